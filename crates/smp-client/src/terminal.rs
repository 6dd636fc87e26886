//! Terminal handling for the interactive shell subsystem.
//!
//! Provides:
//! - cbreak-style terminal mode setup/restore (echo and line buffering off,
//!   signal generation left on so control signals arrive as signals)
//! - Terminal size detection
//! - Async stdin reads

use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;

use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use smp_core::error::{Error, Result};
use smp_core::protocol::SizeData;

/// Original terminal settings to restore on exit.
static ORIGINAL_TERMIOS: Mutex<Option<libc::termios>> = Mutex::new(None);

/// Guard that restores terminal settings on drop.
pub struct TerminalModeGuard {
    fd: RawFd,
}

impl TerminalModeGuard {
    /// Disable echo and line buffering on stdin.
    ///
    /// Returns a guard that restores the previous mode on drop. ISIG stays
    /// on: Ctrl+C and friends must reach the signal handler, which forwards
    /// them to the remote shell as control bytes.
    pub fn enter() -> Result<Self> {
        let fd = io::stdin().as_raw_fd();

        let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let original = unsafe { termios.assume_init() };

        if let Ok(mut guard) = ORIGINAL_TERMIOS.lock() {
            *guard = Some(original);
        }

        let mut raw = original;
        raw.c_lflag &= !(libc::ECHO | libc::ICANON);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;

        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        debug!("disabled terminal echo and input buffering");
        Ok(Self { fd })
    }

    fn restore_inner(&self) {
        if let Ok(mut guard) = ORIGINAL_TERMIOS.lock()
            && let Some(original) = guard.take()
        {
            if unsafe { libc::tcsetattr(self.fd, libc::TCSAFLUSH, &original) } != 0 {
                warn!("failed to restore terminal settings");
            } else {
                debug!("restored terminal settings");
            }
        }
    }
}

impl Drop for TerminalModeGuard {
    fn drop(&mut self) {
        self.restore_inner();
    }
}

/// Restore terminal settings without a guard (exit paths).
pub fn restore_terminal() {
    let fd = io::stdin().as_raw_fd();
    if let Ok(guard) = ORIGINAL_TERMIOS.lock()
        && let Some(ref original) = *guard
    {
        unsafe {
            libc::tcsetattr(fd, libc::TCSAFLUSH, original);
        }
    }
}

/// Fallback size reported when the terminal cannot be queried.
const FALLBACK_SIZE: SizeData = SizeData { cols: 300, rows: 100 };

/// Get the current terminal size, falling back to a fixed size when stdout
/// is not a terminal.
pub fn get_terminal_size() -> SizeData {
    let fd = io::stdout().as_raw_fd();

    let mut winsize = std::mem::MaybeUninit::<libc::winsize>::uninit();
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, winsize.as_mut_ptr()) } != 0 {
        return FALLBACK_SIZE;
    }

    let winsize = unsafe { winsize.assume_init() };
    if winsize.ws_col == 0 || winsize.ws_row == 0 {
        return FALLBACK_SIZE;
    }
    SizeData {
        cols: winsize.ws_col as u32,
        rows: winsize.ws_row as u32,
    }
}

/// Write remote output straight to stdout.
pub fn write_stdout(payload: &[u8]) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(payload)?;
    stdout.flush()?;
    Ok(())
}

/// Async stdin reader using AsyncFd.
///
/// Sets stdin to non-blocking mode so reads can be awaited without parking a
/// thread; blocking mode is restored on drop.
pub struct StdinReader {
    async_fd: AsyncFd<RawFd>,
    fd: RawFd,
}

impl StdinReader {
    pub fn new() -> Result<Self> {
        let fd = io::stdin().as_raw_fd();

        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }

        let async_fd = AsyncFd::new(fd).map_err(Error::Io)?;
        Ok(Self { async_fd, fd })
    }

    /// Read a chunk from stdin into `buf`.
    ///
    /// Returns `None` on EOF or unrecoverable error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
        loop {
            let mut guard = match self.async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "stdin readable error");
                    return None;
                }
            };

            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        *inner.get_ref(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    debug!("stdin EOF");
                    return None;
                }
                Ok(Ok(n)) => return Some(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "stdin read error");
                    return None;
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for StdinReader {
    fn drop(&mut self) {
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(self.fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_has_positive_dimensions() {
        let size = get_terminal_size();
        assert!(size.cols > 0);
        assert!(size.rows > 0);
    }

    #[test]
    fn write_stdout_accepts_empty_payloads() {
        write_stdout(b"").unwrap();
    }
}
