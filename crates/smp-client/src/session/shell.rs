//! Interactive shell subsystem.
//!
//! Three cooperating tasks: a size reporter (500 ms), a control-signal
//! forwarder (SIGINT/SIGQUIT/SIGTSTP become control bytes) and the stdin
//! pump. Remote output is written straight to stdout.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, warn};

use smp_core::constants::{SHELL_PLUGIN_NAME, STREAM_DATA_PAYLOAD_SIZE};
use smp_core::error::{Error, Result};
use smp_core::protocol::{ClientMessage, PayloadType, SizeData};

use crate::session::{Session, SessionPlugin};
use crate::terminal::{self, StdinReader, TerminalModeGuard};

/// Interval between terminal size checks.
const RESIZE_SLEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Control byte sent for Ctrl+C.
const SIGINT_BYTE: u8 = 0x03;
/// Control byte sent for Ctrl+\.
const SIGQUIT_BYTE: u8 = 0x1C;
/// Control byte sent for Ctrl+Z.
const SIGTSTP_BYTE: u8 = 0x1A;

const ESCAPE_HELP: &str = "\nSupported escape sequence commands:\n\
~?  - this help message\n\
~~  - send the ~ character to the remote target\n\
~-  - disable escape sequences for the rest of this session\n\
~.  - disconnect and terminate session\n\
(Note that escapes are only recognized immediately after newline.)";

/// Escape sequence state: a `~` immediately after a newline arms the escape.
struct EscapeTracking {
    enabled: bool,
    newline: bool,
    escaped: bool,
}

impl EscapeTracking {
    fn reset(&mut self) {
        self.escaped = false;
        self.newline = false;
    }
}

/// The shell subsystem.
pub struct ShellSession {
    session: OnceLock<Arc<Session>>,
    size_data: Mutex<SizeData>,
    escape: Mutex<EscapeTracking>,
}

impl ShellSession {
    pub fn new() -> Self {
        Self {
            session: OnceLock::new(),
            size_data: Mutex::new(SizeData::default()),
            escape: Mutex::new(EscapeTracking {
                enabled: true,
                newline: false,
                escaped: false,
            }),
        }
    }

    fn session(&self) -> Result<&Arc<Session>> {
        self.session.get().ok_or_else(|| Error::Protocol {
            message: "shell subsystem used before initialization".to_string(),
        })
    }

    /// Check the terminal size and report it when it changed.
    async fn report_terminal_size(&self) -> Result<()> {
        let size = terminal::get_terminal_size();
        let changed = {
            let mut last = self.size_data.lock().expect("size lock poisoned");
            if *last == size {
                false
            } else {
                *last = size;
                true
            }
        };
        if changed {
            let payload = serde_json::to_vec(&size).map_err(|e| Error::Protocol {
                message: format!("cannot marshal size data: {e}"),
            })?;
            debug!(cols = size.cols, rows = size.rows, "sending terminal size");
            self.session()?
                .data_channel
                .send_input_data_message(PayloadType::Size, &payload)
                .await?;
        }
        Ok(())
    }

    fn start_size_reporter(self: &Arc<Self>) {
        let shell = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = shell.report_terminal_size().await {
                    error!(error = %e, "failed to send size data");
                }
                tokio::time::sleep(RESIZE_SLEEP_INTERVAL).await;
            }
        });
    }

    fn start_signal_forwarder(&self, session: Arc<Session>) {
        tokio::spawn(async move {
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "cannot install SIGINT handler");
                    return;
                }
            };
            let mut quit = match signal(SignalKind::quit()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "cannot install SIGQUIT handler");
                    return;
                }
            };
            let mut stop = match signal(SignalKind::from_raw(libc::SIGTSTP)) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "cannot install SIGTSTP handler");
                    return;
                }
            };

            loop {
                let byte = tokio::select! {
                    _ = interrupt.recv() => SIGINT_BYTE,
                    _ = quit.recv() => SIGQUIT_BYTE,
                    _ = stop.recv() => SIGTSTP_BYTE,
                };
                if let Err(e) = session
                    .data_channel
                    .send_input_data_message(PayloadType::Output, &[byte])
                    .await
                {
                    error!(error = %e, "failed to send control signal");
                }
            }
        });
    }

    /// Process key presses looking for `~`-escapes after a newline.
    ///
    /// Returns true when the chunk was consumed by the escape machinery and
    /// must not be sent to the remote.
    async fn handle_escape_sequence(&self, input: &[u8]) -> Result<bool> {
        let mut skip = false;
        let mut terminate = false;
        {
            let mut escape = self.escape.lock().expect("escape lock poisoned");
            if !escape.enabled {
                return Ok(false);
            }

            if escape.newline && input.len() == 1 {
                if escape.escaped {
                    match input[0] {
                        b'?' => {
                            println!("{ESCAPE_HELP}");
                            escape.reset();
                            skip = true;
                        }
                        b'.' => {
                            terminate = true;
                            skip = true;
                        }
                        b'-' => {
                            escape.enabled = false;
                            skip = true;
                        }
                        b'~' => {
                            // Send the literal ~ through
                            escape.reset();
                        }
                        _ => escape.reset(),
                    }
                } else if input[0] == b'~' {
                    escape.escaped = true;
                    skip = true;
                } else {
                    escape.reset();
                }
            }

            if !skip
                && let Some(last) = input.last()
                && (*last == b'\n' || *last == b'\r')
            {
                escape.newline = true;
            }
        }

        if terminate {
            self.session()?.terminate_session().await?;
        }
        Ok(skip)
    }

    /// Pump stdin to the remote in chunks; returns on EOF.
    async fn handle_keyboard_input(&self) -> Result<()> {
        let session = self.session()?.clone();
        let mut reader = StdinReader::new()?;
        let mut buf = [0u8; STREAM_DATA_PAYLOAD_SIZE];

        loop {
            let Some(n) = reader.read(&mut buf).await else {
                debug!("stdin closed, ending shell session");
                return Ok(());
            };

            if self.handle_escape_sequence(&buf[..n]).await? {
                continue;
            }

            if let Err(e) = session
                .data_channel
                .send_input_data_message(PayloadType::Output, &buf[..n])
                .await
            {
                error!(error = %e, "failed to send keyboard input");
                return Err(e);
            }
            // Limit the rate of small stdin chunks
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for ShellSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionPlugin for ShellSession {
    fn name(&self) -> &'static str {
        SHELL_PLUGIN_NAME
    }

    async fn initialize(self: Arc<Self>, session: Arc<Session>) -> Result<()> {
        self.session.set(session.clone()).map_err(|_| Error::Protocol {
            message: "shell subsystem initialized twice".to_string(),
        })?;

        // Remote output goes straight to stdout
        session.data_channel.register_output_stream_handler(
            Arc::new(move |message: ClientMessage| {
                Box::pin(async move {
                    if let Err(e) = terminal::write_stdout(&message.payload) {
                        warn!(error = %e, "failed to write remote output");
                    }
                    Ok(true)
                })
            }),
            true,
        );
        Ok(())
    }

    async fn set_session_handlers(self: Arc<Self>) -> Result<()> {
        let session = self.session()?.clone();

        // Restored when the guard drops at the end of the session
        let _mode_guard = TerminalModeGuard::enter()?;

        self.start_size_reporter();
        self.start_signal_forwarder(session);

        self.handle_keyboard_input().await
    }
}
