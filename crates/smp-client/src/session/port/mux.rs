//! Multiplexed port forwarding: many local connections share the channel.
//!
//! A yamux client session runs over a local unix socket pair whose far end
//! is pumped through the data channel. Each accepted local connection gets
//! its own mux stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tokio_yamux::config::Config;
use tokio_yamux::Control;
use tokio_yamux::session::Session as MuxSession;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, error, info, trace};

use smp_core::constants::STREAM_DATA_PAYLOAD_SIZE;
use smp_core::error::{Error, Result};
use smp_core::protocol::{PayloadType, PayloadTypeFlag};
use smp_core::version;

use crate::session::Session;
use crate::session::port::{BoxedReader, BoxedWriter, LocalListener, PortForwarding, PortParameters};

/// FNV-1a 32-bit, matching the socket naming scheme of other clients.
fn fnv1a_32(input: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in input {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Path of the intermediate socket carrying the mux session, named by a hash
/// of the session id.
fn mux_socket_path(session_id: &str) -> PathBuf {
    let hash = fnv1a_32(session_id.as_bytes());
    std::env::temp_dir().join(format!("{hash}_smp_mux.sock"))
}

pub struct MuxPortForwarding {
    session: Arc<Session>,
    parameters: PortParameters,
    socket_file: PathBuf,
    mgs_read: Mutex<Option<OwnedReadHalf>>,
    mgs_write: Mutex<Option<OwnedWriteHalf>>,
    control: Mutex<Option<Control>>,
    stream_set: AtomicBool,
}

impl MuxPortForwarding {
    pub fn new(session: Arc<Session>, parameters: PortParameters) -> Self {
        let socket_file = mux_socket_path(&session.session_id);
        Self {
            session,
            parameters,
            socket_file,
            mgs_read: Mutex::new(None),
            mgs_write: Mutex::new(None),
            control: Mutex::new(None),
            stream_set: AtomicBool::new(false),
        }
    }

    fn clean_up(&self) {
        let _ = std::fs::remove_file(&self.socket_file);
    }

    fn handle_control_signals(self: &Arc<Self>) {
        let forwarding = Arc::clone(self);
        tokio::spawn(async move {
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(stream) => stream,
                Err(_) => return,
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(_) => return,
            };
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            println!("Terminate signal received, exiting.");

            if let Err(e) = forwarding
                .session
                .data_channel
                .send_flag(PayloadTypeFlag::TerminateSession)
                .await
            {
                error!(error = %e, "failed to send TerminateSession flag");
            }
            println!(
                "\n\nExiting session with sessionId: {}.\n\n",
                forwarding.session.session_id
            );
            forwarding.stop().await;
        });
    }

    /// Build the socket pair and start the mux client over it.
    async fn initialize_mux(&self, agent_version: &str) -> Result<()> {
        self.clean_up();
        let listener = UnixListener::bind(&self.socket_file)?;

        let (accepted, dialed) = tokio::join!(
            listener.accept(),
            UnixStream::connect(&self.socket_file)
        );
        let (mgs_conn, _) = accepted.map_err(Error::Io)?;
        let mux_conn = dialed.map_err(Error::Io)?;

        let (read, write) = mgs_conn.into_split();
        *self.mgs_read.lock().await = Some(read);
        *self.mgs_write.lock().await = Some(write);

        let mut config = Config::default();
        if version::supports_disable_mux_keep_alive(agent_version) {
            // Mux keep-alive fights the service-side idle timeout
            config.enable_keepalive = false;
        }

        let mut mux_session = MuxSession::new_client(mux_conn, config);
        *self.control.lock().await = Some(mux_session.control());

        tokio::spawn(async move {
            while let Some(event) = mux_session.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "mux session ended");
                    break;
                }
            }
        });

        self.stream_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Pump mux bytes from the socket pair into the data channel.
    async fn transfer_data_to_server(&self) -> Result<()> {
        let mut buf = [0u8; STREAM_DATA_PAYLOAD_SIZE];
        loop {
            let read_result = {
                let mut guard = self.mgs_read.lock().await;
                match guard.as_mut() {
                    Some(read) => read.read(&mut buf).await,
                    None => return Ok(()),
                }
            };

            match read_result {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    trace!(len = n, "received message from mux client");
                    self.session
                        .data_channel
                        .send_input_data_message(PayloadType::Output, &buf[..n])
                        .await
                        .map_err(|e| {
                            error!(error = %e, "failed to send packet on data channel");
                            e
                        })?;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => {
                    debug!(error = %e, "reading from mux connection failed");
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Accept local connections and give each its own mux stream.
    async fn handle_client_connections(&self) -> Result<()> {
        let listener = LocalListener::start(&self.parameters, &self.session.session_id).await?;

        info!("waiting for connections");
        println!("\nWaiting for connections...");

        let accepted_once = AtomicBool::new(false);
        loop {
            match listener.accept().await {
                Ok((local_read, local_write)) => {
                    info!(session_id = %self.session.session_id, "connection accepted for session");
                    if !accepted_once.swap(true, Ordering::SeqCst) {
                        println!("\nConnection accepted for session [{}]", self.session.session_id);
                    }

                    let stream = {
                        let mut guard = self.control.lock().await;
                        let control = guard.as_mut().ok_or_else(|| Error::Protocol {
                            message: "mux session not initialized".to_string(),
                        })?;
                        match control.open_stream().await {
                            Ok(stream) => stream,
                            Err(e) => {
                                error!(error = %e, "failed to open mux stream");
                                continue;
                            }
                        }
                    };
                    debug!("client mux stream opened");
                    tokio::spawn(handle_data_transfer(stream, local_read, local_write));
                }
                Err(e) => {
                    error!(error = %e, "error while accepting connection");
                }
            }
        }
    }
}

/// Copy both directions between a local connection and its mux stream.
async fn handle_data_transfer(
    stream: StreamHandle,
    mut local_read: BoxedReader,
    mut local_write: BoxedWriter,
) {
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    let to_remote = async {
        let _ = tokio::io::copy(&mut local_read, &mut stream_write).await;
        let _ = stream_write.shutdown().await;
    };
    let to_local = async {
        let _ = tokio::io::copy(&mut stream_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
    };
    tokio::join!(to_remote, to_local);
}

#[async_trait]
impl PortForwarding for MuxPortForwarding {
    fn is_stream_not_set(&self) -> bool {
        !self.stream_set.load(Ordering::SeqCst)
    }

    async fn initialize_streams(self: Arc<Self>, agent_version: &str) -> Result<()> {
        self.handle_control_signals();
        if let Err(e) = self.initialize_mux(agent_version).await {
            self.clean_up();
            return Err(e);
        }
        Ok(())
    }

    async fn read_stream(&self) -> Result<()> {
        let result = tokio::select! {
            result = self.transfer_data_to_server() => result,
            result = self.handle_client_connections() => result,
        };
        self.clean_up();
        result
    }

    async fn write_stream(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.mgs_write.lock().await;
        if let Some(write) = guard.as_mut() {
            write.write_all(payload).await?;
        }
        Ok(())
    }

    async fn stop(&self) {
        *self.mgs_read.lock().await = None;
        *self.mgs_write.lock().await = None;
        *self.control.lock().await = None;
        self.clean_up();
        std::process::exit(0);
    }
}
