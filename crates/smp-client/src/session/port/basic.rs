//! Basic port forwarding: one accepted local connection at a time.
//!
//! When the local side drops, a DisconnectToPort flag tells the agent to
//! close its end and the listener accepts a fresh connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use smp_core::constants::STREAM_DATA_PAYLOAD_SIZE;
use smp_core::error::{Error, Result};
use smp_core::protocol::{PayloadType, PayloadTypeFlag};
use smp_core::version;

use crate::session::Session;
use crate::session::port::{
    BoxedReader, BoxedWriter, LocalListener, PortForwarding, PortParameters,
};

pub struct BasicPortForwarding {
    session: Arc<Session>,
    parameters: PortParameters,
    listener: Mutex<Option<LocalListener>>,
    read_half: Mutex<Option<BoxedReader>>,
    write_half: Mutex<Option<BoxedWriter>>,
    stream_set: AtomicBool,
}

impl BasicPortForwarding {
    pub fn new(session: Arc<Session>, parameters: PortParameters) -> Self {
        Self {
            session,
            parameters,
            listener: Mutex::new(None),
            read_half: Mutex::new(None),
            write_half: Mutex::new(None),
            stream_set: AtomicBool::new(false),
        }
    }

    /// Forward terminate signals: newer agents take a TerminateSession flag
    /// over the channel, older ones need the control-plane API.
    fn handle_control_signals(self: &Arc<Self>, agent_version: String) {
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

            if version::supports_terminate_session_flag(&agent_version) {
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
            } else if let Err(e) = forwarding.session.terminate_session().await {
                error!(error = %e, "failed to terminate session");
            }
        });
    }

    /// Open the local listener and accept the first connection.
    async fn start_local_conn(&self) -> Result<()> {
        let listener = LocalListener::start(&self.parameters, &self.session.session_id).await?;
        let (read, write) = listener.accept().await.map_err(|e| {
            error!(error = %e, "failed to accept connection");
            Error::Io(e)
        })?;

        info!(session_id = %self.session.session_id, "connection accepted for session");
        println!("Connection accepted for session {}.", self.session.session_id);

        *self.listener.lock().await = Some(listener);
        *self.read_half.lock().await = Some(read);
        *self.write_half.lock().await = Some(write);
        self.stream_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Replace a dropped connection with a newly accepted one.
    async fn reconnect(&self) -> Result<()> {
        // The old halves are unusable; drop them before waiting
        *self.read_half.lock().await = None;
        *self.write_half.lock().await = None;

        let listener_guard = self.listener.lock().await;
        let listener = listener_guard.as_ref().ok_or_else(|| Error::Protocol {
            message: "reconnect without a local listener".to_string(),
        })?;
        let (read, write) = listener.accept().await.map_err(|e| {
            error!(error = %e, "failed to accept connection");
            Error::Io(e)
        })?;
        drop(listener_guard);

        *self.read_half.lock().await = Some(read);
        *self.write_half.lock().await = Some(write);
        Ok(())
    }
}

#[async_trait]
impl PortForwarding for BasicPortForwarding {
    fn is_stream_not_set(&self) -> bool {
        !self.stream_set.load(Ordering::SeqCst)
    }

    async fn initialize_streams(self: Arc<Self>, agent_version: &str) -> Result<()> {
        self.handle_control_signals(agent_version.to_string());
        self.start_local_conn().await
    }

    async fn read_stream(&self) -> Result<()> {
        let mut buf = [0u8; STREAM_DATA_PAYLOAD_SIZE];
        loop {
            let read_result = {
                let mut guard = self.read_half.lock().await;
                match guard.as_mut() {
                    Some(read) => read.read(&mut buf).await,
                    None => return Ok(()),
                }
            };

            match read_result {
                Ok(0) | Err(_) => {
                    debug!(
                        port = %self.parameters.port_number,
                        "local connection dropped, accepting a new one"
                    );

                    // Tell the agent to drop its server-side connection too
                    self.session
                        .data_channel
                        .send_flag(PayloadTypeFlag::DisconnectToPort)
                        .await
                        .map_err(|e| {
                            error!(error = %e, "failed to send disconnect flag");
                            e
                        })?;

                    self.reconnect().await?;
                    continue;
                }
                Ok(n) => {
                    trace!(len = n, "received message from local stream");
                    self.session
                        .data_channel
                        .send_input_data_message(PayloadType::Output, &buf[..n])
                        .await
                        .map_err(|e| {
                            error!(error = %e, "failed to send data packet");
                            e
                        })?;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
    }

    async fn write_stream(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        if let Some(write) = guard.as_mut() {
            write.write_all(payload).await?;
            write.flush().await?;
        }
        Ok(())
    }

    async fn stop(&self) {
        *self.read_half.lock().await = None;
        *self.write_half.lock().await = None;
        std::process::exit(0);
    }
}
