//! Standard stream forwarding: stdin to the remote port, remote output to
//! stdout. EOF on stdin ends the session normally.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{error, info, trace};

use smp_core::constants::STREAM_DATA_PAYLOAD_SIZE;
use smp_core::error::{Error, Result};
use smp_core::protocol::PayloadType;

use crate::session::Session;
use crate::session::port::{PortForwarding, PortParameters};
use crate::terminal;

pub struct StandardStreamForwarding {
    session: Arc<Session>,
    parameters: PortParameters,
    stream_set: AtomicBool,
}

impl StandardStreamForwarding {
    pub fn new(session: Arc<Session>, parameters: PortParameters) -> Self {
        Self {
            session,
            parameters,
            stream_set: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PortForwarding for StandardStreamForwarding {
    fn is_stream_not_set(&self) -> bool {
        !self.stream_set.load(Ordering::SeqCst)
    }

    async fn initialize_streams(self: Arc<Self>, _agent_version: &str) -> Result<()> {
        self.stream_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_stream(&self) -> Result<()> {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; STREAM_DATA_PAYLOAD_SIZE];

        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => {
                    info!(
                        target_id = %self.session.target_id,
                        port = %self.parameters.port_number,
                        "session was closed"
                    );
                    return Ok(());
                }
                Ok(n) => {
                    trace!(len = n, "received message from stdin");
                    self.session
                        .data_channel
                        .send_input_data_message(PayloadType::Output, &buf[..n])
                        .await
                        .map_err(|e| {
                            error!(error = %e, "failed to send stdin data packet");
                            e
                        })?;
                    // Yield so remote output interleaves with fast input
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => {
                    error!(error = %e, "reading input failed");
                    return Err(Error::Io(e));
                }
            }
        }
    }

    async fn write_stream(&self, payload: &[u8]) -> Result<()> {
        terminal::write_stdout(payload)
    }

    async fn stop(&self) {
        std::process::exit(0);
    }
}
