//! Port forwarding subsystem.
//!
//! Three flavors, selected from the session properties and the remote agent
//! version:
//! - Standard stream forwarding: stdin/stdout pipe
//! - Basic forwarding: one accepted local connection at a time
//! - Mux forwarding: many local connections multiplexed over the channel

mod basic;
mod mux;
mod standard;

pub use basic::BasicPortForwarding;
pub use mux::MuxPortForwarding;
pub use standard::StandardStreamForwarding;

use std::io;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info};

use smp_core::constants::PORT_PLUGIN_NAME;
use smp_core::error::{Error, Result};
use smp_core::protocol::{ClientMessage, OUTPUT_STREAM_MESSAGE, PayloadType, PayloadTypeFlag};
use smp_core::version;

use crate::session::{Session, SessionPlugin};

/// Session property value selecting local port forwarding.
pub const LOCAL_PORT_FORWARDING_TYPE: &str = "LocalPortForwarding";

/// Properties announced with a Port session type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortParameters {
    #[serde(rename = "portNumber", default)]
    pub port_number: String,
    #[serde(rename = "localPortNumber", default)]
    pub local_port_number: String,
    #[serde(rename = "localUnixSocket", default)]
    pub local_unix_socket: String,
    #[serde(rename = "localConnectionType", default)]
    pub local_connection_type: String,
    #[serde(rename = "type", default)]
    pub forwarding_type: String,
}

/// One flavor of port forwarding.
#[async_trait]
pub trait PortForwarding: Send + Sync {
    /// True until the local stream exists; gates incoming frames.
    fn is_stream_not_set(&self) -> bool;

    /// Establish the local side (listener, accepted connection, mux).
    async fn initialize_streams(self: Arc<Self>, agent_version: &str) -> Result<()>;

    /// Pump local reads to the remote; blocks until the session ends.
    async fn read_stream(&self) -> Result<()>;

    /// Write one remote payload to the local stream.
    async fn write_stream(&self, payload: &[u8]) -> Result<()>;

    /// Tear down local resources and exit. Reached from the terminate
    /// signal handlers and from the data channel's stop path.
    async fn stop(&self);
}

/// The Port subsystem: picks a flavor and bridges it to the data channel.
pub struct PortSession {
    session: OnceLock<Arc<Session>>,
    forwarding: OnceLock<Arc<dyn PortForwarding>>,
}

impl PortSession {
    pub fn new() -> Self {
        Self {
            session: OnceLock::new(),
            forwarding: OnceLock::new(),
        }
    }

    fn forwarding(&self) -> Result<&Arc<dyn PortForwarding>> {
        self.forwarding.get().ok_or_else(|| Error::Protocol {
            message: "port subsystem used before initialization".to_string(),
        })
    }

    /// Pick the forwarding flavor for the given parameters and agent.
    fn select_flavor(
        session: &Arc<Session>,
        parameters: &PortParameters,
        agent_version: &str,
    ) -> Arc<dyn PortForwarding> {
        if parameters.forwarding_type == LOCAL_PORT_FORWARDING_TYPE {
            if version::supports_tcp_multiplexing(agent_version) {
                Arc::new(MuxPortForwarding::new(session.clone(), parameters.clone()))
            } else {
                Arc::new(BasicPortForwarding::new(session.clone(), parameters.clone()))
            }
        } else {
            Arc::new(StandardStreamForwarding::new(session.clone(), parameters.clone()))
        }
    }
}

impl Default for PortSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionPlugin for PortSession {
    fn name(&self) -> &'static str {
        PORT_PLUGIN_NAME
    }

    async fn initialize(self: Arc<Self>, session: Arc<Session>) -> Result<()> {
        let parameters: PortParameters =
            serde_json::from_value(session.data_channel.session_properties()).unwrap_or_else(|e| {
                error!(error = %e, "invalid port session properties");
                PortParameters::default()
            });
        let agent_version = session.data_channel.agent_version();

        let forwarding = Self::select_flavor(&session, &parameters, &agent_version);
        self.forwarding
            .set(Arc::clone(&forwarding))
            .map_err(|_| Error::Protocol {
                message: "port subsystem initialized twice".to_string(),
            })?;
        let _ = self.session.set(Arc::clone(&session));

        // Remote payloads go to the local stream; connection errors surface
        // to the user
        let handler_forwarding = Arc::clone(&forwarding);
        session.data_channel.register_output_stream_handler(
            Arc::new(move |message: ClientMessage| {
                let forwarding = Arc::clone(&handler_forwarding);
                Box::pin(async move {
                    if forwarding.is_stream_not_set() {
                        debug!("waiting for streams to be established");
                        return Ok(false);
                    }
                    match PayloadType::from_u32(message.payload_type) {
                        Some(PayloadType::Output) => {
                            forwarding.write_stream(&message.payload).await?;
                        }
                        Some(PayloadType::Flag) => {
                            if PayloadTypeFlag::from_payload(&message.payload)
                                == Some(PayloadTypeFlag::ConnectToPortError)
                            {
                                println!(
                                    "\nConnection to destination port failed, check SSM Agent logs."
                                );
                            }
                        }
                        _ => {}
                    }
                    Ok(true)
                })
            }),
            true,
        );

        // Remote channel-closed and the resend-timeout watcher tear down
        // through the active flavor
        let stop_forwarding = Arc::clone(&forwarding);
        session.data_channel.set_stop_handler(Arc::new(move || {
            let forwarding = Arc::clone(&stop_forwarding);
            Box::pin(async move {
                forwarding.stop().await;
            })
        }));

        // Drop stream data frames arriving before the local stream exists;
        // without an ack the remote resends them once a connection is up
        let gate_forwarding = Arc::clone(&forwarding);
        let gate_session = Arc::clone(&session);
        session.data_channel.channel().set_on_message(Arc::new(move |raw| {
            let forwarding = Arc::clone(&gate_forwarding);
            let session = Arc::clone(&gate_session);
            Box::pin(async move {
                if forwarding.is_stream_not_set() {
                    match ClientMessage::deserialize(&raw) {
                        Err(_) => {
                            debug!("ignoring message deserialize error while stream is not set");
                            return;
                        }
                        Ok(message) if message.message_type == OUTPUT_STREAM_MESSAGE => {
                            debug!("waiting for local connection before processing stream data");
                            return;
                        }
                        Ok(message) => {
                            info!(
                                message_type = %message.message_type,
                                "received message while establishing connection"
                            );
                        }
                    }
                }
                let _ = session.data_channel.output_message_handler(&raw).await;
            })
        }));

        info!(
            target_id = %session.target_id,
            port = %parameters.port_number,
            "connected to target on remote port"
        );
        Ok(())
    }

    async fn set_session_handlers(self: Arc<Self>) -> Result<()> {
        let session = self.session.get().ok_or_else(|| Error::Protocol {
            message: "port subsystem used before initialization".to_string(),
        })?;
        let forwarding = self.forwarding()?;
        Arc::clone(forwarding)
            .initialize_streams(&session.data_channel.agent_version())
            .await?;
        forwarding.read_stream().await
    }
}

// =============================================================================
// Local Listener Plumbing
// =============================================================================

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local listener for forwarded connections: TCP or unix socket.
pub(crate) enum LocalListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl LocalListener {
    /// Bind per the session parameters and print the listening banner.
    pub(crate) async fn start(parameters: &PortParameters, session_id: &str) -> Result<Self> {
        if parameters.local_connection_type == "unix" {
            let listener = UnixListener::bind(&parameters.local_unix_socket)?;
            let message = format!(
                "Unix socket {} opened for sessionId {}.",
                parameters.local_unix_socket, session_id
            );
            info!("{message}");
            println!("{message}");
            Ok(Self::Unix(listener))
        } else {
            let port = if parameters.local_port_number.is_empty() {
                "0"
            } else {
                &parameters.local_port_number
            };
            let listener = TcpListener::bind(format!("localhost:{port}")).await?;
            let message = format!(
                "Port {} opened for sessionId {}.",
                listener.local_addr()?.port(),
                session_id
            );
            info!("{message}");
            println!("{message}");
            Ok(Self::Tcp(listener))
        }
    }

    /// Accept one connection, returning its split halves.
    pub(crate) async fn accept(&self) -> io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write)))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let (read, write) = stream.into_split();
                Ok((Box::new(read), Box::new(write)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_parameters_deserialize_from_properties() {
        let properties = serde_json::json!({
            "portNumber": "3389",
            "localPortNumber": "9999",
            "type": "LocalPortForwarding"
        });
        let parameters: PortParameters = serde_json::from_value(properties).unwrap();
        assert_eq!(parameters.port_number, "3389");
        assert_eq!(parameters.local_port_number, "9999");
        assert_eq!(parameters.forwarding_type, LOCAL_PORT_FORWARDING_TYPE);
        assert!(parameters.local_unix_socket.is_empty());
    }

    #[test]
    fn missing_properties_default() {
        let parameters: PortParameters = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(parameters.port_number.is_empty());
        assert!(parameters.forwarding_type.is_empty());
    }

    #[tokio::test]
    async fn tcp_listener_binds_an_ephemeral_port() {
        let parameters = PortParameters::default();
        let listener = LocalListener::start(&parameters, "user-012345").await.unwrap();
        match listener {
            LocalListener::Tcp(listener) => {
                assert_ne!(listener.local_addr().unwrap().port(), 0)
            }
            LocalListener::Unix(_) => panic!("expected a tcp listener"),
        }
    }
}
