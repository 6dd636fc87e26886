//! Session dispatcher: owns the data channel lifecycle and hands the session
//! to the subsystem the remote announced.

pub mod port;
pub mod shell;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{error, info, warn};

use smp_core::constants::{PORT_PLUGIN_NAME, SHELL_PLUGIN_NAME};
use smp_core::datachannel::{DataChannel, HandlerId, OutputStreamHandler};
use smp_core::error::{Error, Result};
use smp_core::protocol::{ClientMessage, PayloadType};
use smp_core::retry::RepeatableExponentialRetryer;

use crate::cli::StartSessionParams;
use crate::service::ControlPlane;
use crate::terminal;

/// A per-session-type subsystem.
///
/// `initialize` wires the subsystem's handlers into the data channel;
/// `set_session_handlers` runs the subsystem's I/O loop and blocks until the
/// session ends.
#[async_trait]
pub trait SessionPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    async fn initialize(self: Arc<Self>, session: Arc<Session>) -> Result<()>;
    async fn set_session_handlers(self: Arc<Self>) -> Result<()>;
}

type PluginBuilder = Box<dyn Fn() -> Arc<dyn SessionPlugin> + Send + Sync>;

/// Maps the session type announced by the remote to a subsystem builder.
///
/// Built once at startup and passed by reference; there is no process-wide
/// registry.
pub struct SessionRegistry {
    plugins: HashMap<&'static str, PluginBuilder>,
}

impl SessionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// The registry with the built-in shell and port subsystems.
    pub fn with_default_plugins() -> Self {
        let mut registry = Self::new();
        registry.register(
            SHELL_PLUGIN_NAME,
            Box::new(|| Arc::new(shell::ShellSession::new()) as Arc<dyn SessionPlugin>),
        );
        registry.register(
            PORT_PLUGIN_NAME,
            Box::new(|| Arc::new(port::PortSession::new()) as Arc<dyn SessionPlugin>),
        );
        registry
    }

    /// Register a subsystem builder under a session type name.
    pub fn register(&mut self, name: &'static str, builder: PluginBuilder) {
        self.plugins.insert(name, builder);
    }

    /// Instantiate the subsystem for a session type.
    pub fn build(&self, name: &str) -> Option<Arc<dyn SessionPlugin>> {
        self.plugins.get(name).map(|builder| builder())
    }

    /// Registered session type names.
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_default_plugins()
    }
}

/// One interactive session: ids, the data channel, and the control plane.
pub struct Session {
    pub session_id: String,
    pub stream_url: String,
    pub client_id: String,
    pub target_id: String,
    pub data_channel: Arc<DataChannel>,
    pub control_plane: Arc<dyn ControlPlane>,
    first_message_handler_id: OnceLock<HandlerId>,
}

impl Session {
    /// Build a session from validated CLI parameters.
    pub fn new(
        params: &StartSessionParams,
        data_channel: Arc<DataChannel>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            session_id: params.session_id.clone(),
            stream_url: params.stream_url.clone(),
            client_id: params.client_id.clone(),
            target_id: params.target_id.clone(),
            data_channel,
            control_plane,
            first_message_handler_id: OnceLock::new(),
        }
    }

    /// Open the data channel, wait for the session type and run the selected
    /// subsystem until it ends.
    pub async fn execute(self: &Arc<Self>, registry: &SessionRegistry) -> Result<()> {
        println!("\nStarting session with SessionId: {}", self.session_id);

        self.open_data_channel().await?;
        self.start_resend_timeout_watcher();

        // Set either by handshake or by the first received frame
        if !self.data_channel.wait_for_session_type().await {
            error!(session_id = %self.session_id, "unable to set session type");
            return Err(Error::SessionTypeUnknown);
        }

        let session_type = self
            .data_channel
            .session_type()
            .ok_or(Error::SessionTypeUnknown)?;
        info!(session_type = %session_type, "session type set");

        let plugin = registry
            .build(&session_type)
            .ok_or_else(|| Error::Protocol {
                message: format!("no subsystem registered for session type {session_type}"),
            })?;
        Arc::clone(&plugin).initialize(Arc::clone(self)).await?;
        plugin.set_session_handlers().await
    }

    /// Wire handlers into the data channel and open it, retrying with
    /// exponential backoff on failure.
    async fn open_data_channel(self: &Arc<Self>) -> Result<()> {
        let session = Arc::clone(self);
        self.data_channel.channel().set_on_message(Arc::new(move |raw| {
            let session = Arc::clone(&session);
            Box::pin(async move {
                let _ = session.data_channel.output_message_handler(&raw).await;
            })
        }));

        self.data_channel.set_stop_handler(Arc::new(|| {
            Box::pin(async {
                terminal::restore_terminal();
                std::process::exit(0);
            })
        }));

        let handler_id = self
            .data_channel
            .register_output_stream_handler(self.first_message_handler(), false);
        let _ = self.first_message_handler_id.set(handler_id);

        if let Err(e) = self.data_channel.open().await {
            error!(session_id = %self.session_id, error = %e, "opening data channel failed, retrying");
            let data_channel = Arc::clone(&self.data_channel);
            RepeatableExponentialRetryer::for_data_channel()
                .call(|| {
                    let data_channel = Arc::clone(&data_channel);
                    async move { data_channel.reconnect().await }
                })
                .await?;
        }

        let session = Arc::clone(self);
        self.data_channel.channel().set_on_error(Arc::new(move |err| {
            let session = Arc::clone(&session);
            Box::pin(async move {
                let sequence_number = session.data_channel.stream_data_sequence_number().await;
                error!(
                    stream_url = %session.stream_url,
                    error = %err,
                    sequence_number,
                    "trying to reconnect the session"
                );
                let resume = RepeatableExponentialRetryer::for_data_channel()
                    .call(|| {
                        let session = Arc::clone(&session);
                        async move { session.resume_session_handler().await }
                    })
                    .await;
                if let Err(e) = resume {
                    error!(error = %e, "failed to resume session");
                }
            })
        }));

        self.data_channel.start_resend_scheduler();
        Ok(())
    }

    /// Fallback output handler for remotes that never send a handshake:
    /// the first Output frame selects the shell subsystem.
    fn first_message_handler(self: &Arc<Self>) -> OutputStreamHandler {
        let session = Arc::clone(self);
        Arc::new(move |message: ClientMessage| {
            let session = Arc::clone(&session);
            Box::pin(async move {
                // Only ever called for the first frame
                if let Some(id) = session.first_message_handler_id.get() {
                    session.data_channel.deregister_output_stream_handler(*id);
                }
                if session.data_channel.session_type().is_none()
                    && message.payload_type == PayloadType::Output as u32
                {
                    warn!("setting session type to shell based on payload type");
                    session.data_channel.set_session_type(SHELL_PLUGIN_NAME);
                    let _ = terminal::write_stdout(&message.payload);
                }
                Ok(true)
            })
        })
    }

    /// Watch for the resend budget running out; terminate and stop the
    /// session when it does.
    fn start_resend_timeout_watcher(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.data_channel.wait_for_resend_timeout().await;
            error!(
                session_id = %session.session_id,
                "terminating session: stream data was not processed before timeout"
            );
            if let Err(e) = session.terminate_session().await {
                error!(error = %e, "unable to terminate session upon stream data timeout");
            }
            // The stop handler owns subsystem teardown and exits the process
            session.data_channel.stop_session().await;
        });
    }

    /// Fetch a fresh token and reconnect the data channel. An empty token
    /// means the remote session timed out; print and exit.
    pub async fn resume_session_handler(&self) -> Result<()> {
        let token = self
            .control_plane
            .resume_session(&self.session_id)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to get resume session token");
                e
            })?;

        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => {
                info!(session_id = %self.session_id, "session timed out");
                println!("Session: {} timed out.", self.session_id);
                terminal::restore_terminal();
                std::process::exit(0);
            }
        };

        self.data_channel.channel().set_channel_token(token);
        self.data_channel.reconnect().await
    }

    /// Best-effort TerminateSession call.
    pub async fn terminate_session(&self) -> Result<()> {
        self.control_plane
            .terminate_session(&self.session_id)
            .await
            .map_err(|e| {
                error!(error = %e, "terminate session failed");
                e
            })
    }
}
