//! Validation of the argument vector the outer CLI hands to the plugin.
//!
//! The invocation is positional: [1] start-session response JSON (or the
//! name of an environment variable holding it), [2] region, [3] operation,
//! [4] profile, [5] StartSession request JSON, [6] service endpoint. The
//! four-argument legacy form marks the CLI too old for payload encryption.

use clap::Parser;
use serde::Deserialize;
use uuid::Uuid;

/// Session manager plugin for interactive shell and port forwarding sessions.
#[derive(Debug, Parser)]
#[command(name = "session-manager-plugin", version, disable_help_subcommand = true)]
pub struct Cli {
    /// Arguments forwarded by the outer CLI.
    pub args: Vec<String>,
}

/// Environment variable prefix for response indirection: when the first
/// argument starts with this, the response JSON is read from that variable.
pub const START_SESSION_RESPONSE_ENV_PREFIX: &str = "AWS_SSM_START_SESSION_RESPONSE";

/// Only supported operation name.
pub const START_SESSION_OPERATION: &str = "StartSession";

/// Positional-argument count of the legacy invocation (no profile, request
/// or endpoint), which predates encryption support.
const LEGACY_ARGUMENT_COUNT: usize = 3;

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct StartSessionParams {
    pub session_id: String,
    pub token_value: String,
    pub stream_url: String,
    pub region: String,
    pub profile: String,
    pub target_id: String,
    pub endpoint: String,
    pub client_id: String,
    pub is_aws_cli_upgrade_needed: bool,
}

/// What the validated argument vector asks the plugin to do.
#[derive(Debug)]
pub enum CliAction {
    /// No arguments: the post-install banner.
    ShowBanner,
    /// Too few arguments to be a valid invocation.
    UnknownOperation(String),
    /// An operation other than StartSession.
    InvalidOperation,
    /// A well-formed StartSession invocation.
    StartSession(Box<StartSessionParams>),
    /// Arguments were malformed (bad response JSON).
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    #[serde(rename = "SessionId")]
    session_id: String,
    #[serde(rename = "TokenValue")]
    token_value: String,
    #[serde(rename = "StreamUrl")]
    stream_url: String,
}

/// Validate the positional arguments and build the session parameters.
pub fn validate_input(args: &[String]) -> CliAction {
    if args.is_empty() {
        return CliAction::ShowBanner;
    }
    if args.len() < LEGACY_ARGUMENT_COUNT {
        return CliAction::UnknownOperation(args[0].clone());
    }
    let is_aws_cli_upgrade_needed = args.len() == LEGACY_ARGUMENT_COUNT;

    let response = if args[0].starts_with(START_SESSION_RESPONSE_ENV_PREFIX) {
        let value = std::env::var(&args[0]).unwrap_or_default();
        // One-shot: the variable only exists for this invocation
        unsafe { std::env::remove_var(&args[0]) };
        value
    } else {
        args[0].clone()
    };
    let region = args[1].clone();
    let operation = args[2].clone();
    let profile = args.get(3).cloned().unwrap_or_default();
    let target_id = args
        .get(4)
        .and_then(|request| serde_json::from_str::<serde_json::Value>(request).ok())
        .and_then(|request| request["Target"].as_str().map(str::to_string))
        .unwrap_or_default();
    let endpoint = args.get(5).cloned().unwrap_or_default();

    if operation != START_SESSION_OPERATION {
        return CliAction::InvalidOperation;
    }

    let response: StartSessionResponse = match serde_json::from_str(&response) {
        Ok(response) => response,
        Err(e) => return CliAction::Failed(format!("Cannot perform start session: {e}")),
    };

    CliAction::StartSession(Box::new(StartSessionParams {
        session_id: response.session_id,
        token_value: response.token_value,
        stream_url: response.stream_url,
        region,
        profile,
        target_id,
        endpoint,
        client_id: Uuid::new_v4().to_string(),
        is_aws_cli_upgrade_needed,
    }))
}

/// Banner printed when the plugin is run with no arguments.
pub const INSTALL_BANNER: &str = "\nThe Session Manager plugin was installed successfully. \
Use the AWS CLI to start a session.\n";

/// Message printed for an argument vector that is not an invocation.
pub fn unknown_operation_message(operation: &str) -> String {
    format!(
        "\nUnknown operation {operation}. \nUse session-manager-plugin --version to check the version.\n"
    )
}
