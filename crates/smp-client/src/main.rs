//! Entry point for the session manager plugin.
//!
//! The outer CLI starts the session against the control plane and hands this
//! binary the response, region, profile and endpoint; everything after that
//! (stream, handshake, subsystem) happens here. All paths exit 0 so the
//! outer CLI never wraps a stale shell around a plugin error.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use smp_core::communicator::WebSocketChannel;
use smp_core::datachannel::DataChannel;
use smp_core::logging::{LogFormat, init_logging};

use smp_client::awsapi::{KmsService, SsmControlPlane};
use smp_client::cli::{Cli, CliAction, INSTALL_BANNER, StartSessionParams, unknown_operation_message, validate_input};
use smp_client::session::{Session, SessionRegistry};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_file = std::env::var("SMP_LOG_FILE").ok();
    let _ = init_logging(2, log_file.as_deref().map(Path::new), LogFormat::Text);

    match validate_input(&cli.args) {
        CliAction::ShowBanner => println!("{INSTALL_BANNER}"),
        CliAction::UnknownOperation(operation) => {
            println!("{}", unknown_operation_message(&operation))
        }
        CliAction::InvalidOperation => print!("Invalid Operation"),
        CliAction::Failed(message) => {
            error!("{message}");
            println!("{message}");
        }
        CliAction::StartSession(params) => start_session(*params).await,
    }
}

async fn start_session(params: StartSessionParams) {
    let control_plane = Arc::new(
        SsmControlPlane::new(&params.region, &params.profile, &params.endpoint).await,
    );
    let kms = Arc::new(KmsService::new(&params.region, &params.profile).await);

    let channel = Arc::new(WebSocketChannel::new(
        params.stream_url.clone(),
        params.token_value.clone(),
    ));
    let data_channel = Arc::new(DataChannel::new(
        channel,
        params.client_id.clone(),
        params.session_id.clone(),
        params.target_id.clone(),
        params.is_aws_cli_upgrade_needed,
    ));
    data_channel.set_kms_provider(kms);

    let session = Arc::new(Session::new(&params, data_channel, control_plane));
    let registry = SessionRegistry::with_default_plugins();

    if let Err(e) = session.execute(&registry).await {
        error!(error = %e, "cannot perform start session");
        println!("Cannot perform start session: {e}");
    }
}
