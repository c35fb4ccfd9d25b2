//! # iris
//!
//! Terminal client for a broker-connected assistant service.

#![deny(unsafe_code)]

mod cli;
mod front;
mod loopback;
mod playback;
mod repl;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use iris_client::settings::load_layered;
use iris_client::{IrisClient, IrisSettings};
use iris_core::{RoutingIdentity, SessionId};
use iris_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tracing::info;

use crate::cli::{Cli, Command, StartClientArgs};
use crate::front::CliFront;
use crate::loopback::Loopback;
use crate::repl::Repl;

const DEFAULT_CLIENT_NAME: &str = "unknown";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::StartClient(args) => start_client(args).await,
    }
}

async fn start_client(args: StartClientArgs) -> Result<()> {
    let log_level = parse_level(&args.log_level)
        .with_context(|| format!("invalid log level: {}", args.log_level))?;
    init_telemetry(TelemetryConfig {
        log_level,
        module_levels: Vec::new(),
        json: args.json_logs,
    })?;

    let mut settings = load_layered(&args.sources()).context("failed to load settings")?;
    if settings.client.client_name == DEFAULT_CLIENT_NAME {
        settings.client.client_name = "cli".into();
    }
    let lang = args
        .lang
        .clone()
        .unwrap_or_else(|| settings.client.default_lang.clone());

    if !args.loopback {
        bail!(
            "no AMQP transport is built into this binary; run with --loopback \
             or embed iris-client with a BrokerAdapter for {}",
            settings.mq.broker_config().display_url()
        );
    }
    let loopback = Loopback::start(&settings).await?;

    let identity = RoutingIdentity::new();
    let session = cli_session(&settings, &identity);
    let client = IrisClient::connect_with_identity(
        settings.clone(),
        loopback.adapter.clone(),
        Arc::new(CliFront),
        identity,
    )
    .await
    .context("failed to connect")?;
    client.register_session(session.clone(), settings.user.clone().with_username(session.as_str()));
    let client = Arc::new(client);
    info!(identity = %client.identity(), session_id = %session, lang = %lang, "client ready");

    let result = Repl {
        client: client.clone(),
        session,
        lang,
        audio: args.audio,
    }
    .run()
    .await;

    println!("Shutting Down Client");
    client.shutdown().await;
    loopback.stop().await;
    result
}

/// The CLI's single session is addressed by the profile username, or by the
/// routing identity when the profile has none.
fn cli_session(settings: &IrisSettings, identity: &RoutingIdentity) -> SessionId {
    match settings.user.username() {
        "" => SessionId::from_raw(identity.as_str()),
        name => SessionId::from_raw(name),
    }
}
