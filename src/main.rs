//! Fog connector - main entry point
//!
//! Loads configuration, drops privileges, then wires the broker session, the
//! cloud connector and the bridge together and runs until SIGINT or SIGTERM.

use fog_connector::auth::{token_provider_from_config, TokenCache};
use fog_connector::cloud::CloudConnectorFactory;
use fog_connector::config::GatewayConfig;
use fog_connector::error::GatewayError;
use fog_connector::gateway::GatewayLifecycle;
use fog_connector::observability::{health::HealthServer, init_default_logging, metrics::metrics};
use fog_connector::privileges::drop_privileges;
use fog_connector::transport::mqtt::MqttSession;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Configuration files tried when `--config` is not given
const DEFAULT_CONFIG_PATHS: &[&str] = &["fog-connector.toml", "config/fog-connector.toml"];

/// Fog gateway between an on-premises MQTT broker and a cloud IoT platform
#[derive(Parser)]
#[command(name = "fog-connector")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "FOG_CONNECTOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run,
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    info!("Starting fog-connector v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e.sanitized(), "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_gateway(config).await,
        Commands::Config { show } => show_config(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e.sanitized(), fatal = e.is_fatal(), "Gateway failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(path: Option<&Path>) -> Result<GatewayConfig, GatewayError> {
    if let Some(path) = path {
        info!(path = %path.display(), "Loading configuration");
        return Ok(GatewayConfig::load_from_file(path)?);
    }

    let path = DEFAULT_CONFIG_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .ok_or_else(|| {
            GatewayError::Startup(
                "no configuration file found; pass -c/--config or create fog-connector.toml"
                    .to_string(),
            )
        })?;
    info!(path = %path.display(), "Loading configuration");
    Ok(GatewayConfig::load_from_file(path)?)
}

async fn run_gateway(config: GatewayConfig) -> Result<(), GatewayError> {
    info!(gateway_id = %config.gateway.id, "Bootstrapping gateway");
    metrics().set_gateway_state("initializing");

    // Before any socket is opened
    drop_privileges(&config.run_as).map_err(|e| GatewayError::Startup(e.to_string()))?;

    let gateway = build_gateway(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_server = Arc::new(HealthServer::new(
        config.gateway.id.clone(),
        config.gateway.health_port,
        Arc::new(gateway.health_checks()),
    ));
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.serve(shutdown_rx).await {
            error!(error = %e, "Health server error");
        }
    });

    gateway.start().await?;
    info!("Gateway is running");

    wait_for_shutdown_signal().await;

    let report = gateway.shutdown().await;
    if report.undelivered() > 0 {
        warn!(
            inbound = report.inbound_undelivered,
            outbound = report.outbound_undelivered,
            "Messages left undelivered at shutdown"
        );
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task ended abnormally");
    }
    Ok(())
}

/// Assemble the gateway from configuration
async fn build_gateway(config: &GatewayConfig) -> Result<GatewayLifecycle<MqttSession>, GatewayError> {
    let tokens = Arc::new(TokenCache::new(token_provider_from_config(config)?));
    // An unusable token is fatal before anything connects
    tokens.current().await?;

    let connector = CloudConnectorFactory::create(config)?;
    let session = MqttSession::new(&config.gateway.id, config.broker.clone());

    GatewayLifecycle::new(config, session, connector, tokens)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down gracefully"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C, shutting down gracefully");
}

fn show_config(config: &GatewayConfig, show: bool) -> Result<(), GatewayError> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| GatewayError::Startup(format!("cannot render configuration: {e}")))?;
        println!("{rendered}");
    }
    info!("Configuration is valid");
    Ok(())
}
