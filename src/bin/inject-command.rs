//! Fog connector command injection utility
//!
//! Publishes a single command onto one of the gateway's command routes, with
//! the message token taken from the same configuration the gateway uses.
//!
//! ## Usage
//!
//! ```bash
//! # Device command
//! inject-command -c fog-connector.toml --device-id d1 --command reboot
//!
//! # Command with arguments and a correlation id
//! inject-command -c fog-connector.toml --device-id d1 --command dim \
//!   --args '{"level": 40}' --correlation-id req-7
//!
//! # Desired state update
//! inject-command -c fog-connector.toml --device-id d1 --state '{"on": true}'
//! ```

use clap::Parser;
use fog_connector::auth::{token_provider_from_config, TokenCache};
use fog_connector::config::GatewayConfig;
use fog_connector::protocol::{CommandKind, Message, RouteTable};
use fog_connector::transport::mqtt::MqttSession;
use fog_connector::transport::{BrokerConnection, BrokerTransport, ReconnectConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "inject-command",
    about = "Publish a device command onto a fog connector command route"
)]
struct Args {
    /// Gateway configuration file
    #[arg(short, long, default_value = "fog-connector.toml")]
    config: PathBuf,

    /// Target device
    #[arg(long)]
    device_id: String,

    /// Command name (send_command route)
    #[arg(long, conflicts_with = "state", required_unless_present = "state")]
    command: Option<String>,

    /// Command arguments as JSON
    #[arg(long, requires = "command")]
    args: Option<String>,

    /// Desired state as a JSON object (update_state route)
    #[arg(long)]
    state: Option<String>,

    #[arg(long)]
    correlation_id: Option<String>,

    /// Publish without a token
    #[arg(long)]
    no_token: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("inject-command: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::load_from_file(&args.config)?;
    let (kind, payload) = build_payload(&args)?;

    let routes = RouteTable::from_config(&config.routes);
    let command_route = routes
        .command_routes()
        .iter()
        .find(|route| route.kind == kind)
        .ok_or_else(|| format!("no {kind:?} route configured"))?;
    let route = command_route.route.clone();

    let mut message = Message::new(args.device_id.clone(), payload)
        .with_correlation_id(args.correlation_id.clone());
    if !args.no_token {
        let tokens = TokenCache::new(token_provider_from_config(&config)?);
        message = message.stamped(&tokens.current().await?.value);
    }

    let session = MqttSession::new(&format!("{}-inject", config.gateway.id), config.broker.clone());
    let broker = BrokerConnection::new(
        session,
        ReconnectConfig::from(&config.broker.reconnect),
        config.broker.buffer_capacity,
    );

    println!("Connecting to {}...", config.broker.broker_url);
    broker.start().await?;
    let outcome = broker.publish(&route, &message).await;
    broker.close().await?;
    outcome?;

    println!("Published {} to {} for {}", message.id, route.topic, args.device_id);
    Ok(())
}

fn build_payload(args: &Args) -> Result<(CommandKind, Value), Box<dyn std::error::Error>> {
    if let Some(state) = &args.state {
        let state: Value = serde_json::from_str(state)?;
        if !state.is_object() {
            return Err("--state must be a JSON object".into());
        }
        let mut body = json!({ "device_id": args.device_id, "state": state });
        if let Some(id) = &args.correlation_id {
            body["correlation_id"] = json!(id);
        }
        return Ok((CommandKind::UpdateState, body));
    }

    let name = args.command.clone().ok_or("either --command or --state is required")?;
    let mut command = json!({ "name": name });
    if let Some(raw) = &args.args {
        command["args"] = serde_json::from_str(raw)?;
    }
    let mut body = json!({ "device_id": args.device_id, "command": command });
    if let Some(id) = &args.correlation_id {
        body["correlation_id"] = json!(id);
    }
    Ok((CommandKind::SendCommand, body))
}
