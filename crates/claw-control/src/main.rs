//! claw-control - OpenClaw gateway control client
//!
//! Connects to the gateway as an operator device, calls RPC methods, and
//! manages device pairing and tokens.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use claw_control::{
    ChannelHandler, ControlConfig, GatewayClient, GatewayNotification,
    protocol::CONNECT_FAILED_CLOSE_CODE,
};
use claw_identity::{DeviceIdentityManager, DeviceTokenStore};
use claw_persist::{FileStore, KeyValueStore};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "claw-control")]
#[command(about = "OpenClaw gateway control client")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "CLAW_CONTROL_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway WebSocket URL
    #[arg(long, env = "CLAW_GATEWAY_URL")]
    url: Option<String>,

    /// Gateway token
    #[arg(long, env = "CLAW_GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Gateway password
    #[arg(long, env = "CLAW_GATEWAY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Role to request
    #[arg(long)]
    role: Option<String>,

    /// Directory holding device identity and tokens
    #[arg(long, env = "CLAW_CONTROL_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Seconds to wait for the handshake
    #[arg(long, default_value_t = 15)]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the local device identity
    Identity,

    /// Call a gateway method and print the result
    Call {
        /// Method name
        method: String,

        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Print gateway events until interrupted
    Watch,

    /// Manage device pairing and tokens
    Devices {
        #[command(subcommand)]
        command: DeviceCommands,
    },

    /// Inspect or clear the cached device token
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Write a config file
    InitConfig {
        /// Path to write config
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Gateway URL
        #[arg(long, default_value = "ws://127.0.0.1:18789")]
        gateway: String,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// List pending and paired devices
    List,
    /// Approve a pairing request
    Approve {
        /// Pairing request id
        request_id: String,
    },
    /// Reject a pairing request
    Reject {
        /// Pairing request id
        request_id: String,
    },
    /// Issue a new token for a device
    Rotate {
        /// Device id
        device_id: String,
        /// Role the token is bound to
        #[arg(long, default_value = "operator")]
        role: String,
        /// Scopes to grant (repeatable)
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
    /// Revoke a device token
    Revoke {
        /// Device id
        device_id: String,
        /// Role the token is bound to
        #[arg(long, default_value = "operator")]
        role: String,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Show the cached token for a role
    Show {
        /// Role
        #[arg(long, default_value = "operator")]
        role: String,
    },
    /// Forget the cached token for a role
    Clear {
        /// Role
        #[arg(long, default_value = "operator")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("claw_control=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(ControlConfig::default_path);

    if let Commands::InitConfig { output, gateway } = &cli.command {
        return init_config(output.clone().unwrap_or(config_path), gateway.clone());
    }

    let config = resolve_config(&cli, &config_path)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.state_dir.clone()));
    let timeout = Duration::from_secs(cli.connect_timeout);

    match cli.command {
        Commands::Identity => show_identity(store),
        Commands::Call { method, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            let client = connect(&config, store, timeout).await?;
            let result = client.request(&method, params).await;
            client.stop();
            println!("{}", serde_json::to_string_pretty(&result?)?);
            Ok(())
        }
        Commands::Watch => watch(&config, store).await,
        Commands::Devices { command } => {
            let client = connect(&config, store, timeout).await?;
            let result = run_device_command(&client, command).await;
            client.stop();
            result
        }
        Commands::Token { command } => token_command(store, command),
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn resolve_config(cli: &Cli, path: &Path) -> anyhow::Result<ControlConfig> {
    let mut config = ControlConfig::load_or_default(path)?;
    if let Some(url) = &cli.url {
        config.gateway_url.clone_from(url);
    }
    if cli.token.is_some() {
        config.token.clone_from(&cli.token);
    }
    if cli.password.is_some() {
        config.password.clone_from(&cli.password);
    }
    if let Some(role) = &cli.role {
        config.role.clone_from(role);
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir.clone_from(dir);
    }
    config.validate()?;
    Ok(config)
}

/// Start a client and wait for the handshake to finish.
///
/// The notification receiver is dropped once the client is connected, so
/// later events are discarded without filling the channel.
async fn connect(
    config: &ControlConfig,
    store: Arc<dyn KeyValueStore>,
    timeout: Duration,
) -> anyhow::Result<GatewayClient> {
    let (handler, mut rx) = ChannelHandler::new(256);
    let client = GatewayClient::new(config.client_options(), store, handler);
    client.start();

    let ready = tokio::time::timeout(timeout, async {
        while let Some(notification) = rx.recv().await {
            match notification {
                GatewayNotification::Hello(_) => return Ok(()),
                GatewayNotification::Closed(close) if close.code == CONNECT_FAILED_CLOSE_CODE => {
                    return Err(anyhow::anyhow!("gateway rejected the handshake"));
                }
                GatewayNotification::Closed(close) => {
                    warn!(code = close.code, reason = %close.reason, "connection attempt failed");
                }
                _ => {}
            }
        }
        Err(anyhow::anyhow!("gateway client stopped"))
    })
    .await;

    match ready {
        Ok(Ok(())) => Ok(client),
        Ok(Err(e)) => {
            client.stop();
            Err(e)
        }
        Err(_) => {
            client.stop();
            bail!("timed out connecting to {}", config.gateway_url)
        }
    }
}

fn show_identity(store: Arc<dyn KeyValueStore>) -> anyhow::Result<()> {
    let identity = DeviceIdentityManager::new(store).ensure_identity();
    println!("Device ID:  {}", identity.device_id);
    println!("Public key: {}", identity.public_key);
    Ok(())
}

async fn watch(config: &ControlConfig, store: Arc<dyn KeyValueStore>) -> anyhow::Result<()> {
    let (handler, mut rx) = ChannelHandler::new(1024);
    let client = GatewayClient::new(config.client_options(), store, handler);
    client.start();
    info!(url = %config.gateway_url, "watching gateway events");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = rx.recv() => match notification {
                Some(GatewayNotification::Hello(_)) => println!("-- connected"),
                Some(GatewayNotification::Event(event)) => {
                    let seq = event.seq.map_or_else(String::new, |s| format!("#{s} "));
                    println!("{seq}{} {}", event.event, event.payload);
                }
                Some(GatewayNotification::Gap(gap)) => {
                    println!("-- missed events {}..{}", gap.expected, gap.received);
                }
                Some(GatewayNotification::Closed(close)) => {
                    println!("-- closed ({}): {}", close.code, close.reason);
                }
                None => break,
            },
        }
    }

    client.stop();
    Ok(())
}

async fn run_device_command(client: &GatewayClient, command: DeviceCommands) -> anyhow::Result<()> {
    match command {
        DeviceCommands::List => {
            let list = client.list_pairings().await?;
            if list.pending.is_empty() {
                println!("No pending pairing requests");
            } else {
                println!("Pending ({}):", list.pending.len());
                for p in &list.pending {
                    println!(
                        "  {}  device={}  role={}  name={}",
                        p.request_id,
                        p.device_id,
                        p.role.as_deref().unwrap_or("-"),
                        p.display_name.as_deref().unwrap_or("-"),
                    );
                }
            }
            println!();
            println!("Paired ({}):", list.paired.len());
            for d in &list.paired {
                println!(
                    "  {}  roles={}  name={}",
                    d.device_id,
                    d.roles.join(","),
                    d.display_name.as_deref().unwrap_or("-"),
                );
            }
        }
        DeviceCommands::Approve { request_id } => {
            client.approve_pairing(&request_id).await?;
            println!("Approved {request_id}");
        }
        DeviceCommands::Reject { request_id } => {
            client.reject_pairing(&request_id).await?;
            println!("Rejected {request_id}");
        }
        DeviceCommands::Rotate { device_id, role, scopes } => {
            let rotated = client.rotate_token(&device_id, &role, &scopes).await?;
            println!("{}", serde_json::to_string_pretty(&rotated)?);
        }
        DeviceCommands::Revoke { device_id, role } => {
            let revoked = client.revoke_token(&device_id, &role).await?;
            println!("Revoked {} token for {}", revoked.role, revoked.device_id);
        }
    }
    Ok(())
}

fn token_command(store: Arc<dyn KeyValueStore>, command: TokenCommands) -> anyhow::Result<()> {
    let identity = DeviceIdentityManager::new(Arc::clone(&store)).ensure_identity();
    let tokens = DeviceTokenStore::new(store);

    match command {
        TokenCommands::Show { role } => match tokens.get(&identity.device_id, &role) {
            Some(token) => {
                println!("Device ID: {}", identity.device_id);
                println!("Role:      {}", token.role);
                println!(
                    "Scopes:    {}",
                    token.scopes.iter().cloned().collect::<Vec<_>>().join(",")
                );
                println!("Updated:   {}", format_ms(token.updated_at_ms));
                println!("Token:     {}", token.token);
            }
            None => println!("No cached {role} token for device {}", identity.device_id),
        },
        TokenCommands::Clear { role } => {
            tokens.clear(&identity.device_id, &role)?;
            println!("Cleared cached {role} token");
        }
    }
    Ok(())
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(|| ms.to_string(), |t| t.to_rfc3339())
}

fn init_config(output: PathBuf, gateway: String) -> anyhow::Result<()> {
    let config = ControlConfig {
        gateway_url: gateway,
        ..ControlConfig::default()
    };
    config.validate()?;
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Add a gateway token or password if required, then run:");
    println!("  claw-control --config {} call health", output.display());

    Ok(())
}
