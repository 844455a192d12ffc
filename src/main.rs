use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beez_node::config::NodeConfig;
use beez_node::crypto::{generate_keypair, load_or_generate_keypair, save_keypair, Wallet};
use beez_node::node::Node;
use beez_node::protocol::Connector;
use beez_node::transport::TcpTransport;

#[derive(Parser)]
#[command(author, version, about = "Beez peer-to-peer blockchain node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Generate a new Ed25519 keypair for the node wallet
    Keygen {
        #[arg(short, long, default_value = "keys/node.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_node(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path } => keygen(path)?,
    }

    Ok(())
}

async fn start_node(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };
    config.ensure_directories()?;

    let wallet = Wallet::new(load_or_generate_keypair(&config.key_path)?);
    let local = Connector::new(config.advertised_ip(), config.p2p_listen.port());
    let neighbor = config
        .neighbor
        .map(|addr| Connector::new(addr.ip().to_string(), addr.port()));
    let transport = TcpTransport::bind(
        config.p2p_listen,
        local,
        neighbor,
        config.max_frame_length,
    )
    .await?;

    let node = Node::new(config, wallet, Arc::new(transport.clone()))?;
    let handle = node.handle();
    info!(public_key = %handle.public_key(), address = %handle.address(), "starting node");
    let listener_task = transport.serve(node.dispatcher())?;
    let node_task = tokio::spawn(async move { node.start().await });

    let result = tokio::select! {
        res = node_task => handle_join(res),
        res = listener_task => res.map_err(Into::into),
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    result?;
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<()> {
    let keypair = generate_keypair();
    save_keypair(&path, &keypair)?;
    let wallet = Wallet::new(keypair);
    info!(?path, public_key = %wallet.public_key_string(), "generated node keypair");
    Ok(())
}

fn handle_join(result: Result<beez_node::errors::ChainResult<()>, JoinError>) -> Result<()> {
    let inner = result?;
    inner?;
    Ok(())
}
