//! Gossip node CLI application
//!
//! Starts a node, optionally joins a peer, then reads commands from stdin.

use clap::Parser;
use gossip_node::cli::{self, USAGE};
use gossip_node::network::{Network, NodeConfig, PrintHandler, TcpTransport};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "p2p-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A minimal P2P node with gossip peer discovery", long_about = None)]
struct Cli {
    /// This node's address (host:port); also its node id
    #[arg(long, default_value = "127.0.0.1:1248")]
    address: String,

    /// Peer to connect to after startup (host:port)
    #[arg(long)]
    connect_to: Option<String>,

    /// Directory holding the peer file
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match NodeConfig::from_address(&cli.address) {
        Ok(config) => NodeConfig {
            data_dir: cli.data_dir,
            ..config
        },
        Err(e) => {
            println!("Error: Address must be in format IP:PORT");
            return Err(e.into());
        }
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_node(config, cli.connect_to))
}

async fn run_node(
    config: NodeConfig,
    connect_to: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🌐 Starting P2P node on {}", config.node_id);

    let network = Network::create(config, TcpTransport, PrintHandler).await;

    let server = match network.start().await {
        Ok(server) => server,
        Err(e) => {
            println!("❌ Failed to start P2P network: {}", e);
            return Err(e.into());
        }
    };

    if let Some(peer) = connect_to {
        if let Err(e) = network.connect(&peer).await {
            println!("⚠️  Failed to connect to {}: {}", peer, e);
        }
    }

    println!("✅ P2P Node ready.");
    println!("{}", USAGE);

    cli::run_command_loop(&network).await?;

    println!("📴 Shutting down node...");
    server.shutdown().await;

    Ok(())
}
