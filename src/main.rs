use clap::{Parser, Subcommand};
use log::info;
use mini_kad::utils::setup_logging;
use mini_kad::{Config, NodeAddress, Node, NodeId, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mini-kad")]
#[command(about = "A Kademlia DHT node for content-addressed file sharing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a DHT node
    Start {
        /// Address advertised to peers
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// TCP port for content transfer
        #[arg(long, default_value = "4000")]
        tcp_port: u16,
        /// UDP port for RPCs
        #[arg(long, default_value = "4001")]
        udp_port: u16,
        /// Bootstrap peer address (host:tcp_port/udp_port)
        #[arg(short, long)]
        bootstrap: Option<NodeAddress>,
        /// Contacts queried in parallel per lookup
        #[arg(long, default_value = "3")]
        alpha: usize,
        /// Bucket size and replication factor
        #[arg(short, long, default_value = "20")]
        k: usize,
        /// Seconds before an unpinned entry is evicted
        #[arg(long, default_value = "86400")]
        eviction_secs: u64,
        /// Seconds between re-announcements of stored files
        #[arg(long, default_value = "3600")]
        republish_secs: u64,
        /// RPC timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
        /// Files to publish once the node is up
        #[arg(short, long)]
        store: Vec<PathBuf>,
    },
    /// Print the content key of a file
    Hash {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            host,
            tcp_port,
            udp_port,
            bootstrap,
            alpha,
            k,
            eviction_secs,
            republish_secs,
            timeout_ms,
            store,
        } => {
            let config = Config {
                host,
                tcp_port,
                udp_port,
                bootstrap_peer: bootstrap,
                alpha,
                k,
                eviction_ttl: Duration::from_secs(eviction_secs),
                republish_interval: Duration::from_secs(republish_secs),
                connection_timeout: Duration::from_millis(timeout_ms),
                ..Config::default()
            };

            let node = Node::new(config).await?;
            node.start().await?;

            for path in store {
                let data = tokio::fs::read(&path).await?;
                let hash = node.store_pinned(&data).await;
                println!("{} {}", hash, path.display());
            }

            println!("Node {} listening on {}", node.me().node_id, node.me().address);
            tokio::signal::ctrl_c().await?;
            info!("Ctrl+C received, shutting down");
            node.shutdown();
        }
        Commands::Hash { file } => {
            let data = tokio::fs::read(&file).await?;
            println!("{}", NodeId::from_content(&data));
        }
    }

    Ok(())
}
