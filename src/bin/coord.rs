//! Coordinator binary

use clap::{Parser, Subcommand};
use skyclaw::common::{Config, CoordinatorConfig};
use skyclaw::Coordinator;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skyclaw-coord")]
#[command(about = "skyclaw coordinator: replicated job queue and host registry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Config file (JSON); CLI flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen port
        #[arg(long)]
        port: Option<u16>,

        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Node ID (minted if absent)
        #[arg(long)]
        node_id: Option<String>,

        /// Public base URL peers should use to reach this node
        #[arg(long)]
        public_url: Option<String>,

        /// Seed peer base URLs (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Shared cluster token
        #[arg(long)]
        token: Option<String>,

        /// Minimum replica count per committed write
        #[arg(long)]
        min_replicas: Option<u32>,

        /// Job lease duration in milliseconds
        #[arg(long)]
        lease_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            host,
            db,
            node_id,
            public_url,
            peers,
            token,
            min_replicas,
            lease_ms,
        } => {
            let mut coord_config = match config {
                Some(path) => Config::from_file(path)?
                    .coordinator
                    .unwrap_or_default(),
                None => CoordinatorConfig::default(),
            };
            if let Some(port) = port {
                coord_config.port = port;
            }
            if let Some(host) = host {
                coord_config.host = host;
            }
            if let Some(db) = db {
                coord_config.db_path = db;
            }
            if let Some(node_id) = node_id {
                coord_config.node_id = Some(node_id);
            }
            if let Some(public_url) = public_url {
                coord_config.public_url = Some(public_url);
            }
            if !peers.is_empty() {
                coord_config.peer_urls = peers;
            }
            if let Some(token) = token {
                coord_config.auth_token = Some(token);
            }
            if let Some(min_replicas) = min_replicas {
                coord_config.min_replicas = min_replicas;
            }
            if let Some(lease_ms) = lease_ms {
                coord_config.lease_ms = lease_ms;
            }

            Coordinator::new(coord_config).serve().await?;
        }
    }

    Ok(())
}
