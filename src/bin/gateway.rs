//! Gateway binary

use clap::{Parser, Subcommand};
use skyclaw::common::{Config, GatewayConfig};
use skyclaw::gateway::Gateway;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skyclaw-gateway")]
#[command(about = "skyclaw gateway: federated routing to running services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Config file (JSON); CLI flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Coordinator base URLs (comma-separated)
        #[arg(long, value_delimiter = ',')]
        coordinators: Vec<String>,

        /// Shared cluster token
        #[arg(long)]
        token: Option<String>,
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
            bind,
            coordinators,
            token,
        } => {
            let mut gateway_config = match config {
                Some(path) => Config::from_file(path)?.gateway,
                None => None,
            }
            .unwrap_or_else(|| GatewayConfig {
                coordinators: vec![],
                bind: "0.0.0.0:8080".into(),
                auth_token: None,
                poll_interval_secs: 5,
                probe_interval_secs: 10,
                cooldown_secs: 30,
            });
            if let Some(bind) = bind {
                gateway_config.bind = bind;
            }
            if !coordinators.is_empty() {
                gateway_config.coordinators = coordinators;
            }
            if let Some(token) = token {
                gateway_config.auth_token = Some(token);
            }
            if gateway_config.coordinators.is_empty() {
                anyhow::bail!("at least one --coordinators URL is required");
            }

            Gateway::new(gateway_config).serve().await?;
        }
    }

    Ok(())
}
