//! Host daemon binary

use clap::{Parser, Subcommand};
use skyclaw::common::{Config, HostConfig};
use skyclaw::host::HostDaemon;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skyclaw-host")]
#[command(about = "skyclaw host daemon: claims and executes cluster work")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host daemon
    Run {
        /// Config file (JSON); CLI flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Coordinator base URLs (comma-separated)
        #[arg(long, value_delimiter = ',')]
        coordinators: Vec<String>,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Stable host id to re-register under
        #[arg(long)]
        host_id: Option<String>,

        /// Capability labels (comma-separated)
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,

        /// Max concurrent leases
        #[arg(long)]
        max_parallel: Option<u32>,

        /// Shared cluster token
        #[arg(long)]
        token: Option<String>,

        /// Commands shell payloads may invoke (comma-separated)
        #[arg(long, value_delimiter = ',')]
        shell_allowlist: Vec<String>,
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
        Commands::Run {
            config,
            coordinators,
            name,
            host_id,
            capabilities,
            max_parallel,
            token,
            shell_allowlist,
        } => {
            let mut host_config = match config {
                Some(path) => Config::from_file(path)?.host,
                None => None,
            }
            .unwrap_or_else(|| HostConfig {
                coordinators: vec![],
                name: "skyclaw-host".into(),
                host_id: None,
                capabilities: vec![],
                max_parallel: 1,
                auth_token: None,
                heartbeat_interval_secs: 5,
                poll_interval_secs: 2,
                shell_allowlist: vec![],
                output_cap_bytes: 256 * 1024,
                openclaw_bin: "openclaw".into(),
                advertise_host: "127.0.0.1".into(),
                service_port_base: 9000,
            });
            if !coordinators.is_empty() {
                host_config.coordinators = coordinators;
            }
            if let Some(name) = name {
                host_config.name = name;
            }
            if let Some(host_id) = host_id {
                host_config.host_id = Some(host_id);
            }
            if !capabilities.is_empty() {
                host_config.capabilities = capabilities;
            }
            if let Some(max_parallel) = max_parallel {
                host_config.max_parallel = max_parallel;
            }
            if let Some(token) = token {
                host_config.auth_token = Some(token);
            }
            if !shell_allowlist.is_empty() {
                host_config.shell_allowlist = shell_allowlist;
            }
            if host_config.coordinators.is_empty() {
                anyhow::bail!("at least one --coordinators URL is required");
            }

            HostDaemon::new(host_config).run().await?;
        }
    }

    Ok(())
}
