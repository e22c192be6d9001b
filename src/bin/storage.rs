//! Storage node binary

use clap::{Parser, Subcommand};
use minidfs::{StorageConfig, StorageNode};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minidfs-storage")]
#[command(about = "minidfs storage node: holds replicas, serves downloads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the storage node
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Data directory for replica files
        #[arg(long)]
        data: Option<PathBuf>,

        /// Overseer address (host:port)
        #[arg(long)]
        overseer: Option<String>,

        /// Host other nodes and clients should reach this node on
        #[arg(long)]
        advertise_host: Option<String>,

        /// Capacity to report to the overseer, in bytes
        #[arg(long)]
        capacity_bytes: Option<u64>,
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
            data,
            overseer,
            advertise_host,
            capacity_bytes,
        } => {
            // file config first, CLI flags override
            let mut config = StorageConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(data) = data {
                config.data_dir = data;
            }
            if let Some(overseer) = overseer {
                config.overseer_addr = overseer;
            }
            if let Some(host) = advertise_host {
                config.advertise_host = host;
            }
            if let Some(capacity) = capacity_bytes {
                config.capacity_bytes = capacity;
            }
            StorageNode::new(config).serve().await?;
        }
    }

    Ok(())
}
