//! Overseer binary

use clap::{Parser, Subcommand};
use minidfs::{Overseer, OverseerConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minidfs-overseer")]
#[command(about = "minidfs overseer: node registry, placement, file metadata")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the overseer server
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Metadata dump path
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Replica count for uploads that do not ask for one
        #[arg(long)]
        replicas: Option<u32>,
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
            dump,
            replicas,
        } => {
            // file config first, CLI flags override
            let mut config = OverseerConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(dump) = dump {
                config.dump_path = dump;
            }
            if let Some(replicas) = replicas {
                config.default_replica_count = replicas;
            }
            Overseer::new(config).serve().await?;
        }
    }

    Ok(())
}
