//! CLI for uploads and downloads

use clap::{Parser, Subcommand};
use minidfs::common::hash::hex_digest;
use minidfs::common::utils::format_bytes;
use minidfs::transfer::ProgressSink;
use minidfs::{ClientConfig, DfsClient};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "minidfs")]
#[command(about = "minidfs distributed file store CLI")]
#[command(version)]
struct Cli {
    /// Overseer address (host:port)
    #[arg(long, default_value = "localhost:7500")]
    overseer: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file into the cluster
    Upload {
        /// File to upload
        file: PathBuf,

        /// Number of replicas (0 takes the cluster default)
        #[arg(long, default_value = "0")]
        replicas: u32,
    },

    /// Download a file by id
    Download {
        /// File id printed by a previous upload
        file_id: String,

        /// Output path
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = DfsClient::new(ClientConfig {
        overseer_addr: cli.overseer.clone(),
        ..ClientConfig::default()
    });

    match cli.command {
        Commands::Upload { file, replicas } => {
            let (sink, printer) = progress_printer();
            let receipt = client.upload(&file, replicas, sink).await?;
            printer.await?;
            println!("Uploaded {}", file.display());
            println!("  file id: {}", receipt.file_id);
            println!("  size: {}", format_bytes(receipt.size_bytes));
            println!("  md5: {}", hex_digest(&receipt.md5));
            println!("  replicas: {}", receipt.replicas.join(", "));
            println!("  took: {:?}", receipt.elapsed);
        }

        Commands::Download { file_id, output } => {
            let (sink, printer) = progress_printer();
            let receipt = client.download(&file_id, &output, sink).await?;
            printer.await?;
            println!("Downloaded {} -> {}", receipt.file_id, output.display());
            println!("  size: {}", format_bytes(receipt.size_bytes));
            println!("  served by: {}", receipt.source);
            println!("  took: {:?}", receipt.elapsed);
        }
    }

    Ok(())
}

/// Print progress in ten-percent steps; the task ends when the transfer
/// drops its sink.
fn progress_printer() -> (ProgressSink, tokio::task::JoinHandle<()>) {
    let (sink, mut rx) = ProgressSink::channel();
    let task = tokio::spawn(async move {
        let mut last = 0u64;
        while let Some(event) = rx.recv().await {
            let percent = event.percent();
            if percent >= last + 10 || (percent == 100 && last != 100) {
                println!("  {}% ({})", percent, format_bytes(event.bytes_done));
                last = percent;
            }
        }
    });
    (sink, task)
}
