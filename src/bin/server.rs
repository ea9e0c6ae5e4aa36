//! Server binary

use clap::{Parser, Subcommand};
use minirepo::{common::Config, ops, Server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minirepo-server")]
#[command(about = "minirepo artifact repository server")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./minirepo.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Content store root directory
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    /// Metadata database directory
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Maximum upload size in bytes
        #[arg(long)]
        max_upload_bytes: Option<u64>,
    },

    /// Check metadata against content (server must be stopped)
    Verify {
        /// Re-hash every file
        #[arg(long)]
        deep: bool,
    },

    /// Remove orphaned files and directories (server must be stopped)
    Repair {
        /// Only report what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file and environment, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(root) = cli.storage_root {
        config.storage_root = root;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            max_upload_bytes,
        } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(max) = max_upload_bytes {
                config.max_upload_bytes = max;
            }
            config.validate()?;
            Server::new(config).serve().await?;
        }

        Commands::Verify { deep } => {
            let coordinator = Server::open_coordinator(&config)?;
            let report =
                ops::verify_store(coordinator.metadata().as_ref(), coordinator.content(), deep)
                    .await?;
            println!("Verification report:");
            println!("  Projects: {}", report.total_projects);
            println!("  Artifacts: {}", report.total_artifacts);
            println!("  Healthy: {}", report.healthy);
            println!("  Missing files: {}", report.missing.len());
            println!("  Size mismatches: {}", report.size_mismatch.len());
            println!("  Corrupted: {}", report.corrupted.len());
            println!("  Orphaned files: {}", report.orphaned_files.len());
            println!("  Orphaned directories: {}", report.orphaned_dirs.len());
            for file in report
                .missing
                .iter()
                .chain(&report.size_mismatch)
                .chain(&report.corrupted)
                .chain(&report.orphaned_files)
            {
                println!("    {}/{}", file.project, file.name);
            }
            if !report.is_consistent() {
                std::process::exit(1);
            }
        }

        Commands::Repair { dry_run } => {
            let coordinator = Server::open_coordinator(&config)?;
            let report = coordinator.repair_orphans(dry_run).await?;
            println!("Repair report{}:", if dry_run { " (dry run)" } else { "" });
            println!("  Files removed: {}", report.files_removed);
            println!("  Directories removed: {}", report.dirs_removed);
            println!("  Skipped: {}", report.skipped);
        }
    }

    Ok(())
}
