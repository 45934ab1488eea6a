//! CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use studyhall::bootstrap::{background_intervals, build_node};
use studyhall::health::RESTART_EXIT_CODE;
use studyhall::Config;

#[derive(Parser)]
#[command(name = "studyhall", version, about = "Offline-first AI tutoring node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node: serve queries and background synchronizers.
    Serve,
    /// Verify and activate a curriculum package from a file.
    InstallVkp {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        grade: String,
        /// Path to the package file.
        file: PathBuf,
    },
    /// Roll a subject back to its previous package version.
    RollbackVkp {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        grade: String,
    },
    /// Print node health, queue, and installation state.
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("studyhall=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::InstallVkp {
            subject,
            grade,
            file,
        } => {
            let node = build_node(&config).await?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading package {}", file.display()))?;
            let version = node.install_vkp(&subject, &grade, &bytes).await?;
            println!("active version: {version}");
            node.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::RollbackVkp { subject, grade } => {
            let node = build_node(&config).await?;
            let version = node.rollback_vkp(&subject, &grade).await?;
            println!("active version: {version}");
            node.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let node = build_node(&config).await?;
            let health = node.health().await;
            let status = serde_json::json!({
                "health": health,
                "queue": node.queue_stats(),
                "installations": node.installations(),
                "cache": node.cache_stats().await,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            node.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<ExitCode> {
    let node = build_node(&config).await?;
    node.start_background(background_intervals(&config));
    tracing::info!(
        data_dir = %config.node.data_dir.display(),
        sovereign = config.node.sovereign_mode,
        workers = config.scheduler.workers,
        "node up"
    );

    let restart = node.restart_signal();
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            ExitCode::SUCCESS
        }
        _ = restart.cancelled() => {
            // The restart policy already drained and flushed; the
            // distinguishable code tells the process manager to respawn.
            ExitCode::from(RESTART_EXIT_CODE as u8)
        }
    };

    node.shutdown().await;
    Ok(exit_code)
}
