use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tlpipe::config::RunMode;
use tlpipe::phase::PhaseKind;

mod cmd;

use cmd::run::RunOptions;

#[derive(Parser)]
#[command(name = "tlpipe")]
#[command(version, about = "LLM translation pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to the config file (defaults to tlpipe.toml in the project dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Resume identifier; reruns with the same thread share checkpoints
    #[arg(long, default_value = "default", global = true)]
    pub thread: String,

    /// Work selection mode: overwrite, gap-fill, or new-only
    #[arg(long, global = true)]
    pub mode: Option<RunMode>,

    /// Restrict processing to one scene
    #[arg(long, global = true)]
    pub scene: Option<String>,

    /// Restrict processing to one route
    #[arg(long, global = true)]
    pub route: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute all enabled phases in dependency order
    Run,
    /// Execute a single phase
    Phase {
        /// Phase name: ingest, context, pretranslation, translate, qa, edit, export
        name: PhaseKind,

        /// Target language (required for language-scoped phases)
        #[arg(short, long)]
        lang: Option<String>,
    },
    /// Show per-phase revisions, staleness, and errors
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("tlpipe={default_level}"))),
        )
        .with_writer(std::io::stderr)
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let opts = RunOptions {
        project_dir: &project_dir,
        config_path: cli.config.as_deref(),
        thread: &cli.thread,
        mode: cli.mode,
        scene: cli.scene.clone(),
        route: cli.route.clone(),
    };

    match &cli.command {
        Commands::Run => cmd::cmd_run_pipeline(opts).await?,
        Commands::Phase { name, lang } => {
            cmd::cmd_run_phase(opts, *name, lang.as_deref()).await?;
        }
        Commands::Status => cmd::cmd_status(opts).await?,
    }

    Ok(())
}
