//! Pipeline execution commands: `tlpipe run` and `tlpipe phase <name>`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use tlpipe::agent::CliBackend;
use tlpipe::config::{PipelineConfig, RunMode, TargetFilter};
use tlpipe::orchestrator::Orchestrator;
use tlpipe::orchestrator::events::PipelineEvent;
use tlpipe::phase::PhaseKind;

pub struct RunOptions<'a> {
    pub project_dir: &'a Path,
    pub config_path: Option<&'a Path>,
    pub thread: &'a str,
    pub mode: Option<RunMode>,
    pub scene: Option<String>,
    pub route: Option<String>,
}

fn load_config(opts: &RunOptions<'_>) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(opts.project_dir, opts.config_path)?;
    if let Some(mode) = opts.mode {
        config.mode = mode;
    }
    if opts.scene.is_some() || opts.route.is_some() {
        config.filter = TargetFilter {
            scene: opts.scene.clone(),
            route: opts.route.clone(),
        };
    }
    Ok(config)
}

fn build_orchestrator(
    opts: &RunOptions<'_>,
) -> Result<(Orchestrator, mpsc::Receiver<PipelineEvent>)> {
    let config = load_config(opts)?;
    let backend = Arc::new(CliBackend::new(
        &config.backend.command,
        &config.backend.args,
    ));
    let (tx, rx) = mpsc::channel(64);
    let orchestrator = Orchestrator::new(config, backend, opts.thread, Some(tx))?;
    Ok((orchestrator, rx))
}

/// Print each event as a single human-readable line. The structured copy
/// goes through `tracing` regardless.
fn spawn_event_printer(mut rx: mpsc::Receiver<PipelineEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{}", event.message());
        }
    })
}

pub async fn cmd_run_pipeline(opts: RunOptions<'_>) -> Result<()> {
    let (mut orchestrator, rx) = build_orchestrator(&opts)?;
    let printer = spawn_event_printer(rx);

    // First Ctrl-C stops scheduling new chunks; in-flight chunks finish and
    // are checkpointed.
    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested, finishing in-flight chunks");
            cancel.cancel();
        }
    });

    let result = orchestrator.run_pipeline().await;
    drop(orchestrator);
    let _ = printer.await;
    result?;
    Ok(())
}

pub async fn cmd_run_phase(
    opts: RunOptions<'_>,
    phase: PhaseKind,
    language: Option<&str>,
) -> Result<()> {
    let (mut orchestrator, rx) = build_orchestrator(&opts)?;
    let printer = spawn_event_printer(rx);

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested, finishing in-flight chunks");
            cancel.cancel();
        }
    });

    let result = orchestrator.run_phase(phase, language).await;
    drop(orchestrator);
    let _ = printer.await;
    result?;
    Ok(())
}
