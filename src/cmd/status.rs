//! `tlpipe status` - phase revisions, staleness, and last errors.

use anyhow::Result;
use std::sync::Arc;

use tlpipe::agent::CliBackend;
use tlpipe::config::PipelineConfig;
use tlpipe::orchestrator::Orchestrator;

use super::run::RunOptions;

pub async fn cmd_status(opts: RunOptions<'_>) -> Result<()> {
    let config = PipelineConfig::load(opts.project_dir, opts.config_path)?;
    let backend = Arc::new(CliBackend::new(
        &config.backend.command,
        &config.backend.args,
    ));
    let orchestrator = Orchestrator::new(config, backend, opts.thread, None)?;

    let run = orchestrator.run();
    println!("run {} ({:?}) thread {}", run.id, run.status, run.thread_id);
    if let Some(error) = &run.last_error {
        println!("last error: {error}");
    }
    println!();
    println!(
        "{:<24} {:>8}  {:>6}  {:>6}  {}",
        "phase", "revision", "stale", "items", "last error"
    );

    for row in orchestrator.status() {
        let key = match &row.language {
            Some(lang) => format!("{}:{}", row.phase, lang),
            None => row.phase.clone(),
        };
        println!(
            "{:<24} {:>8}  {:>6}  {:>6}  {}",
            key,
            row.revision,
            if row.stale { "yes" } else { "no" },
            row.items.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            row.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
