//! The phase state machine.
//!
//! Resolves which phases may run given dependency state, dispatches chunks
//! through the bounded worker pool to the agent execution contract, merges
//! results deterministically, persists artifacts and revisions, and
//! checkpoints per-chunk completion so an interrupted phase resumes in
//! gap-fill semantics instead of restarting.

pub mod events;
pub mod prompts;
pub mod workset;

use anyhow::{Context, anyhow};
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agent::{self, AgentBackend, AgentCallResult, AgentRequest};
use crate::concurrency::{CancelFlag, ContextStore, EntityKind, Resolution, run_bounded};
use crate::config::{PipelineConfig, RunMode};
use crate::error::{AgentError, PhaseError};
use crate::model::{Artifact, OutputItem, PhaseKey, PhaseRecord, Run, RunStatus, WorkItem};
use crate::phase::PhaseKind;
use crate::revision::RevisionTracker;
use crate::store::{Checkpoint, FsStore};

use events::{Emitter, PipelineEvent};
use workset::{merge_outputs, partition, select_work};

/// Read-only status row for one phase target.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PhaseStatus {
    pub phase: String,
    pub language: Option<String>,
    pub revision: u64,
    pub stale: bool,
    pub items: Option<usize>,
    pub last_error: Option<String>,
}

/// Outcome of one successful phase execution, before the record is built.
struct PhaseOutput {
    artifact: Artifact,
    items: usize,
    retries: u32,
}

pub struct Orchestrator {
    config: PipelineConfig,
    backend: Arc<dyn AgentBackend>,
    store: FsStore,
    revisions: RevisionTracker,
    context: Arc<ContextStore>,
    cancel: CancelFlag,
    emitter: Emitter,
    run: Run,
    /// True when `run` was loaded from an unfinished previous attempt.
    resumed: bool,
    checkpoint: Checkpoint,
}

impl Orchestrator {
    /// Open or resume the run for `thread_id`. A thread whose previous run
    /// completed gets a fresh run; a pending or failed one is resumed.
    pub fn new(
        config: PipelineConfig,
        backend: Arc<dyn AgentBackend>,
        thread_id: &str,
        event_tx: Option<mpsc::Sender<PipelineEvent>>,
    ) -> anyhow::Result<Self> {
        let store = FsStore::open(&config.project_dir)?;
        let revisions = store.load_revisions()?;
        let checkpoint = store.load_checkpoint(thread_id)?;

        let (run, resumed) = match store.load_run(thread_id)? {
            Some(existing) if existing.status != RunStatus::Completed => {
                info!(run_id = %existing.id, thread_id, "resuming run");
                (existing, true)
            }
            Some(finished) => (Run::successor(&finished, config.snapshot()), false),
            None => (Run::new(thread_id, config.snapshot()), false),
        };

        let emitter = Emitter::new(run.id, event_tx);
        let context = Arc::new(ContextStore::new(config.conflict_window()));

        Ok(Self {
            config,
            backend,
            store,
            revisions,
            context,
            cancel: CancelFlag::new(),
            emitter,
            run,
            resumed,
            checkpoint,
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    /// Handle for signalling run-level cancellation from outside.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Shared entity store for human-in-the-loop metadata edits.
    pub fn context_store(&self) -> Arc<ContextStore> {
        Arc::clone(&self.context)
    }

    /// Execute every enabled phase in dependency order, across all target
    /// languages. Stops at the first phase failure, leaving the run in a
    /// resumable failed state.
    pub async fn run_pipeline(&mut self) -> Result<(), PhaseError> {
        self.run.start();
        self.persist_run()?;
        self.emitter
            .emit(PipelineEvent::RunStarted {
                run_id: self.emitter.run_id().to_string(),
                thread_id: self.run.thread_id.clone(),
            })
            .await;

        for phase in self.config.enabled_phases.ordered() {
            if phase.is_language_scoped() && self.config.target_languages.is_empty() {
                let err = PhaseError::LanguageRequired(phase);
                self.fail_run(&err).await?;
                return Err(err);
            }

            for language in self.targets_for(phase) {
                let key = PhaseKey::new(phase, language.as_deref());
                // Resuming an unfinished run: completed targets are not
                // repeated unless the whole run is in overwrite mode. A
                // fresh run re-executes every phase; inherited coverage
                // keeps that cheap in gap-fill mode.
                if self.resumed
                    && self.run.has_success(&key)
                    && self.config.mode != RunMode::Overwrite
                {
                    continue;
                }
                if let Err(err) = self.execute_phase(phase, language.as_deref()).await {
                    self.fail_run(&err).await?;
                    return Err(err);
                }
            }
        }

        self.run.complete();
        self.persist_run()?;
        self.emitter
            .emit(PipelineEvent::RunCompleted {
                run_id: self.emitter.run_id().to_string(),
            })
            .await;
        Ok(())
    }

    /// Execute a single phase, honoring dependency gating.
    pub async fn run_phase(
        &mut self,
        phase: PhaseKind,
        language: Option<&str>,
    ) -> Result<PhaseRecord, PhaseError> {
        if !self.config.enabled_phases.contains(phase) {
            return Err(PhaseError::NotEnabled(phase));
        }
        if self.run.status == RunStatus::Pending {
            self.run.start();
            self.persist_run()?;
        }

        match self.execute_phase(phase, language).await {
            Ok(record) => {
                self.run.complete();
                self.persist_run()?;
                Ok(record)
            }
            Err(err) => {
                self.fail_run(&err).await?;
                Err(err)
            }
        }
    }

    /// Per-phase revision, staleness, and progress snapshot.
    pub fn status(&self) -> Vec<PhaseStatus> {
        let mut rows = Vec::new();
        for phase in self.config.enabled_phases.ordered() {
            for language in self.targets_for(phase) {
                let key = PhaseKey::new(phase, language.as_deref());
                let record = self.run.record(&key);
                rows.push(PhaseStatus {
                    phase: phase.name().to_string(),
                    language: language.clone(),
                    revision: self.revisions.current(&key),
                    stale: record
                        .map(|r| r.success && self.revisions.is_stale(r))
                        .unwrap_or(false),
                    items: record
                        .and_then(|r| r.artifact.as_ref())
                        .map(|a| a.item_count),
                    last_error: self.run.failures.get(&key.to_string()).cloned(),
                });
            }
        }
        rows
    }

    fn targets_for(&self, phase: PhaseKind) -> Vec<Option<String>> {
        if phase.is_language_scoped() {
            self.config
                .target_languages
                .iter()
                .map(|l| Some(l.clone()))
                .collect()
        } else {
            vec![None]
        }
    }

    async fn execute_phase(
        &mut self,
        phase: PhaseKind,
        language: Option<&str>,
    ) -> Result<PhaseRecord, PhaseError> {
        if phase.is_language_scoped() && language.is_none() {
            return Err(PhaseError::LanguageRequired(phase));
        }
        let key = PhaseKey::new(phase, language);

        // Eligibility: every hard prerequisite needs a successful record.
        let missing: Vec<String> = phase
            .dependencies(&self.config.enabled_phases)
            .into_iter()
            .filter_map(|dep| {
                let dep_key = self.dep_key(dep, language);
                if self.run.has_success(&dep_key) {
                    None
                } else {
                    Some(dep_key.to_string())
                }
            })
            .collect();
        if !missing.is_empty() {
            return Err(PhaseError::NotEligible { phase, missing });
        }

        let started_at = Utc::now();
        // Dependency snapshot, taken once before any chunk starts.
        let dep_revisions = self
            .revisions
            .snapshot(phase, language, &self.config.enabled_phases);

        let result = match phase {
            PhaseKind::Ingest => self.run_ingest().await,
            PhaseKind::Export => self.run_export(language).await,
            PhaseKind::Context
            | PhaseKind::Pretranslation
            | PhaseKind::Translate
            | PhaseKind::Qa
            | PhaseKind::Edit => self.run_agent_phase(phase, language).await,
        };

        match result {
            Ok(output) => {
                let revision = self.revisions.advance(&key);
                self.store.save_revisions(&self.revisions)?;
                self.checkpoint.clear_phase(&key);
                self.store.save_checkpoint(&self.checkpoint)?;

                let record = PhaseRecord {
                    phase,
                    language: language.map(str::to_string),
                    revision,
                    dep_revisions,
                    artifact: Some(output.artifact),
                    started_at,
                    finished_at: Some(Utc::now()),
                    retries: output.retries,
                    success: true,
                    error: None,
                };
                self.run.failures.remove(&key.to_string());
                self.run.insert_record(record.clone());
                self.persist_run()?;

                self.emitter
                    .emit(PipelineEvent::PhaseCompleted {
                        run_id: self.emitter.run_id().to_string(),
                        phase: phase.name().to_string(),
                        language: language.map(str::to_string),
                        revision,
                        items: output.items,
                        retries: output.retries,
                    })
                    .await;
                Ok(record)
            }
            Err(err) => {
                // Failed executions never advance the revision. Completed
                // chunks are already checkpointed, so a rerun of the same
                // thread skips them.
                self.run.failures.insert(key.to_string(), err.to_string());
                self.persist_run()?;
                self.emitter
                    .emit(PipelineEvent::PhaseFailed {
                        run_id: self.emitter.run_id().to_string(),
                        phase: phase.name().to_string(),
                        language: language.map(str::to_string),
                        code: err.code().to_string(),
                        message: err.to_string(),
                        advice: err.advice().to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// Key for a dependency as seen from a phase targeting `language`.
    fn dep_key(&self, dep: PhaseKind, language: Option<&str>) -> PhaseKey {
        if dep.is_language_scoped() {
            PhaseKey::new(dep, language)
        } else {
            PhaseKey::global(dep)
        }
    }

    /// Ingest: load and validate the source work items, persist them as the
    /// ingest artifact. No backend call.
    async fn run_ingest(&mut self) -> Result<PhaseOutput, PhaseError> {
        let content = std::fs::read_to_string(&self.config.source_file).with_context(|| {
            format!(
                "Failed to read source file {}",
                self.config.source_file.display()
            )
        })?;
        let items: Vec<WorkItem> = serde_json::from_str(&content).with_context(|| {
            format!(
                "Failed to parse source file {}",
                self.config.source_file.display()
            )
        })?;

        let mut seen = BTreeSet::new();
        for item in &items {
            if !seen.insert(item.id.as_str()) {
                return Err(PhaseError::Store(anyhow!(
                    "duplicate work item id in source: {}",
                    item.id
                )));
            }
        }

        self.emitter
            .emit(PipelineEvent::PhaseStarted {
                run_id: self.emitter.run_id().to_string(),
                phase: PhaseKind::Ingest.name().to_string(),
                language: None,
                items: items.len(),
                chunks: 1,
            })
            .await;

        let count = items.len();
        let artifact = self.store.put_artifact(PhaseKind::Ingest, None, &items)?;
        Ok(PhaseOutput {
            artifact,
            items: count,
            retries: 0,
        })
    }

    /// Export: deterministic local merge of the latest edit output, falling
    /// back to translate when edit is disabled. No backend call.
    async fn run_export(&mut self, language: Option<&str>) -> Result<PhaseOutput, PhaseError> {
        let source_phase = if self.config.enabled_phases.contains(PhaseKind::Edit) {
            PhaseKind::Edit
        } else {
            PhaseKind::Translate
        };
        let outputs = self.load_outputs(source_phase, language)?;

        self.emitter
            .emit(PipelineEvent::PhaseStarted {
                run_id: self.emitter.run_id().to_string(),
                phase: PhaseKind::Export.name().to_string(),
                language: language.map(str::to_string),
                items: outputs.len(),
                chunks: 1,
            })
            .await;

        let count = outputs.len();
        let artifact = self
            .store
            .put_artifact(PhaseKind::Export, language, &outputs)?;
        Ok(PhaseOutput {
            artifact,
            items: count,
            retries: 0,
        })
    }

    /// The common path for backend-driven phases: select work, partition,
    /// fan out through the bounded pool, merge, persist.
    async fn run_agent_phase(
        &mut self,
        phase: PhaseKind,
        language: Option<&str>,
    ) -> Result<PhaseOutput, PhaseError> {
        let key = PhaseKey::new(phase, language);

        let mut all_items = self.load_source_items()?;
        self.attach_annotations(phase, language, &mut all_items)?;
        let context_blocks = self.context_blocks(phase, language, &all_items).await?;

        let retained = match self.run.record(&key).and_then(|r| r.artifact.clone()) {
            Some(artifact) => self.store.load_artifact::<OutputItem>(&artifact)?,
            None => Vec::new(),
        };
        let covered_latest: BTreeSet<String> = retained.iter().map(|i| i.id.clone()).collect();
        let covered_ever = if self.config.mode == RunMode::NewOnly {
            self.store.covered_ids(phase, language)?
        } else {
            BTreeSet::new()
        };

        let ordered_ids: Vec<String> = all_items.iter().map(|i| i.id.clone()).collect();
        let work = select_work(
            &all_items,
            &covered_latest,
            &covered_ever,
            self.config.mode,
            &self.config.filter,
        );
        let chunks = partition(work, phase.chunk_strategy());
        let total_chunks = chunks.len();

        self.emitter
            .emit(PipelineEvent::PhaseStarted {
                run_id: self.emitter.run_id().to_string(),
                phase: phase.name().to_string(),
                language: language.map(str::to_string),
                items: chunks.iter().map(|c| c.items.len()).sum(),
                chunks: total_chunks,
            })
            .await;

        let policy = self.config.retry_policy();
        let schema = prompts::schema_for(phase);
        let instructions = prompts::instructions_for(phase, language);
        let completed = Arc::new(AtomicUsize::new(0));

        let mut chunk_keys = Vec::with_capacity(total_chunks);
        let mut futures: Vec<BoxFuture<'static, Result<AgentCallResult, AgentError>>> =
            Vec::with_capacity(total_chunks);

        for chunk in chunks {
            let chunk_key = chunk.key();
            chunk_keys.push(chunk_key.clone());
            let emitter = self.emitter.clone();
            let completed = Arc::clone(&completed);
            let phase_name = phase.name().to_string();
            let lang_owned = language.map(str::to_string);

            if let Some(cached) = self.checkpoint.chunk(&key, &chunk_key) {
                // Already completed on a previous attempt of this thread:
                // serve from the checkpoint, no backend call.
                let items = cached.clone();
                futures.push(Box::pin(async move {
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    emitter
                        .emit(PipelineEvent::PhaseProgress {
                            run_id: emitter.run_id().to_string(),
                            phase: phase_name,
                            language: lang_owned,
                            completed_chunks: done,
                            total_chunks,
                        })
                        .await;
                    Ok(AgentCallResult {
                        items,
                        validation_retries: 0,
                        transient_retries: 0,
                    })
                }));
                continue;
            }

            let request = AgentRequest {
                phase,
                language: language.map(str::to_string),
                items: chunk.items,
                context: context_blocks.clone(),
                instructions: instructions.clone(),
            };
            let backend = Arc::clone(&self.backend);
            let policy = policy.clone();
            let schema = schema.clone();

            futures.push(Box::pin(async move {
                let result = agent::execute(backend.as_ref(), &request, &schema, &policy).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                emitter
                    .emit(PipelineEvent::PhaseProgress {
                        run_id: emitter.run_id().to_string(),
                        phase: phase_name,
                        language: lang_owned,
                        completed_chunks: done,
                        total_chunks,
                    })
                    .await;
                result
            }));
        }

        let results = run_bounded(
            futures,
            self.config.fan_out_for(phase),
            self.cancel.clone(),
        )
        .await;

        // Collect everything before surfacing a failure, so every completed
        // chunk lands in the checkpoint.
        let mut fresh: Vec<Vec<OutputItem>> = Vec::new();
        let mut retries: u32 = 0;
        let mut first_failure: Option<(String, AgentError)> = None;

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(call)) => {
                    retries += call.retries();
                    self.checkpoint
                        .record_chunk(&key, &chunk_keys[index], call.items.clone());
                    fresh.push(call.items);
                }
                Some(Err(err)) => {
                    warn!(
                        phase = phase.name(),
                        chunk = %chunk_keys[index],
                        error = %err,
                        "chunk failed"
                    );
                    if first_failure.is_none() {
                        first_failure = Some((chunk_keys[index].clone(), err));
                    }
                }
                None => {
                    if first_failure.is_none() {
                        first_failure = Some((chunk_keys[index].clone(), AgentError::Cancelled));
                    }
                }
            }
        }

        self.store.save_checkpoint(&self.checkpoint)?;

        if let Some((chunk, source)) = first_failure {
            return Err(PhaseError::ChunkFailed { chunk, source });
        }

        let merged = merge_outputs(&ordered_ids, retained, fresh);
        if phase == PhaseKind::Context {
            self.sync_scene_annotations(&all_items, &merged).await;
        }

        let count = merged.len();
        let artifact = self.store.put_artifact(phase, language, &merged)?;
        Ok(PhaseOutput {
            artifact,
            items: count,
            retries,
        })
    }

    fn load_source_items(&self) -> Result<Vec<WorkItem>, PhaseError> {
        let ingest = self
            .run
            .record(&PhaseKey::global(PhaseKind::Ingest))
            .and_then(|r| r.artifact.clone())
            .ok_or_else(|| anyhow!("ingest record has no artifact"))?;
        Ok(self.store.load_artifact::<WorkItem>(&ingest)?)
    }

    fn load_outputs(
        &self,
        phase: PhaseKind,
        language: Option<&str>,
    ) -> Result<Vec<OutputItem>, PhaseError> {
        let key = self.dep_key(phase, language);
        let artifact = self
            .run
            .record(&key)
            .and_then(|r| r.artifact.clone())
            .ok_or_else(|| anyhow!("{key} record has no artifact"))?;
        Ok(self.store.load_artifact::<OutputItem>(&artifact)?)
    }

    /// Attach upstream-phase outputs as per-item annotations, so each chunk
    /// carries the context its prompt needs.
    fn attach_annotations(
        &self,
        phase: PhaseKind,
        language: Option<&str>,
        items: &mut [WorkItem],
    ) -> Result<(), PhaseError> {
        fn attach(items: &mut [WorkItem], outputs: Vec<OutputItem>) {
            let by_id: BTreeMap<String, OutputItem> =
                outputs.into_iter().map(|o| (o.id.clone(), o)).collect();
            for item in items.iter_mut() {
                if let Some(output) = by_id.get(&item.id) {
                    for (name, value) in &output.fields {
                        item.annotations.insert(name.clone(), value.clone());
                    }
                }
            }
        }

        match phase {
            PhaseKind::Ingest | PhaseKind::Export | PhaseKind::Context => {}
            PhaseKind::Pretranslation | PhaseKind::Translate => {
                if self.has_output(PhaseKind::Context, None) {
                    attach(items, self.load_outputs(PhaseKind::Context, None)?);
                }
            }
            PhaseKind::Qa => {
                attach(items, self.load_outputs(PhaseKind::Translate, language)?);
            }
            PhaseKind::Edit => {
                attach(items, self.load_outputs(PhaseKind::Translate, language)?);
                if self.has_output(PhaseKind::Qa, language) {
                    attach(items, self.load_outputs(PhaseKind::Qa, language)?);
                }
            }
        }
        Ok(())
    }

    fn has_output(&self, phase: PhaseKind, language: Option<&str>) -> bool {
        self.config.enabled_phases.contains(phase)
            && self.run.has_success(&self.dep_key(phase, language))
    }

    /// Read-only context blocks rendered verbatim into the prompt.
    async fn context_blocks(
        &self,
        phase: PhaseKind,
        language: Option<&str>,
        items: &[WorkItem],
    ) -> Result<Vec<String>, PhaseError> {
        let mut blocks = Vec::new();
        if !matches!(phase, PhaseKind::Translate | PhaseKind::Edit) {
            return Ok(blocks);
        }

        if self.has_output(PhaseKind::Pretranslation, language) {
            let glossary = self.load_outputs(PhaseKind::Pretranslation, language)?;
            let json = serde_json::to_string_pretty(&glossary).unwrap_or_default();
            blocks.push(format!("GLOSSARY (canonical term translations):\n{json}"));
        }

        // Scene annotations from the shared entity store, which carries both
        // context-phase notes and any later human edits.
        let scenes: BTreeSet<&str> = items.iter().map(|i| i.scene.as_str()).collect();
        let mut notes = serde_json::Map::new();
        for scene in scenes {
            let fields: BTreeMap<String, serde_json::Value> = self
                .context
                .entity_fields(EntityKind::SceneAnnotation, scene)
                .await
                .into_iter()
                .collect();
            if fields.is_empty() {
                continue;
            }
            let mut per_line = serde_json::Map::new();
            for (line_id, value) in fields {
                per_line.insert(line_id, value);
            }
            notes.insert(scene.to_string(), serde_json::Value::Object(per_line));
        }
        if !notes.is_empty() {
            let json = serde_json::to_string_pretty(&serde_json::Value::Object(notes))
                .unwrap_or_default();
            blocks.push(format!("SCENE NOTES (scene, then line id):\n{json}"));
        }
        Ok(blocks)
    }

    /// Mirror context-phase notes into the shared entity store, where human
    /// edits also land. A note colliding with a recent human edit is
    /// skipped; the agent never silently clobbers a fresher write.
    async fn sync_scene_annotations(&self, all_items: &[WorkItem], merged: &[OutputItem]) {
        let scene_of: BTreeMap<&str, &str> = all_items
            .iter()
            .map(|i| (i.id.as_str(), i.scene.as_str()))
            .collect();

        for output in merged {
            let Some(scene) = scene_of.get(output.id.as_str()) else {
                continue;
            };
            let Some(note) = output.fields.get("note") else {
                continue;
            };
            let outcome = self
                .context
                .update_field(
                    EntityKind::SceneAnnotation,
                    scene,
                    &output.id,
                    note.clone(),
                    "context-agent",
                )
                .await;
            if !outcome.is_applied() {
                warn!(
                    scene = %scene,
                    item = %output.id,
                    "annotation conflicts with a recent edit, keeping the existing value"
                );
                self.context
                    .resolve(
                        EntityKind::SceneAnnotation,
                        scene,
                        &output.id,
                        note.clone(),
                        "context-agent",
                        Resolution::Skip,
                    )
                    .await;
            }
        }
    }

    async fn fail_run(&mut self, err: &PhaseError) -> Result<(), PhaseError> {
        let message = format!("{err} ({}: {})", err.code(), err.advice());
        self.run.fail(&message);
        self.persist_run()?;
        self.emitter
            .emit(PipelineEvent::RunFailed {
                run_id: self.emitter.run_id().to_string(),
                message,
            })
            .await;
        Ok(())
    }

    fn persist_run(&self) -> Result<(), PhaseError> {
        self.store.save_run(&self.run)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::OutputSchema;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::fs;
    use tempfile::TempDir;

    /// Backend that answers every request with exact id coverage.
    struct EchoBackend;

    #[async_trait]
    impl AgentBackend for EchoBackend {
        async fn run(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, BackendError> {
            Ok(echo_answer(prompt, schema))
        }
    }

    /// EchoBackend that also counts backend invocations.
    struct CountingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentBackend for CountingBackend {
        async fn run(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(echo_answer(prompt, schema))
        }
    }

    /// EchoBackend that keeps every prompt it was given.
    struct RecordingBackend {
        prompts: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AgentBackend for RecordingBackend {
        async fn run(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, BackendError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(echo_answer(prompt, schema))
        }
    }

    fn echo_answer(prompt: &str, schema: &OutputSchema) -> Value {
        let ids = extract_ids(prompt);
        let field = schema
            .fields
            .first()
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "value".to_string());
        Value::Array(
            ids.into_iter()
                .map(|id| {
                    let mut obj = serde_json::Map::new();
                    let payload = if field == "issues" || field == "terms" {
                        json!([])
                    } else {
                        json!(format!("out:{id}"))
                    };
                    obj.insert("id".to_string(), Value::String(id));
                    obj.insert(field.clone(), payload);
                    Value::Object(obj)
                })
                .collect(),
        )
    }

    fn extract_ids(prompt: &str) -> Vec<String> {
        // Work items are embedded as a JSON array in the prompt.
        let start = prompt.find("## WORK ITEMS\n").unwrap() + "## WORK ITEMS\n".len();
        let rest = &prompt[start..];
        let end = rest.find("\n\n## OUTPUT FORMAT").unwrap();
        let items: Vec<WorkItem> = serde_json::from_str(&rest[..end]).unwrap();
        items.into_iter().map(|i| i.id).collect()
    }

    fn write_source(dir: &TempDir, count: usize) {
        let items: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "id": format!("scene_a_00_{i:04}"),
                    "scene": "scene_a_00",
                    "route": "scene_a",
                    "text": format!("line {i}")
                })
            })
            .collect();
        fs::write(
            dir.path().join("script.json"),
            serde_json::to_string_pretty(&items).unwrap(),
        )
        .unwrap();
    }

    fn minimal_config(dir: &TempDir) -> PipelineConfig {
        fs::write(
            dir.path().join("tlpipe.toml"),
            r#"
enabled_phases = ["ingest", "translate"]
target_languages = ["de"]
mode = "gap-fill"
"#,
        )
        .unwrap();
        PipelineConfig::load(dir.path(), None).unwrap()
    }

    #[tokio::test]
    async fn test_phase_not_eligible_without_prerequisites() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 3);
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();

        let err = orch
            .run_phase(PhaseKind::Translate, Some("de"))
            .await
            .unwrap_err();
        match err {
            PhaseError::NotEligible { phase, missing } => {
                assert_eq!(phase, PhaseKind::Translate);
                assert_eq!(missing, vec!["ingest".to_string()]);
            }
            other => panic!("expected NotEligible, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_phase_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 1);
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();

        let err = orch.run_phase(PhaseKind::Qa, Some("de")).await.unwrap_err();
        assert!(matches!(err, PhaseError::NotEnabled(PhaseKind::Qa)));
    }

    #[tokio::test]
    async fn test_language_required_for_scoped_phase() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 1);
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();

        orch.run_phase(PhaseKind::Ingest, None).await.unwrap();
        let err = orch
            .run_phase(PhaseKind::Translate, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PhaseError::LanguageRequired(PhaseKind::Translate)
        ));
    }

    #[tokio::test]
    async fn test_ingest_rejects_duplicate_ids() {
        let dir = TempDir::new().unwrap();
        let items = json!([
            {"id": "scene_a_00_0001", "scene": "s", "route": "r", "text": "x"},
            {"id": "scene_a_00_0001", "scene": "s", "route": "r", "text": "y"}
        ]);
        fs::write(dir.path().join("script.json"), items.to_string()).unwrap();
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();

        let err = orch.run_phase(PhaseKind::Ingest, None).await.unwrap_err();
        assert!(err.to_string().contains("duplicate work item id"));
    }

    #[tokio::test]
    async fn test_run_pipeline_happy_path_sets_revisions() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 3);
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();

        orch.run_pipeline().await.unwrap();

        assert_eq!(orch.run().status, RunStatus::Completed);
        let translate_key = PhaseKey::new(PhaseKind::Translate, Some("de"));
        let record = orch.run().record(&translate_key).unwrap();
        assert_eq!(record.revision, 1);
        assert_eq!(record.retries, 0);
        assert_eq!(record.artifact.as_ref().unwrap().item_count, 3);
        // Translate snapshotted ingest at its current revision: not stale.
        assert!(!orch.revisions.is_stale(record));
    }

    #[tokio::test]
    async fn test_status_reports_staleness_after_upstream_advance() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 2);
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();

        orch.run_pipeline().await.unwrap();
        assert!(orch.status().iter().all(|r| !r.stale));

        // Re-running ingest advances its revision; translate becomes stale
        // but is never auto-rerun.
        orch.run_phase(PhaseKind::Ingest, None).await.unwrap();
        let rows = orch.status();
        let translate = rows.iter().find(|r| r.phase == "translate").unwrap();
        assert!(translate.stale);
        assert_eq!(translate.revision, 1);
    }

    #[tokio::test]
    async fn test_full_pipeline_with_all_phases() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 4);
        fs::write(
            dir.path().join("tlpipe.toml"),
            r#"
target_languages = ["de"]
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(dir.path(), None).unwrap();
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-all", None).unwrap();

        orch.run_pipeline().await.unwrap();
        assert_eq!(orch.run().status, RunStatus::Completed);

        // Export carries the edit output forward.
        let export = orch
            .run()
            .record(&PhaseKey::new(PhaseKind::Export, Some("de")))
            .unwrap();
        assert_eq!(export.artifact.as_ref().unwrap().item_count, 4);
    }

    #[tokio::test]
    async fn test_phase_records_carry_across_restarts() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 3);

        // First process runs ingest only and exits.
        {
            let config = minimal_config(&dir);
            let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();
            orch.run_phase(PhaseKind::Ingest, None).await.unwrap();
        }

        // A second process on the same thread still sees ingest's success,
        // so translate is eligible.
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();
        let record = orch.run_phase(PhaseKind::Translate, Some("de")).await.unwrap();
        assert_eq!(record.artifact.as_ref().unwrap().item_count, 3);
    }

    #[tokio::test]
    async fn test_staleness_survives_restart() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 2);

        {
            let config = minimal_config(&dir);
            let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();
            orch.run_pipeline().await.unwrap();
        }
        {
            // Re-running ingest in a new process advances its revision.
            let config = minimal_config(&dir);
            let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();
            orch.run_phase(PhaseKind::Ingest, None).await.unwrap();
        }

        let config = minimal_config(&dir);
        let orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();
        let rows = orch.status();
        let translate = rows.iter().find(|r| r.phase == "translate").unwrap();
        assert!(translate.stale);
        assert_eq!(translate.revision, 1);
    }

    #[tokio::test]
    async fn test_gap_fill_rerun_after_completion_skips_backend() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 3);

        {
            let config = minimal_config(&dir);
            let mut orch = Orchestrator::new(config, Arc::new(EchoBackend), "t-1", None).unwrap();
            orch.run_pipeline().await.unwrap();
        }

        // Same source, new process, gap-fill: every item is already covered
        // by the inherited translate record, so no chunk reaches the backend.
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(CountingBackend {
            calls: Arc::clone(&calls),
        });
        let config = minimal_config(&dir);
        let mut orch = Orchestrator::new(config, backend, "t-1", None).unwrap();
        orch.run_pipeline().await.unwrap();

        assert_eq!(orch.run().status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let translate = orch
            .run()
            .record(&PhaseKey::new(PhaseKind::Translate, Some("de")))
            .unwrap();
        assert_eq!(translate.artifact.as_ref().unwrap().item_count, 3);
    }

    #[tokio::test]
    async fn test_scene_notes_reach_translate_prompt() {
        let dir = TempDir::new().unwrap();
        write_source(&dir, 2);
        let config = minimal_config(&dir);
        let prompts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let backend = Arc::new(RecordingBackend {
            prompts: Arc::clone(&prompts),
        });
        let mut orch = Orchestrator::new(config, backend, "t-1", None).unwrap();

        orch.run_phase(PhaseKind::Ingest, None).await.unwrap();
        // A reviewer leaves a note on one line before translation starts.
        orch.context_store()
            .update_field(
                EntityKind::SceneAnnotation,
                "scene_a_00",
                "scene_a_00_0000",
                json!("keep the honorific untranslated"),
                "reviewer",
            )
            .await;
        orch.run_phase(PhaseKind::Translate, Some("de")).await.unwrap();

        let seen = prompts.lock().unwrap();
        let translate_prompt = seen.last().unwrap();
        assert!(translate_prompt.contains("SCENE NOTES"));
        assert!(translate_prompt.contains("keep the honorific untranslated"));
        assert!(translate_prompt.contains("scene_a_00_0000"));
    }
}
