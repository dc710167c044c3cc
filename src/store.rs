//! Durable state under the project's `.tlpipe/` directory.
//!
//! Layout:
//! - `artifacts/<phase-key>-<artifact-id>.json` - immutable phase outputs
//! - `runs/<thread-id>.json` - the current run for a resume thread
//! - `checkpoints/<thread-id>.json` - per-chunk completion for resume
//! - `revisions.json` - the revision tracker
//!
//! Artifacts are written once and never touched again; a rerun of the same
//! phase writes a new file and the superseded one simply stops being
//! referenced.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::model::{Artifact, ArtifactId, OutputItem, PhaseKey, Run};
use crate::phase::PhaseKind;
use crate::revision::RevisionTracker;

/// Per-chunk completion state for one resume thread. A rerun in gap-fill
/// mode serves checkpointed chunks from here instead of calling the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    /// `PhaseKey` string -> `ChunkKey` -> validated chunk output.
    pub completed: BTreeMap<String, BTreeMap<String, Vec<OutputItem>>>,
}

impl Checkpoint {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            completed: BTreeMap::new(),
        }
    }

    pub fn record_chunk(&mut self, key: &PhaseKey, chunk_key: &str, items: Vec<OutputItem>) {
        self.completed
            .entry(key.to_string())
            .or_default()
            .insert(chunk_key.to_string(), items);
    }

    pub fn chunk(&self, key: &PhaseKey, chunk_key: &str) -> Option<&Vec<OutputItem>> {
        self.completed.get(&key.to_string())?.get(chunk_key)
    }

    /// Drop a phase's chunks once its artifact has been persisted.
    pub fn clear_phase(&mut self, key: &PhaseKey) {
        self.completed.remove(&key.to_string());
    }
}

/// Filesystem-backed artifact, run, checkpoint, and revision storage.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) the store under `<project_dir>/.tlpipe`.
    pub fn open(project_dir: &Path) -> Result<Self> {
        let root = project_dir.join(".tlpipe");
        for sub in ["artifacts", "runs", "checkpoints"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("Failed to create {}", root.join(sub).display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist one phase output as a new immutable artifact.
    pub fn put_artifact<T: Serialize>(
        &self,
        phase: PhaseKind,
        language: Option<&str>,
        items: &[T],
    ) -> Result<Artifact> {
        let id = ArtifactId::new();
        let key = PhaseKey::new(phase, language);
        let file_name = format!("{}-{}.json", key.to_string().replace(':', "_"), id);
        let path = self.root.join("artifacts").join(file_name);

        let artifact = Artifact {
            id,
            phase,
            language: language.map(str::to_string),
            path: path.clone(),
            item_count: items.len(),
            created_at: Utc::now(),
        };

        let payload = serde_json::json!({
            "artifact": artifact,
            "items": items,
        });
        let json =
            serde_json::to_string_pretty(&payload).context("Failed to serialize artifact")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;

        Ok(artifact)
    }

    pub fn load_artifact<T: DeserializeOwned>(&self, artifact: &Artifact) -> Result<Vec<T>> {
        #[derive(Deserialize)]
        struct Payload<T> {
            items: Vec<T>,
        }

        let content = fs::read_to_string(&artifact.path)
            .with_context(|| format!("Failed to read artifact {}", artifact.path.display()))?;
        let payload: Payload<T> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", artifact.path.display()))?;
        Ok(payload.items)
    }

    /// Union of item ids across every artifact ever written for a phase
    /// key, superseded ones included. Drives `new-only` work selection.
    pub fn covered_ids(
        &self,
        phase: PhaseKind,
        language: Option<&str>,
    ) -> Result<std::collections::BTreeSet<String>> {
        #[derive(Deserialize)]
        struct Payload {
            items: Vec<serde_json::Value>,
        }

        let key = PhaseKey::new(phase, language).to_string().replace(':', "_");
        let mut ids = std::collections::BTreeSet::new();
        let dir = self.root.join("artifacts");
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Failed to list artifacts in {}", dir.display()))?
        {
            let entry = entry.context("Failed to read artifact dir entry")?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Exact key match only. A bare prefix test would let the key for
            // `de` also claim artifacts written for `de-AT`.
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Some(rest) = stem.strip_prefix(&key) else {
                continue;
            };
            let uuid_ok = rest
                .strip_prefix('-')
                .is_some_and(|tail| Uuid::parse_str(tail).is_ok());
            if !uuid_ok {
                continue;
            }
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read artifact {}", name))?;
            let payload: Payload = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse artifact {}", name))?;
            for item in payload.items {
                if let Some(id) = item.get("id").and_then(|v| v.as_str()) {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn run_path(&self, thread_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{thread_id}.json"))
    }

    pub fn save_run(&self, run: &Run) -> Result<()> {
        let path = self.run_path(&run.thread_id);
        let json = serde_json::to_string_pretty(run).context("Failed to serialize run")?;
        fs::write(&path, json).with_context(|| format!("Failed to write run {}", path.display()))
    }

    /// Load the current run for a resume thread, if one exists.
    pub fn load_run(&self, thread_id: &str) -> Result<Option<Run>> {
        let path = self.run_path(thread_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run {}", path.display()))?;
        let run = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run {}", path.display()))?;
        Ok(Some(run))
    }

    fn checkpoint_path(&self, thread_id: &str) -> PathBuf {
        self.root
            .join("checkpoints")
            .join(format!("{thread_id}.json"))
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.thread_id);
        let json =
            serde_json::to_string_pretty(checkpoint).context("Failed to serialize checkpoint")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))
    }

    pub fn load_checkpoint(&self, thread_id: &str) -> Result<Checkpoint> {
        let path = self.checkpoint_path(thread_id);
        if !path.exists() {
            return Ok(Checkpoint::new(thread_id));
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))
    }

    pub fn save_revisions(&self, tracker: &RevisionTracker) -> Result<()> {
        let path = self.root.join("revisions.json");
        let json =
            serde_json::to_string_pretty(tracker).context("Failed to serialize revisions")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write revisions {}", path.display()))
    }

    pub fn load_revisions(&self) -> Result<RevisionTracker> {
        let path = self.root.join("revisions.json");
        if !path.exists() {
            return Ok(RevisionTracker::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read revisions {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse revisions {}", path.display()))
    }
}
