//! Core data model: runs, phase records, artifacts, and work items.
//!
//! These are plain serde records. All mutation of a `Run` happens inside the
//! orchestrator's completion/failure handlers; agents never touch it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::phase::PhaseKind;

/// Time-sortable identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Time-sortable identifier for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Key addressing one phase execution target: the phase plus, for
/// language-scoped phases, the target language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseKey {
    pub phase: PhaseKind,
    pub language: Option<String>,
}

impl PhaseKey {
    pub fn new(phase: PhaseKind, language: Option<&str>) -> Self {
        Self {
            phase,
            language: language.map(str::to_string),
        }
    }

    pub fn global(phase: PhaseKind) -> Self {
        Self {
            phase,
            language: None,
        }
    }
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.language {
            Some(lang) => write!(f, "{}:{}", self.phase.name(), lang),
            None => write!(f, "{}", self.phase.name()),
        }
    }
}

/// Revision of one upstream dependency, captured at phase start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRevision {
    pub phase: PhaseKind,
    pub language: Option<String>,
    pub revision: u64,
}

impl DependencyRevision {
    pub fn key(&self) -> PhaseKey {
        PhaseKey {
            phase: self.phase,
            language: self.language.clone(),
        }
    }
}

/// Result of one completed (or failed) phase execution.
///
/// `dep_revisions` is the snapshot taken atomically at phase start. It is
/// always present - an empty list means the phase has no upstream
/// dependency, not that the snapshot was skipped. Staleness is computed from
/// it on demand and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: PhaseKind,
    pub language: Option<String>,
    /// Incremented only on successful, persisted output. Starts at 0.
    pub revision: u64,
    pub dep_revisions: Vec<DependencyRevision>,
    pub artifact: Option<Artifact>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Total backend retries observed across all chunks of this execution.
    pub retries: u32,
    pub success: bool,
    pub error: Option<String>,
}

impl PhaseRecord {
    pub fn key(&self) -> PhaseKey {
        PhaseKey {
            phase: self.phase,
            language: self.language.clone(),
        }
    }
}

/// An immutable, persisted unit of phase output.
///
/// Never mutated; a later successful run of the same phase produces a new
/// artifact with a new id and supersedes this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub phase: PhaseKind,
    pub language: Option<String>,
    pub path: PathBuf,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
}

/// The atomic unit of processing: one dialogue line.
///
/// Ids follow the `word_number` pattern, e.g. `scene_a_00_0001`. `scene`
/// and `route` come from ingest and drive per-scene / per-route chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub scene: String,
    pub route: String,
    pub text: String,
    /// Speaking character, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    /// Upstream-phase annotations carried as read-only context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

/// One item of validated agent output, keyed by the work item id it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl OutputItem {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

/// One execution of the pipeline over one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Resume identifier; reruns with the same thread id share checkpoints.
    pub thread_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Configuration snapshot taken at run creation.
    pub config: serde_json::Value,
    /// Latest record per (phase, target language). BTreeMap keeps status
    /// output and serialized runs in a stable order.
    pub records: BTreeMap<String, PhaseRecord>,
    /// Most recent failure message per phase key. Cleared by the next
    /// successful execution of the same key.
    #[serde(default)]
    pub failures: BTreeMap<String, String>,
}

impl Run {
    pub fn new(thread_id: &str, config: serde_json::Value) -> Self {
        Self {
            id: RunId::new(),
            thread_id: thread_id.to_string(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            config,
            records: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Fresh run for a thread whose previous run finished. Phase records and
    /// failure messages carry over so eligibility, staleness, and coverage
    /// survive across processes.
    pub fn successor(previous: &Run, config: serde_json::Value) -> Self {
        Self {
            id: RunId::new(),
            thread_id: previous.thread_id.clone(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            config,
            records: previous.records.clone(),
            failures: previous.failures.clone(),
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(error.to_string());
    }

    pub fn record(&self, key: &PhaseKey) -> Option<&PhaseRecord> {
        self.records.get(&key.to_string())
    }

    pub fn insert_record(&mut self, record: PhaseRecord) {
        self.records.insert(record.key().to_string(), record);
    }

    /// Whether a phase target has at least one successful record.
    pub fn has_success(&self, key: &PhaseKey) -> bool {
        self.record(key).map(|r| r.success).unwrap_or(false)
    }
}
