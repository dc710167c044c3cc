//! The closed set of pipeline phases and their static properties.
//!
//! Every per-phase decision (dependencies, chunking, alignment policy,
//! fan-out) lives here behind exhaustive matches, so adding a phase forces
//! the compiler to flag every dispatch site.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One named stage of the pipeline, in dependency order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Ingest,
    Context,
    Pretranslation,
    Translate,
    Qa,
    Edit,
    Export,
}

/// How a phase's work set is partitioned into backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// One chunk covering the whole work set.
    WholeProject,
    /// One chunk per scene.
    PerScene,
    /// One chunk per route.
    PerRoute,
}

/// Identifier-coverage contract for a batch-producing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentPolicy {
    /// Returned ids must match the requested ids exactly:
    /// no missing, no extra, no duplicates.
    Exact,
    /// Returned ids must be a subset of the requested ids. Annotation
    /// phases that legitimately skip lines opt into this explicitly.
    Sparse,
}

impl PhaseKind {
    /// All phases in dependency order.
    pub const ALL: [PhaseKind; 7] = [
        PhaseKind::Ingest,
        PhaseKind::Context,
        PhaseKind::Pretranslation,
        PhaseKind::Translate,
        PhaseKind::Qa,
        PhaseKind::Edit,
        PhaseKind::Export,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Ingest => "ingest",
            PhaseKind::Context => "context",
            PhaseKind::Pretranslation => "pretranslation",
            PhaseKind::Translate => "translate",
            PhaseKind::Qa => "qa",
            PhaseKind::Edit => "edit",
            PhaseKind::Export => "export",
        }
    }

    /// Whether this phase produces one output per target language.
    pub fn is_language_scoped(&self) -> bool {
        match self {
            PhaseKind::Ingest | PhaseKind::Context => false,
            PhaseKind::Pretranslation
            | PhaseKind::Translate
            | PhaseKind::Qa
            | PhaseKind::Edit
            | PhaseKind::Export => true,
        }
    }

    /// Whether this phase calls out to the agent backend. Ingest and export
    /// are deterministic local transforms.
    pub fn uses_backend(&self) -> bool {
        match self {
            PhaseKind::Ingest | PhaseKind::Export => false,
            PhaseKind::Context
            | PhaseKind::Pretranslation
            | PhaseKind::Translate
            | PhaseKind::Qa
            | PhaseKind::Edit => true,
        }
    }

    /// Hard prerequisites given the set of enabled phases. Optional upstream
    /// phases only gate (and only feed staleness for) downstream phases when
    /// they are enabled.
    pub fn dependencies(&self, enabled: &EnabledPhases) -> Vec<PhaseKind> {
        match self {
            PhaseKind::Ingest => vec![],
            PhaseKind::Context => vec![PhaseKind::Ingest],
            PhaseKind::Pretranslation => {
                let mut deps = vec![PhaseKind::Ingest];
                if enabled.contains(PhaseKind::Context) {
                    deps.push(PhaseKind::Context);
                }
                deps
            }
            PhaseKind::Translate => {
                let mut deps = vec![PhaseKind::Ingest];
                if enabled.contains(PhaseKind::Context) {
                    deps.push(PhaseKind::Context);
                }
                if enabled.contains(PhaseKind::Pretranslation) {
                    deps.push(PhaseKind::Pretranslation);
                }
                deps
            }
            PhaseKind::Qa => vec![PhaseKind::Translate],
            PhaseKind::Edit => {
                let mut deps = vec![PhaseKind::Translate];
                if enabled.contains(PhaseKind::Qa) {
                    deps.push(PhaseKind::Qa);
                }
                deps
            }
            PhaseKind::Export => {
                if enabled.contains(PhaseKind::Edit) {
                    vec![PhaseKind::Edit]
                } else {
                    vec![PhaseKind::Translate]
                }
            }
        }
    }

    pub fn chunk_strategy(&self) -> ChunkStrategy {
        match self {
            PhaseKind::Ingest | PhaseKind::Export => ChunkStrategy::WholeProject,
            PhaseKind::Pretranslation => ChunkStrategy::PerRoute,
            PhaseKind::Context | PhaseKind::Translate | PhaseKind::Qa | PhaseKind::Edit => {
                ChunkStrategy::PerScene
            }
        }
    }

    pub fn alignment_policy(&self) -> AlignmentPolicy {
        match self {
            // Context annotation may legitimately return nothing for lines
            // with nothing to annotate.
            PhaseKind::Context => AlignmentPolicy::Sparse,
            PhaseKind::Ingest
            | PhaseKind::Pretranslation
            | PhaseKind::Translate
            | PhaseKind::Qa
            | PhaseKind::Edit
            | PhaseKind::Export => AlignmentPolicy::Exact,
        }
    }

    /// Default bounded parallelism for this phase's chunks. Edit is kept
    /// narrow: it is quality-sensitive and rarely I/O-bound.
    pub fn default_fan_out(&self) -> usize {
        match self {
            PhaseKind::Ingest | PhaseKind::Export => 1,
            PhaseKind::Context | PhaseKind::Pretranslation => 3,
            PhaseKind::Translate | PhaseKind::Qa => 4,
            PhaseKind::Edit => 2,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PhaseKind {
    type Err = crate::error::PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(PhaseKind::Ingest),
            "context" => Ok(PhaseKind::Context),
            "pretranslation" => Ok(PhaseKind::Pretranslation),
            "translate" => Ok(PhaseKind::Translate),
            "qa" => Ok(PhaseKind::Qa),
            "edit" => Ok(PhaseKind::Edit),
            "export" => Ok(PhaseKind::Export),
            other => Err(crate::error::PhaseError::UnknownPhase(other.to_string())),
        }
    }
}

/// The set of phases enabled for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledPhases(BTreeSet<PhaseKind>);

impl EnabledPhases {
    pub fn new(phases: impl IntoIterator<Item = PhaseKind>) -> Self {
        Self(phases.into_iter().collect())
    }

    /// Everything enabled.
    pub fn all() -> Self {
        Self::new(PhaseKind::ALL)
    }

    pub fn contains(&self, phase: PhaseKind) -> bool {
        self.0.contains(&phase)
    }

    /// Enabled phases in dependency order.
    pub fn ordered(&self) -> Vec<PhaseKind> {
        PhaseKind::ALL
            .into_iter()
            .filter(|p| self.0.contains(p))
            .collect()
    }
}
