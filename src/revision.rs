//! Revision counters and computed staleness.
//!
//! Each successful phase execution advances a monotonic revision for its
//! `(phase, target-language)` key. A downstream record is stale when any
//! dependency's current revision has moved past the revision snapshotted at
//! that record's phase start. Staleness is advisory: it shows up in status
//! output and never blocks execution or queues a rerun.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{DependencyRevision, PhaseKey, PhaseRecord};
use crate::phase::{EnabledPhases, PhaseKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevisionTracker {
    /// Keyed by `PhaseKey` string form for stable serialization.
    revisions: BTreeMap<String, u64>,
}

impl RevisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current revision for a key; 0 means never successfully run.
    pub fn current(&self, key: &PhaseKey) -> u64 {
        self.revisions.get(&key.to_string()).copied().unwrap_or(0)
    }

    /// Advance on successful persisted completion. Returns the new revision.
    pub fn advance(&mut self, key: &PhaseKey) -> u64 {
        let entry = self.revisions.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Snapshot the current revisions of a phase's dependencies. Taken at
    /// phase start; stored on the `PhaseRecord` that execution produces.
    ///
    /// Language-scoped dependencies are snapshotted for the same target
    /// language as the dependent phase; global ones without a language.
    pub fn snapshot(
        &self,
        phase: PhaseKind,
        language: Option<&str>,
        enabled: &EnabledPhases,
    ) -> Vec<DependencyRevision> {
        phase
            .dependencies(enabled)
            .into_iter()
            .map(|dep| {
                let dep_lang = if dep.is_language_scoped() {
                    language.map(str::to_string)
                } else {
                    None
                };
                let key = PhaseKey {
                    phase: dep,
                    language: dep_lang.clone(),
                };
                DependencyRevision {
                    phase: dep,
                    language: dep_lang,
                    revision: self.current(&key),
                }
            })
            .collect()
    }

    /// A record is stale when any dependency has advanced past the revision
    /// captured at that record's phase start.
    pub fn is_stale(&self, record: &PhaseRecord) -> bool {
        record
            .dep_revisions
            .iter()
            .any(|dep| self.current(&dep.key()) > dep.revision)
    }
}
