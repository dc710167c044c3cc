//! Per-entity advisory locks with conflict feedback.
//!
//! Shared entity metadata (characters, glossary terms, scene annotations) is
//! mutated by concurrent agents and by human-in-the-loop edits. A write that
//! lands on a field another writer touched within the conflict window is not
//! applied silently: the caller gets both values back and must decide.
//!
//! Entity locks are held only across the read-check-write sequence, never
//! across a backend call.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Kinds of shared mutable entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    GlossaryTerm,
    SceneAnnotation,
}

/// One field value with the provenance needed for conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Outcome of an update attempt. `Conflict` is a first-class decision point,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied { previous: Option<Value> },
    Conflict { current: FieldValue, proposed: Value },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// Caller's decision after a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Apply the proposed value over the contested one.
    Overwrite,
    /// Keep the current value, discard the proposal.
    Skip,
}

type EntityKey = (EntityKind, String);
type Fields = HashMap<String, FieldValue>;

/// Shared entity store guarded by per-entity async locks.
pub struct ContextStore {
    window: Duration,
    entities: Mutex<HashMap<EntityKey, Arc<Mutex<Fields>>>>,
}

impl ContextStore {
    pub fn new(conflict_window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(conflict_window).unwrap_or_else(|_| Duration::seconds(30)),
            entities: Mutex::new(HashMap::new()),
        }
    }

    async fn entity(&self, kind: EntityKind, id: &str) -> Arc<Mutex<Fields>> {
        let mut entities = self.entities.lock().await;
        entities
            .entry((kind, id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
            .clone()
    }

    /// Attempt to update one field. Returns `Conflict` when a different
    /// writer touched the same field within the conflict window.
    pub async fn update_field(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        proposed: Value,
        writer: &str,
    ) -> UpdateOutcome {
        let entity = self.entity(kind, id).await;
        let mut fields = entity.lock().await;

        if let Some(current) = fields.get(field) {
            let age = Utc::now() - current.updated_at;
            if age < self.window && current.updated_by != writer {
                return UpdateOutcome::Conflict {
                    current: current.clone(),
                    proposed,
                };
            }
        }

        let previous = fields
            .insert(
                field.to_string(),
                FieldValue {
                    value: proposed,
                    updated_at: Utc::now(),
                    updated_by: writer.to_string(),
                },
            )
            .map(|fv| fv.value);

        UpdateOutcome::Applied { previous }
    }

    /// Apply the caller's decision for a previously reported conflict.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        proposed: Value,
        writer: &str,
        resolution: Resolution,
    ) {
        match resolution {
            Resolution::Skip => {}
            Resolution::Overwrite => {
                let entity = self.entity(kind, id).await;
                let mut fields = entity.lock().await;
                fields.insert(
                    field.to_string(),
                    FieldValue {
                        value: proposed,
                        updated_at: Utc::now(),
                        updated_by: writer.to_string(),
                    },
                );
            }
        }
    }

    pub async fn get(&self, kind: EntityKind, id: &str, field: &str) -> Option<FieldValue> {
        let entity = self.entity(kind, id).await;
        let fields = entity.lock().await;
        fields.get(field).cloned()
    }

    /// All fields of one entity, for rendering into prompts.
    pub async fn entity_fields(&self, kind: EntityKind, id: &str) -> HashMap<String, Value> {
        let entity = self.entity(kind, id).await;
        let fields = entity.lock().await;
        fields
            .iter()
            .map(|(k, fv)| (k.clone(), fv.value.clone()))
            .collect()
    }
}
