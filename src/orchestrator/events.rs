//! Progress and lifecycle events.
//!
//! Each event is one self-contained record: serialized to a single JSON line
//! via `tracing` for operators, and optionally mirrored onto an mpsc channel
//! for an attached frontend (CLI/TUI). No event spans multiple lines.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::model::RunId;

/// One significant pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        thread_id: String,
    },
    PhaseStarted {
        run_id: String,
        phase: String,
        language: Option<String>,
        items: usize,
        chunks: usize,
    },
    PhaseProgress {
        run_id: String,
        phase: String,
        language: Option<String>,
        completed_chunks: usize,
        total_chunks: usize,
    },
    PhaseCompleted {
        run_id: String,
        phase: String,
        language: Option<String>,
        revision: u64,
        items: usize,
        retries: u32,
    },
    PhaseFailed {
        run_id: String,
        phase: String,
        language: Option<String>,
        code: String,
        message: String,
        advice: String,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        message: String,
    },
}

impl PipelineEvent {
    /// Short human message accompanying the structured payload.
    pub fn message(&self) -> String {
        match self {
            PipelineEvent::RunStarted { thread_id, .. } => {
                format!("run started (thread {thread_id})")
            }
            PipelineEvent::PhaseStarted { phase, items, chunks, .. } => {
                format!("phase {phase} started: {items} items in {chunks} chunks")
            }
            PipelineEvent::PhaseProgress {
                phase,
                completed_chunks,
                total_chunks,
                ..
            } => format!("phase {phase}: {completed_chunks}/{total_chunks} chunks"),
            PipelineEvent::PhaseCompleted { phase, revision, items, .. } => {
                format!("phase {phase} completed: {items} items at revision {revision}")
            }
            PipelineEvent::PhaseFailed { phase, code, .. } => {
                format!("phase {phase} failed ({code})")
            }
            PipelineEvent::RunCompleted { .. } => "run completed".to_string(),
            PipelineEvent::RunFailed { message, .. } => format!("run failed: {message}"),
        }
    }
}

/// Emits events as single-line tracing records and mirrors them onto an
/// optional channel.
#[derive(Clone)]
pub struct Emitter {
    run_id: String,
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl Emitter {
    pub fn new(run_id: RunId, tx: Option<mpsc::Sender<PipelineEvent>>) -> Self {
        Self {
            run_id: run_id.to_string(),
            tx,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn emit(&self, event: PipelineEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(target: "tlpipe::event", message = %event.message(), data = %payload);
        if let Some(tx) = &self.tx {
            tx.send(event).await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_snake_case_names() {
        let event = PipelineEvent::PhaseCompleted {
            run_id: "r1".into(),
            phase: "translate".into(),
            language: Some("de".into()),
            revision: 1,
            items: 3,
            retries: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "phase_completed");
        assert_eq!(json["phase"], "translate");
        assert_eq!(json["revision"], 1);
    }

    #[test]
    fn test_event_is_single_line() {
        let event = PipelineEvent::PhaseFailed {
            run_id: "r1".into(),
            phase: "qa".into(),
            language: Some("de".into()),
            code: "chunk_failed".into(),
            message: "backend exited with 1".into(),
            advice: "rerun the phase in gap-fill mode".into(),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
    }

    #[tokio::test]
    async fn test_emitter_mirrors_to_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = Emitter::new(RunId::new(), Some(tx));

        emitter
            .emit(PipelineEvent::RunCompleted {
                run_id: emitter.run_id().to_string(),
            })
            .await;

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, PipelineEvent::RunCompleted { .. }));
    }
}
