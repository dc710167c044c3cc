//! Integration tests for tlpipe.
//!
//! The CLI tests exercise the binary end to end; the pipeline tests drive
//! the orchestrator directly against scripted backends and assert on the
//! persisted artifacts, revisions, and checkpoints.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use async_trait::async_trait;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use tlpipe::agent::{AgentBackend, OutputSchema};
use tlpipe::config::PipelineConfig;
use tlpipe::error::BackendError;
use tlpipe::model::{PhaseKey, PhaseRecord, RunStatus, WorkItem};
use tlpipe::orchestrator::Orchestrator;
use tlpipe::phase::PhaseKind;

fn tlpipe() -> Command {
    cargo_bin_cmd!("tlpipe")
}

/// Pull the requested item ids back out of a rendered prompt.
fn prompt_ids(prompt: &str) -> Vec<String> {
    let start = prompt.find("## WORK ITEMS\n").unwrap() + "## WORK ITEMS\n".len();
    let rest = &prompt[start..];
    let end = rest.find("\n\n## OUTPUT FORMAT").unwrap();
    let items: Vec<WorkItem> = serde_json::from_str(&rest[..end]).unwrap();
    items.into_iter().map(|i| i.id).collect()
}

fn echo_output(ids: &[String], field: &str) -> Value {
    Value::Array(
        ids.iter()
            .map(|id| {
                let mut obj = serde_json::Map::new();
                obj.insert("id".to_string(), Value::String(id.clone()));
                obj.insert(field.to_string(), json!(format!("out:{id}")));
                Value::Object(obj)
            })
            .collect(),
    )
}

/// Answers every request with exact id coverage, recording the ids asked
/// for on each call.
struct EchoBackend {
    calls: Mutex<Vec<Vec<String>>>,
}

impl EchoBackend {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn run(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, BackendError> {
        let ids = prompt_ids(prompt);
        self.calls.lock().unwrap().push(ids.clone());
        Ok(echo_output(&ids, &schema.fields[0].name))
    }
}

/// One scripted misbehavior per call, then echoes. Records every prompt.
enum Step {
    Malformed,
    DropFirst,
    FailContaining(&'static str),
}

struct ScriptBackend {
    script: Mutex<VecDeque<Step>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptBackend {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptBackend {
    async fn run(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, BackendError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let ids = prompt_ids(prompt);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Malformed) => Ok(json!("not an output array")),
            Some(Step::DropFirst) => Ok(echo_output(&ids[1..], &schema.fields[0].name)),
            Some(Step::FailContaining(needle)) => {
                if ids.iter().any(|id| id.contains(needle)) {
                    Err(BackendError::Auth("token rejected".to_string()))
                } else {
                    Ok(echo_output(&ids, &schema.fields[0].name))
                }
            }
            None => Ok(echo_output(&ids, &schema.fields[0].name)),
        }
    }
}

/// Two scenes, `count` lines each, ids `scene_{a,b}_00_NNNN`.
fn write_script_file(dir: &TempDir, scenes: &[&str], per_scene: usize) {
    let mut items = Vec::new();
    for scene in scenes {
        for i in 0..per_scene {
            items.push(json!({
                "id": format!("scene_{scene}_00_{i:04}"),
                "scene": format!("scene_{scene}_00"),
                "route": format!("scene_{scene}"),
                "text": format!("{scene} line {i}")
            }));
        }
    }
    fs::write(
        dir.path().join("script.json"),
        serde_json::to_string_pretty(&items).unwrap(),
    )
    .unwrap();
}

fn translate_config(dir: &TempDir) -> PipelineConfig {
    fs::write(
        dir.path().join("tlpipe.toml"),
        r#"
enabled_phases = ["ingest", "translate"]
target_languages = ["de"]
"#,
    )
    .unwrap();
    PipelineConfig::load(dir.path(), None).unwrap()
}

fn artifact_items(record: &PhaseRecord) -> Vec<Value> {
    let path = &record.artifact.as_ref().unwrap().path;
    let payload: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    payload["items"].as_array().unwrap().clone()
}

// =============================================================================
// CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        tlpipe().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        tlpipe().arg("--version").assert().success();
    }

    #[test]
    fn test_status_on_fresh_project() {
        let dir = TempDir::new().unwrap();
        tlpipe()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("revision"));
        assert!(dir.path().join(".tlpipe").exists());
    }

    #[test]
    fn test_run_without_source_file_fails() {
        let dir = TempDir::new().unwrap();
        tlpipe()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read source file"));
    }

    #[test]
    fn test_unknown_phase_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        tlpipe()
            .current_dir(dir.path())
            .args(["phase", "review"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown phase"));
    }
}

// =============================================================================
// Pipeline scenarios
// =============================================================================

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn test_translate_produces_ordered_artifact() {
        let dir = TempDir::new().unwrap();
        write_script_file(&dir, &["a", "b"], 2);
        let backend = Arc::new(EchoBackend::new());
        let mut orch =
            Orchestrator::new(translate_config(&dir), backend.clone(), "t-1", None).unwrap();

        orch.run_pipeline().await.unwrap();
        assert_eq!(orch.run().status, RunStatus::Completed);

        // One backend call per scene chunk.
        assert_eq!(backend.calls().len(), 2);

        let record = orch
            .run()
            .record(&PhaseKey::new(PhaseKind::Translate, Some("de")))
            .unwrap();
        assert_eq!(record.revision, 1);
        assert_eq!(record.retries, 0);

        // Final artifact follows input id order, never completion order.
        let items = artifact_items(record);
        let ids: Vec<&str> = items.iter().map(|i| i["id"].as_str().unwrap()).collect();
        assert_eq!(
            ids,
            vec![
                "scene_a_00_0000",
                "scene_a_00_0001",
                "scene_b_00_0000",
                "scene_b_00_0001"
            ]
        );
        assert_eq!(items[0]["translation"], "out:scene_a_00_0000");
    }

    #[tokio::test]
    async fn test_malformed_output_retries_with_feedback() {
        let dir = TempDir::new().unwrap();
        write_script_file(&dir, &["a"], 3);
        let backend = Arc::new(ScriptBackend::new(vec![Step::Malformed, Step::DropFirst]));
        let mut orch =
            Orchestrator::new(translate_config(&dir), backend.clone(), "t-1", None).unwrap();

        orch.run_pipeline().await.unwrap();

        let record = orch
            .run()
            .record(&PhaseKey::new(PhaseKind::Translate, Some("de")))
            .unwrap();
        assert_eq!(record.retries, 2);
        assert_eq!(record.artifact.as_ref().unwrap().item_count, 3);

        // The second retry prompt names the id the backend dropped.
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("## CORRECTION"));
        assert!(prompts[2].contains("missing"));
        assert!(prompts[2].contains("scene_a_00_0000"));
    }

    #[tokio::test]
    async fn test_failed_run_resumes_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        write_script_file(&dir, &["a", "b"], 2);
        let config = translate_config(&dir);

        // Scene b fails with a permanent error; scene a completes and is
        // checkpointed.
        let failing = Arc::new(ScriptBackend::new(vec![
            Step::FailContaining("scene_b"),
            Step::FailContaining("scene_b"),
        ]));
        let mut orch =
            Orchestrator::new(config.clone(), failing, "t-resume", None).unwrap();
        orch.run_pipeline().await.unwrap_err();
        assert_eq!(orch.run().status, RunStatus::Failed);
        drop(orch);

        // Same thread, healthy backend: only the failed chunk hits the
        // backend again.
        let backend = Arc::new(EchoBackend::new());
        let mut orch = Orchestrator::new(config, backend.clone(), "t-resume", None).unwrap();
        orch.run_pipeline().await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].iter().all(|id| id.starts_with("scene_b")));

        let record = orch
            .run()
            .record(&PhaseKey::new(PhaseKind::Translate, Some("de")))
            .unwrap();
        assert!(record.success);
        assert_eq!(record.artifact.as_ref().unwrap().item_count, 4);
    }

    #[tokio::test]
    async fn test_gap_fill_translates_only_new_items() {
        let dir = TempDir::new().unwrap();
        write_script_file(&dir, &["a"], 2);
        let backend = Arc::new(EchoBackend::new());
        let mut orch =
            Orchestrator::new(translate_config(&dir), backend.clone(), "t-1", None).unwrap();
        orch.run_pipeline().await.unwrap();
        assert_eq!(backend.calls().len(), 1);

        // New lines land in the script; re-ingest, then gap-fill translate.
        write_script_file(&dir, &["a", "b"], 2);
        orch.run_phase(PhaseKind::Ingest, None).await.unwrap();
        let record = orch
            .run_phase(PhaseKind::Translate, Some("de"))
            .await
            .unwrap();

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].iter().all(|id| id.starts_with("scene_b")));

        // Retained and fresh outputs merge in full input order.
        assert_eq!(record.revision, 2);
        let items = artifact_items(&record);
        assert_eq!(items.len(), 4);
        let ids: Vec<&str> = items.iter().map(|i| i["id"].as_str().unwrap()).collect();
        assert_eq!(
            ids,
            vec![
                "scene_a_00_0000",
                "scene_a_00_0001",
                "scene_b_00_0000",
                "scene_b_00_0001"
            ]
        );
    }

    #[tokio::test]
    async fn test_export_carries_translation_forward() {
        let dir = TempDir::new().unwrap();
        write_script_file(&dir, &["a"], 2);
        fs::write(
            dir.path().join("tlpipe.toml"),
            r#"
enabled_phases = ["ingest", "translate", "export"]
target_languages = ["de"]
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(dir.path(), None).unwrap();
        let backend = Arc::new(EchoBackend::new());
        let mut orch = Orchestrator::new(config, backend, "t-1", None).unwrap();

        orch.run_pipeline().await.unwrap();

        let export = orch
            .run()
            .record(&PhaseKey::new(PhaseKind::Export, Some("de")))
            .unwrap();
        let items = artifact_items(export);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["translation"], "out:scene_a_00_0000");
    }

    #[tokio::test]
    async fn test_stale_phase_is_reported_not_rerun() {
        let dir = TempDir::new().unwrap();
        write_script_file(&dir, &["a"], 1);
        let backend = Arc::new(EchoBackend::new());
        let mut orch =
            Orchestrator::new(translate_config(&dir), backend.clone(), "t-1", None).unwrap();
        orch.run_pipeline().await.unwrap();

        orch.run_phase(PhaseKind::Ingest, None).await.unwrap();

        let rows = orch.status();
        let translate = rows.iter().find(|r| r.phase == "translate").unwrap();
        assert!(translate.stale);
        // No automatic rerun happened.
        assert_eq!(backend.calls().len(), 1);
    }
}
