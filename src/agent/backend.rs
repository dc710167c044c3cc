//! Command-line agent backend.
//!
//! Spawns a configured command, writes the prompt to its stdin, and parses
//! its stdout as JSON. Whatever sits behind the command - a hosted LLM CLI,
//! a local model wrapper, or a deterministic stub - only needs to honor the
//! prompt-in / JSON-out contract.

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::BackendError;

use super::{AgentBackend, OutputSchema};

pub struct CliBackend {
    command: String,
    args: Vec<String>,
}

impl CliBackend {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    async fn run(&self, prompt: &str, _schema: &OutputSchema) -> Result<Value, BackendError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::InvalidConfig(format!(
                    "backend command not found: {}",
                    self.command
                )),
                _ => BackendError::Connection(format!("failed to spawn backend: {e}")),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| BackendError::Connection(format!("failed to write prompt: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| BackendError::Connection(format!("failed to close stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Connection(format!("backend process failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        debug!(
            command = %self.command,
            exit = output.status.code().unwrap_or(-1),
            stdout_chars = stdout.len(),
            "backend call finished"
        );

        if !output.status.success() {
            let detail = stderr.trim();
            let lowered = detail.to_lowercase();
            if lowered.contains("unauthorized")
                || lowered.contains("api key")
                || lowered.contains("authentication")
            {
                return Err(BackendError::Auth(detail.to_string()));
            }
            if lowered.contains("rate limit") || lowered.contains("too many requests") {
                return Err(BackendError::RateLimited);
            }
            return Err(BackendError::Connection(format!(
                "backend exited with {}: {}",
                output.status.code().unwrap_or(-1),
                detail
            )));
        }

        // Some CLIs wrap the payload in log lines; take the first line that
        // parses, falling back to the whole stdout.
        serde_json::from_str(stdout.trim()).or_else(|whole_err| {
            stdout
                .lines()
                .find_map(|line| serde_json::from_str(line.trim()).ok())
                .ok_or_else(|| BackendError::Malformed(format!("stdout was not JSON: {whole_err}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_command_is_config_error() {
        let backend = CliBackend::new("definitely-not-a-real-binary-tlpipe", &[]);
        let schema = OutputSchema::new("x", &[]);
        let err = backend.run("hi", &schema).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
        assert!(err.is_permanent());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cat_echoes_json_back() {
        let backend = CliBackend::new("cat", &[]);
        let schema = OutputSchema::new("x", &[]);
        let value = backend.run(r#"[{"id":"a"}]"#, &schema).await.unwrap();
        assert_eq!(value[0]["id"], "a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_json_stdout_is_malformed() {
        let backend = CliBackend::new("cat", &[]);
        let schema = OutputSchema::new("x", &[]);
        let err = backend.run("this is not json", &schema).await.unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_json_extracted_from_noisy_stdout() {
        // printf emits a log line before the payload.
        let backend = CliBackend::new(
            "sh",
            &["-c".into(), r#"printf 'starting up\n[{"id":"a"}]\n'"#.into()],
        );
        let schema = OutputSchema::new("x", &[]);
        let value = backend.run("ignored", &schema).await.unwrap();
        assert_eq!(value[0]["id"], "a");
    }
}
