//! Pipeline configuration.
//!
//! Everything the orchestrator needs is loaded here, once, and passed in at
//! construction. Nothing in the execution path reads ambient state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::agent::RetryPolicy;
use crate::phase::{EnabledPhases, PhaseKind};

/// How the work set for a phase execution is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Process every item, replacing prior output.
    Overwrite,
    /// Process only items missing from the phase's latest output.
    #[default]
    GapFill,
    /// Process only items that no prior output of this phase has ever
    /// covered.
    NewOnly,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "overwrite" => Ok(RunMode::Overwrite),
            "gap-fill" => Ok(RunMode::GapFill),
            "new-only" => Ok(RunMode::NewOnly),
            other => anyhow::bail!("unknown mode '{other}' (overwrite | gap-fill | new-only)"),
        }
    }
}

/// Optional explicit targeting of a scene or route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    pub scene: Option<String>,
    pub route: Option<String>,
}

/// Retry budgets and backoff shape, one layer, applied inside the execution
/// contract only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_validation_attempts: u32,
    pub max_transient_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_validation_attempts: 3,
            max_transient_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            call_timeout_secs: 180,
        }
    }
}

/// Backend command invoked per chunk: prompt on stdin, JSON on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            command: "tlpipe-agent".to_string(),
            args: Vec::new(),
        }
    }
}

/// On-disk shape of `tlpipe.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    source_file: Option<PathBuf>,
    enabled_phases: Vec<PhaseKind>,
    target_languages: Vec<String>,
    mode: Option<RunMode>,
    conflict_window_secs: Option<u64>,
    fan_out: BTreeMap<String, usize>,
    retry: RetrySettings,
    backend: BackendSettings,
}

/// Resolved runtime configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub project_dir: PathBuf,
    /// Source script items, JSON. Format-specific ingest adapters live
    /// outside the core and produce this file.
    pub source_file: PathBuf,
    pub enabled_phases: EnabledPhases,
    pub target_languages: Vec<String>,
    pub mode: RunMode,
    pub filter: TargetFilter,
    pub conflict_window_secs: u64,
    fan_out: BTreeMap<String, usize>,
    pub retry: RetrySettings,
    pub backend: BackendSettings,
}

impl PipelineConfig {
    /// Load `tlpipe.toml` from the project directory (or an explicit path)
    /// and resolve defaults.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => project_dir.join("tlpipe.toml"),
        };

        let file: ConfigFile = if path.exists() {
            let content = fs_read(&path)?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            ConfigFile::default()
        };

        let enabled_phases = if file.enabled_phases.is_empty() {
            EnabledPhases::all()
        } else {
            EnabledPhases::new(file.enabled_phases)
        };

        let source_file = match file.source_file {
            Some(p) if p.is_absolute() => p,
            Some(p) => project_dir.join(p),
            None => project_dir.join("script.json"),
        };

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            source_file,
            enabled_phases,
            target_languages: file.target_languages,
            mode: file.mode.unwrap_or_default(),
            filter: TargetFilter::default(),
            conflict_window_secs: file.conflict_window_secs.unwrap_or(30),
            fan_out: file.fan_out,
            retry: file.retry,
            backend: file.backend,
        })
    }

    /// Bounded parallelism for a phase: explicit override or the phase's
    /// default.
    pub fn fan_out_for(&self, phase: PhaseKind) -> usize {
        self.fan_out
            .get(phase.name())
            .copied()
            .unwrap_or_else(|| phase.default_fan_out())
            .max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_validation_attempts: self.retry.max_validation_attempts.max(1),
            max_transient_attempts: self.retry.max_transient_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            call_timeout: Duration::from_secs(self.retry.call_timeout_secs),
        }
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_secs(self.conflict_window_secs)
    }

    /// Configuration snapshot stored on the run record.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn fs_read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(dir.path(), None).unwrap();

        assert_eq!(config.mode, RunMode::GapFill);
        assert_eq!(config.conflict_window_secs, 30);
        assert!(config.enabled_phases.contains(PhaseKind::Translate));
        assert_eq!(config.source_file, dir.path().join("script.json"));
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("tlpipe.toml"),
            r#"
source_file = "lines.json"
enabled_phases = ["ingest", "translate", "export"]
target_languages = ["de", "fr"]
mode = "overwrite"
conflict_window_secs = 10

[fan_out]
translate = 8

[retry]
max_validation_attempts = 5
base_delay_ms = 250

[backend]
command = "my-agent"
args = ["--format", "json"]
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.mode, RunMode::Overwrite);
        assert_eq!(config.target_languages, vec!["de", "fr"]);
        assert!(config.enabled_phases.contains(PhaseKind::Export));
        assert!(!config.enabled_phases.contains(PhaseKind::Qa));
        assert_eq!(config.fan_out_for(PhaseKind::Translate), 8);
        assert_eq!(config.fan_out_for(PhaseKind::Edit), 2);
        assert_eq!(config.retry.max_validation_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.backend.command, "my-agent");
        assert_eq!(config.source_file, dir.path().join("lines.json"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tlpipe.toml"), "mode = [not toml").unwrap();
        let err = PipelineConfig::load(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!(RunMode::from_str("gap-fill").unwrap(), RunMode::GapFill);
        assert_eq!(RunMode::from_str("new-only").unwrap(), RunMode::NewOnly);
        assert!(RunMode::from_str("sideways").is_err());
    }

    #[test]
    fn test_retry_policy_conversion() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(dir.path(), None).unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(1_000));
        assert_eq!(policy.call_timeout, Duration::from_secs(180));
    }
}
