//! The agent execution contract.
//!
//! `execute` is the single place where backend calls, schema validation,
//! alignment checking, and retry policy meet. There is exactly one retry
//! layer: the backend itself must not retry internally, and the orchestrator
//! never re-dispatches a chunk that this contract has already given up on.

pub mod alignment;
pub mod backend;

pub use backend::CliBackend;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AgentError, BackendError};
use crate::model::{OutputItem, WorkItem};
use crate::phase::{AlignmentPolicy, PhaseKind};

use alignment::AlignmentReport;

/// The external execution backend: given a prompt and a schema description,
/// produce structured output or a classified error. The orchestrator does
/// not care whether this is a hosted LLM, a local model, or a stub.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, BackendError>;
}

/// Per-item output fields a phase expects back.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    /// Short name used in prompts and logs, e.g. "translation".
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
}

impl OutputSchema {
    pub fn new(name: &str, fields: &[(&str, bool)]) -> Self {
        Self {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(n, required)| FieldSpec {
                    name: n.to_string(),
                    required: *required,
                })
                .collect(),
        }
    }

    /// Prompt-facing description of the expected JSON shape.
    pub fn describe(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                if f.required {
                    format!("\"{}\" (required)", f.name)
                } else {
                    format!("\"{}\" (optional)", f.name)
                }
            })
            .collect();
        format!(
            "Return a JSON array of {} objects. Each object must have a \"id\" \
             field matching a requested id, plus: {}.",
            self.name,
            fields.join(", ")
        )
    }
}

/// Typed payload for one chunk: the work items plus read-only context.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub phase: PhaseKind,
    pub language: Option<String>,
    pub items: Vec<WorkItem>,
    /// Read-only context blocks (glossary, prior-phase annotations),
    /// rendered verbatim into the prompt.
    pub context: Vec<String>,
    pub instructions: String,
}

impl AgentRequest {
    pub fn expected_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }

    /// Render the full prompt, with any accumulated validation feedback
    /// from the previous attempt appended verbatim.
    pub fn render_prompt(&self, schema: &OutputSchema, feedback: Option<&str>) -> String {
        let items_json = serde_json::to_string_pretty(&self.items).unwrap_or_default();
        let mut prompt = String::new();

        prompt.push_str(&format!("## TASK: {}", self.phase.name()));
        if let Some(lang) = &self.language {
            prompt.push_str(&format!(" (target language: {lang})"));
        }
        prompt.push_str("\n\n");
        prompt.push_str(&self.instructions);
        prompt.push_str("\n\n");

        for block in &self.context {
            prompt.push_str("## CONTEXT\n");
            prompt.push_str(block);
            prompt.push_str("\n\n");
        }

        prompt.push_str("## WORK ITEMS\n");
        prompt.push_str(&items_json);
        prompt.push_str("\n\n## OUTPUT FORMAT\n");
        prompt.push_str(&schema.describe());

        if let Some(fb) = feedback {
            prompt.push_str("\n\n## CORRECTION\n");
            prompt.push_str(fb);
        }

        prompt
    }
}

/// Validated outcome of one execution-contract invocation.
#[derive(Debug, Clone)]
pub struct AgentCallResult {
    pub items: Vec<OutputItem>,
    /// Attempts consumed by schema/alignment failures.
    pub validation_retries: u32,
    /// Attempts consumed by transient backend failures.
    pub transient_retries: u32,
}

impl AgentCallResult {
    pub fn retries(&self) -> u32 {
        self.validation_retries + self.transient_retries
    }
}

/// The one retry policy, applied at exactly this layer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed against schema/alignment failures.
    pub max_validation_attempts: u32,
    /// Total attempts allowed against transient backend failures.
    pub max_transient_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Hard timeout per backend call; a timeout counts as transient.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_validation_attempts: 3,
            max_transient_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Invoke the backend for one chunk, enforcing the typed request/response
/// contract. Returns a structured failure after budget exhaustion - never an
/// opaque error. Persistence is the orchestrator's job, not this function's.
pub async fn execute(
    backend: &dyn AgentBackend,
    request: &AgentRequest,
    schema: &OutputSchema,
    policy: &RetryPolicy,
) -> Result<AgentCallResult, AgentError> {
    let expected = request.expected_ids();
    let alignment_policy = request.phase.alignment_policy();

    let mut validation_retries: u32 = 0;
    let mut transient_retries: u32 = 0;
    let mut feedback: Option<String> = None;

    loop {
        let prompt = request.render_prompt(schema, feedback.as_deref());

        let outcome = match tokio::time::timeout(policy.call_timeout, backend.run(&prompt, schema))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                seconds: policy.call_timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(value) => match validate_output(&value, &expected, schema, alignment_policy) {
                Ok(items) => {
                    return Ok(AgentCallResult {
                        items,
                        validation_retries,
                        transient_retries,
                    });
                }
                Err(fb) => {
                    validation_retries += 1;
                    if validation_retries >= policy.max_validation_attempts {
                        return Err(AgentError::ValidationExhausted {
                            attempts: validation_retries,
                            feedback: fb,
                        });
                    }
                    warn!(
                        phase = request.phase.name(),
                        attempt = validation_retries,
                        "output validation failed, retrying with feedback"
                    );
                    feedback = Some(fb);
                }
            },
            Err(e) if e.is_permanent() => return Err(AgentError::Permanent(e)),
            Err(e) if e.is_transient() => {
                transient_retries += 1;
                if transient_retries >= policy.max_transient_attempts {
                    return Err(AgentError::TransientExhausted {
                        attempts: transient_retries,
                        source: e,
                    });
                }
                let delay = policy.backoff_delay(transient_retries - 1);
                debug!(
                    phase = request.phase.name(),
                    attempt = transient_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient backend failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                // Unparseable output is a validation-class failure: the
                // backend gets told what went wrong and another chance.
                validation_retries += 1;
                let fb = format!(
                    "Your previous response could not be parsed: {e}. \
                     Respond with only the JSON array, no surrounding text."
                );
                if validation_retries >= policy.max_validation_attempts {
                    return Err(AgentError::ValidationExhausted {
                        attempts: validation_retries,
                        feedback: fb,
                    });
                }
                feedback = Some(fb);
            }
        }
    }
}

/// Parse and validate a backend response: JSON shape, required fields, and
/// id alignment. On failure returns a single feedback message covering every
/// problem found.
fn validate_output(
    value: &Value,
    expected_ids: &[String],
    schema: &OutputSchema,
    policy: AlignmentPolicy,
) -> Result<Vec<OutputItem>, String> {
    let items: Vec<OutputItem> = match serde_json::from_value(value.clone()) {
        Ok(items) => items,
        Err(e) => {
            return Err(format!(
                "Response was not an array of objects with string \"id\" fields: {e}. {}",
                schema.describe()
            ));
        }
    };

    let mut field_errors = Vec::new();
    for item in &items {
        for field in &schema.fields {
            if !field.required {
                continue;
            }
            match item.fields.get(&field.name) {
                Some(v) if !v.is_null() => {}
                _ => field_errors.push(format!("{} is missing \"{}\"", item.id, field.name)),
            }
        }
    }

    let returned_ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
    let report: AlignmentReport = alignment::check(expected_ids, &returned_ids, policy);

    if field_errors.is_empty() && report.is_ok() {
        return Ok(items);
    }

    let mut feedback = String::new();
    if !field_errors.is_empty() {
        feedback.push_str(&format!(
            "Some items were missing required fields: {}. ",
            field_errors.join("; ")
        ));
    }
    if !report.is_ok() {
        feedback.push_str(&report.feedback());
    }
    Err(feedback.trim_end().to_string())
}
