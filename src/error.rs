//! Typed error hierarchy for the pipeline.
//!
//! Three enums cover the three subsystems:
//! - `BackendError` - failures of a single backend call, classified
//!   transient vs. permanent vs. malformed-output
//! - `AgentError` - execution-contract outcomes after retry budgets
//! - `PhaseError` - orchestrator-level phase failures
//!
//! Every error carries a stable code and a suggested next action so a
//! failure never surfaces as an unexplained stall.

use thiserror::Error;

use crate::phase::PhaseKind;

/// Failure of a single backend invocation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Backend rate limited the request")]
    RateLimited,

    #[error("Connection to backend failed: {0}")]
    Connection(String),

    #[error("Backend output was not parseable: {0}")]
    Malformed(String),

    #[error("Backend authentication failed: {0}")]
    Auth(String),

    #[error("Backend configuration invalid: {0}")]
    InvalidConfig(String),
}

impl BackendError {
    /// Transient failures are retried with exponential backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout { .. } | BackendError::RateLimited | BackendError::Connection(_)
        )
    }

    /// Permanent failures are never retried and surface verbatim.
    pub fn is_permanent(&self) -> bool {
        matches!(self, BackendError::Auth(_) | BackendError::InvalidConfig(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Timeout { .. } => "backend_timeout",
            BackendError::RateLimited => "backend_rate_limited",
            BackendError::Connection(_) => "backend_connection",
            BackendError::Malformed(_) => "backend_malformed_output",
            BackendError::Auth(_) => "backend_auth",
            BackendError::InvalidConfig(_) => "backend_config",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            BackendError::Timeout { .. } => "increase call_timeout_secs or reduce chunk size",
            BackendError::RateLimited => "lower the phase fan-out or wait before retrying",
            BackendError::Connection(_) => "check network access to the backend and retry",
            BackendError::Malformed(_) => "inspect the backend command output format",
            BackendError::Auth(_) => "check the backend API key or credentials",
            BackendError::InvalidConfig(_) => "fix the backend section of tlpipe.toml",
        }
    }
}

/// Outcome of an execution-contract call after all retry budgets.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Output validation failed after {attempts} attempts: {feedback}")]
    ValidationExhausted { attempts: u32, feedback: String },

    #[error("Transient backend failures exhausted {attempts} attempts: {source}")]
    TransientExhausted {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("Permanent backend failure: {0}")]
    Permanent(#[source] BackendError),

    #[error("Call cancelled before dispatch")]
    Cancelled,
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ValidationExhausted { .. } => "validation_exhausted",
            AgentError::TransientExhausted { .. } => "transient_exhausted",
            AgentError::Permanent(e) => e.code(),
            AgentError::Cancelled => "cancelled",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            AgentError::ValidationExhausted { .. } => {
                "raise max_validation_attempts or simplify the phase's output schema"
            }
            AgentError::TransientExhausted { .. } => {
                "retry the phase in gap-fill mode once the backend recovers"
            }
            AgentError::Permanent(e) => e.advice(),
            AgentError::Cancelled => "rerun in gap-fill mode to pick up remaining chunks",
        }
    }
}

/// Orchestrator-level phase failures.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase} is not eligible: missing successful record for {missing:?}")]
    NotEligible {
        phase: PhaseKind,
        missing: Vec<String>,
    },

    #[error("Chunk {chunk} failed: {source}")]
    ChunkFailed {
        chunk: String,
        #[source]
        source: AgentError,
    },

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Phase {0} is language-scoped but no target language was given")]
    LanguageRequired(PhaseKind),

    #[error("Phase {0} is not enabled for this run")]
    NotEnabled(PhaseKind),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl PhaseError {
    pub fn code(&self) -> &'static str {
        match self {
            PhaseError::NotEligible { .. } => "phase_not_eligible",
            PhaseError::ChunkFailed { .. } => "chunk_failed",
            PhaseError::UnknownPhase(_) => "unknown_phase",
            PhaseError::LanguageRequired(_) => "language_required",
            PhaseError::NotEnabled(_) => "phase_not_enabled",
            PhaseError::Store(_) => "store_error",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            PhaseError::NotEligible { .. } => "run the missing prerequisite phases first",
            PhaseError::ChunkFailed { .. } => "rerun the phase in gap-fill mode",
            PhaseError::UnknownPhase(_) => "use one of: ingest, context, pretranslation, translate, qa, edit, export",
            PhaseError::LanguageRequired(_) => "pass --lang with a configured target language",
            PhaseError::NotEnabled(_) => "add the phase to enabled_phases in tlpipe.toml",
            PhaseError::Store(_) => "check permissions on the project's .tlpipe directory",
        }
    }
}
