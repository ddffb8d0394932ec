// ── Atoms: Error Types ───────────────────────────────────────────────────
// Single canonical error enum for the platform, built with `thiserror`.
//
// Variants map onto the failure-kind taxonomy: validation/auth/not-found
// are surfaced directly to callers, the ledger/settlement kinds carry
// enough detail for a synthetic in-stream message, and the last two are
// always logged + alerted and never leak partial state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Request failed schema/length/enum validation. No state changes.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Referenced entity (agent, thread, account, event...) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but not permitted to perform this action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Payer balance is below the amount required for the operation.
    /// Ledger is left unchanged; callers turn this into a synthetic
    /// assistant-facing message rather than aborting the conversation.
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: String, available: String },

    /// Per-agent daily/monthly quota has been exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A tool call was cancelled or timed out; the conversation continues.
    #[error("skill interrupted: {0}")]
    SkillInterrupted(String),

    /// A tool call raised; its error text becomes the tool result.
    #[error("skill error: {skill}: {message}")]
    SkillError { skill: String, message: String },

    /// Model provider call failed after the single permitted retry.
    #[error("model error: {provider}: {message}")]
    ModelError { provider: String, message: String },

    /// A ledger invariant was violated mid-write. The write is aborted
    /// and the caller must alert — this must never be silently retried.
    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    /// Configuration is invalid or a required key is missing at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// SQLite / rusqlite database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timestamp parsing failure.
    #[error("time parse error: {0}")]
    TimeParse(#[from] chrono::ParseError),

    /// Any other unhandled failure. 500, alert, no partial state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound(entity.into())
    }

    pub fn skill_error(skill: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SkillError { skill: skill.into(), message: message.into() }
    }

    pub fn model_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelError { provider: provider.into(), message: message.into() }
    }

    /// Kind identifier used for logging, alerting, and `CheckResult.type` fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::SkillInterrupted(_) => "SKILL_INTERRUPTED",
            Self::SkillError { .. } => "SKILL_ERROR",
            Self::ModelError { .. } => "MODEL_ERROR",
            Self::LedgerInconsistency(_) => "LEDGER_INCONSISTENCY",
            Self::Config(_) | Self::Database(_) | Self::Serialization(_) | Self::Io(_)
            | Self::TimeParse(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this kind should trigger the alert sink / error reporter
    /// per the propagation policy (kinds 9 and 10 are always alerted).
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            Self::LedgerInconsistency(_)
                | Self::Internal(_)
                | Self::Database(_)
                | Self::Io(_)
        )
    }
}

impl From<String> for PlatformError {
    fn from(s: String) -> Self {
        PlatformError::Internal(s)
    }
}

impl From<&str> for PlatformError {
    fn from(s: &str) -> Self {
        PlatformError::Internal(s.to_string())
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;
