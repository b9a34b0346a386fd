//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which budget a session exceeded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    #[error("iteration limit")]
    IterationLimit,
    #[error("token budget")]
    TokenBudget,
    #[error("runtime limit")]
    RuntimeLimit,
}

/// Main error enum for the Ralph execution core.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Quota or resource exhaustion outside the session-budget path (e.g. a
    /// bounded dispatch queue at capacity).
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Invalid state transition (e.g. dispatch to a non-idle worker).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors, including recovered panics.
    #[error("internal error: {0}")]
    Internal(String),

    /// A session exceeded one of its configured budgets. Expected-terminal,
    /// never a bug.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(BudgetKind),

    /// The calling context was cancelled. Expected-terminal.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Hat-transition loop detection tripped. Expected-terminal.
    #[error("loop limit reached: {0}")]
    LoopLimit(String),

    /// Timeout (e.g. a shell tool call, or a worker stop grace period).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed wire protocol envelope or truncated stream. Fatal for the
    /// connection that raised it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Key material or sealed-envelope failure: invalid key or failed
    /// decrypt/authentication.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Local durable store I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Startup-time misconfiguration (e.g. no chat client configured).
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn budget_exceeded(kind: BudgetKind) -> Self {
        Self::BudgetExceeded(kind)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn loop_limit(msg: impl Into<String>) -> Self {
        Self::LoopLimit(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn misconfiguration(msg: impl Into<String>) -> Self {
        Self::Misconfiguration(msg.into())
    }

    /// Report-facing status string, matching the `CompletionReport.status`
    /// and `SessionState.status` vocabularies used across the protocol.
    pub fn report_status(&self) -> &'static str {
        match self {
            Error::BudgetExceeded(_) => "budget_exceeded",
            Error::Cancelled(_) => "cancelled",
            Error::LoopLimit(_) => "loop_limit",
            _ => "failed",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
