//! Workflow error taxonomy
//!
//! The engine distinguishes three families, all carried by one enum so the
//! executor can classify outcomes exhaustively:
//!
//! - **Yield signals** (`Sleep`, `MessageWait`, `Evicted`) are not failures.
//!   They travel through `Result` like any other variant, workflow code
//!   propagates them with `?`, and the executor turns them into a persisted
//!   pause instead of an error.
//! - **Retryable** (`StepFailed`) triggers a backoff alarm; exhaustion turns
//!   into `StepExhausted`, which is not retried further.
//! - **Unrecoverable** (everything else) triggers compensation, except
//!   `Critical` and `RollbackCheckpoint`, which explicitly bypass it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error type flowing through workflow code and into the executor.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Yield: pause until `deadline` (optionally also waiting for messages).
    #[error("sleeping until {deadline}")]
    Sleep {
        deadline: DateTime<Utc>,
        messages: Vec<String>,
    },

    /// Yield: pause until a matching message arrives (any message if empty).
    #[error("waiting for messages: {names:?}")]
    MessageWait { names: Vec<String> },

    /// Yield: the host asked this invocation to stop; state is flushed as-is
    /// and the workflow is expected to be rescheduled elsewhere.
    #[error("workflow evicted")]
    Evicted,

    /// A step callback failed and will be retried with backoff.
    #[error("step '{name}' failed on attempt {attempt}: {source}")]
    StepFailed {
        name: String,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },

    /// A step ran out of attempts; not retried further.
    #[error("step '{name}' exhausted after {attempts} attempts: {last_error}")]
    StepExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },

    /// All branches of a join settled and at least one failed.
    #[error("join '{name}' failed: {}", .errors.join("; "))]
    Join { name: String, errors: Vec<String> },

    /// Unrecoverable failure that must NOT run compensation.
    #[error("critical: {0}")]
    Critical(String),

    /// Failure raised from within rollback handling; recorded and re-thrown
    /// without entering the rollback path.
    #[error("rollback checkpoint: {0}")]
    RollbackCheckpoint(String),

    /// Application-level error escaping to the workflow function; triggers
    /// compensation.
    #[error(transparent)]
    App(#[from] anyhow::Error),

    /// Internal boundary marker for rollback-mode replay; swallowed by the
    /// compensation driver and never crossing the public API.
    #[error("rollback replay reached incomplete history")]
    RollbackStop,
}

impl WorkflowError {
    /// Whether this is a control-flow yield rather than a failure.
    pub fn is_yield(&self) -> bool {
        matches!(
            self,
            Self::Sleep { .. } | Self::MessageWait { .. } | Self::Evicted
        )
    }

    /// Whether this failure skips compensation entirely.
    pub fn bypasses_rollback(&self) -> bool {
        matches!(self, Self::Critical(_) | Self::RollbackCheckpoint(_))
    }

    /// Stable kind tag, used for the durable error record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sleep { .. } => "sleep",
            Self::MessageWait { .. } => "message_wait",
            Self::Evicted => "evicted",
            Self::StepFailed { .. } => "step_failed",
            Self::StepExhausted { .. } => "step_exhausted",
            Self::Join { .. } => "join",
            Self::Critical(_) => "critical",
            Self::RollbackCheckpoint(_) => "rollback_checkpoint",
            Self::App(_) => "app",
            Self::RollbackStop => "rollback_stop",
        }
    }

    /// Serializable form for the `wf/error` record.
    pub fn to_stored(&self) -> StoredError {
        StoredError {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Durable, serializable snapshot of a workflow-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredError {
    /// Stable kind tag (see [`WorkflowError::kind`]).
    pub kind: String,

    /// Human-readable message.
    pub message: String,
}

impl std::fmt::Display for StoredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
