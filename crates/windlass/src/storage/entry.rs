//! Durable records: history entries, entry metadata, and messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::location::Location;

/// One durable record per operation, addressed by its location key.
///
/// Entries are what replay consults: a completed entry short-circuits its
/// operation to the cached result without re-executing side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Generated once when the operation first runs (UUID v7, time-ordered).
    pub id: Uuid,

    /// Path address within the execution tree.
    pub location: Location,

    /// Kind-specific durable data.
    pub kind: EntryKind,

    /// Whether this entry has unflushed changes.
    #[serde(skip)]
    pub dirty: bool,
}

/// Kind-specific payload of an [`Entry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    /// A durable step: executes once, caches its output (or last error).
    Step {
        output: Option<serde_json::Value>,
        error: Option<String>,
    },

    /// A durable sleep, optionally combined with a message wait.
    Sleep {
        deadline: DateTime<Utc>,
        #[serde(default)]
        messages: Vec<String>,
    },

    /// A consumed inbox message.
    Message { message: Message },

    /// A parallel join with per-branch bookkeeping.
    Join { branches: Vec<BranchSlot> },

    /// A race; the recorded winner lets replay skip the losers.
    Race {
        winner: Option<String>,
        output: Option<serde_json::Value>,
    },

    /// A durable loop: committed state plus the trim watermark.
    Loop {
        state: serde_json::Value,
        iteration: u64,
        /// Carried state as of `trimmed_before`; rollback replay starts here.
        base_state: serde_json::Value,
        /// Iterations below this index had their history trimmed.
        trimmed_before: u64,
        /// States captured at trim boundaries, candidates for future cuts.
        checkpoints: Vec<LoopCheckpoint>,
        output: Option<serde_json::Value>,
    },

    /// Boundary tombstone left where loop history was trimmed.
    Removed,
}

/// Loop state captured at a trim boundary. When the iteration later falls
/// out of the retention window it becomes the new trim cut, and its state
/// becomes the loop's `base_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopCheckpoint {
    pub iteration: u64,
    pub state: serde_json::Value,
}

/// Per-branch durable state inside a join entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSlot {
    pub name: String,
    pub status: BranchStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl BranchSlot {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: BranchStatus::Pending,
            output: None,
            error: None,
        }
    }

    /// Whether this branch has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(self.status, BranchStatus::Completed | BranchStatus::Failed)
    }
}

/// Status of one join branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Operational state of one entry, kept separate from the entry itself so
/// replay-only reads never dirty metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub status: EntryStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rollback_completed_at: Option<DateTime<Utc>>,
    pub rollback_error: Option<String>,

    /// Whether this metadata has unflushed changes.
    #[serde(skip)]
    pub dirty: bool,
}

impl EntryMetadata {
    /// Fresh metadata for a newly created entry.
    pub fn pending() -> Self {
        Self {
            status: EntryStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
            completed_at: None,
            rollback_completed_at: None,
            rollback_error: None,
            dirty: true,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == EntryStatus::Completed
    }
}

/// Status of one entry's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Exhausted,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// One inbox message, delivered by an external writer into the workflow's
/// KV namespace and consumed in id (FIFO) order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonically increasing per-workflow id.
    pub id: u64,

    /// Message name; waits match on it.
    pub name: String,

    /// Message payload.
    pub data: serde_json::Value,

    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: u64, name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id,
            name: name.into(),
            data,
            sent_at: Utc::now(),
        }
    }
}
