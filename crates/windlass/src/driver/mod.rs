//! Pluggable persistence/timer driver
//!
//! This module provides:
//! - [`EngineDriver`] trait: the persistence and alarm contract the engine
//!   is built against
//! - [`WorkflowMessageDriver`] trait for message delivery
//! - [`InMemoryDriver`] for tests and non-durable dev hosts

mod memory;

pub use memory::InMemoryDriver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::storage::{keys, Message};

/// Error type for driver operations
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Backend failure (I/O, database, ...)
    #[error("backend error: {0}")]
    Backend(String),

    /// Value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored record did not parse
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The namespace was written by an incompatible engine version
    #[error("unsupported schema version: expected {expected}, found {found}")]
    SchemaVersion { expected: String, found: String },
}

/// One write in an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Persistence and alarm backend for one workflow's KV namespace.
///
/// Implementations must be thread-safe. Two contract points matter for
/// correctness, not just performance:
///
/// - `list` MUST return keys in lexicographic byte order. The engine relies
///   on this for FIFO message consumption, name-registry reconstruction, and
///   deterministic loop-history trimming.
/// - `batch` SHOULD be atomic. If it is not, a crash mid-flush can leave
///   partially written entries; the engine carries no transaction log of its
///   own, so that risk lands on the driver implementor.
///
/// The engine assumes exactly one concurrent writer per namespace (itself);
/// external message writers are coordinated by the host scheduler.
#[async_trait]
pub trait EngineDriver: Send + Sync + 'static {
    /// Read one key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError>;

    /// Write one key.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), DriverError>;

    /// Delete one key (no-op if absent).
    async fn delete(&self, key: &str) -> Result<(), DriverError>;

    /// List all keys under `prefix` in lexicographic byte order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, DriverError>;

    /// Bulk-delete all keys under `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), DriverError>;

    /// Apply a batch of writes, atomically if at all possible.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), DriverError>;

    /// Schedule (or replace) the wake-up alarm for a workflow.
    async fn set_alarm(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<(), DriverError>;

    /// Clear any scheduled alarm for a workflow.
    async fn clear_alarm(&self, workflow_id: Uuid) -> Result<(), DriverError>;

    /// Optional fast path: resolve once a message matching `names` (any
    /// message if empty) may have arrived. Spurious wakeups are fine; the
    /// engine re-checks the inbox after every wake.
    ///
    /// The default implementation never resolves on its own and simply waits
    /// out the eviction token, which makes the live runtime fall back to its
    /// in-memory notifier and alarm timer.
    async fn wait_for_messages(
        &self,
        _names: &[String],
        token: &CancellationToken,
    ) -> Result<(), DriverError> {
        token.cancelled().await;
        Ok(())
    }

    /// Optional dedicated message writer; defaults to direct KV delivery.
    fn message_driver(&self) -> Option<&dyn WorkflowMessageDriver> {
        None
    }
}

/// Message delivery contract.
///
/// Messages land in the same KV namespace the workflow owns, keyed by a
/// monotonically increasing id so `list` order is send order.
#[async_trait]
pub trait WorkflowMessageDriver: Send + Sync {
    /// Persist a message into the workflow's inbox, returning it with its
    /// assigned id.
    async fn add_message(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> Result<Message, DriverError>;
}

/// Deliver a message through the driver's message path, or directly into the
/// KV inbox when no dedicated message driver is supplied.
pub async fn deliver_message<D: EngineDriver + ?Sized>(
    driver: &D,
    name: &str,
    data: serde_json::Value,
) -> Result<Message, DriverError> {
    if let Some(messages) = driver.message_driver() {
        return messages.add_message(name, data).await;
    }

    // Single-writer-per-namespace isolation makes last-id + 1 safe here.
    let next_id = driver
        .list(keys::MESSAGE_PREFIX)
        .await?
        .last()
        .and_then(|(key, _)| keys::parse_message_key(key))
        .map(|id| id + 1)
        .unwrap_or(0);

    let message = Message::new(next_id, name, data);
    let encoded =
        serde_json::to_vec(&message).map_err(|e| DriverError::Serialization(e.to_string()))?;
    driver.set(&keys::message_key(next_id), encoded).await?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_message_assigns_monotonic_ids() {
        let driver = InMemoryDriver::new();

        let m1 = deliver_message(&driver, "x", serde_json::json!(1)).await.unwrap();
        let m2 = deliver_message(&driver, "x", serde_json::json!(2)).await.unwrap();
        let m3 = deliver_message(&driver, "y", serde_json::json!(3)).await.unwrap();

        assert_eq!(m1.id, 0);
        assert_eq!(m2.id, 1);
        assert_eq!(m3.id, 2);

        let listed = driver.list(keys::MESSAGE_PREFIX).await.unwrap();
        assert_eq!(listed.len(), 3);
    }
}
