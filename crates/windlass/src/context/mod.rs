//! Workflow authoring API
//!
//! [`WorkflowContext`] is the handle workflow code receives. Every operation
//! on it (step, sleep, listen, join, race, repeat) is durable: the first
//! execution records an [`Entry`] at the operation's [`Location`], and any
//! replay of the same location short-circuits to the recorded result instead
//! of re-running side effects.
//!
//! Pauses are ordinary `Result` values. A sleep that has not elapsed or a
//! listen with an empty inbox returns a yield-flavored [`WorkflowError`],
//! which workflow code propagates with `?` and the executor converts into a
//! persisted pause.

mod branch;
mod repeat;
mod rollback;

pub use branch::Branch;
pub use repeat::{LoopConfig, LoopResult};
pub use rollback::RollbackContext;

pub(crate) use rollback::{RollbackAction, UndoFn};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::location::Location;
use crate::storage::{EntryKind, EntryStatus, Message, Storage};

/// Replay direction of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplayMode {
    /// Normal execution: missing entries are created and run.
    Forward,

    /// Compensation replay: completed entries short-circuit and register
    /// their rollback actions; the first missing or incomplete entry stops
    /// the replay.
    Rollback,
}

/// State shared by every context handle of one invocation.
pub(crate) struct ContextShared {
    pub storage: Mutex<Storage>,
    pub config: EngineConfig,
    pub workflow_id: Uuid,
    pub token: CancellationToken,
    pub rollback_actions: Mutex<Vec<RollbackAction>>,
    visited: Mutex<HashSet<String>>,
}

impl ContextShared {
    pub fn new(
        storage: Storage,
        config: EngineConfig,
        workflow_id: Uuid,
        token: CancellationToken,
    ) -> Self {
        Self {
            storage: Mutex::new(storage),
            config,
            workflow_id,
            token,
            rollback_actions: Mutex::new(Vec::new()),
            visited: Mutex::new(HashSet::new()),
        }
    }
}

/// Durable operation handle passed to workflow functions.
///
/// Cheap to clone; clones entering branches or loop iterations carry the
/// child location so nested operations address distinct history entries.
#[derive(Clone)]
pub struct WorkflowContext {
    shared: Arc<ContextShared>,
    location: Location,
    mode: ReplayMode,
}

impl WorkflowContext {
    pub(crate) fn new_root(shared: Arc<ContextShared>, mode: ReplayMode) -> Self {
        Self {
            shared,
            location: Location::root(),
            mode,
        }
    }

    /// Same invocation, re-rooted at `location`.
    pub(crate) fn at(&self, location: Location) -> Self {
        Self {
            shared: self.shared.clone(),
            location,
            mode: self.mode,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    pub(crate) fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub(crate) fn location(&self) -> &Location {
        &self.location
    }

    pub fn workflow_id(&self) -> Uuid {
        self.shared.workflow_id
    }

    /// Whether the host asked this invocation to stop. Operations check this
    /// before running side effects; cooperative code in long computations can
    /// check it too and return [`WorkflowError::Evicted`].
    pub fn is_evicted(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Validate `name`, intern it, and render the child location and its
    /// history key.
    pub(crate) fn resolve(&self, name: &str) -> Result<(Location, String), WorkflowError> {
        validate_name(name)?;
        let mut storage = self.shared.storage.lock();
        let idx = storage.register_name(name);
        let location = self.location.child(idx);
        let key = storage.location_key(&location);
        Ok((location, key))
    }

    /// Fail fast when the same location is executed twice in one invocation.
    /// Catches non-deterministic workflow code (same name used twice at one
    /// nesting level) before it corrupts history. Completed replays
    /// short-circuit before claiming, so they never trip this.
    pub(crate) fn claim(&self, key: &str) -> Result<(), WorkflowError> {
        if self.mode == ReplayMode::Rollback {
            return Ok(());
        }
        if !self.shared.visited.lock().insert(key.to_string()) {
            return Err(WorkflowError::Critical(format!(
                "duplicate operation at '{key}': operation names must be unique per scope"
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Run `f` durably: at most one successful execution per location, with
    /// the output cached for replay. A failed callback is retried with the
    /// engine's backoff policy until the attempt budget is exhausted.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let (location, key) = self.resolve(name)?;

        let entry_id = {
            let mut storage = self.shared.storage.lock();
            match storage.entry(&key) {
                Some(entry) => match &entry.kind {
                    EntryKind::Step { output, .. } => {
                        let id = entry.id;
                        if storage.entry_metadata(id).is_some_and(|m| m.is_completed()) {
                            let cached = output.clone().unwrap_or(serde_json::Value::Null);
                            return decode_cached(name, cached);
                        }
                        if self.mode == ReplayMode::Rollback {
                            return Err(WorkflowError::RollbackStop);
                        }
                        id
                    }
                    EntryKind::Removed if self.mode == ReplayMode::Rollback => {
                        return Err(WorkflowError::RollbackStop)
                    }
                    _ => return Err(history_mismatch(&key)),
                },
                None => {
                    if self.mode == ReplayMode::Rollback {
                        return Err(WorkflowError::RollbackStop);
                    }
                    storage.insert_entry(
                        key.clone(),
                        location,
                        EntryKind::Step {
                            output: None,
                            error: None,
                        },
                    )
                }
            }
        };
        self.claim(&key)?;

        if self.is_evicted() {
            return Err(WorkflowError::Evicted);
        }

        let attempt = {
            let mut storage = self.shared.storage.lock();
            let meta = storage
                .entry_metadata_mut(entry_id)
                .ok_or_else(|| missing_metadata(&key))?;
            meta.attempts += 1;
            meta.status = EntryStatus::Running;
            meta.last_attempt_at = Some(Utc::now());
            meta.attempts
        };

        tracing::debug!(step = name, attempt, "executing step");

        // The lock is released while the callback runs.
        let result = f().await;

        let mut storage = self.shared.storage.lock();
        match result {
            Ok(value) => {
                let encoded = serde_json::to_value(&value).map_err(|e| {
                    WorkflowError::Critical(format!("step '{name}': output not serializable: {e}"))
                })?;
                if let Some(entry) = storage.entry_mut(&key) {
                    if let EntryKind::Step { output, error } = &mut entry.kind {
                        *output = Some(encoded);
                        *error = None;
                    }
                }
                complete_entry(&mut storage, entry_id);
                Ok(value)
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(step = name, attempt, error = %message, "step failed");
                if let Some(entry) = storage.entry_mut(&key) {
                    if let EntryKind::Step { error, .. } = &mut entry.kind {
                        *error = Some(message.clone());
                    }
                }
                let retryable = self.shared.config.retry.has_attempts_remaining(attempt);
                if let Some(meta) = storage.entry_metadata_mut(entry_id) {
                    meta.status = if retryable {
                        EntryStatus::Failed
                    } else {
                        EntryStatus::Exhausted
                    };
                }
                if retryable {
                    Err(WorkflowError::StepFailed {
                        name: name.to_string(),
                        attempt,
                        source: err,
                    })
                } else {
                    Err(WorkflowError::StepExhausted {
                        name: name.to_string(),
                        attempts: attempt,
                        last_error: message,
                    })
                }
            }
        }
    }

    /// Like [`step`](Self::step), with a compensation callback that undoes
    /// the step's effect if the workflow later fails unrecoverably.
    ///
    /// The callback receives the step's cached output. Undo callbacks run in
    /// reverse execution order, each at most once.
    pub async fn step_with_rollback<T, F, Fut, U, UFut>(
        &self,
        name: &str,
        f: F,
        undo: U,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
        U: FnOnce(RollbackContext, T) -> UFut + Send + 'static,
        UFut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        if self.mode == ReplayMode::Rollback {
            let (_, key) = self.resolve(name)?;
            let step_name = name.to_string();
            let storage = self.shared.storage.lock();

            let Some(entry) = storage.entry(&key) else {
                return Err(WorkflowError::RollbackStop);
            };
            let id = entry.id;
            let cached = match &entry.kind {
                EntryKind::Step { output, .. } => output.clone().unwrap_or(serde_json::Value::Null),
                EntryKind::Removed => return Err(WorkflowError::RollbackStop),
                _ => return Err(history_mismatch(&key)),
            };
            let Some(meta) = storage.entry_metadata(id) else {
                return Err(missing_metadata(&key));
            };
            if !meta.is_completed() {
                return Err(WorkflowError::RollbackStop);
            }

            if meta.rollback_completed_at.is_none() {
                let undo: UndoFn = Box::new(move |ctx, value| {
                    Box::pin(async move {
                        let typed: T = serde_json::from_value(value).map_err(|e| {
                            anyhow::anyhow!("step '{step_name}': cached output does not deserialize: {e}")
                        })?;
                        undo(ctx, typed).await
                    })
                });
                self.shared.rollback_actions.lock().push(RollbackAction {
                    entry_id: id,
                    name: name.to_string(),
                    output: cached.clone(),
                    undo,
                });
            }

            return decode_cached(name, cached);
        }

        self.step(name, f).await
    }

    // =========================================================================
    // Sleeps and messages
    // =========================================================================

    /// Durable sleep. The deadline is recorded on first execution, so replay
    /// resumes the original deadline instead of restarting the clock.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), WorkflowError> {
        let deadline = Utc::now() + to_chrono(duration)?;
        self.sleep_until(name, deadline).await
    }

    /// Durable sleep until an absolute deadline.
    pub async fn sleep_until(
        &self,
        name: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let (location, key) = self.resolve(name)?;

        let mut storage = self.shared.storage.lock();
        let (entry_id, stored_deadline) = match storage.entry(&key) {
            Some(entry) => match &entry.kind {
                EntryKind::Sleep { deadline, .. } => {
                    let id = entry.id;
                    if storage.entry_metadata(id).is_some_and(|m| m.is_completed()) {
                        return Ok(());
                    }
                    if self.mode == ReplayMode::Rollback {
                        return Err(WorkflowError::RollbackStop);
                    }
                    (id, *deadline)
                }
                EntryKind::Removed if self.mode == ReplayMode::Rollback => {
                    return Err(WorkflowError::RollbackStop)
                }
                _ => return Err(history_mismatch(&key)),
            },
            None => {
                if self.mode == ReplayMode::Rollback {
                    return Err(WorkflowError::RollbackStop);
                }
                let id = storage.insert_entry(
                    key.clone(),
                    location,
                    EntryKind::Sleep {
                        deadline,
                        messages: Vec::new(),
                    },
                );
                (id, deadline)
            }
        };
        self.claim(&key)?;

        if Utc::now() >= stored_deadline {
            complete_entry(&mut storage, entry_id);
            Ok(())
        } else {
            Err(WorkflowError::Sleep {
                deadline: stored_deadline,
                messages: Vec::new(),
            })
        }
    }

    /// Consume the next matching inbox message (any message when
    /// `message_names` is empty), pausing until one arrives.
    ///
    /// Messages are consumed in send order; the consumed message is recorded
    /// at this location, so replay returns the same message.
    pub async fn listen(
        &self,
        name: &str,
        message_names: &[&str],
    ) -> Result<Message, WorkflowError> {
        let (location, key) = self.resolve(name)?;
        let names: Vec<String> = message_names.iter().map(|s| s.to_string()).collect();

        let mut storage = self.shared.storage.lock();
        if let Some(entry) = storage.entry(&key) {
            return match &entry.kind {
                EntryKind::Message { message } => Ok(message.clone()),
                EntryKind::Removed if self.mode == ReplayMode::Rollback => {
                    Err(WorkflowError::RollbackStop)
                }
                _ => Err(history_mismatch(&key)),
            };
        }
        if self.mode == ReplayMode::Rollback {
            return Err(WorkflowError::RollbackStop);
        }
        self.claim(&key)?;

        match storage.find_message(&names).map(|m| m.id) {
            Some(id) => {
                let message = storage
                    .consume_message(id)
                    .ok_or_else(|| WorkflowError::Critical(format!("inbox message {id} vanished")))?;
                let entry_id = storage.insert_entry(
                    key,
                    location,
                    EntryKind::Message {
                        message: message.clone(),
                    },
                );
                complete_entry(&mut storage, entry_id);
                tracing::debug!(listen = name, message = %message.name, id = message.id, "message consumed");
                Ok(message)
            }
            None => Err(WorkflowError::MessageWait { names }),
        }
    }

    /// [`listen`](Self::listen) with a deadline: resolves to `Some(message)`
    /// when a matching message arrives first, `None` when the timeout elapses
    /// first.
    pub async fn listen_with_timeout(
        &self,
        name: &str,
        message_names: &[&str],
        timeout: Duration,
    ) -> Result<Option<Message>, WorkflowError> {
        let (location, key) = self.resolve(name)?;
        let names: Vec<String> = message_names.iter().map(|s| s.to_string()).collect();
        let candidate_deadline = Utc::now() + to_chrono(timeout)?;

        let mut storage = self.shared.storage.lock();
        let (entry_id, deadline) = match storage.entry(&key) {
            Some(entry) => match &entry.kind {
                EntryKind::Message { message } => return Ok(Some(message.clone())),
                EntryKind::Sleep { deadline, .. } => {
                    let id = entry.id;
                    if storage.entry_metadata(id).is_some_and(|m| m.is_completed()) {
                        return Ok(None);
                    }
                    if self.mode == ReplayMode::Rollback {
                        return Err(WorkflowError::RollbackStop);
                    }
                    (id, *deadline)
                }
                EntryKind::Removed if self.mode == ReplayMode::Rollback => {
                    return Err(WorkflowError::RollbackStop)
                }
                _ => return Err(history_mismatch(&key)),
            },
            None => {
                if self.mode == ReplayMode::Rollback {
                    return Err(WorkflowError::RollbackStop);
                }
                let id = storage.insert_entry(
                    key.clone(),
                    location,
                    EntryKind::Sleep {
                        deadline: candidate_deadline,
                        messages: names.clone(),
                    },
                );
                (id, candidate_deadline)
            }
        };
        self.claim(&key)?;

        if let Some(id) = storage.find_message(&names).map(|m| m.id) {
            let message = storage
                .consume_message(id)
                .ok_or_else(|| WorkflowError::Critical(format!("inbox message {id} vanished")))?;
            if let Some(entry) = storage.entry_mut(&key) {
                entry.kind = EntryKind::Message {
                    message: message.clone(),
                };
            }
            complete_entry(&mut storage, entry_id);
            return Ok(Some(message));
        }

        if Utc::now() >= deadline {
            complete_entry(&mut storage, entry_id);
            return Ok(None);
        }

        Err(WorkflowError::Sleep {
            deadline,
            messages: names,
        })
    }
}

fn validate_name(name: &str) -> Result<(), WorkflowError> {
    if name.is_empty() {
        return Err(WorkflowError::Critical(
            "operation name must not be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains('~') {
        return Err(WorkflowError::Critical(format!(
            "operation name '{name}' must not contain '/' or '~'"
        )));
    }
    Ok(())
}

fn complete_entry(storage: &mut Storage, id: Uuid) {
    if let Some(meta) = storage.entry_metadata_mut(id) {
        meta.status = EntryStatus::Completed;
        meta.completed_at = Some(Utc::now());
    }
}

fn decode_cached<T: DeserializeOwned>(
    name: &str,
    value: serde_json::Value,
) -> Result<T, WorkflowError> {
    serde_json::from_value(value).map_err(|e| {
        WorkflowError::Critical(format!(
            "'{name}': cached output does not deserialize: {e}"
        ))
    })
}

fn history_mismatch(key: &str) -> WorkflowError {
    WorkflowError::Critical(format!(
        "history mismatch at '{key}': a different operation kind is recorded here"
    ))
}

fn missing_metadata(key: &str) -> WorkflowError {
    WorkflowError::Critical(format!("missing metadata for entry at '{key}'"))
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, WorkflowError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| WorkflowError::Critical(format!("duration out of range: {e}")))
}
