//! Workflow executor
//!
//! One [`WorkflowExecutor::run`] call is one invocation: load the workflow's
//! snapshot, replay the workflow function over it, classify the outcome, and
//! flush. Pauses (sleep, message wait, retry backoff) come back as
//! [`RunResult::Sleeping`] with the alarm already scheduled; unrecoverable
//! failures run compensation before the workflow lands in `Failed`.

mod rollback;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{ContextShared, ReplayMode, WorkflowContext};
use crate::driver::{DriverError, EngineDriver};
use crate::error::{StoredError, WorkflowError};
use crate::storage::{Storage, WorkflowState};

use rollback::RollbackOutcome;

/// Error type for executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The workflow was cancelled by the host; no invocation will run.
    #[error("workflow {0} is cancelled")]
    Cancelled(Uuid),

    /// The workflow reached `Failed`, either in this invocation or earlier.
    #[error("workflow failed: {0}")]
    WorkflowFailed(StoredError),

    /// A compensation callback failed; the workflow stays in `RollingBack`
    /// and a later invocation resumes the remaining undo steps.
    #[error("rollback failed at '{name}': {reason}")]
    RollbackFailed { name: String, reason: String },

    /// Safety guard against unbounded history (a loop without trimming).
    #[error("history entry limit exceeded: {count} > {max}")]
    TooManyEntries { count: usize, max: usize },

    /// First invocation without an input.
    #[error("workflow has no input")]
    MissingInput,

    #[error("live task failed: {0}")]
    LiveTaskFailed(String),
}

/// Outcome of one invocation that did not fail.
#[derive(Debug, Clone)]
pub enum RunResult {
    /// Terminal success, output recorded durably.
    Completed { output: serde_json::Value },

    /// Paused. The wake-up alarm (if any) is already scheduled with the
    /// driver; `waiting_for_messages` lists the message names that would
    /// also wake it (empty plus no deadline means any message).
    Sleeping {
        sleep_until: Option<DateTime<Utc>>,
        waiting_for_messages: Vec<String>,
    },

    /// The invocation stopped at an eviction point; state was flushed as-is
    /// and the workflow can resume elsewhere.
    Evicted { state: WorkflowState },
}

/// Replays workflow functions against driver-backed state.
pub struct WorkflowExecutor<D> {
    driver: Arc<D>,
    config: EngineConfig,
}

impl<D: EngineDriver> WorkflowExecutor<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self::with_config(driver, EngineConfig::default())
    }

    pub fn with_config(driver: Arc<D>, config: EngineConfig) -> Self {
        Self { driver, config }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one invocation of `workflow_fn`.
    ///
    /// `input` is consulted only on the first invocation; once pinned, the
    /// stored input is replayed and the argument is ignored. `token` is the
    /// eviction signal for this invocation.
    #[instrument(skip_all, fields(%workflow_id))]
    pub async fn run<F, Fut, O>(
        &self,
        workflow_id: Uuid,
        workflow_fn: &F,
        input: Option<serde_json::Value>,
        token: &CancellationToken,
    ) -> Result<RunResult, ExecutorError>
    where
        F: Fn(WorkflowContext, serde_json::Value) -> Fut,
        Fut: Future<Output = Result<O, WorkflowError>>,
        O: Serialize,
    {
        let mut storage = Storage::load(self.driver.as_ref()).await?;

        match storage.state {
            WorkflowState::Cancelled => return Err(ExecutorError::Cancelled(workflow_id)),
            WorkflowState::Completed => {
                return Ok(RunResult::Completed {
                    output: storage.output.clone().unwrap_or(serde_json::Value::Null),
                })
            }
            WorkflowState::Failed => {
                return Err(ExecutorError::WorkflowFailed(stored_or_unknown(
                    storage.error.clone(),
                )))
            }
            _ => {}
        }

        // Pin the input on first run; replay always uses the pinned value.
        if storage.input.is_none() {
            match input {
                Some(value) => storage.set_input(value),
                None => return Err(ExecutorError::MissingInput),
            }
        }
        let input_value = storage.input.clone().unwrap_or(serde_json::Value::Null);

        let resuming_rollback = storage.state == WorkflowState::RollingBack;
        if !resuming_rollback {
            storage.set_state(WorkflowState::Running);
        }

        let shared = Arc::new(ContextShared::new(
            storage,
            self.config.clone(),
            workflow_id,
            token.clone(),
        ));

        if resuming_rollback {
            tracing::info!("resuming interrupted rollback");
            let error = stored_or_unknown(shared.storage.lock().error.clone());
            return self
                .finish_rollback(&shared, workflow_fn, input_value, error)
                .await;
        }

        tracing::debug!("invoking workflow");
        let ctx = WorkflowContext::new_root(shared.clone(), ReplayMode::Forward);
        let result = workflow_fn(ctx, input_value.clone()).await;

        let count = shared.storage.lock().history_len();
        if count > self.config.max_history_entries {
            let stored = StoredError {
                kind: "critical".to_string(),
                message: format!("history entry limit exceeded: {count}"),
            };
            {
                let mut storage = shared.storage.lock();
                storage.set_error(Some(stored));
                storage.set_state(WorkflowState::Failed);
            }
            self.flush(&shared).await?;
            return Err(ExecutorError::TooManyEntries {
                count,
                max: self.config.max_history_entries,
            });
        }

        match result {
            Ok(output) => {
                let encoded = serde_json::to_value(&output)
                    .map_err(|e| DriverError::Serialization(e.to_string()))?;
                {
                    let mut storage = shared.storage.lock();
                    storage.set_output(encoded.clone());
                    storage.set_state(WorkflowState::Completed);
                }
                self.flush(&shared).await?;
                self.driver.clear_alarm(workflow_id).await?;
                tracing::info!("workflow completed");
                Ok(RunResult::Completed { output: encoded })
            }
            Err(err) => {
                self.classify_failure(workflow_id, &shared, workflow_fn, input_value, err)
                    .await
            }
        }
    }

    async fn classify_failure<F, Fut, O>(
        &self,
        workflow_id: Uuid,
        shared: &Arc<ContextShared>,
        workflow_fn: &F,
        input: serde_json::Value,
        err: WorkflowError,
    ) -> Result<RunResult, ExecutorError>
    where
        F: Fn(WorkflowContext, serde_json::Value) -> Fut,
        Fut: Future<Output = Result<O, WorkflowError>>,
        O: Serialize,
    {
        match err {
            WorkflowError::Sleep { deadline, messages } => {
                shared.storage.lock().set_state(WorkflowState::Sleeping);
                self.flush(shared).await?;
                self.driver.set_alarm(workflow_id, deadline).await?;
                tracing::debug!(%deadline, "workflow sleeping");
                Ok(RunResult::Sleeping {
                    sleep_until: Some(deadline),
                    waiting_for_messages: messages,
                })
            }
            WorkflowError::MessageWait { names } => {
                shared.storage.lock().set_state(WorkflowState::Sleeping);
                self.flush(shared).await?;
                self.driver.clear_alarm(workflow_id).await?;
                tracing::debug!(?names, "workflow waiting for messages");
                Ok(RunResult::Sleeping {
                    sleep_until: None,
                    waiting_for_messages: names,
                })
            }
            WorkflowError::Evicted => {
                self.flush(shared).await?;
                let state = shared.storage.lock().state;
                tracing::debug!("workflow evicted");
                Ok(RunResult::Evicted { state })
            }
            WorkflowError::StepFailed {
                name,
                attempt,
                source,
            } => {
                let delay = self.config.retry.delay_for_attempt(attempt + 1);
                let until = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                shared.storage.lock().set_state(WorkflowState::Sleeping);
                self.flush(shared).await?;
                self.driver.set_alarm(workflow_id, until).await?;
                tracing::warn!(step = %name, attempt, error = %format!("{source:#}"), "step failed; backing off");
                Ok(RunResult::Sleeping {
                    sleep_until: Some(until),
                    waiting_for_messages: Vec::new(),
                })
            }
            err if err.bypasses_rollback() => {
                let stored = err.to_stored();
                {
                    let mut storage = shared.storage.lock();
                    storage.set_error(Some(stored.clone()));
                    storage.set_state(WorkflowState::Failed);
                }
                self.flush(shared).await?;
                self.driver.clear_alarm(workflow_id).await?;
                tracing::error!(error = %stored, "workflow failed without rollback");
                Err(ExecutorError::WorkflowFailed(stored))
            }
            err => {
                let stored = err.to_stored();
                {
                    let mut storage = shared.storage.lock();
                    storage.set_error(Some(stored.clone()));
                    storage.set_state(WorkflowState::RollingBack);
                }
                self.flush(shared).await?;
                tracing::error!(error = %stored, "workflow failed; rolling back");
                self.finish_rollback(shared, workflow_fn, input, stored).await
            }
        }
    }

    async fn finish_rollback<F, Fut, O>(
        &self,
        shared: &Arc<ContextShared>,
        workflow_fn: &F,
        input: serde_json::Value,
        error: StoredError,
    ) -> Result<RunResult, ExecutorError>
    where
        F: Fn(WorkflowContext, serde_json::Value) -> Fut,
        Fut: Future<Output = Result<O, WorkflowError>>,
        O: Serialize,
    {
        match self.run_compensation(shared, workflow_fn, input).await? {
            RollbackOutcome::Evicted => Ok(RunResult::Evicted {
                state: WorkflowState::RollingBack,
            }),
            RollbackOutcome::Completed => {
                shared.storage.lock().set_state(WorkflowState::Failed);
                self.flush(shared).await?;
                self.driver.clear_alarm(shared.workflow_id).await?;
                tracing::info!("rollback complete; workflow failed");
                Err(ExecutorError::WorkflowFailed(error))
            }
        }
    }

    /// Flush dirty records through the driver.
    pub(crate) async fn flush(&self, shared: &Arc<ContextShared>) -> Result<(), ExecutorError> {
        let set = { shared.storage.lock().flush_ops()? };
        if !set.ops.is_empty() {
            self.driver.batch(set.ops).await?;
        }
        for prefix in set.delete_prefixes {
            self.driver.delete_prefix(&prefix).await?;
        }
        Ok(())
    }
}

fn stored_or_unknown(error: Option<StoredError>) -> StoredError {
    error.unwrap_or_else(|| StoredError {
        kind: "unknown".to_string(),
        message: "workflow failed".to_string(),
    })
}
