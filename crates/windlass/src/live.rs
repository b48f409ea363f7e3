//! In-process live mode
//!
//! [`LiveRuntime::spawn`] drives a workflow to a terminal state on a tokio
//! task: run one invocation, and while it sleeps wait on the earliest of the
//! sleep deadline, an explicit wake, a delivered message, or eviction, then
//! run again. Each workflow owns its own driver namespace; the runtime keeps
//! a routing table so hosts can deliver messages by workflow id.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::WorkflowContext;
use crate::driver::{deliver_message, DriverError, EngineDriver};
use crate::error::WorkflowError;
use crate::executor::{ExecutorError, RunResult, WorkflowExecutor};
use crate::storage::{keys, EntryStatus, Message, Storage, WorkflowState};

struct Route<D> {
    driver: Arc<D>,
    wake: Arc<Notify>,
}

/// Host-side registry of resident workflows.
pub struct LiveRuntime<D> {
    config: EngineConfig,
    registry: DashMap<Uuid, Route<D>>,
}

impl<D: EngineDriver> LiveRuntime<D> {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            registry: DashMap::new(),
        }
    }

    /// Start driving a workflow on its own task. `driver` is the workflow's
    /// private namespace.
    pub fn spawn<F, Fut, O>(
        &self,
        workflow_id: Uuid,
        driver: Arc<D>,
        input: serde_json::Value,
        workflow_fn: F,
    ) -> WorkflowHandle<D>
    where
        F: Fn(WorkflowContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
        O: Serialize + Send + 'static,
    {
        let executor = Arc::new(WorkflowExecutor::with_config(
            driver.clone(),
            self.config.clone(),
        ));
        let wake = Arc::new(Notify::new());
        let token = CancellationToken::new();
        self.registry.insert(workflow_id, Route {
            driver,
            wake: wake.clone(),
        });

        let workflow_fn = Arc::new(workflow_fn);
        let cancelled = Arc::new(AtomicBool::new(false));
        let respawn: RespawnFn = {
            let executor = executor.clone();
            let wake = wake.clone();
            let cancelled = cancelled.clone();
            Arc::new(move |input, token| {
                let executor = executor.clone();
                let workflow_fn = workflow_fn.clone();
                let wake = wake.clone();
                let cancelled = cancelled.clone();
                tokio::spawn(async move {
                    drive(executor, workflow_id, workflow_fn, input, token, wake, cancelled).await
                })
            })
        };

        let task = respawn(Some(input), token.clone());
        WorkflowHandle {
            workflow_id,
            executor,
            wake,
            token: Mutex::new(token),
            task: Mutex::new(Some(task)),
            respawn,
            cancelled,
        }
    }

    /// Deliver a message to a resident workflow and wake it.
    pub async fn message(
        &self,
        workflow_id: Uuid,
        name: &str,
        data: serde_json::Value,
    ) -> Result<Message, ExecutorError> {
        let Some(route) = self.registry.get(&workflow_id) else {
            return Err(ExecutorError::LiveTaskFailed(format!(
                "no resident workflow {workflow_id}"
            )));
        };
        let message = deliver_message(route.driver.as_ref(), name, data).await?;
        route.wake.notify_one();
        Ok(message)
    }

    /// Drop a workflow from the routing table, typically after its handle
    /// resolved.
    pub fn remove(&self, workflow_id: Uuid) {
        self.registry.remove(&workflow_id);
    }
}

impl<D: EngineDriver> Default for LiveRuntime<D> {
    fn default() -> Self {
        Self::new()
    }
}

type RespawnFn = Arc<
    dyn Fn(
            Option<serde_json::Value>,
            CancellationToken,
        ) -> JoinHandle<Result<RunResult, ExecutorError>>
        + Send
        + Sync,
>;

/// Handle to one resident workflow.
pub struct WorkflowHandle<D> {
    workflow_id: Uuid,
    executor: Arc<WorkflowExecutor<D>>,
    wake: Arc<Notify>,
    token: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<Result<RunResult, ExecutorError>>>>,
    respawn: RespawnFn,
    cancelled: Arc<AtomicBool>,
}

impl<D: EngineDriver> WorkflowHandle<D> {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Wait for the drive task to reach a terminal result (completion,
    /// failure, or eviction). Consumes the pending task; a second call
    /// without a [`recover`](Self::recover) in between fails.
    pub async fn result(&self) -> Result<RunResult, ExecutorError> {
        let task = self.task.lock().take();
        match task {
            Some(handle) => handle
                .await
                .map_err(|e| ExecutorError::LiveTaskFailed(e.to_string()))?,
            None => Err(ExecutorError::LiveTaskFailed(
                "result already taken".to_string(),
            )),
        }
    }

    /// Deliver a message into this workflow's inbox and wake it.
    pub async fn message(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> Result<Message, ExecutorError> {
        let message = deliver_message(self.executor.driver().as_ref(), name, data).await?;
        self.wake.notify_one();
        Ok(message)
    }

    /// Wake the drive loop for an immediate re-check.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Ask the current invocation to stop at its next eviction point.
    pub fn evict(&self) {
        self.token.lock().cancel();
    }

    /// Cancel the workflow: no further invocation will run.
    ///
    /// The drive task stops at its next eviction point and durably marks the
    /// workflow cancelled after its final flush, so a still-running
    /// invocation cannot overwrite the marker with a stale state.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.token.lock().cancel();
        self.wake.notify_one();
    }

    /// Current durable workflow state.
    pub async fn state(&self) -> Result<WorkflowState, ExecutorError> {
        match self.executor.driver().get(keys::WF_STATE_KEY).await? {
            Some(raw) => {
                WorkflowState::from_str(&String::from_utf8_lossy(&raw)).map_err(|reason| {
                    ExecutorError::Driver(DriverError::Corrupt {
                        key: keys::WF_STATE_KEY.to_string(),
                        reason,
                    })
                })
            }
            None => Ok(WorkflowState::Pending),
        }
    }

    /// Recorded output, if the workflow completed.
    pub async fn output(&self) -> Result<Option<serde_json::Value>, ExecutorError> {
        match self.executor.driver().get(keys::WF_OUTPUT_KEY).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| ExecutorError::Driver(DriverError::Serialization(e.to_string()))),
            None => Ok(None),
        }
    }

    /// Reset a failed workflow's step budgets and resume driving it.
    ///
    /// Failed and exhausted entries go back to pending with a fresh attempt
    /// budget; the workflow error clears; a new drive task starts.
    pub async fn recover(&self) -> Result<(), ExecutorError> {
        let driver = self.executor.driver();
        let mut storage = Storage::load(driver.as_ref()).await?;
        if storage.state != WorkflowState::Failed {
            return Err(ExecutorError::LiveTaskFailed(format!(
                "cannot recover workflow in state '{}'",
                storage.state
            )));
        }

        let reset: Vec<Uuid> = storage
            .metadata
            .iter()
            .filter(|(_, m)| matches!(m.status, EntryStatus::Failed | EntryStatus::Exhausted))
            .map(|(id, _)| *id)
            .collect();
        for id in reset {
            if let Some(meta) = storage.entry_metadata_mut(id) {
                meta.status = EntryStatus::Pending;
                meta.attempts = 0;
            }
        }
        storage.set_error(None);
        storage.set_state(WorkflowState::Sleeping);

        let set = storage.flush_ops()?;
        if !set.ops.is_empty() {
            driver.batch(set.ops).await?;
        }
        for prefix in set.delete_prefixes {
            driver.delete_prefix(&prefix).await?;
        }

        let token = CancellationToken::new();
        let task = (self.respawn)(None, token.clone());
        *self.token.lock() = token;
        *self.task.lock() = Some(task);
        tracing::info!(workflow_id = %self.workflow_id, "workflow recovered");
        Ok(())
    }
}

/// Run invocations until the workflow terminates, waiting out each pause.
async fn drive<D, F, Fut, O>(
    executor: Arc<WorkflowExecutor<D>>,
    workflow_id: Uuid,
    workflow_fn: Arc<F>,
    mut input: Option<serde_json::Value>,
    token: CancellationToken,
    wake: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
) -> Result<RunResult, ExecutorError>
where
    D: EngineDriver,
    F: Fn(WorkflowContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
    O: Serialize + Send + 'static,
{
    let result = loop {
        let result = executor
            .run(workflow_id, workflow_fn.as_ref(), input.take(), &token)
            .await?;
        match result {
            RunResult::Completed { .. } | RunResult::Evicted { .. } => break result,
            RunResult::Sleeping {
                sleep_until,
                waiting_for_messages,
            } => {
                wait_for_wake(
                    executor.driver().as_ref(),
                    sleep_until,
                    &waiting_for_messages,
                    &token,
                    &wake,
                )
                .await?;
                if token.is_cancelled() {
                    // State was already flushed as sleeping; do not spin on
                    // a cancelled token.
                    break RunResult::Evicted {
                        state: WorkflowState::Sleeping,
                    };
                }
            }
        }
    };

    // The cancelled marker is written here, after the last invocation
    // flushed, so the flush cannot overwrite it with a stale state.
    if cancelled.load(Ordering::SeqCst) && matches!(result, RunResult::Evicted { .. }) {
        executor
            .driver()
            .set(
                keys::WF_STATE_KEY,
                WorkflowState::Cancelled.as_str().as_bytes().to_vec(),
            )
            .await?;
        tracing::info!(workflow_id = %workflow_id, "workflow cancelled");
        return Ok(RunResult::Evicted {
            state: WorkflowState::Cancelled,
        });
    }
    Ok(result)
}

async fn wait_for_wake<D: EngineDriver>(
    driver: &D,
    sleep_until: Option<DateTime<Utc>>,
    names: &[String],
    token: &CancellationToken,
    wake: &Notify,
) -> Result<(), DriverError> {
    let timer = async {
        match sleep_until {
            Some(at) => {
                let delay = (at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(delay).await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = token.cancelled() => {}
        _ = wake.notified() => {}
        _ = timer => {}
        result = driver.wait_for_messages(names, token) => {
            result?;
        }
    }
    Ok(())
}
