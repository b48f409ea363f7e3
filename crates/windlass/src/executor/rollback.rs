//! Compensation driver
//!
//! Rollback happens in two phases. First the workflow function replays in
//! rollback mode: completed entries short-circuit to their cached outputs and
//! each completed `step_with_rollback` registers its undo callback, until the
//! replay reaches the first incomplete entry and stops. Then the collected
//! callbacks run in reverse order, each at most once, with durable progress
//! after every callback so an interrupted rollback resumes where it left off.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::{ExecutorError, WorkflowExecutor};
use crate::context::{ContextShared, ReplayMode, RollbackContext, WorkflowContext};
use crate::driver::EngineDriver;
use crate::error::WorkflowError;

pub(super) enum RollbackOutcome {
    Completed,
    Evicted,
}

impl<D: EngineDriver> WorkflowExecutor<D> {
    pub(super) async fn run_compensation<F, Fut, O>(
        &self,
        shared: &Arc<ContextShared>,
        workflow_fn: &F,
        input: serde_json::Value,
    ) -> Result<RollbackOutcome, ExecutorError>
    where
        F: Fn(WorkflowContext, serde_json::Value) -> Fut,
        Fut: Future<Output = Result<O, WorkflowError>>,
        O: Serialize,
    {
        let ctx = WorkflowContext::new_root(shared.clone(), ReplayMode::Rollback);
        match workflow_fn(ctx, input).await {
            Ok(_) | Err(WorkflowError::RollbackStop) => {}
            Err(e) if e.is_yield() => {}
            Err(e) => {
                // Replay over cached history should not fail; compensation
                // still proceeds over whatever was collected.
                tracing::warn!(error = %e, "rollback replay error");
            }
        }

        let actions: Vec<_> = {
            let mut collected = shared.rollback_actions.lock();
            collected.drain(..).collect()
        };
        tracing::info!(actions = actions.len(), "running compensation");

        for action in actions.into_iter().rev() {
            let already_done = shared
                .storage
                .lock()
                .entry_metadata(action.entry_id)
                .and_then(|m| m.rollback_completed_at)
                .is_some();
            if already_done {
                continue;
            }

            if shared.token.is_cancelled() {
                self.flush(shared).await?;
                return Ok(RollbackOutcome::Evicted);
            }

            tracing::debug!(step = %action.name, "rolling back step");
            let rb = RollbackContext::new(shared.workflow_id, shared.token.clone());
            match (action.undo)(rb, action.output).await {
                Ok(()) => {
                    {
                        let mut storage = shared.storage.lock();
                        if let Some(meta) = storage.entry_metadata_mut(action.entry_id) {
                            meta.rollback_completed_at = Some(Utc::now());
                        }
                    }
                    self.flush(shared).await?;
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    {
                        let mut storage = shared.storage.lock();
                        if let Some(meta) = storage.entry_metadata_mut(action.entry_id) {
                            meta.rollback_error = Some(reason.clone());
                        }
                    }
                    self.flush(shared).await?;
                    tracing::error!(step = %action.name, error = %reason, "rollback step failed");
                    return Err(ExecutorError::RollbackFailed {
                        name: action.name,
                        reason,
                    });
                }
            }
        }

        Ok(RollbackOutcome::Completed)
    }
}
