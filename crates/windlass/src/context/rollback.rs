//! Compensation actions collected during rollback replay

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context handed to rollback callbacks.
///
/// Deliberately narrow: compensation must not schedule new durable
/// operations, so none of the workflow authoring surface is available here.
#[derive(Clone)]
pub struct RollbackContext {
    workflow_id: Uuid,
    token: CancellationToken,
}

impl RollbackContext {
    pub(crate) fn new(workflow_id: Uuid, token: CancellationToken) -> Self {
        Self { workflow_id, token }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Whether the host asked this invocation to stop. Long-running rollback
    /// callbacks should poll this and return early; completed undo steps are
    /// never re-run.
    pub fn is_evicted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Type-erased undo callback. Receives the step's cached output value and
/// deserializes it back to the step's own type before running.
pub(crate) type UndoFn = Box<
    dyn FnOnce(RollbackContext, serde_json::Value) -> BoxFuture<'static, Result<(), anyhow::Error>>
        + Send,
>;

/// One pending compensation, collected in execution order during rollback
/// replay and run in reverse.
pub(crate) struct RollbackAction {
    pub entry_id: Uuid,
    pub name: String,
    pub output: serde_json::Value,
    pub undo: UndoFn,
}
