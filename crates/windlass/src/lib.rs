//! # Windlass
//!
//! Durable workflow execution: write workflows as plain async Rust functions
//! and run them with exactly-once step semantics across crashes, sleeps, and
//! migrations.
//!
//! Workflow progress is event-sourced into a key-value namespace behind a
//! pluggable [`EngineDriver`]. Every durable operation (step, sleep, listen,
//! join, race, loop) records an entry at its location in the execution tree;
//! re-running the workflow function replays completed entries instead of
//! re-executing side effects, so an invocation can stop at any pause point
//! and a later one continues exactly where it left off.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌────────────────────┐
//!                    │  workflow function │   plain async fn
//!                    └─────────┬──────────┘
//!                              │ WorkflowContext
//!                              │   step / sleep / listen
//!                              │   join / race / repeat
//!                    ┌─────────▼──────────┐
//!                    │  WorkflowExecutor  │   replay + outcome
//!                    │                    │   classification
//!                    └─────────┬──────────┘
//!                              │ Storage (dirty tracking)
//!                    ┌─────────▼──────────┐
//!                    │    EngineDriver    │   KV + alarms
//!                    │  (per workflow)    │
//!                    └────────────────────┘
//! ```
//!
//! Pauses travel as `Result` values: a sleep that has not elapsed or a
//! listen on an empty inbox returns a yield-flavored [`WorkflowError`] that
//! workflow code propagates with `?`. The executor flushes dirty state,
//! schedules the wake-up alarm, and reports [`RunResult::Sleeping`]; the
//! next invocation replays to the pause point and continues.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use uuid::Uuid;
//! use windlass::{InMemoryDriver, RunResult, WorkflowContext, WorkflowError, WorkflowExecutor};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), windlass::ExecutorError> {
//! let executor = WorkflowExecutor::new(Arc::new(InMemoryDriver::new()));
//!
//! let workflow = |ctx: WorkflowContext, input: serde_json::Value| async move {
//!     let n = input.as_u64().unwrap_or(0);
//!     let doubled: u64 = ctx.step("double", || async move { Ok(n * 2) }).await?;
//!     Ok::<_, WorkflowError>(doubled)
//! };
//!
//! let result = executor
//!     .run(
//!         Uuid::now_v7(),
//!         &workflow,
//!         Some(serde_json::json!(21)),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//!
//! match result {
//!     RunResult::Completed { output } => assert_eq!(output, serde_json::json!(42)),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! For long-lived hosting, [`LiveRuntime`] drives workflows on tokio tasks,
//! waking them on deadlines, messages, and explicit nudges.

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod executor;
pub mod live;
pub mod location;
pub mod retry;
pub mod storage;

pub use config::EngineConfig;
pub use context::{Branch, LoopConfig, LoopResult, RollbackContext, WorkflowContext};
pub use driver::{
    deliver_message, BatchOp, DriverError, EngineDriver, InMemoryDriver, WorkflowMessageDriver,
};
pub use error::{StoredError, WorkflowError};
pub use executor::{ExecutorError, RunResult, WorkflowExecutor};
pub use live::{LiveRuntime, WorkflowHandle};
pub use location::{Location, NameRegistry};
pub use retry::RetryPolicy;
pub use storage::{Entry, EntryKind, Message, WorkflowState};
