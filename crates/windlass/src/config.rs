//! Engine configuration

use crate::retry::RetryPolicy;

/// Configuration for the workflow executor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry/backoff policy applied to failing steps.
    pub retry: RetryPolicy,

    /// Safety guard: maximum number of history entries per workflow.
    pub max_history_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(),
            max_history_entries: 100_000,
        }
    }
}

impl EngineConfig {
    /// Set the step retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-workflow history entry cap.
    pub fn with_max_history_entries(mut self, max: usize) -> Self {
        self.max_history_entries = max;
        self
    }
}
