//! Durable loops with bounded history

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{complete_entry, history_mismatch, ReplayMode, WorkflowContext};
use crate::error::WorkflowError;
use crate::location::NameIndex;
use crate::storage::{EntryKind, LoopCheckpoint, Storage};

/// Configuration of one durable loop.
///
/// `commit_interval` bounds replay length: the loop's carried state is
/// committed every N iterations, and a resuming invocation replays only the
/// iterations after the last commit. `with_history_trim` additionally deletes
/// the per-iteration history of old iterations, keeping storage bounded for
/// long-lived loops.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub(crate) name: String,
    pub(crate) commit_interval: u64,
    pub(crate) history_every: u64,
    pub(crate) history_keep: u64,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit_interval: 1,
            history_every: 0,
            history_keep: 0,
        }
    }

    /// Commit the loop state every `interval` iterations (default 1).
    pub fn with_commit_interval(mut self, interval: u64) -> Self {
        self.commit_interval = interval.max(1);
        self
    }

    /// Every `every` iterations, delete the history of iterations older than
    /// the most recent `keep`. Trimmed iterations can no longer replay, so
    /// their compensation callbacks are gone too; a tombstone marks the
    /// boundary.
    pub fn with_history_trim(mut self, every: u64, keep: u64) -> Self {
        self.history_every = every;
        self.history_keep = keep;
        self
    }
}

/// Body verdict of one loop iteration.
pub enum LoopResult<S, B> {
    /// Run another iteration with this carried state.
    Continue(S),

    /// Finish the loop with this output.
    Break(B),
}

impl WorkflowContext {
    /// Run a durable loop. Each iteration gets its own history subtree, so
    /// operations inside the body may reuse names across iterations.
    ///
    /// On resume the loop continues from its last committed state and
    /// iteration; iterations after the commit replay through their cached
    /// entries. A finished loop replays to its cached output without running
    /// the body.
    pub async fn repeat<S, B, F, Fut>(
        &self,
        config: LoopConfig,
        initial: S,
        mut body: F,
    ) -> Result<B, WorkflowError>
    where
        S: Serialize + DeserializeOwned,
        B: Serialize + DeserializeOwned,
        F: FnMut(WorkflowContext, S) -> Fut,
        Fut: Future<Output = Result<LoopResult<S, B>, WorkflowError>>,
    {
        let (location, key) = self.resolve(&config.name)?;
        let idx = self.shared().storage.lock().register_name(&config.name);

        let (mut state, mut iteration) = {
            let mut storage = self.shared().storage.lock();
            match storage.entry(&key) {
                Some(entry) => match &entry.kind {
                    EntryKind::Loop {
                        state,
                        iteration,
                        base_state,
                        trimmed_before,
                        output,
                        ..
                    } => {
                        if self.mode() == ReplayMode::Forward {
                            if let Some(output) = output {
                                return decode(&config.name, output.clone());
                            }
                            let state: S = decode(&config.name, state.clone())?;
                            (state, *iteration)
                        } else {
                            // Rollback replays the whole retained tail, not
                            // just the tail after the last commit, so every
                            // kept iteration re-registers its undo actions.
                            let state: S = decode(&config.name, base_state.clone())?;
                            (state, *trimmed_before)
                        }
                    }
                    _ => return Err(history_mismatch(&key)),
                },
                None => {
                    if self.mode() == ReplayMode::Rollback {
                        return Err(WorkflowError::RollbackStop);
                    }
                    let encoded = encode(&config.name, &initial)?;
                    storage.insert_entry(key.clone(), location.clone(), EntryKind::Loop {
                        state: encoded.clone(),
                        iteration: 0,
                        base_state: encoded,
                        trimmed_before: 0,
                        checkpoints: Vec::new(),
                        output: None,
                    });
                    (initial, 0)
                }
            }
        };
        if self.mode() == ReplayMode::Forward {
            self.claim(&key)?;
        }

        loop {
            if self.mode() == ReplayMode::Forward && self.is_evicted() {
                return Err(WorkflowError::Evicted);
            }

            let iter_ctx = self.at(self.location().child_iteration(idx, iteration));
            match body(iter_ctx, state).await? {
                LoopResult::Continue(next) => {
                    state = next;
                    iteration += 1;

                    if self.mode() == ReplayMode::Rollback {
                        continue;
                    }
                    let at_commit = iteration % config.commit_interval == 0;
                    let at_trim =
                        config.history_every > 0 && iteration % config.history_every == 0;
                    if at_commit || at_trim {
                        let encoded = encode(&config.name, &state)?;
                        let mut storage = self.shared().storage.lock();
                        if let Some(entry) = storage.entry_mut(&key) {
                            if let EntryKind::Loop {
                                state: committed,
                                iteration: committed_iter,
                                checkpoints,
                                ..
                            } = &mut entry.kind
                            {
                                *committed = encoded.clone();
                                *committed_iter = iteration;
                                if at_trim {
                                    checkpoints.push(LoopCheckpoint {
                                        iteration,
                                        state: encoded,
                                    });
                                }
                            }
                        }
                        if at_trim {
                            self.trim_loop_history(
                                &mut storage,
                                &key,
                                idx,
                                iteration,
                                config.history_keep,
                            );
                        }
                    }
                }
                LoopResult::Break(output) => {
                    if self.mode() == ReplayMode::Rollback {
                        return Ok(output);
                    }
                    let encoded = encode(&config.name, &output)?;
                    let mut storage = self.shared().storage.lock();
                    let entry_id = match storage.entry_mut(&key) {
                        Some(entry) => {
                            if let EntryKind::Loop {
                                iteration: committed_iter,
                                output: cached,
                                ..
                            } = &mut entry.kind
                            {
                                *committed_iter = iteration;
                                *cached = Some(encoded);
                            }
                            entry.id
                        }
                        None => return Err(history_mismatch(&key)),
                    };
                    complete_entry(&mut storage, entry_id);
                    tracing::debug!(name = %config.name, iterations = iteration + 1, "loop finished");
                    return Ok(output);
                }
            }
        }
    }

    /// Trim iterations below the newest checkpoint that is at least `keep`
    /// iterations old, leaving a tombstone at the highest trimmed slot. The
    /// cut always lands on a checkpointed iteration, so rollback replay can
    /// start there with the recorded state.
    fn trim_loop_history(
        &self,
        storage: &mut Storage,
        key: &str,
        idx: NameIndex,
        iteration: u64,
        keep: u64,
    ) {
        let oldest_needed = iteration.saturating_sub(keep);
        let (trimmed_before, checkpoint) = match storage.entry(key).map(|e| &e.kind) {
            Some(EntryKind::Loop {
                trimmed_before,
                checkpoints,
                ..
            }) => {
                let checkpoint = checkpoints
                    .iter()
                    .filter(|c| c.iteration <= oldest_needed)
                    .max_by_key(|c| c.iteration)
                    .cloned();
                (*trimmed_before, checkpoint)
            }
            _ => return,
        };
        let Some(checkpoint) = checkpoint else { return };
        let cut = checkpoint.iteration;
        if cut <= trimmed_before {
            return;
        }

        // Start one slot early so the previous boundary tombstone goes too.
        let mut removed = 0;
        for i in trimmed_before.saturating_sub(1)..cut {
            removed += storage.trim_subtree(&self.location().child_iteration(idx, i));
        }

        let tomb_location = self.location().child_iteration(idx, cut - 1);
        let tomb_key = storage.location_key(&tomb_location);
        let tomb_id = storage.insert_entry(tomb_key, tomb_location, EntryKind::Removed);
        complete_entry(storage, tomb_id);

        if let Some(entry) = storage.entry_mut(key) {
            if let EntryKind::Loop {
                base_state,
                trimmed_before,
                checkpoints,
                ..
            } = &mut entry.kind
            {
                *base_state = checkpoint.state;
                *trimmed_before = cut;
                checkpoints.retain(|c| c.iteration > cut);
            }
        }
        tracing::debug!(loop_key = key, cut, removed, "trimmed loop history");
    }
}

fn encode<T: Serialize>(name: &str, value: &T) -> Result<serde_json::Value, WorkflowError> {
    serde_json::to_value(value)
        .map_err(|e| WorkflowError::Critical(format!("loop '{name}': state not serializable: {e}")))
}

fn decode<T: DeserializeOwned>(name: &str, value: serde_json::Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value).map_err(|e| {
        WorkflowError::Critical(format!("loop '{name}': stored state does not deserialize: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{reinvoke, test_context};
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loop_runs_to_break() {
        let ctx = test_context(ReplayMode::Forward);

        let total: u64 = ctx
            .repeat(LoopConfig::new("sum"), 0u64, |_ctx, acc| async move {
                if acc >= 10 {
                    Ok(LoopResult::Break(acc))
                } else {
                    Ok(LoopResult::Continue(acc + 3))
                }
            })
            .await
            .unwrap();

        assert_eq!(total, 12);
    }

    #[tokio::test]
    async fn test_finished_loop_replays_cached_output() {
        let ctx = test_context(ReplayMode::Forward);
        let runs = Arc::new(AtomicU32::new(0));

        let body_runs = runs.clone();
        let first: u32 = ctx
            .repeat(LoopConfig::new("once"), 0u32, move |_ctx, n| {
                let body_runs = body_runs.clone();
                async move {
                    body_runs.fetch_add(1, Ordering::SeqCst);
                    Ok(LoopResult::Break(n + 1))
                }
            })
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let ctx2 = reinvoke(&ctx, ReplayMode::Forward);
        let second: u32 = ctx2
            .repeat(LoopConfig::new("once"), 0u32, |_ctx, _n| async move {
                panic!("finished loop must not run its body")
            })
            .await
            .unwrap();
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_loop_resumes_from_committed_state() {
        let ctx = test_context(ReplayMode::Forward);

        // Pause inside iteration 2.
        let yielded = ctx
            .repeat(LoopConfig::new("work"), 0u32, |ctx, n| async move {
                if n == 2 {
                    ctx.sleep("pause", Duration::from_secs(600)).await?;
                }
                Ok(LoopResult::Continue(n + 1))
            })
            .await;
        assert!(matches!(yielded, Err::<u32, _>(WorkflowError::Sleep { .. })));

        // The committed iteration is 2: two completed iterations, paused in
        // the third.
        {
            let storage = ctx.shared().storage.lock();
            let idx_key = {
                // Loop entry sits at the loop's own name.
                "work".to_string()
            };
            match storage.entry(&idx_key).map(|e| &e.kind) {
                Some(EntryKind::Loop { iteration, .. }) => assert_eq!(*iteration, 2),
                other => panic!("expected loop entry, got {other:?}"),
            }
        }

        // Resume with the sleep completed.
        let ctx2 = reinvoke(&ctx, ReplayMode::Forward);
        {
            let mut storage = ctx2.shared().storage.lock();
            if let Some(entry) = storage.entry_mut("work~00000002/pause") {
                if let EntryKind::Sleep { deadline, .. } = &mut entry.kind {
                    *deadline = chrono::Utc::now() - chrono::Duration::seconds(1);
                }
            } else {
                panic!("sleep entry missing");
            }
        }

        let done: u32 = ctx2
            .repeat(LoopConfig::new("work"), 0u32, |ctx, n| async move {
                if n == 2 {
                    ctx.sleep("pause", Duration::from_secs(600)).await?;
                }
                if n >= 4 {
                    Ok(LoopResult::Break(n))
                } else {
                    Ok(LoopResult::Continue(n + 1))
                }
            })
            .await
            .unwrap();
        assert_eq!(done, 4);
    }

    #[tokio::test]
    async fn test_loop_history_trimming() {
        let ctx = test_context(ReplayMode::Forward);

        // Keep 2 of every 4. The cut lands on the newest checkpointed
        // iteration at least `keep` old: the pass after iteration 4 only
        // leaves a checkpoint; the passes after 8 and 12 cut at 4 and 8
        // respectively.
        let _: u32 = ctx
            .repeat(
                LoopConfig::new("batch").with_history_trim(4, 2),
                0u32,
                |ctx, n| async move {
                    let _: u32 = ctx.step("work", move || async move { Ok(n) }).await?;
                    if n >= 13 {
                        Ok(LoopResult::Break(n))
                    } else {
                        Ok(LoopResult::Continue(n + 1))
                    }
                },
            )
            .await
            .unwrap();

        let storage = ctx.shared().storage.lock();
        assert!(storage.entry("batch~00000000/work").is_none());
        assert!(storage.entry("batch~00000007/work").is_none());
        assert!(storage.entry("batch~00000008/work").is_some());
        assert!(storage.entry("batch~00000013/work").is_some());

        // The first cut's tombstone (slot 3) was superseded by the second
        // cut; only the latest boundary remains, with the watermark and base
        // state on the loop entry.
        assert!(storage.entry("batch~00000003").is_none());
        assert!(matches!(
            storage.entry("batch~00000007").map(|e| &e.kind),
            Some(EntryKind::Removed)
        ));
        match storage.entry("batch").map(|e| &e.kind) {
            Some(EntryKind::Loop {
                base_state,
                trimmed_before,
                ..
            }) => {
                assert_eq!(*trimmed_before, 8);
                assert_eq!(base_state, &serde_json::json!(8));
            }
            other => panic!("expected loop entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rollback_replay_covers_all_retained_iterations() {
        let run = |ctx: WorkflowContext| async move {
            ctx.repeat(LoopConfig::new("apply"), 0u32, |ctx, n| async move {
                let _: u32 = ctx
                    .step_with_rollback(
                        "write",
                        move || async move { Ok(n) },
                        |_rb, _out: u32| async { Ok(()) },
                    )
                    .await?;
                if n >= 2 {
                    Ok(LoopResult::Break(n))
                } else {
                    Ok(LoopResult::Continue(n + 1))
                }
            })
            .await
        };

        let ctx = test_context(ReplayMode::Forward);
        let total: u32 = run(ctx.clone()).await.unwrap();
        assert_eq!(total, 2);

        // Rollback replay starts from the first retained iteration (0 here,
        // nothing trimmed), so every iteration's undo action is collected,
        // not just the ones after the last state commit.
        let rb = reinvoke(&ctx, ReplayMode::Rollback);
        let replayed: u32 = run(rb.clone()).await.unwrap();
        assert_eq!(replayed, 2);

        let actions = rb.shared().rollback_actions.lock();
        let outputs: Vec<_> = actions.iter().map(|a| a.output.clone()).collect();
        assert_eq!(
            outputs,
            vec![
                serde_json::json!(0),
                serde_json::json!(1),
                serde_json::json!(2)
            ]
        );
    }

    #[tokio::test]
    async fn test_commit_interval_limits_committed_state() {
        let ctx = test_context(ReplayMode::Forward);

        let yielded = ctx
            .repeat(
                LoopConfig::new("work").with_commit_interval(5),
                0u32,
                |ctx, n| async move {
                    if n == 7 {
                        ctx.listen("hold", &["go"]).await?;
                    }
                    Ok(LoopResult::Continue(n + 1))
                },
            )
            .await;
        assert!(matches!(
            yielded,
            Err::<u32, _>(WorkflowError::MessageWait { .. })
        ));

        let storage = ctx.shared().storage.lock();
        match storage.entry("work").map(|e| &e.kind) {
            Some(EntryKind::Loop {
                iteration, state, ..
            }) => {
                assert_eq!(*iteration, 5);
                assert_eq!(state, &serde_json::json!(5));
            }
            other => panic!("expected loop entry, got {other:?}"),
        }
    }
}
