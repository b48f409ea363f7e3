//! Parallel composition: join and race

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::future::Future;

use super::{complete_entry, history_mismatch, ReplayMode, WorkflowContext};
use crate::error::WorkflowError;
use crate::storage::{BranchSlot, BranchStatus, EntryKind, EntryStatus};

type BranchFn = Box<
    dyn FnOnce(WorkflowContext) -> BoxFuture<'static, Result<serde_json::Value, WorkflowError>>
        + Send,
>;

/// One named branch of a [`join`](WorkflowContext::join) or
/// [`race`](WorkflowContext::race).
///
/// The closure receives a context rooted under the join/race location, so
/// operations inside the branch get their own history subtree.
pub struct Branch {
    name: String,
    run: BranchFn,
}

impl Branch {
    pub fn new<T, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        T: Serialize,
        F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkflowError>> + Send + 'static,
    {
        let name = name.into();
        let branch_name = name.clone();
        let run: BranchFn = Box::new(move |ctx| {
            Box::pin(async move {
                let value = f(ctx).await?;
                serde_json::to_value(&value).map_err(|e| {
                    WorkflowError::Critical(format!(
                        "branch '{branch_name}': output not serializable: {e}"
                    ))
                })
            })
        });
        Self { name, run }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl WorkflowContext {
    /// Run branches concurrently and wait for all of them.
    ///
    /// Outputs come back in branch order. Branch completion is durable per
    /// branch: when one branch pauses, the others' finished work survives the
    /// yield and is not re-executed on resume. The join fails only once every
    /// branch has settled and at least one failed.
    pub async fn join(
        &self,
        name: &str,
        branches: Vec<Branch>,
    ) -> Result<Vec<serde_json::Value>, WorkflowError> {
        let (location, key) = self.resolve(name)?;
        validate_branches(&branches)?;

        {
            let mut storage = self.shared().storage.lock();
            match storage.entry(&key) {
                Some(entry) => match &entry.kind {
                    EntryKind::Join { branches: slots } => {
                        let id = entry.id;
                        if storage.entry_metadata(id).is_some_and(|m| m.is_completed()) {
                            if self.mode() == ReplayMode::Forward {
                                return Ok(slot_outputs(slots));
                            }
                            // Rollback replays the branches below to collect
                            // undo actions before returning the outputs.
                        } else if slots.len() != branches.len()
                            || slots.iter().zip(&branches).any(|(s, b)| s.name != b.name)
                        {
                            return Err(history_mismatch(&key));
                        }
                    }
                    _ => return Err(history_mismatch(&key)),
                },
                None => {
                    if self.mode() == ReplayMode::Rollback {
                        return Err(WorkflowError::RollbackStop);
                    }
                    let slots = branches
                        .iter()
                        .map(|b| BranchSlot::pending(b.name.clone()))
                        .collect();
                    storage.insert_entry(key.clone(), location.clone(), EntryKind::Join {
                        branches: slots,
                    });
                }
            }
            if self.mode() == ReplayMode::Forward {
                drop(storage);
                self.claim(&key)?;
            }
        }

        if self.mode() == ReplayMode::Rollback {
            return self.join_rollback_replay(&key, &location, branches).await;
        }

        // Pick the branches that still need to run.
        let mut runnable: Vec<(usize, BoxFuture<'static, Result<serde_json::Value, WorkflowError>>)> =
            Vec::new();
        {
            let mut storage = self.shared().storage.lock();
            let settled: Vec<bool> = match storage.entry(&key).map(|e| &e.kind) {
                Some(EntryKind::Join { branches: slots }) => {
                    slots.iter().map(|s| s.is_settled()).collect()
                }
                _ => return Err(history_mismatch(&key)),
            };
            for (i, branch) in branches.into_iter().enumerate() {
                if settled[i] {
                    continue;
                }
                let idx = storage.register_name(&branch.name);
                let ctx = self.at(location.child(idx));
                runnable.push((i, (branch.run)(ctx)));
            }
        }

        let (indices, futures): (Vec<usize>, Vec<_>) = runnable.into_iter().unzip();
        let results = futures::future::join_all(futures).await;

        let mut signals: Vec<WorkflowError> = Vec::new();
        let mut storage = self.shared().storage.lock();
        let entry = storage.entry_mut(&key).ok_or_else(|| history_mismatch(&key))?;
        let entry_id = entry.id;
        let EntryKind::Join { branches: slots } = &mut entry.kind else {
            return Err(history_mismatch(&key));
        };

        for (i, result) in indices.into_iter().zip(results) {
            match result {
                Ok(value) => {
                    slots[i].status = BranchStatus::Completed;
                    slots[i].output = Some(value);
                }
                Err(e) if e.is_yield() || matches!(e, WorkflowError::StepFailed { .. }) => {
                    slots[i].status = BranchStatus::Running;
                    signals.push(e);
                }
                Err(e) => {
                    slots[i].status = BranchStatus::Failed;
                    slots[i].error = Some(e.to_string());
                }
            }
        }

        if !signals.is_empty() {
            return Err(merge_signals(signals));
        }

        // Every branch has settled.
        let failures: Vec<String> = slots
            .iter()
            .filter(|s| s.status == BranchStatus::Failed)
            .map(|s| format!("{}: {}", s.name, s.error.as_deref().unwrap_or("unknown")))
            .collect();
        if !failures.is_empty() {
            if let Some(meta) = storage.entry_metadata_mut(entry_id) {
                meta.status = EntryStatus::Failed;
            }
            return Err(WorkflowError::Join {
                name: name.to_string(),
                errors: failures,
            });
        }

        let outputs = match storage.entry(&key).map(|e| &e.kind) {
            Some(EntryKind::Join { branches: slots }) => slot_outputs(slots),
            _ => return Err(history_mismatch(&key)),
        };
        complete_entry(&mut storage, entry_id);
        Ok(outputs)
    }

    /// Run branches concurrently and return the first success.
    ///
    /// The winner is recorded durably; losers are dropped at the first win
    /// and skipped entirely on replay. If every branch fails, yields are
    /// merged like a join and terminal failures propagate the first error.
    pub async fn race(
        &self,
        name: &str,
        branches: Vec<Branch>,
    ) -> Result<serde_json::Value, WorkflowError> {
        let (location, key) = self.resolve(name)?;
        validate_branches(&branches)?;

        let cached_winner = {
            let mut storage = self.shared().storage.lock();
            match storage.entry(&key) {
                Some(entry) => match &entry.kind {
                    EntryKind::Race { winner, output } => match winner {
                        Some(w) => Some((w.clone(), output.clone().unwrap_or(serde_json::Value::Null))),
                        None => {
                            if self.mode() == ReplayMode::Rollback {
                                return Err(WorkflowError::RollbackStop);
                            }
                            None
                        }
                    },
                    _ => return Err(history_mismatch(&key)),
                },
                None => {
                    if self.mode() == ReplayMode::Rollback {
                        return Err(WorkflowError::RollbackStop);
                    }
                    storage.insert_entry(key.clone(), location.clone(), EntryKind::Race {
                        winner: None,
                        output: None,
                    });
                    None
                }
            }
        };

        if let Some((winner, output)) = cached_winner {
            if self.mode() == ReplayMode::Rollback {
                // Replay only the winning branch to collect its undo actions.
                if let Some(branch) = branches.into_iter().find(|b| b.name == winner) {
                    let ctx = {
                        let mut storage = self.shared().storage.lock();
                        let idx = storage.register_name(&branch.name);
                        self.at(location.child(idx))
                    };
                    match (branch.run)(ctx).await {
                        Ok(_) | Err(WorkflowError::RollbackStop) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            return Ok(output);
        }
        self.claim(&key)?;

        let mut running: FuturesUnordered<
            BoxFuture<'static, (String, Result<serde_json::Value, WorkflowError>)>,
        > = FuturesUnordered::new();
        {
            let mut storage = self.shared().storage.lock();
            for branch in branches {
                let idx = storage.register_name(&branch.name);
                let ctx = self.at(location.child(idx));
                let branch_name = branch.name;
                let run = branch.run;
                running.push(Box::pin(async move { (branch_name, run(ctx).await) }));
            }
        }

        let mut signals: Vec<WorkflowError> = Vec::new();
        let mut terminal: Vec<WorkflowError> = Vec::new();
        while let Some((branch_name, result)) = running.next().await {
            match result {
                Ok(value) => {
                    // First success wins; the rest are cancelled by drop.
                    drop(running);
                    let mut storage = self.shared().storage.lock();
                    let entry = storage.entry_mut(&key).ok_or_else(|| history_mismatch(&key))?;
                    let entry_id = entry.id;
                    if let EntryKind::Race { winner, output } = &mut entry.kind {
                        *winner = Some(branch_name.clone());
                        *output = Some(value.clone());
                    }
                    complete_entry(&mut storage, entry_id);
                    tracing::debug!(race = name, winner = %branch_name, "race settled");
                    return Ok(value);
                }
                Err(e) if e.is_yield() || matches!(e, WorkflowError::StepFailed { .. }) => {
                    signals.push(e);
                }
                Err(e) => terminal.push(e),
            }
        }

        if !signals.is_empty() {
            return Err(merge_signals(signals));
        }
        match terminal.into_iter().next() {
            Some(e) => Err(e),
            None => Err(WorkflowError::Critical(format!(
                "race '{name}' has no branches"
            ))),
        }
    }

    /// Rollback-mode branch replay: run each branch sequentially over cached
    /// history so their undo actions register, swallowing the per-branch
    /// replay boundary.
    async fn join_rollback_replay(
        &self,
        key: &str,
        location: &crate::location::Location,
        branches: Vec<Branch>,
    ) -> Result<Vec<serde_json::Value>, WorkflowError> {
        for branch in branches {
            let ctx = {
                let mut storage = self.shared().storage.lock();
                let idx = storage.register_name(&branch.name);
                self.at(location.child(idx))
            };
            match (branch.run)(ctx).await {
                Ok(_) | Err(WorkflowError::RollbackStop) => {}
                Err(e) if e.is_yield() => {}
                Err(e) => return Err(e),
            }
        }

        let storage = self.shared().storage.lock();
        match storage.entry(key) {
            Some(entry) => match &entry.kind {
                EntryKind::Join { branches: slots }
                    if storage
                        .entry_metadata(entry.id)
                        .is_some_and(|m| m.is_completed()) =>
                {
                    Ok(slot_outputs(slots))
                }
                EntryKind::Join { .. } => Err(WorkflowError::RollbackStop),
                _ => Err(history_mismatch(key)),
            },
            None => Err(WorkflowError::RollbackStop),
        }
    }
}

fn validate_branches(branches: &[Branch]) -> Result<(), WorkflowError> {
    for branch in branches {
        super::validate_name(&branch.name)?;
    }
    for (i, branch) in branches.iter().enumerate() {
        if branches[..i].iter().any(|b| b.name == branch.name) {
            return Err(WorkflowError::Critical(format!(
                "duplicate branch name '{}'",
                branch.name
            )));
        }
    }
    Ok(())
}

fn slot_outputs(slots: &[BranchSlot]) -> Vec<serde_json::Value> {
    slots
        .iter()
        .map(|s| s.output.clone().unwrap_or(serde_json::Value::Null))
        .collect()
}

/// Collapse pending-branch signals into the single yield the executor sees:
/// eviction first, then retry backoff, then the earliest sleep deadline with
/// all awaited message names merged in.
fn merge_signals(mut signals: Vec<WorkflowError>) -> WorkflowError {
    if signals.iter().any(|e| matches!(e, WorkflowError::Evicted)) {
        return WorkflowError::Evicted;
    }
    if let Some(pos) = signals
        .iter()
        .position(|e| matches!(e, WorkflowError::StepFailed { .. }))
    {
        return signals.swap_remove(pos);
    }

    let mut deadline: Option<DateTime<Utc>> = None;
    let mut names: Vec<String> = Vec::new();
    for signal in signals {
        match signal {
            WorkflowError::Sleep {
                deadline: d,
                messages,
            } => {
                deadline = Some(match deadline {
                    Some(existing) => existing.min(d),
                    None => d,
                });
                names.extend(messages);
            }
            WorkflowError::MessageWait { names: n } => names.extend(n),
            _ => {}
        }
    }
    names.sort();
    names.dedup();

    match deadline {
        Some(deadline) => WorkflowError::Sleep {
            deadline,
            messages: names,
        },
        None => WorkflowError::MessageWait { names },
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{reinvoke, test_context};
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_join_collects_outputs_in_branch_order() {
        let ctx = test_context(ReplayMode::Forward);

        let outputs = ctx
            .join("fanout", vec![
                Branch::new("left", |ctx| async move {
                    ctx.step("work", || async { Ok("L".to_string()) }).await
                }),
                Branch::new("right", |ctx| async move {
                    ctx.step("work", || async { Ok("R".to_string()) }).await
                }),
            ])
            .await
            .unwrap();

        assert_eq!(outputs, vec![serde_json::json!("L"), serde_json::json!("R")]);
    }

    #[tokio::test]
    async fn test_join_yield_preserves_completed_branches() {
        let ctx = test_context(ReplayMode::Forward);
        let runs = Arc::new(AtomicU32::new(0));

        let make_branches = |runs: Arc<AtomicU32>| {
            vec![
                Branch::new("fast", move |ctx| async move {
                    ctx.step("work", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(1u32)
                    })
                    .await
                }),
                Branch::new("waiting", |ctx| async move {
                    ctx.listen("msg", &["go"]).await.map(|m| m.id)
                }),
            ]
        };

        let yielded = ctx.join("pair", make_branches(runs.clone())).await;
        assert!(matches!(yielded, Err(WorkflowError::MessageWait { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Deliver the message and re-run: the fast branch must not re-execute.
        {
            let mut storage = ctx.shared().storage.lock();
            storage.messages = vec![crate::storage::Message::new(
                0,
                "go",
                serde_json::json!(null),
            )];
        }
        let ctx2 = reinvoke(&ctx, ReplayMode::Forward);
        let outputs = ctx2.join("pair", make_branches(runs.clone())).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(outputs[0], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_join_fails_only_after_all_settle() {
        let ctx = test_context(ReplayMode::Forward);

        let err = ctx
            .join("pair", vec![
                Branch::new("ok", |ctx| async move {
                    ctx.step("work", || async { Ok(1u32) }).await
                }),
                Branch::new("bad", |_ctx| async move {
                    Err::<u32, _>(WorkflowError::App(anyhow::anyhow!("exploded")))
                }),
            ])
            .await;

        match err {
            Err(WorkflowError::Join { name, errors }) => {
                assert_eq!(name, "pair");
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("bad"));
            }
            other => panic!("expected join failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_merges_sleep_deadlines() {
        let ctx = test_context(ReplayMode::Forward);
        let near = Utc::now() + chrono::Duration::seconds(10);
        let far = Utc::now() + chrono::Duration::seconds(100);

        let err = ctx
            .join("pair", vec![
                Branch::new("near", move |ctx| async move {
                    ctx.sleep_until("nap", near).await
                }),
                Branch::new("far", move |ctx| async move {
                    ctx.sleep_until("nap", far).await
                }),
            ])
            .await;

        match err {
            Err(WorkflowError::Sleep { deadline, .. }) => assert_eq!(deadline, near),
            other => panic!("expected merged sleep, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_race_records_winner_and_skips_losers_on_replay() {
        let ctx = test_context(ReplayMode::Forward);
        let loser_runs = Arc::new(AtomicU32::new(0));

        let winner = ctx
            .race("pick", vec![
                Branch::new("instant", |ctx| async move {
                    ctx.step("work", || async { Ok("fast".to_string()) }).await
                }),
                Branch::new("slow", {
                    let loser_runs = loser_runs.clone();
                    move |ctx| async move {
                        loser_runs.fetch_add(1, Ordering::SeqCst);
                        ctx.sleep("nap", std::time::Duration::from_secs(600)).await?;
                        Ok("slow".to_string())
                    }
                }),
            ])
            .await
            .unwrap();
        assert_eq!(winner, serde_json::json!("fast"));

        // Replay: cached winner, no branch runs at all.
        let ctx2 = reinvoke(&ctx, ReplayMode::Forward);
        let replayed = ctx2
            .race("pick", vec![
                Branch::new("instant", |_ctx| async move {
                    Err::<u32, _>(WorkflowError::Critical("must not run".into()))
                }),
                Branch::new("slow", |_ctx| async move {
                    Err::<u32, _>(WorkflowError::Critical("must not run".into()))
                }),
            ])
            .await
            .unwrap();
        assert_eq!(replayed, serde_json::json!("fast"));
    }

    #[tokio::test]
    async fn test_race_all_yield_merges_signals() {
        let ctx = test_context(ReplayMode::Forward);

        let err = ctx
            .race("pick", vec![
                Branch::new("a", |ctx| async move {
                    ctx.listen("msg", &["x"]).await.map(|m| m.id)
                }),
                Branch::new("b", |ctx| async move {
                    ctx.listen("msg", &["y"]).await.map(|m| m.id)
                }),
            ])
            .await;

        match err {
            Err(WorkflowError::MessageWait { names }) => {
                assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("expected merged message wait, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_branch_names_rejected() {
        let ctx = test_context(ReplayMode::Forward);

        let err = ctx
            .join("pair", vec![
                Branch::new("same", |_ctx| async move { Ok(1u32) }),
                Branch::new("same", |_ctx| async move { Ok(2u32) }),
            ])
            .await;
        assert!(matches!(err, Err(WorkflowError::Critical(_))));
    }
}
