// src/batch.rs

//! Deferred operation queue with run-grouped execution (spec §4.7, C7).
//!
//! Grounded on the teacher's `JoinSet`-based fan-out (`server/connection_loop.rs`'s
//! `client_tasks: JoinSet<...>`, spawn-then-join-all pattern) for "dispatch a
//! run's operations concurrently, then join before moving to the next run."

use crate::errors::Result;
use crate::semantics::Semantics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Type-erased identity for grouping ops into runs (spec §4.7, §9 "Opaque
/// `void*` key"). Two operations are in the same run iff their `exec` is the
/// same pointer-equal implementation *and* their `key` compares equal.
pub trait OperationKey: std::fmt::Debug + Send + Sync {
    fn key_eq(&self, other: &dyn OperationKey) -> bool;
}

/// A key that is just an object identity (`Arc` pointer equality) — the
/// common case described in spec §4.7: "callers with large-volume writes to
/// the same object get automatic batching for free because they reuse the
/// same object pointer as key."
#[derive(Debug, Clone)]
pub struct PointerKey(pub Arc<dyn std::any::Any + Send + Sync>);

impl OperationKey for PointerKey {
    fn key_eq(&self, other: &dyn OperationKey) -> bool {
        let Some(other) = (other as &dyn std::any::Any).downcast_ref::<PointerKey>() else {
            return false;
        };
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A run of same-`(exec, key)` operations, dispatched together by `exec`
/// (spec §4.7 `execute`).
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Identifies this executor for run-boundary comparison. Two ops are in
    /// the same run only if `exec_id` also matches, in addition to `key`.
    fn exec_id(&self) -> usize {
        self as *const Self as *const () as usize
    }

    async fn exec(&self, ops: Vec<Operation>, semantics: Semantics) -> Result<bool>;
}

/// A single deferred operation queued onto a `Batch` (spec §4.7).
pub struct Operation {
    pub key: Arc<dyn OperationKey>,
    pub payload: Box<dyn std::any::Any + Send>,
}

impl Operation {
    pub fn new(key: Arc<dyn OperationKey>, payload: Box<dyn std::any::Any + Send>) -> Self {
        Self { key, payload }
    }
}

struct QueuedOp {
    executor: Arc<dyn RunExecutor>,
    op: Operation,
}

/// An ordered queue of deferred operations executed together under one
/// `Semantics` value (spec §4.7, Glossary "Batch").
pub struct Batch {
    semantics: Semantics,
    ops: Vec<QueuedOp>,
}

impl Batch {
    pub fn new(semantics: Semantics) -> Self {
        Self {
            semantics,
            ops: Vec::new(),
        }
    }

    /// Queues `op`, dispatched later by `executor` (spec §4.7 `add`).
    pub fn add(&mut self, executor: Arc<dyn RunExecutor>, op: Operation) {
        self.ops.push(QueuedOp { executor, op });
    }

    /// Walks the op list left-to-right, grouping maximal runs of identical
    /// `(exec, key)`, dispatching each run to its executor concurrently with
    /// every other run, and AND-reducing all run results (spec §4.7
    /// `execute`, §8 item 6, §9 "Parallel fan-out").
    ///
    /// Runs are spawned onto a `JoinSet` and joined before `execute`
    /// returns — mirroring the teacher's accept-loop `JoinSet`, but here the
    /// "join_next in a loop" happens once, at the very end, since batch
    /// semantics make all runs independent and unordered (spec §5
    /// "Ordering guarantees").
    pub async fn execute(self) -> bool {
        let runs = self.group_into_runs();
        let semantics = self.semantics;
        let mut joinset: JoinSet<Result<bool>> = JoinSet::new();
        for run in runs {
            let semantics = semantics;
            joinset.spawn(async move { run.executor.exec(run.ops, semantics).await });
        }

        let mut aggregate = true;
        while let Some(joined) = joinset.join_next().await {
            let outcome = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => false,
                Err(_) => false, // a run's task panicked; treat as failed
            };
            aggregate &= outcome;
        }
        aggregate
    }

    fn group_into_runs(self) -> Vec<Run> {
        let mut runs: Vec<Run> = Vec::new();
        for queued in self.ops {
            let boundary_crossed = match runs.last() {
                None => true,
                Some(run) => {
                    run.executor.exec_id() != queued.executor.exec_id()
                        || !run.ops.last().unwrap().key.key_eq(queued.op.key.as_ref())
                }
            };
            if boundary_crossed {
                runs.push(Run {
                    executor: queued.executor,
                    ops: vec![queued.op],
                });
            } else {
                runs.last_mut().unwrap().ops.push(queued.op);
            }
        }
        runs
    }
}

struct Run {
    executor: Arc<dyn RunExecutor>,
    ops: Vec<Operation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: Arc<AtomicUsize>,
        last_len: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl RunExecutor for CountingExecutor {
        async fn exec(&self, ops: Vec<Operation>, _semantics: Semantics) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.lock().unwrap().push(ops.len());
            Ok(true)
        }
    }

    fn key(tag: u64) -> Arc<dyn OperationKey> {
        Arc::new(PointerKey(Arc::new(tag)))
    }

    #[tokio::test]
    async fn groups_runs_by_exec_and_key_per_spec_8_item_6() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lens = Arc::new(std::sync::Mutex::new(Vec::new()));
        let exec_a: Arc<dyn RunExecutor> = Arc::new(CountingExecutor {
            calls: calls.clone(),
            last_len: lens.clone(),
        });
        let exec_b: Arc<dyn RunExecutor> = Arc::new(CountingExecutor {
            calls: calls.clone(),
            last_len: lens.clone(),
        });

        let key_a = key(1);
        let key_b = key(2);

        let mut batch = Batch::new(Semantics::default_template());
        // [A, A, B, A] per spec §8 item 6.
        batch.add(
            exec_a.clone(),
            Operation::new(key_a.clone(), Box::new(())),
        );
        batch.add(
            exec_a.clone(),
            Operation::new(key_a.clone(), Box::new(())),
        );
        batch.add(exec_b.clone(), Operation::new(key_b, Box::new(())));
        batch.add(exec_a.clone(), Operation::new(key_a, Box::new(())));

        let result = batch.execute().await;
        assert!(result);

        let mut lens = lens.lock().unwrap().clone();
        lens.sort_unstable();
        assert_eq!(lens, vec![1, 1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct FailingExecutor;

    #[async_trait]
    impl RunExecutor for FailingExecutor {
        async fn exec(&self, _ops: Vec<Operation>, _semantics: Semantics) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn aggregate_is_false_if_any_run_fails() {
        let ok: Arc<dyn RunExecutor> = Arc::new(CountingExecutor {
            calls: Arc::new(AtomicUsize::new(0)),
            last_len: Arc::new(std::sync::Mutex::new(Vec::new())),
        });
        let failing: Arc<dyn RunExecutor> = Arc::new(FailingExecutor);

        let mut batch = Batch::new(Semantics::default_template());
        batch.add(ok, Operation::new(key(1), Box::new(())));
        batch.add(failing, Operation::new(key(2), Box::new(())));

        assert!(!batch.execute().await);
    }
}
