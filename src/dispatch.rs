//! Per-scan parallel execution with ordered, failure-isolating aggregation.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use web_time::Instant;

use crate::enums::PoolKind;
use crate::error::{BatchError, Result, TaskFailure};
use crate::index::ScanIndex;

/// Runs one closure per scan on a worker pool.
///
/// Results always come back in the order the items were submitted. A task that
/// errors or panics is recorded and its siblings still run to completion.
#[derive(Clone, Default)]
pub struct Dispatcher {
    pool: Option<Arc<ThreadPool>>,
}

impl Dispatcher {
    pub fn new(kind: PoolKind) -> Result<Self> {
        let pool = match kind {
            PoolKind::Global => None,
            PoolKind::Threads(threads) => {
                if threads == 0 {
                    return Err(BatchError::invalid("worker pool needs at least one thread"));
                }
                let pool = ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("ct-batch-{i}"))
                    .build()?;
                Some(Arc::new(pool))
            }
        };
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |pool| pool.current_num_threads())
    }

    /// Runs `task` over `(position, item)` pairs and returns each outcome next to
    /// its position, in submission order.
    pub fn run<I, R, F>(&self, items: Vec<(usize, I)>, task: F) -> Vec<(usize, Result<R>)>
    where
        I: Send,
        R: Send,
        F: Fn(usize, I) -> Result<R> + Sync + Send,
    {
        let work = || {
            items
                .into_par_iter()
                .map(|(position, item)| {
                    let outcome = catch_unwind(AssertUnwindSafe(|| task(position, item)))
                        .unwrap_or_else(|payload| Err(BatchError::TaskPanicked(panic_message(payload))));
                    (position, outcome)
                })
                .collect()
        };
        self.install(work)
    }

    /// Runs `op` inside this dispatcher's pool, so rayon work nested in it is
    /// bounded by the same thread count.
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Like [`run`](Self::run) but folds failures into one `PartialFailure`.
    ///
    /// `label` names the operation in log lines; `index` names failed scans.
    pub fn run_all<I, R, F>(
        &self,
        label: &str,
        index: &ScanIndex,
        items: Vec<(usize, I)>,
        task: F,
    ) -> Result<Vec<R>>
    where
        I: Send,
        R: Send,
        F: Fn(usize, I) -> Result<R> + Sync + Send,
    {
        let started = Instant::now();
        let total = items.len();
        log::debug!("{label}: dispatching {total} scan tasks on {} threads", self.threads());
        let outcomes = self.run(items, task);
        let collected = collect_ordered(index, total, outcomes);
        match &collected {
            Ok(_) => log::debug!("{label}: {total} tasks done in {:?}", started.elapsed()),
            Err(err) => log::warn!("{label}: {err}"),
        }
        collected
    }
}

/// Splits outcomes into values (position order) or one aggregated failure.
pub fn collect_ordered<R>(
    index: &ScanIndex,
    total: usize,
    outcomes: Vec<(usize, Result<R>)>,
) -> Result<Vec<R>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (position, outcome) in outcomes {
        match outcome {
            Ok(value) => values.push(value),
            Err(error) => {
                let identifier = index
                    .identifier(position)
                    .map_or_else(|_| format!("#{position}"), str::to_string);
                log::warn!("Scan {position} ({identifier}) failed: {error}");
                failures.push(TaskFailure {
                    position,
                    identifier,
                    error,
                });
            }
        }
    }
    if failures.is_empty() {
        Ok(values)
    } else {
        failures.sort_by_key(|failure| failure.position);
        Err(BatchError::PartialFailure { total, failures })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
