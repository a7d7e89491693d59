//! how per-file operations are scheduled
//!
//! every per-file scan or rebuild step touches a disjoint store key and a
//! disjoint filesystem path, so they can run on a bounded pool with no
//! coordination beyond collecting results. the pool size is also the cap on
//! concurrent store requests.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/// execution strategy for per-file operations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// one file at a time, in path order (deterministic)
    #[default]
    Sequential,
    /// bounded worker pool
    Parallel { workers: NonZeroUsize },
}

impl Strategy {
    /// `Sequential` for 0 or 1 workers, `Parallel` otherwise
    pub fn with_workers(workers: usize) -> Self {
        match NonZeroUsize::new(workers) {
            Some(workers) if workers.get() > 1 => Strategy::Parallel { workers },
            _ => Strategy::Sequential,
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            Strategy::Sequential => 1,
            Strategy::Parallel { workers } => workers.get(),
        }
    }
}

/// cooperative cancellation signal
///
/// once cancelled, no new per-file operation starts; operations already in
/// flight run to completion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }

    /// token that observes this one but can be cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(self.is_cancelled())),
            parent: Some(self.flag.clone()),
        }
    }
}

/// run `op` over every item under `strategy`
///
/// items that are not started because `cancel` fired go through `on_cancel`
/// instead, so every item yields exactly one result. result order follows
/// input order only for `Sequential`.
pub(crate) fn run_all<I, T, F, C>(
    strategy: Strategy,
    items: Vec<I>,
    cancel: &CancelToken,
    op: F,
    on_cancel: C,
) -> Vec<T>
where
    I: Send,
    T: Send,
    F: Fn(I) -> T + Sync,
    C: Fn(I) -> T + Sync,
{
    let workers = strategy.workers().min(items.len());
    if workers <= 1 {
        return items
            .into_iter()
            .map(|item| {
                if cancel.is_cancelled() {
                    on_cancel(item)
                } else {
                    op(item)
                }
            })
            .collect();
    }

    let queue = Mutex::new(items.into_iter());
    let (tx, rx) = mpsc::channel();
    let (op, on_cancel, queue) = (&op, &on_cancel, &queue);

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            scope.spawn(move || loop {
                let next = queue.lock().unwrap_or_else(|e| e.into_inner()).next();
                let Some(item) = next else {
                    break;
                };
                let result = if cancel.is_cancelled() {
                    on_cancel(item)
                } else {
                    op(item)
                };
                if tx.send(result).is_err() {
                    break;
                }
            });
        }
        drop(tx);
        rx.iter().collect()
    })
}
