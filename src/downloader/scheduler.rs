//! Bounded-concurrency scheduler for download tasks
//!
//! The scheduler admits jobs up to a runtime-mutable concurrency ceiling,
//! orders pending work by priority tier with a FIFO/LIFO tie-break, and
//! supports suspension and mass cancellation. It never interprets job
//! outcomes — admission and lifetime only.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ExecutionOrder;
use crate::types::Priority;

/// A unit of schedulable work.
///
/// This is the factory seam: the scheduler runs anything satisfying this
/// contract, so alternative task implementations can be substituted without
/// touching admission logic.
pub(crate) trait SchedulerJob: Send + Sync + 'static {
    /// Execute the job to completion. Cancellation is cooperative,
    /// signalled through [`abort`](Self::abort).
    fn run(self: Arc<Self>) -> BoxFuture<'static, ()>;

    /// Signal cooperative cancellation. Must not block. Jobs that were
    /// never started must reach their terminal state from here.
    fn abort(&self);
}

struct Pending {
    job: Arc<dyn SchedulerJob>,
    priority: Priority,
    seq: u64,
}

struct SchedulerState {
    max_concurrent: usize,
    execution_order: ExecutionOrder,
    suspended: bool,
    next_seq: u64,
    pending: Vec<Pending>,
    running: HashMap<u64, Arc<dyn SchedulerJob>>,
}

/// Admission controller shared by all clones of a downloader
#[derive(Clone)]
pub(crate) struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    runtime: tokio::runtime::Handle,
}

impl Scheduler {
    /// Create a scheduler. Must be called within a Tokio runtime.
    pub(crate) fn new(max_concurrent: usize, execution_order: ExecutionOrder) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                max_concurrent: max_concurrent.max(1),
                execution_order,
                suspended: false,
                next_seq: 0,
                pending: Vec::new(),
                running: HashMap::new(),
            })),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Insert a job into the pending queue and re-evaluate admission.
    pub(crate) fn submit(&self, job: Arc<dyn SchedulerJob>, priority: Priority) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(Pending { job, priority, seq });
            tracing::debug!(seq, ?priority, pending = state.pending.len(), "job submitted");
        }
        self.pump();
    }

    /// Halt or resume admission. Running jobs are unaffected either way.
    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.lock().suspended = suspended;
        if !suspended {
            self.pump();
        }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// Change the concurrency ceiling. Lowering it never preempts running
    /// jobs; it only throttles future admissions.
    pub(crate) fn set_max_concurrent(&self, max_concurrent: usize) {
        self.lock().max_concurrent = max_concurrent.max(1);
        self.pump();
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    pub(crate) fn set_execution_order(&self, execution_order: ExecutionOrder) {
        self.lock().execution_order = execution_order;
    }

    pub(crate) fn execution_order(&self) -> ExecutionOrder {
        self.lock().execution_order
    }

    pub(crate) fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Jobs that are pending or running.
    pub(crate) fn current_count(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.running.len()
    }

    /// Abort every pending and running job.
    ///
    /// Pending jobs are dropped from the queue and never started; their
    /// abort path is responsible for reaching a terminal state. Running
    /// jobs receive the cooperative signal and tear down asynchronously.
    pub(crate) fn cancel_all(&self) {
        let (pending, running) = {
            let mut state = self.lock();
            let pending = std::mem::take(&mut state.pending);
            let running: Vec<_> = state.running.values().cloned().collect();
            (pending, running)
        };
        tracing::debug!(
            pending = pending.len(),
            running = running.len(),
            "cancelling all jobs"
        );
        for entry in pending {
            entry.job.abort();
        }
        for job in running {
            job.abort();
        }
    }

    /// Admit jobs while capacity allows. Re-run on every event that could
    /// open a slot: submission, job termination, resume, ceiling raise.
    fn pump(&self) {
        loop {
            let (job, seq) = {
                let mut state = self.lock();
                if state.suspended
                    || state.running.len() >= state.max_concurrent
                    || state.pending.is_empty()
                {
                    return;
                }
                let Some(index) = Self::next_index(&state) else {
                    return;
                };
                let entry = state.pending.remove(index);
                state.running.insert(entry.seq, entry.job.clone());
                (entry.job, entry.seq)
            };

            tracing::debug!(seq, "job admitted");
            let scheduler = self.clone();
            self.runtime.spawn(async move {
                job.run().await;
                scheduler.finish(seq);
            });
        }
    }

    fn finish(&self, seq: u64) {
        self.lock().running.remove(&seq);
        self.pump();
    }

    /// Pick the next pending job: highest tier first, then the configured
    /// FIFO/LIFO rule among that tier's entries.
    fn next_index(state: &SchedulerState) -> Option<usize> {
        let top = state.pending.iter().map(|p| p.priority).max()?;
        let candidates = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.priority == top);
        let chosen = match state.execution_order {
            ExecutionOrder::Fifo => candidates.min_by_key(|(_, p)| p.seq),
            ExecutionOrder::Lifo => candidates.max_by_key(|(_, p)| p.seq),
        };
        chosen.map(|(index, _)| index)
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
