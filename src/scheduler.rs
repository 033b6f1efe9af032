//! Deferred task queue
//!
//! Streams never emit `error`, `close`, `end` or deferred `readable`
//! notifications from inside the call that caused them. Instead they queue a
//! task here and the owner of the pipeline drives the queue:
//!
//! ```text
//!   caller ──► stream op ──► scheduler.defer(task)
//!                                   │
//!   run_turn() ◄────────────────────┘   tasks run in the order queued;
//!                                       tasks they defer wait for the
//!                                       next turn
//! ```
//!
//! In async code, spawn [`Scheduler::run`] on a `tokio::task::LocalSet` (or
//! use [`Scheduler::run_until`]); it sleeps on a `Notify` while the queue is
//! empty and yields to other local tasks between turns.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use tokio::sync::Notify;

type Task = Box<dyn FnOnce()>;

/// Shared FIFO of deferred tasks
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    queue: RefCell<VecDeque<Task>>,
    notify: Notify,
    turns: Cell<u64>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task for a later turn
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(task));
        self.inner.notify.notify_one();
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Check if no task is queued
    pub fn is_idle(&self) -> bool {
        self.inner.queue.borrow().is_empty()
    }

    /// Number of non-empty turns run so far
    pub fn turns(&self) -> u64 {
        self.inner.turns.get()
    }

    /// Run one turn: every task queued before this call, in order
    ///
    /// Returns the number of tasks run.
    pub fn run_turn(&self) -> usize {
        let batch = std::mem::take(&mut *self.inner.queue.borrow_mut());
        let count = batch.len();
        if count > 0 {
            self.inner.turns.set(self.inner.turns.get() + 1);
        }
        for task in batch {
            task();
        }
        count
    }

    /// Run turns until the queue is empty
    ///
    /// Returns the total number of tasks run. A producer that keeps
    /// scheduling work forever keeps this from returning; use
    /// [`Scheduler::run_turns`] to bound it.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let count = self.run_turn();
            if count == 0 {
                return total;
            }
            total += count;
        }
    }

    /// Run at most `max_turns` turns
    pub fn run_turns(&self, max_turns: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_turns {
            let count = self.run_turn();
            if count == 0 {
                break;
            }
            total += count;
        }
        total
    }

    /// Drive the queue forever
    ///
    /// Waits for new tasks while idle and yields between turns so other
    /// tasks on the same `LocalSet` (e.g. async hooks) make progress.
    pub async fn run(self) {
        loop {
            if self.run_turn() == 0 {
                self.inner.notify.notified().await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Drive the queue while awaiting `future`, returning its output
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        let driver = self.clone().run();
        tokio::pin!(future);
        tokio::pin!(driver);
        loop {
            tokio::select! {
                biased;
                output = &mut future => return output,
                _ = &mut driver => {}
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("turns", &self.turns())
            .finish()
    }
}
