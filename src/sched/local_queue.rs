//! Per-worker local queue.
//!
//! A lock-based deque: LIFO push/pop for the owning worker, FIFO steal
//! for sibling workers on the same node. Inter-node stealing goes
//! through the spark pool instead; this queue never crosses the wire.

use crate::sched::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A local task queue owned by one worker.
#[derive(Clone)]
pub(crate) struct LocalQueue {
    inner: Arc<Mutex<VecDeque<Task>>>,
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Pushes a task (owner end).
    pub(crate) fn push(&self, task: Task) {
        self.inner.lock().push_back(task);
    }

    /// Pops the most recently pushed task (owner end, LIFO).
    pub(crate) fn pop(&self) -> Option<Task> {
        self.inner.lock().pop_back()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Creates a stealer handle for sibling workers.
    pub(crate) fn stealer(&self) -> Stealer {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Steals from the opposite end of a sibling's queue (FIFO).
#[derive(Clone)]
pub(crate) struct Stealer {
    inner: Arc<Mutex<VecDeque<Task>>>,
}

impl Stealer {
    pub(crate) fn steal(&self) -> Option<Task> {
        self.inner.lock().pop_front()
    }
}
