//! Global injection queue.
//!
//! A thread-safe unbounded queue for tasks that do not belong to any
//! worker's deque: message-handler tasks, woken cell readers, and work
//! injected from outside the worker pool.

use crate::sched::Task;
use crossbeam_queue::SegQueue;

/// The node-global task queue.
#[derive(Default)]
pub(crate) struct GlobalQueue {
    inner: SegQueue<Task>,
}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        self.inner.push(task);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.inner.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fifo_ordering() {
        let q = GlobalQueue::new();
        let seen = Arc::new(AtomicU32::new(0));
        for i in 1..=3_u32 {
            let seen = Arc::clone(&seen);
            q.push(Task::new(move |_| {
                seen.store(i, Ordering::SeqCst);
            }));
        }
        let rt = crate::test_support::bare_rt();
        q.pop().expect("first").run(&rt);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        q.pop().expect("second").run(&rt);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(!q.is_empty());
        q.pop().expect("third").run(&rt);
        assert!(q.is_empty());
    }
}
