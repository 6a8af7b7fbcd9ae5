//! The spark pool.
//!
//! Sparks are task closures placed here for *potential* execution:
//! local workers convert them when their deques run dry, and incoming
//! FISH requests steal them for other nodes. Local conversion takes the
//! newest spark (better locality); steals take the oldest. Access is
//! serialised; a steal transaction takes exactly one spark.

use crate::closure::TaskClosure;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// The node-wide pool of stealable sparks.
pub(crate) struct SparkPool {
    inner: Mutex<VecDeque<TaskClosure>>,
}

impl SparkPool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds a spark (local sparking or an incoming re-spark).
    pub(crate) fn push(&self, spark: TaskClosure) {
        self.inner.lock().push_back(spark);
    }

    /// Takes the newest spark for local conversion.
    pub(crate) fn pop_local(&self) -> Option<TaskClosure> {
        self.inner.lock().pop_back()
    }

    /// Atomically takes one spark for a fisher.
    pub(crate) fn steal(&self) -> Option<TaskClosure> {
        self.inner.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Label;

    fn spark(n: u8) -> TaskClosure {
        TaskClosure::new(Label::new(format!("test/spark/{n}")), vec![n])
    }

    #[test]
    fn local_conversion_is_lifo() {
        let pool = SparkPool::new();
        pool.push(spark(1));
        pool.push(spark(2));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.pop_local().unwrap().label().as_str(), "test/spark/2");
        assert_eq!(pool.pop_local().unwrap().label().as_str(), "test/spark/1");
        assert!(pool.pop_local().is_none());
    }

    #[test]
    fn steal_takes_the_oldest() {
        let pool = SparkPool::new();
        pool.push(spark(1));
        pool.push(spark(2));
        assert_eq!(pool.steal().unwrap().label().as_str(), "test/spark/1");
        assert_eq!(pool.steal().unwrap().label().as_str(), "test/spark/2");
        assert!(pool.steal().is_none());
        assert!(pool.is_empty());
    }
}
