//! The scheduler.
//!
//! Each node runs a pool of worker threads. A worker owns a local deque
//! of tasks; the node carries a global injection queue (message
//! handlers, woken readers) and the spark pool of stealable work. An
//! idle worker looks, in order, at its deque, the global queue, the
//! spark pool (converting a spark to a task), its siblings' deques, and
//! finally fishes a random peer node for a spark.
//!
//! [`RtState`] is the per-node runtime state shared by workers, message
//! handlers, and the embedding [`crate::runtime::Runtime`].

pub(crate) mod global_queue;
pub(crate) mod local_queue;
pub(crate) mod spark_pool;
pub(crate) mod worker;

use crate::cell::GlobalTable;
use crate::closure::TaskClosure;
use crate::comm::envelope::Msg;
use crate::comm::transport::Comm;
use crate::config::RuntimeConfig;
use crate::debug::DebugLevel;
use crate::debug_at;
use crate::error::{Error, ErrorKind, Result};
use crate::node::{self, NodeId};
use global_queue::GlobalQueue;
use parking_lot::{Mutex, RwLock};
use spark_pool::SparkPool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use worker::Parker;

/// A ready unit of work: one resumption of a task's continuation.
pub(crate) struct Task(Box<dyn FnOnce(&Arc<RtState>) + Send>);

impl Task {
    pub(crate) fn new(f: impl FnOnce(&Arc<RtState>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub(crate) fn run(self, rt: &Arc<RtState>) {
        (self.0)(rt);
    }
}

/// Counters reported in the final stats line and carried by
/// quiescence probes.
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) sparks_created: AtomicU64,
    pub(crate) sparks_converted: AtomicU64,
    pub(crate) schedules_served: AtomicU64,
    pub(crate) msgs_out: AtomicU64,
    pub(crate) msgs_in: AtomicU64,
}

pub(crate) struct WorkerHandle {
    pub(crate) queue: local_queue::LocalQueue,
    pub(crate) parker: Parker,
}

/// Per-node runtime state.
pub(crate) struct RtState {
    pub(crate) config: RuntimeConfig,
    pub(crate) injector: GlobalQueue,
    pub(crate) spark_pool: SparkPool,
    globals: GlobalTable,
    pub(crate) handles: RwLock<Vec<WorkerHandle>>,
    pub(crate) comm: OnceLock<Arc<Comm>>,
    fatal: Mutex<Option<Error>>,
    shutdown: AtomicBool,
    pub(crate) idle_workers: AtomicUsize,
    pending_fishes: Mutex<VecDeque<usize>>,
    dispatched: Mutex<Vec<(NodeId, TaskClosure)>>,
    pub(crate) stats: Stats,
    pub(crate) quiesce_tx: Mutex<Option<mpsc::Sender<crate::comm::envelope::QuiesceProbe>>>,
}

impl RtState {
    pub(crate) fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            injector: GlobalQueue::new(),
            spark_pool: SparkPool::new(),
            globals: GlobalTable::new(),
            handles: RwLock::new(Vec::new()),
            comm: OnceLock::new(),
            fatal: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            idle_workers: AtomicUsize::new(0),
            pending_fishes: Mutex::new(VecDeque::new()),
            dispatched: Mutex::new(Vec::new()),
            stats: Stats::default(),
            quiesce_tx: Mutex::new(None),
        })
    }

    pub(crate) fn globals(&self) -> &GlobalTable {
        &self.globals
    }

    /// Enqueues a task on the global queue and wakes a worker.
    pub(crate) fn schedule(&self, task: Task) {
        self.injector.push(task);
        self.unpark_one();
    }

    /// Enqueues a task on the current worker's deque, or globally when
    /// called from outside the pool.
    pub(crate) fn fork_local(&self, task: Task) {
        if let Some(queue) = worker::current_queue() {
            queue.push(task);
            self.unpark_one();
        } else {
            self.schedule(task);
        }
    }

    /// Places a spark in the pool (debug level 3).
    pub(crate) fn add_spark(&self, spark: TaskClosure) {
        self.stats.sparks_created.fetch_add(1, Ordering::Relaxed);
        debug_at!(DebugLevel::Sparks, "spark created: {}", spark.label());
        self.spark_pool.push(spark);
        self.unpark_one();
    }

    /// Converts a spark into a ready task (debug level 3) and runs it.
    pub(crate) fn convert_spark(self: &Arc<Self>, spark: TaskClosure) {
        self.stats.sparks_converted.fetch_add(1, Ordering::Relaxed);
        debug_at!(DebugLevel::Sparks, "spark converted: {}", spark.label());
        self.run_task_closure(spark);
    }

    /// Materializes and runs a shipped task closure.
    pub(crate) fn run_task_closure(self: &Arc<Self>, tc: TaskClosure) {
        match tc.to_par() {
            Ok(p) => p.execute(self),
            Err(e) => self.fatal(e),
        }
    }

    /// Delivers a task closure to `target`: forked locally when the
    /// target is this node, an EXECUTE message otherwise.
    pub(crate) fn push(self: &Arc<Self>, target: &NodeId, tc: TaskClosure) -> Result<()> {
        if node::try_my_node().as_ref() == Some(target) {
            self.schedule(Task::new(move |rt| rt.run_task_closure(tc)));
            Ok(())
        } else {
            self.send(target, Msg::Execute { task: tc })
        }
    }

    /// Sends a message to a peer (or loops it back to this node).
    pub(crate) fn send(self: &Arc<Self>, to: &NodeId, msg: Msg) -> Result<()> {
        if msg.counted() {
            self.stats.msgs_out.fetch_add(1, Ordering::Relaxed);
        }
        debug_at!(DebugLevel::MsgOut, "-> {to}: {}", msg.describe());
        if node::try_my_node().as_ref() == Some(to) {
            let me = to.clone();
            let rt = Arc::clone(self);
            crate::comm::deliver(&rt, &me, msg);
            return Ok(());
        }
        let comm = self.comm.get().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_context(format!("no transport, cannot reach {to}"))
        })?;
        comm.send(self, to, msg)
    }

    /// Records the first fatal error and begins shutdown.
    pub(crate) fn fatal(self: &Arc<Self>, e: Error) {
        {
            let mut slot = self.fatal.lock();
            if slot.is_none() {
                crate::debug::emit_error(&format!("fatal: {e}"));
                *slot = Some(e);
            }
        }
        self.begin_shutdown(true);
    }

    pub(crate) fn current_fatal(&self) -> Option<Error> {
        self.fatal.lock().clone()
    }

    /// Sets the shutdown flag and wakes everything; optionally tells
    /// the peers to do the same.
    ///
    /// The broadcast is enqueued before the flag flips so the writer
    /// threads still deliver it on their way out.
    pub(crate) fn begin_shutdown(self: &Arc<Self>, broadcast: bool) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if broadcast {
            if let Some(comm) = self.comm.get() {
                comm.broadcast(self, Msg::Shutdown);
            }
        }
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.unpark_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// True when every worker is parked and no local work remains.
    pub(crate) fn local_idle(&self) -> bool {
        self.idle_workers.load(Ordering::SeqCst) == self.config.num_workers
            && self.spark_pool.is_empty()
            && self.injector.is_empty()
            && self.handles.read().iter().all(|h| h.queue.is_empty())
    }

    // With a small pool, waking everyone on new work is cheaper than
    // tracking which worker sleeps.
    fn unpark_one(&self) {
        self.unpark_all();
    }

    pub(crate) fn unpark_all(&self) {
        for h in self.handles.read().iter() {
            h.parker.unpark();
        }
    }

    // === Fishing accounting ===
    //
    // Each worker holds at most `max_fish` fishes in flight. Replies
    // carry no worker identity, so claims live in a FIFO of worker
    // ids: victims serve FISHes in receipt order, and every SCHEDULE
    // or NOWORK resolves the oldest claim.

    /// Claims an outstanding-fish slot for `worker`.
    pub(crate) fn claim_fish(&self, worker: usize) -> bool {
        let mut pending = self.pending_fishes.lock();
        let held = pending.iter().filter(|w| **w == worker).count() as u32;
        if held >= self.config.max_fish {
            return false;
        }
        pending.push_back(worker);
        true
    }

    /// Withdraws `worker`'s newest claim after a failed FISH send.
    pub(crate) fn release_fish(&self, worker: usize) {
        let mut pending = self.pending_fishes.lock();
        if let Some(pos) = pending.iter().rposition(|w| *w == worker) {
            pending.remove(pos);
        }
    }

    /// A SCHEDULE or NOWORK reply resolves the oldest outstanding fish.
    pub(crate) fn note_fish_reply(&self) {
        self.pending_fishes.lock().pop_front();
    }

    // === Fault-model hooks ===

    /// Records a supervised spark handed to `fisher` by SCHEDULE.
    pub(crate) fn record_dispatch(&self, fisher: &NodeId, spark: TaskClosure) {
        self.dispatched.lock().push((fisher.clone(), spark));
    }

    /// Removes and returns the records for sparks in flight on a
    /// failed node; those sparks are eligible for re-spark here.
    pub(crate) fn recover_dispatched(&self, failed: &NodeId) -> Vec<TaskClosure> {
        let mut ledger = self.dispatched.lock();
        let mut recovered = Vec::new();
        ledger.retain(|(n, tc)| {
            if n == failed {
                recovered.push(tc.clone());
                false
            } else {
                true
            }
        });
        recovered
    }

    /// Handles a detected peer failure: re-sparks supervised work that
    /// was in flight there, then (absent a fault-tolerance layer)
    /// aborts the computation.
    pub(crate) fn peer_failed(self: &Arc<Self>, peer: &NodeId) {
        if self.is_shutdown() {
            return;
        }
        debug_at!(DebugLevel::Failure, "node failed: {peer}");
        for spark in self.recover_dispatched(peer) {
            debug_at!(DebugLevel::Failure, "re-spark after failure of {peer}");
            self.add_spark(spark);
        }
        self.fatal(
            Error::new(ErrorKind::PeerUnreachable).with_context(format!("peer {peer} failed")),
        );
    }

    /// Emits the final stats line (debug level 1).
    pub(crate) fn emit_stats(&self) {
        debug_at!(
            DebugLevel::Stats,
            "stats: sparks created={} converted={} pending={} schedules served={} msgs out={} in={} cells outstanding={}",
            self.stats.sparks_created.load(Ordering::Relaxed),
            self.stats.sparks_converted.load(Ordering::Relaxed),
            self.spark_pool.len(),
            self.stats.schedules_served.load(Ordering::Relaxed),
            self.stats.msgs_out.load(Ordering::Relaxed),
            self.stats.msgs_in.load(Ordering::Relaxed),
            self.globals.outstanding(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Label;
    use crate::test_support;

    #[test]
    fn each_worker_holds_at_most_one_fish() {
        test_support::init();
        let rt = test_support::bare_rt();
        // Default max_fish is 1 per worker: a worker with a fish in
        // flight cannot issue another, but its siblings can.
        assert!(rt.claim_fish(0));
        assert!(!rt.claim_fish(0));
        assert!(rt.claim_fish(1));
        assert!(!rt.claim_fish(1));

        // Replies resolve the oldest claim first.
        rt.note_fish_reply();
        assert!(rt.claim_fish(0));
        assert!(!rt.claim_fish(1));
        rt.note_fish_reply();
        rt.note_fish_reply();
        rt.note_fish_reply(); // extra replies must not underflow
        assert!(rt.claim_fish(0));
        assert!(rt.claim_fish(1));
    }

    #[test]
    fn failed_send_returns_the_claim() {
        test_support::init();
        let rt = test_support::bare_rt();
        assert!(rt.claim_fish(3));
        assert!(!rt.claim_fish(3));
        rt.release_fish(3);
        assert!(rt.claim_fish(3));
        // Releasing a worker with no claim is a no-op for the others.
        assert!(rt.claim_fish(4));
        rt.release_fish(5);
        assert!(!rt.claim_fish(3));
        assert!(!rt.claim_fish(4));
    }

    #[test]
    fn recovery_ledger_returns_only_the_failed_nodes_sparks() {
        test_support::init();
        let rt = test_support::bare_rt();
        let a = NodeId::new("peer-a");
        let b = NodeId::new("peer-b");
        rt.record_dispatch(&a, TaskClosure::new(Label::new("t/1"), vec![]));
        rt.record_dispatch(&b, TaskClosure::new(Label::new("t/2"), vec![]));
        rt.record_dispatch(&a, TaskClosure::new(Label::new("t/3"), vec![]));

        let recovered = rt.recover_dispatched(&a);
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().all(|tc| tc.label().as_str() != "t/2"));
        assert!(rt.recover_dispatched(&a).is_empty());
        assert_eq!(rt.recover_dispatched(&b).len(), 1);
    }
}
