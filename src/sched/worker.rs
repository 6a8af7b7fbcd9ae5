//! The worker loop.
//!
//! A worker drains, in order: its own deque (LIFO), the global queue,
//! the spark pool (converting one spark), and its siblings' deques.
//! With nothing left locally it fishes a random peer for a spark and
//! parks; after a fruitless round the park timeout doubles, up to eight
//! times the configured base, and resets as soon as work appears.

use crate::comm::envelope::Msg;
use crate::debug_at;
use crate::node;
use crate::sched::local_queue::{LocalQueue, Stealer};
use crate::sched::{RtState, Task, WorkerHandle};
use crate::util::XorShift64;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

thread_local! {
    static CURRENT: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

/// The deque of the worker running on this thread, if any.
pub(crate) fn current_queue() -> Option<LocalQueue> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Starts the worker pool and installs its handles into `rt`.
pub(crate) fn spawn_workers(rt: &Arc<RtState>) -> Vec<thread::JoinHandle<()>> {
    let n = rt.config.num_workers;
    let queues: Vec<LocalQueue> = (0..n).map(|_| LocalQueue::new()).collect();
    let stealers: Vec<Stealer> = queues.iter().map(LocalQueue::stealer).collect();

    {
        let mut handles = rt.handles.write();
        for queue in &queues {
            handles.push(WorkerHandle {
                queue: queue.clone(),
                parker: Parker::new(),
            });
        }
    }

    queues
        .into_iter()
        .enumerate()
        .map(|(id, queue)| {
            let rt = Arc::clone(rt);
            let siblings: Vec<Stealer> = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != id)
                .map(|(_, s)| s.clone())
                .collect();
            thread::Builder::new()
                .name(format!("parsteal-worker-{id}"))
                .spawn(move || {
                    let parker = rt.handles.read()[id].parker.clone();
                    Worker {
                        id,
                        rt,
                        local: queue,
                        siblings,
                        parker,
                        rng: XorShift64::new(0x5eed_0000 + id as u64 + 1),
                    }
                    .run_loop();
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}

struct Worker {
    id: usize,
    rt: Arc<RtState>,
    local: LocalQueue,
    siblings: Vec<Stealer>,
    parker: Parker,
    rng: XorShift64,
}

impl Worker {
    fn run_loop(mut self) {
        CURRENT.with(|c| *c.borrow_mut() = Some(self.local.clone()));
        let base = self.rt.config.fish_backoff;
        let mut backoff = base;

        while !self.rt.is_shutdown() {
            if let Some(task) = self.find_work() {
                task.run(&self.rt);
                backoff = base;
                continue;
            }

            // Nothing local: fish a random peer, then park. The park
            // timeout doubles after each fruitless round (jittered), so
            // a cluster out of work stops hammering its peers.
            self.rt.idle_workers.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let fishing = self.try_fish();
            if !self.rt.is_shutdown() {
                let timeout = if fishing {
                    let jitter = self.rng.next_range(0, 1 + backoff.as_micros() as u64);
                    backoff + Duration::from_micros(jitter)
                } else {
                    // No peers to fish: sleep until new local work
                    // unparks us.
                    Duration::from_millis(50)
                };
                self.parker.park_timeout(timeout);
            }
            self.rt.idle_workers.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            backoff = (backoff * 2).min(base * 8);
        }
        debug_at!(
            crate::debug::DebugLevel::Sparks,
            "worker {} stopping",
            self.id
        );
    }

    fn find_work(&mut self) -> Option<Task> {
        if let Some(task) = self.local.pop() {
            return Some(task);
        }
        if let Some(task) = self.rt.injector.pop() {
            return Some(task);
        }
        if let Some(spark) = self.rt.spark_pool.pop_local() {
            return Some(Task::new(move |rt| rt.convert_spark(spark)));
        }
        self.steal_from_sibling()
    }

    /// Tries each sibling's deque, starting at a random index.
    fn steal_from_sibling(&mut self) -> Option<Task> {
        if self.siblings.is_empty() {
            return None;
        }
        let len = self.siblings.len();
        let start = self.rng.next_usize(len);
        for i in 0..len {
            if let Some(task) = self.siblings[(start + i) % len].steal() {
                return Some(task);
            }
        }
        None
    }

    /// Sends FISH to a random peer. Each worker keeps at most
    /// `max_fish` of its own fishes in flight.
    fn try_fish(&mut self) -> bool {
        let Some(me) = node::try_my_node() else {
            return false;
        };
        let Ok(all) = node::all_nodes() else {
            return false;
        };
        let peers: Vec<_> = all.into_iter().filter(|n| *n != me).collect();
        if peers.is_empty() || self.rt.comm.get().is_none() {
            return false;
        }
        if !self.rt.claim_fish(self.id) {
            return false;
        }
        let victim = peers[self.rng.next_usize(peers.len())].clone();
        match self.rt.send(&victim, Msg::Fish { fisher: me }) {
            Ok(()) => true,
            Err(_) => {
                self.rt.release_fish(self.id);
                false
            }
        }
    }
}

/// A mechanism for parking and unparking one worker.
#[derive(Clone)]
pub(crate) struct Parker {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Parks the current thread until notified or the timeout elapses.
    pub(crate) fn park_timeout(&self, duration: Duration) {
        let (lock, cvar) = &*self.inner;
        let mut notified = lock.lock();
        if !*notified {
            let _ = cvar.wait_for(&mut notified, duration);
        }
        *notified = false;
    }

    /// Unparks the worker; a pending notification makes the next park
    /// return immediately.
    pub(crate) fn unpark(&self) {
        let (lock, cvar) = &*self.inner;
        {
            let mut notified = lock.lock();
            *notified = true;
        }
        cvar.notify_one();
    }
}
