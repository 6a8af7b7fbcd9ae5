//! Runtime startup, the run loop, and orderly shutdown.
//!
//! Startup sequence: every node parses its configuration and builds
//! the static table identically (user registrations, then
//! [`Runtime::start`] seals it); nodes connect into a full mesh; the
//! main node publishes the node list (main first); user code runs on
//! the main node inside [`Runtime::run_par_io`] while the other nodes
//! sit in [`Runtime::serve`] until SHUTDOWN.
//!
//! Termination is a distributed quiescence check rooted at the main
//! node: once the root plan has produced its value, QUIESCE tokens
//! circulate the node ring accumulating message counters and idleness;
//! two identical consecutive all-idle rounds mean no work and no
//! messages are in flight anywhere, and SHUTDOWN is broadcast.

use crate::comm::envelope::{Msg, QuiesceProbe};
use crate::comm::transport::Comm;
use crate::config::RuntimeConfig;
use crate::debug::{self, DebugLevel};
use crate::debug_at;
use crate::error::{Error, ErrorKind, Result};
use crate::node::{self, NodeId};
use crate::par::Par;
use crate::registry;
use crate::sched::{worker, RtState, Task};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// One node's runtime: the worker pool, spark pool, and (in a
/// multi-node cluster) the transport.
pub struct Runtime {
    rt: Arc<RtState>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Seals the static table and starts this node.
    ///
    /// All registrations ([`crate::closure::provide`] and friends) must
    /// have happened before this call, identically on every node.
    pub fn start(mut config: RuntimeConfig) -> Result<Self> {
        config.normalize();
        debug::set_level(config.debug_level);
        registry::seal();

        let me = NodeId::new(config.listen.clone());
        let rt = RtState::new(config.clone());

        if config.is_single_node() {
            node::set_my_node(me.clone())?;
            node::set_all_nodes(vec![me])?;
        } else {
            let comm = Comm::start(&rt, &config)?;
            let _ = rt.comm.set(comm);
            node::set_my_node(me.clone())?;
            if config.main_node {
                let mut all = vec![me];
                all.extend(config.peers.iter().cloned().map(NodeId::new));
                node::set_all_nodes(all.clone())?;
                if let Some(comm) = rt.comm.get() {
                    comm.broadcast(&rt, Msg::Nodes { nodes: all });
                }
            } else {
                wait_for_node_list()?;
            }
        }

        if debug::enabled(DebugLevel::TableDump) && node::is_main().unwrap_or(false) {
            for label in registry::dump() {
                debug::emit(DebugLevel::TableDump, &format!("static table: {label}"));
            }
        }

        let workers = worker::spawn_workers(&rt);
        Ok(Self { rt, workers })
    }

    /// Executes a plan on this node and returns its value, or the
    /// first fatal error of the computation.
    pub fn run_par_io<T: Send + 'static>(&self, p: Par<T>) -> Result<T> {
        let (tx, rx) = mpsc::channel();
        let root = p.then(move |v| {
            let _ = tx.send(v);
            Par::done(())
        });
        self.rt.schedule(Task::new(move |rt| root.execute(rt)));
        loop {
            if let Some(e) = self.rt.current_fatal() {
                return Err(e);
            }
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(v) => return Ok(v),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.rt.is_shutdown() {
                        return Err(self
                            .rt
                            .current_fatal()
                            .unwrap_or_else(|| Error::new(ErrorKind::Shutdown)));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(self
                        .rt
                        .current_fatal()
                        .unwrap_or_else(|| Error::new(ErrorKind::Internal)
                            .with_context("root plan dropped its result")));
                }
            }
        }
    }

    /// Non-main nodes: handle incoming work until SHUTDOWN, then
    /// report how the computation ended.
    pub fn serve(self) -> Result<()> {
        while !self.rt.is_shutdown() {
            thread::sleep(Duration::from_millis(20));
        }
        self.finish(false)
    }

    /// Orderly shutdown: drive the cluster to quiescence, broadcast
    /// SHUTDOWN, stop the workers, and report the outcome.
    pub fn shutdown(self) -> Result<()> {
        self.finish(true)
    }

    fn finish(mut self, quiesce: bool) -> Result<()> {
        if quiesce && !self.rt.is_shutdown() {
            self.wait_quiescent()?;
        }
        self.rt.begin_shutdown(true);
        for w in std::mem::take(&mut self.workers) {
            let _ = w.join();
        }
        if let Some(comm) = self.rt.comm.get() {
            comm.close_all();
        }
        self.rt.emit_stats();

        if let Some(e) = self.rt.current_fatal() {
            return Err(e);
        }
        let leftover = self.rt.globals().dump();
        if leftover.is_empty() {
            Ok(())
        } else {
            debug::emit_error(&format!(
                "termination with {} unfilled globalised cells: slots {leftover:?}",
                leftover.len()
            ));
            Err(Error::new(ErrorKind::TerminationViolation)
                .with_context(format!("{} globalised cells never written", leftover.len())))
        }
    }

    /// Blocks until the whole cluster is quiescent.
    fn wait_quiescent(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(60);
        let Ok(all) = node::all_nodes() else {
            return Ok(());
        };

        if all.len() == 1 {
            while !self.rt.local_idle() {
                if Instant::now() >= deadline {
                    return Err(Error::new(ErrorKind::TerminationViolation)
                        .with_context("node never went idle"));
                }
                if self.rt.is_shutdown() {
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(5));
            }
            return Ok(());
        }

        // Ring probe rooted here (the main node): two identical
        // consecutive all-idle rounds with matching counters mean the
        // cluster is quiet.
        let me = node::my_node()?;
        let (tx, rx) = mpsc::channel::<QuiesceProbe>();
        *self.rt.quiesce_tx.lock() = Some(tx);
        let mut last: Option<QuiesceProbe> = None;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::new(ErrorKind::TerminationViolation)
                    .with_context("cluster never became quiescent"));
            }
            if self.rt.is_shutdown() {
                return Ok(());
            }
            let probe = QuiesceProbe {
                sent: self.rt.stats.msgs_out.load(Ordering::SeqCst),
                received: self.rt.stats.msgs_in.load(Ordering::SeqCst),
                all_idle: self.rt.local_idle(),
            };
            let next = crate::comm::ring_next(&all, &me);
            self.rt.send(&next, Msg::Quiesce { probe })?;
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(completed) => {
                    let quiet = completed.all_idle && completed.sent == completed.received;
                    if quiet && last == Some(completed) {
                        debug_at!(DebugLevel::Stats, "cluster quiescent: {completed:?}");
                        *self.rt.quiesce_tx.lock() = None;
                        return Ok(());
                    }
                    last = Some(completed);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    last = None;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_context("quiescence channel dropped"));
                }
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// A snapshot of this node's scheduling counters.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            sparks_created: self.rt.stats.sparks_created.load(Ordering::Relaxed),
            sparks_converted: self.rt.stats.sparks_converted.load(Ordering::Relaxed),
            schedules_served: self.rt.stats.schedules_served.load(Ordering::Relaxed),
            msgs_out: self.rt.stats.msgs_out.load(Ordering::Relaxed),
            msgs_in: self.rt.stats.msgs_in.load(Ordering::Relaxed),
        }
    }

}

/// Scheduling counters of one node, as reported at debug level 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Sparks placed in this node's pool.
    pub sparks_created: u64,
    /// Sparks this node converted into tasks.
    pub sparks_converted: u64,
    /// FISH requests served with a SCHEDULE.
    pub schedules_served: u64,
    /// Work-bearing messages sent.
    pub msgs_out: u64,
    /// Work-bearing messages received.
    pub msgs_in: u64,
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.rt.begin_shutdown(true);
        if let Some(comm) = self.rt.comm.get() {
            comm.close_all();
        }
        for w in std::mem::take(&mut self.workers) {
            let _ = w.join();
        }
    }
}

fn wait_for_node_list() -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !node::nodes_published() {
        if Instant::now() >= deadline {
            return Err(Error::new(ErrorKind::PeerUnreachable)
                .with_context("main node never published the node list"));
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}
