//! Inter-node communication.
//!
//! [`envelope`] defines the message set and its wire form;
//! [`transport`] maintains the TCP full mesh. [`deliver`] is the
//! dispatch point: it turns each received envelope into a short,
//! non-blocking handler task on the scheduler. Handlers may spawn
//! tasks but never perform a blocking `get` themselves.

pub mod envelope;
pub mod transport;

use crate::debug::DebugLevel;
use crate::debug_at;
use crate::node::{self, NodeId};
use crate::sched::{RtState, Task};
use envelope::{Msg, QuiesceProbe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Dispatches one received message: counts it, logs it, and enqueues
/// its handler on the scheduler.
pub(crate) fn deliver(rt: &Arc<RtState>, from: &NodeId, msg: Msg) {
    if msg.counted() {
        rt.stats.msgs_in.fetch_add(1, Ordering::Relaxed);
    }
    debug_at!(DebugLevel::MsgIn, "<- {from}: {}", msg.describe());
    match msg {
        Msg::Fish { fisher } => {
            rt.schedule(Task::new(move |rt| handle_fish(rt, &fisher)));
        }
        Msg::Schedule { spark, .. } => {
            rt.note_fish_reply();
            rt.schedule(Task::new(move |rt| rt.convert_spark(spark)));
        }
        Msg::NoWork { .. } => {
            rt.note_fish_reply();
        }
        Msg::Execute { task } => {
            rt.schedule(Task::new(move |rt| rt.run_task_closure(task)));
        }
        Msg::RPut { slot, bytes } => {
            rt.schedule(Task::new(move |rt| {
                if let Err(e) = rt.globals().fulfill_bytes(rt, slot, &bytes) {
                    rt.fatal(e);
                }
            }));
        }
        Msg::Quiesce { probe } => {
            rt.schedule(Task::new(move |rt| handle_quiesce(rt, probe)));
        }
        Msg::Shutdown => {
            rt.begin_shutdown(false);
        }
        Msg::Heartbeat { .. } => {
            // Liveness is recorded at the transport layer for every
            // received frame; nothing further to do.
        }
        Msg::Nodes { nodes } => {
            if let Err(e) = node::set_all_nodes(nodes) {
                rt.fatal(e);
            }
        }
        Msg::Hello { node } => {
            debug_at!(DebugLevel::MsgIn, "unexpected HELLO from {node} after handshake");
        }
    }
}

/// Serves one FISH: take one spark and SCHEDULE it back, or NOWORK.
fn handle_fish(rt: &Arc<RtState>, fisher: &NodeId) {
    match rt.spark_pool.steal() {
        Some(spark) => {
            if spark.is_supervised() {
                rt.record_dispatch(fisher, spark.clone());
            }
            rt.stats.schedules_served.fetch_add(1, Ordering::Relaxed);
            let _ = rt.send(
                fisher,
                Msg::Schedule {
                    fisher: fisher.clone(),
                    spark,
                },
            );
        }
        None => {
            let _ = rt.send(
                fisher,
                Msg::NoWork {
                    fisher: fisher.clone(),
                },
            );
        }
    }
}

/// Advances a termination probe around the node ring.
///
/// Non-main nodes fold in their counters and idleness and forward to
/// the next node; the main node hands the completed probe to the
/// waiting quiescence driver.
fn handle_quiesce(rt: &Arc<RtState>, probe: QuiesceProbe) {
    let Some(me) = node::try_my_node() else {
        return;
    };
    let Ok(all) = node::all_nodes() else {
        return;
    };
    if all.first() == Some(&me) {
        if let Some(tx) = rt.quiesce_tx.lock().as_ref() {
            let _ = tx.send(probe);
        }
        return;
    }
    let merged = QuiesceProbe {
        sent: probe.sent + rt.stats.msgs_out.load(Ordering::SeqCst),
        received: probe.received + rt.stats.msgs_in.load(Ordering::SeqCst),
        all_idle: probe.all_idle && rt.local_idle(),
    };
    let next = ring_next(&all, &me);
    let _ = rt.send(&next, Msg::Quiesce { probe: merged });
}

/// The successor of `me` in the published node order, wrapping to the
/// main node.
pub(crate) fn ring_next(all: &[NodeId], me: &NodeId) -> NodeId {
    let pos = all.iter().position(|n| n == me).unwrap_or(0);
    all[(pos + 1) % all.len()].clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_next_wraps_to_main() {
        let all = vec![NodeId::new("main"), NodeId::new("b"), NodeId::new("c")];
        assert_eq!(ring_next(&all, &all[0]).as_str(), "b");
        assert_eq!(ring_next(&all, &all[1]).as_str(), "c");
        assert_eq!(ring_next(&all, &all[2]).as_str(), "main");
    }
}
