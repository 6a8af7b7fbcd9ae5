//! The task monad.
//!
//! A [`Par`] value is a plan of computation, encoded in
//! continuation-passing style: running it hands the eventual value to a
//! continuation, which the scheduler may invoke on any worker. Within a
//! task operations are sequential; suspension occurs only at [`get`] on
//! an empty cell, at task completion, and at the enqueue points inside
//! [`fork`]/[`spark`]/[`push_to`] (the current task continues; the new
//! work is just enqueued).
//!
//! Errors inside a task (DoublePut, RegistryMiss, ...) terminate that
//! task and, absent a fault-tolerance layer, abort the whole
//! computation with the error tagged by the emitting node.

use crate::cell::{wake_waiters, GIVar, IVar};
use crate::closure::{spawn_label, NetData, ParClosure, TaskClosure};
use crate::comm::envelope::Msg;
use crate::error::Error;
use crate::node::{self, NodeId};
use crate::sched::{RtState, Task};
use crate::util::codec;
use std::sync::Arc;

/// A suspended continuation, resumed with the produced value.
pub(crate) type Cont<T> = Box<dyn FnOnce(&Arc<RtState>, T) + Send>;

/// A plan of computation executed by the scheduler.
pub struct Par<T> {
    run: Box<dyn FnOnce(&Arc<RtState>, Cont<T>) + Send>,
}

impl<T: Send + 'static> Par<T> {
    pub(crate) fn new(f: impl FnOnce(&Arc<RtState>, Cont<T>) + Send + 'static) -> Self {
        Self { run: Box::new(f) }
    }

    /// A plan that immediately produces `v`.
    #[must_use]
    pub fn done(v: T) -> Self {
        Self::new(move |rt, k| k(rt, v))
    }

    /// A plan that computes `f()` when executed.
    #[must_use]
    pub fn lazy(f: impl FnOnce() -> T + Send + 'static) -> Self {
        Self::new(move |rt, k| k(rt, f()))
    }

    /// A plan that aborts the computation with `e`.
    #[must_use]
    pub fn fail(e: Error) -> Self {
        Self::new(move |rt, _k| rt.fatal(e))
    }

    /// Monadic sequencing: run `self`, then the plan `f` builds from
    /// its value.
    #[must_use]
    pub fn then<U: Send + 'static>(
        self,
        f: impl FnOnce(T) -> Par<U> + Send + 'static,
    ) -> Par<U> {
        Par::new(move |rt, k| {
            (self.run)(
                rt,
                Box::new(move |rt2: &Arc<RtState>, v: T| {
                    let next = f(v);
                    (next.run)(rt2, k);
                }),
            );
        })
    }

    /// Functorial map.
    #[must_use]
    pub fn map<U: Send + 'static>(self, f: impl FnOnce(T) -> U + Send + 'static) -> Par<U> {
        self.then(move |v| Par::done(f(v)))
    }

    /// Lifts a fallible computation; an `Err` aborts the computation.
    #[must_use]
    pub fn try_then<U: Send + 'static>(
        self,
        f: impl FnOnce(T) -> crate::error::Result<Par<U>> + Send + 'static,
    ) -> Par<U> {
        self.then(move |v| match f(v) {
            Ok(p) => p,
            Err(e) => Par::fail(e),
        })
    }

    pub(crate) fn run(self, rt: &Arc<RtState>, k: Cont<T>) {
        (self.run)(rt, k);
    }
}

impl Par<()> {
    /// Runs a `Par<()>` plan to completion-or-suspension, discarding
    /// the unit result.
    pub(crate) fn execute(self, rt: &Arc<RtState>) {
        self.run(rt, Box::new(|_, ()| {}));
    }
}

/// Runs a plan lifted from a fallible constructor.
pub(crate) fn from_result<T: Send + 'static>(r: crate::error::Result<Par<T>>) -> Par<T> {
    match r {
        Ok(p) => p,
        Err(e) => Par::fail(e),
    }
}

/// Pushes a subsidiary task onto the current worker's deque; the
/// current task continues.
#[must_use]
pub fn fork(p: Par<()>) -> Par<()> {
    Par::new(move |rt, k| {
        rt.fork_local(Task::new(move |rt| p.execute(rt)));
        k(rt, ());
    })
}

/// Places a task closure in the node-wide spark pool, where any node
/// may steal it.
#[must_use]
pub fn spark(tc: TaskClosure) -> Par<()> {
    Par::new(move |rt, k| {
        rt.add_spark(tc);
        k(rt, ());
    })
}

/// Like [`spark`], but registers a recovery record first: if the spark
/// is stolen by a node that subsequently fails, it is re-sparked here.
#[must_use]
pub fn spark_supervised(tc: TaskClosure) -> Par<()> {
    Par::new(move |rt, k| {
        rt.add_spark(tc.supervised());
        k(rt, ());
    })
}

/// Eager placement: ships the task to `node` via EXECUTE; the target
/// always accepts and forks it.
#[must_use]
pub fn push_to(tc: TaskClosure, target: NodeId) -> Par<()> {
    Par::new(move |rt, k| match rt.push(&target, tc) {
        Ok(()) => k(rt, ()),
        Err(e) => rt.fatal(e),
    })
}

/// Allocates an Empty cell.
#[must_use]
pub fn new_ivar<T: Clone + Send + 'static>() -> Par<Arc<IVar<T>>> {
    Par::lazy(IVar::new)
}

/// Reads a cell, suspending the current task while it is Empty.
///
/// The continuation is rescheduled rather than run inline, so a chain
/// of gets cannot grow the stack.
#[must_use]
pub fn get<T: Clone + Send + 'static>(iv: Arc<IVar<T>>) -> Par<T> {
    Par::new(move |rt, k| {
        if let Some((v, k)) = iv.read_or_wait(k) {
            rt.schedule(Task::new(move |rt| k(rt, v)));
        }
    })
}

/// Writes a cell, waking all blocked readers. A second write aborts
/// with DoublePut.
#[must_use]
pub fn put<T: Clone + Send + 'static>(iv: Arc<IVar<T>>, v: T) -> Par<()> {
    Par::new(move |rt, k| match iv.try_put(v.clone()) {
        Ok(waiters) => {
            wake_waiters(rt, waiters, &v);
            k(rt, ());
        }
        Err(e) => rt.fatal(e),
    })
}

/// Registers a local cell in the table of globalised cells and returns
/// its global handle.
#[must_use]
pub fn glob<T: NetData>(iv: Arc<IVar<T>>) -> Par<GIVar<T>> {
    Par::new(move |rt, k| match rt.globals().glob(&iv) {
        Ok(gv) => k(rt, gv),
        Err(e) => rt.fatal(e),
    })
}

/// Writes a value through a global handle: a local put when the owner
/// is this node, an RPUT message otherwise.
#[must_use]
pub fn rput<T: NetData>(gv: GIVar<T>, v: T) -> Par<()> {
    Par::new(move |rt, k| {
        let local = node::try_my_node().as_ref() == Some(gv.owner());
        let res = if local {
            rt.globals().fulfill_local(rt, gv.slot(), v)
        } else {
            codec::encode(&v).and_then(|bytes| {
                rt.send(
                    gv.owner(),
                    Msg::RPut {
                        slot: gv.slot(),
                        bytes,
                    },
                )
            })
        };
        match res {
            Ok(()) => k(rt, ()),
            Err(e) => rt.fatal(e),
        }
    })
}

/// Sparks a plan closure and returns the cell its result will arrive
/// in: allocate, globalise, spark the write-back wrapper.
#[must_use]
pub fn spawn<T: NetData>(pc: ParClosure<T>) -> Par<Arc<IVar<T>>> {
    Par::new(move |rt, k| match spawn_task(rt, &pc) {
        Ok((iv, tc)) => {
            rt.add_spark(tc);
            k(rt, iv);
        }
        Err(e) => rt.fatal(e),
    })
}

/// Like [`spawn`], but places the work on `target` eagerly.
#[must_use]
pub fn spawn_at<T: NetData>(pc: ParClosure<T>, target: NodeId) -> Par<Arc<IVar<T>>> {
    Par::new(move |rt, k| {
        let res = spawn_task(rt, &pc).and_then(|(iv, tc)| {
            rt.push(&target, tc)?;
            Ok(iv)
        });
        match res {
            Ok(iv) => k(rt, iv),
            Err(e) => rt.fatal(e),
        }
    })
}

fn spawn_task<T: NetData>(
    rt: &Arc<RtState>,
    pc: &ParClosure<T>,
) -> crate::error::Result<(Arc<IVar<T>>, TaskClosure)> {
    let iv = IVar::new();
    let gv = rt.globals().glob(&iv)?;
    let payload = codec::encode(&(pc, &gv))?;
    Ok((iv, TaskClosure::new(spawn_label::<T>(), payload)))
}

/// Runs the plans one after another, collecting their results in
/// order.
#[must_use]
pub fn sequence<T: Send + 'static>(plans: Vec<Par<T>>) -> Par<Vec<T>> {
    fn go<T: Send + 'static>(
        mut rest: std::vec::IntoIter<Par<T>>,
        mut acc: Vec<T>,
    ) -> Par<Vec<T>> {
        match rest.next() {
            None => Par::done(acc),
            Some(p) => p.then(move |v| {
                acc.push(v);
                go(rest, acc)
            }),
        }
    }
    go(plans.into_iter(), Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn done_then_map_compose() {
        test_support::init();
        let v = test_support::run(Par::done(20_i64).map(|n| n + 1).then(|n| Par::done(n * 2)))
            .expect("run");
        assert_eq!(v, 42);
    }

    #[test]
    fn fork_runs_the_subsidiary_task() {
        test_support::init();
        let iv: Arc<IVar<i64>> = IVar::new();
        let iv2 = Arc::clone(&iv);
        let plan = fork(put(iv2, 5)).then(move |()| get(iv));
        assert_eq!(test_support::run(plan).expect("run"), 5);
    }

    #[test]
    fn get_blocks_until_put() {
        test_support::init();
        let iv: Arc<IVar<String>> = IVar::new();
        let reader = get(Arc::clone(&iv));
        let writer = put(iv, "ready".to_owned());
        // Fork the writer after the reader has been set up; the reader
        // must block, then be woken by the put.
        let plan = fork(writer).then(move |()| reader);
        assert_eq!(test_support::run(plan).expect("run"), "ready");
    }

    #[test]
    fn double_put_aborts_the_computation() {
        test_support::init();
        let iv: Arc<IVar<i64>> = IVar::new();
        let iv2 = Arc::clone(&iv);
        let plan = put(Arc::clone(&iv), 1).then(move |()| put(iv2, 2)).map(|()| 0_i64);
        let err = test_support::run(plan).expect_err("second put must abort");
        assert_eq!(err.kind(), crate::ErrorKind::DoublePut);
    }

    #[test]
    fn sequence_preserves_order() {
        test_support::init();
        let plans = (0..10_i64).map(Par::done).collect();
        let v = test_support::run(sequence(plans)).expect("run");
        assert_eq!(v, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn spawn_writes_back_through_the_globalised_cell() {
        test_support::init();
        let pc = test_support::square_par_fun().bind(&6_i64).expect("bind");
        let plan = spawn(pc).then(get);
        assert_eq!(test_support::run(plan).expect("run"), 36);
    }
}
