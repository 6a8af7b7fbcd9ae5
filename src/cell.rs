//! Single-assignment cells.
//!
//! An [`IVar`] transitions once from *Empty* (holding a list of blocked
//! readers) to *Full*; a second write is a protocol violation. A
//! [`GIVar`] is a globally addressable handle `(owner, slot)` referring
//! to an IVar registered in the owner node's table of globalised cells;
//! writing through it is a local put when the owner is this node, and an
//! RPUT message otherwise.

use crate::closure::NetData;
use crate::debug::DebugLevel;
use crate::debug_at;
use crate::error::{Error, ErrorKind, Result};
use crate::node::{self, NodeId};
use crate::par::Cont;
use crate::sched::{RtState, Task};
use crate::util::codec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Waiters<T> = SmallVec<[Cont<T>; 2]>;

enum IVarState<T> {
    Empty(Waiters<T>),
    Full(T),
}

/// A single-assignment cell with blocking read.
///
/// `T: Clone` because every blocked reader observes the same value.
pub struct IVar<T> {
    state: Mutex<IVarState<T>>,
}

impl<T: Clone + Send + 'static> IVar<T> {
    /// Allocates an Empty cell.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(IVarState::Empty(SmallVec::new())),
        })
    }

    /// Returns the value if the cell is Full.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        match &*self.state.lock() {
            IVarState::Full(v) => Some(v.clone()),
            IVarState::Empty(_) => None,
        }
    }

    /// Returns true once the cell has been written.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(&*self.state.lock(), IVarState::Full(_))
    }

    /// Transitions Empty to Full, returning the waiters to wake.
    ///
    /// A write to a Full cell is the DoublePut protocol violation.
    pub(crate) fn try_put(&self, v: T) -> Result<Waiters<T>> {
        let mut state = self.state.lock();
        match &mut *state {
            IVarState::Full(_) => Err(Error::new(ErrorKind::DoublePut)),
            IVarState::Empty(waiters) => {
                let waiters = std::mem::take(waiters);
                *state = IVarState::Full(v);
                if !waiters.is_empty() {
                    debug_at!(DebugLevel::IVars, "ivar: unblocking {} reader(s)", waiters.len());
                }
                Ok(waiters)
            }
        }
    }

    /// Reads the value, or registers `k` as a blocked reader.
    pub(crate) fn read_or_wait(&self, k: Cont<T>) -> Option<(T, Cont<T>)> {
        let mut state = self.state.lock();
        match &mut *state {
            IVarState::Full(v) => Some((v.clone(), k)),
            IVarState::Empty(waiters) => {
                debug_at!(DebugLevel::IVars, "ivar: reader blocked");
                waiters.push(k);
                None
            }
        }
    }
}

impl<T> fmt::Debug for IVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = matches!(&*self.state.lock(), IVarState::Full(_));
        f.debug_struct("IVar").field("full", &full).finish()
    }
}

/// Schedules each waiter with its own clone of the value.
pub(crate) fn wake_waiters<T: Clone + Send + 'static>(
    rt: &Arc<RtState>,
    waiters: Waiters<T>,
    v: &T,
) {
    for k in waiters {
        let vv = v.clone();
        rt.schedule(Task::new(move |rt| k(rt, vv)));
    }
}

/// A globally addressable reference to an [`IVar`] on some node.
#[derive(Serialize, Deserialize)]
pub struct GIVar<T> {
    owner: NodeId,
    slot: u64,
    #[serde(skip)]
    _t: PhantomData<fn(T)>,
}

impl<T> GIVar<T> {
    /// The node owning the referenced cell.
    #[must_use]
    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    /// The slot in the owner's table of globalised cells.
    #[must_use]
    pub fn slot(&self) -> u64 {
        self.slot
    }
}

impl<T> Clone for GIVar<T> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            slot: self.slot,
            _t: PhantomData,
        }
    }
}

impl<T> fmt::Debug for GIVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GIVar({}, {})", self.owner, self.slot)
    }
}

struct GlobalSlot {
    cell: Box<dyn Any + Send>,
    fulfill: Box<dyn FnOnce(&Arc<RtState>, &[u8]) -> Result<()> + Send>,
}

/// The node-local registry of globalised cells.
///
/// A slot lives from `glob` until the one successful write; a write to
/// a missing slot is the distributed face of DoublePut.
pub(crate) struct GlobalTable {
    slots: Mutex<HashMap<u64, GlobalSlot>>,
    next: AtomicU64,
}

impl GlobalTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Registers a local cell and returns its global handle.
    pub(crate) fn glob<T: NetData>(&self, iv: &Arc<IVar<T>>) -> Result<GIVar<T>> {
        let owner = node::my_node()?;
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        let target = Arc::clone(iv);
        let fulfill = Box::new(move |rt: &Arc<RtState>, bytes: &[u8]| -> Result<()> {
            let v: T = codec::decode(bytes)?;
            let waiters = target.try_put(v.clone())?;
            wake_waiters(rt, waiters, &v);
            Ok(())
        });
        self.slots.lock().insert(
            slot,
            GlobalSlot {
                cell: Box::new(Arc::clone(iv)),
                fulfill,
            },
        );
        debug_at!(DebugLevel::GIVars, "givar: glob slot {slot}");
        Ok(GIVar {
            owner,
            slot,
            _t: PhantomData,
        })
    }

    /// Writes a value through a slot owned by this node, without a
    /// serialization round-trip.
    pub(crate) fn fulfill_local<T: NetData>(
        &self,
        rt: &Arc<RtState>,
        slot: u64,
        v: T,
    ) -> Result<()> {
        let entry = self.take(slot)?;
        let iv = entry
            .cell
            .downcast::<Arc<IVar<T>>>()
            .map_err(|_| Error::new(ErrorKind::Internal).with_context("slot type mismatch"))?;
        let waiters = iv.try_put(v.clone())?;
        wake_waiters(rt, waiters, &v);
        debug_at!(DebugLevel::GIVars, "givar: local rput slot {slot}");
        Ok(())
    }

    /// Writes serialized bytes through a slot (incoming RPUT).
    pub(crate) fn fulfill_bytes(&self, rt: &Arc<RtState>, slot: u64, bytes: &[u8]) -> Result<()> {
        let entry = self.take(slot)?;
        (entry.fulfill)(rt, bytes)?;
        debug_at!(DebugLevel::GIVars, "givar: remote rput slot {slot}");
        Ok(())
    }

    fn take(&self, slot: u64) -> Result<GlobalSlot> {
        self.slots.lock().remove(&slot).ok_or_else(|| {
            Error::new(ErrorKind::DoublePut).with_context(format!("slot {slot} already fulfilled"))
        })
    }

    /// Number of globalised cells still awaiting their write.
    pub(crate) fn outstanding(&self) -> usize {
        self.slots.lock().len()
    }

    /// Slot numbers still outstanding, for the termination diagnostic.
    pub(crate) fn dump(&self) -> Vec<u64> {
        let mut slots: Vec<u64> = self.slots.lock().keys().copied().collect();
        slots.sort_unstable();
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn try_get_on_empty_is_none() {
        let iv: Arc<IVar<i64>> = IVar::new();
        assert!(iv.try_get().is_none());
        assert!(!iv.is_full());
    }

    #[test]
    fn put_then_get_returns_the_value() {
        let iv: Arc<IVar<i64>> = IVar::new();
        let waiters = iv.try_put(7).expect("first put");
        assert!(waiters.is_empty());
        assert_eq!(iv.try_get(), Some(7));
    }

    #[test]
    fn second_put_is_double_put() {
        let iv: Arc<IVar<i64>> = IVar::new();
        iv.try_put(1).expect("first put");
        let err = match iv.try_put(2) {
            Err(e) => e,
            Ok(_) => panic!("second put must fail"),
        };
        assert_eq!(err.kind(), ErrorKind::DoublePut);
        // The first value wins.
        assert_eq!(iv.try_get(), Some(1));
    }

    #[test]
    fn blocked_readers_are_returned_on_put() {
        let iv: Arc<IVar<i64>> = IVar::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            let waiting = iv.read_or_wait(Box::new(move |_rt, v| seen.lock().push(v)));
            assert!(waiting.is_none());
        }
        let waiters = iv.try_put(5).expect("put");
        assert_eq!(waiters.len(), 3);
    }

    #[test]
    fn glob_and_local_fulfill() {
        test_support::init();
        let rt = test_support::bare_rt();
        let iv: Arc<IVar<i64>> = IVar::new();
        let gv = rt.globals().glob(&iv).expect("glob");
        assert_eq!(gv.owner().as_str(), "test-node");
        assert_eq!(rt.globals().outstanding(), 1);

        rt.globals().fulfill_local(&rt, gv.slot(), 99i64).expect("rput");
        assert_eq!(iv.try_get(), Some(99));
        assert_eq!(rt.globals().outstanding(), 0);

        // A second write through the same slot is DoublePut.
        let err = rt
            .globals()
            .fulfill_local(&rt, gv.slot(), 100i64)
            .expect_err("double rput");
        assert_eq!(err.kind(), ErrorKind::DoublePut);
    }

    #[test]
    fn fulfill_bytes_decodes_and_writes() {
        test_support::init();
        let rt = test_support::bare_rt();
        let iv: Arc<IVar<String>> = IVar::new();
        let gv = rt.globals().glob(&iv).expect("glob");
        let bytes = codec::encode(&"over the wire".to_owned()).expect("encode");
        rt.globals()
            .fulfill_bytes(&rt, gv.slot(), &bytes)
            .expect("fulfill");
        assert_eq!(iv.try_get(), Some("over the wire".to_owned()));
    }
}
