//! The static table: a process-wide mapping from stable labels to code
//! pointers.
//!
//! Every unit of work that can be shipped between nodes is indexed by a
//! [`Label`] chosen at registration time. The label travels on the wire;
//! the corresponding code is looked up on the receiver. Invariants:
//!
//! - populated exactly once, before the runtime starts (then *sealed*)
//! - identical contents on every node running the same binary
//! - lookup by label never fails after the seal for registered labels
//!
//! A lookup miss after the seal means the peers are running divergent
//! binaries and is fatal ([`crate::ErrorKind::RegistryMiss`]).

use crate::debug::DebugLevel;
use crate::debug_at;
use crate::error::{Error, ErrorKind, Result};
use crate::par::Par;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A stable identifier for a registered code pointer.
///
/// Labels are derived from symbol names and element types at
/// registration time; two nodes running the same binary derive
/// identical labels.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label(String);

impl Label {
    /// Creates a label from its string form.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the label's string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pure value constructor: payload bytes to a type-erased value.
pub type ValueFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>> + Send + Sync>;

/// A task producer: payload bytes to a runnable plan.
pub type TaskFn = Arc<dyn Fn(&[u8]) -> Result<Par<()>> + Send + Sync>;

/// A registered code pointer.
#[derive(Clone)]
pub(crate) enum CodePointer {
    /// Rebuilds a value (or re-composes a combinator) from payload bytes.
    Value(ValueFn),
    /// Produces a shipped task from payload bytes.
    Task(TaskFn),
}

struct StaticTable {
    entries: RwLock<BTreeMap<Label, CodePointer>>,
    sealed: AtomicBool,
}

static TABLE: OnceLock<StaticTable> = OnceLock::new();

fn table() -> &'static StaticTable {
    TABLE.get_or_init(|| StaticTable {
        entries: RwLock::new(BTreeMap::new()),
        sealed: AtomicBool::new(false),
    })
}

/// Registers a pure value constructor under `label`.
///
/// Registration is first-wins: re-registering an existing label is a
/// no-op (the table is populated by idempotent startup code on every
/// node). Registering after the seal is an error.
pub fn register_value(label: Label, f: ValueFn) -> Result<()> {
    register(label, CodePointer::Value(f))
}

/// Registers a task producer under `label`.
pub fn register_task(label: Label, f: TaskFn) -> Result<()> {
    register(label, CodePointer::Task(f))
}

fn register(label: Label, ptr: CodePointer) -> Result<()> {
    let t = table();
    if t.sealed.load(Ordering::Acquire) {
        return Err(Error::new(ErrorKind::RegistrySealed)
            .with_context(format!("cannot register {label} after seal")));
    }
    let mut entries = t.entries.write();
    if entries.contains_key(&label) {
        return Ok(());
    }
    debug_at!(DebugLevel::Registry, "registry: + {label}");
    entries.insert(label, ptr);
    Ok(())
}

/// Seals the table. Idempotent; called by runtime startup.
pub fn seal() {
    table().sealed.store(true, Ordering::Release);
}

/// Returns true once the table has been sealed.
#[must_use]
pub fn is_sealed() -> bool {
    table().sealed.load(Ordering::Acquire)
}

fn lookup(label: &Label) -> Result<CodePointer> {
    let t = table();
    if !t.sealed.load(Ordering::Acquire) {
        return Err(Error::new(ErrorKind::RegistryUnsealed)
            .with_context(format!("lookup of {label} before seal")));
    }
    t.entries.read().get(label).cloned().ok_or_else(|| {
        Error::new(ErrorKind::RegistryMiss).with_context(format!("unknown label {label}"))
    })
}

/// Looks up a value constructor.
pub(crate) fn lookup_value(label: &Label) -> Result<ValueFn> {
    match lookup(label)? {
        CodePointer::Value(f) => Ok(f),
        CodePointer::Task(_) => Err(Error::new(ErrorKind::RegistryMiss)
            .with_context(format!("{label} is a task pointer, expected value"))),
    }
}

/// Looks up a task producer.
pub(crate) fn lookup_task(label: &Label) -> Result<TaskFn> {
    match lookup(label)? {
        CodePointer::Task(f) => Ok(f),
        CodePointer::Value(_) => Err(Error::new(ErrorKind::RegistryMiss)
            .with_context(format!("{label} is a value pointer, expected task"))),
    }
}

/// Applies a value constructor and downcasts the result.
pub(crate) fn decode_as<T: 'static>(label: &Label, payload: &[u8]) -> Result<T> {
    let f = lookup_value(label)?;
    let any = f(payload)?;
    any.downcast::<T>().map(|b| *b).map_err(|_| {
        Error::new(ErrorKind::RegistryMiss)
            .with_context(format!("{label} decoded to an unexpected type"))
    })
}

/// Returns all registered labels, in label order.
#[must_use]
pub fn dump() -> Vec<Label> {
    table().entries.read().keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    // The table is process-wide and sealed once, so the registrations
    // these tests read live in test_support::init.

    #[test]
    fn register_then_lookup_after_seal() {
        test_support::init();
        seal();
        let got: i64 = decode_as(&Label::new("test/registry/forty-two"), &[]).expect("decode");
        assert_eq!(got, 42);
    }

    #[test]
    fn duplicate_registration_is_first_wins() {
        test_support::init();
        seal();
        let got: i64 = decode_as(&Label::new("test/registry/dup"), &[]).expect("decode");
        assert_eq!(got, 1);
    }

    #[test]
    fn register_after_seal_is_rejected() {
        test_support::init();
        seal();
        let err = register_value(
            Label::new("test/registry/late"),
            Arc::new(|_: &[u8]| Ok(Box::new(0_i64) as Box<dyn Any + Send>)),
        )
        .expect_err("must reject");
        assert_eq!(err.kind(), ErrorKind::RegistrySealed);
    }

    #[test]
    fn unknown_label_is_a_registry_miss() {
        test_support::init();
        seal();
        let err =
            decode_as::<i64>(&Label::new("test/registry/unknown"), &[]).expect_err("must miss");
        assert_eq!(err.kind(), ErrorKind::RegistryMiss);
    }

    #[test]
    fn dump_lists_labels_in_order() {
        test_support::init();
        seal();
        let labels = dump();
        assert!(!labels.is_empty());
        let mut sorted = labels.clone();
        sorted.sort();
        assert_eq!(labels, sorted);
    }
}
