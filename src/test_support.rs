//! Shared fixtures for the in-crate tests.
//!
//! The static table and the node identity are process-wide, so every
//! test funnels through [`init`]: one `Once` block performs all
//! registrations used anywhere in the lib tests, then the first
//! [`crate::runtime::Runtime`] seals the table.

use crate::closure::{provide, provide_comp, provide_fn, provide_par_fn, CFun, CParFun};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::node::{self, NodeId};
use crate::par::Par;
use crate::registry::{self, Label};
use crate::runtime::Runtime;
use crate::sched::RtState;
use crate::skeleton::{provide_div_conq, provide_map_reduce, DivConq};
use std::any::Any;
use std::sync::{Arc, Once, OnceLock};

static INIT: Once = Once::new();
static INCR: OnceLock<CFun<i64, i64>> = OnceLock::new();
static DOUBLE: OnceLock<CFun<i64, i64>> = OnceLock::new();
static SQUARE: OnceLock<CParFun<i64, i64>> = OnceLock::new();
static IDENTITY: OnceLock<CParFun<i64, i64>> = OnceLock::new();
static ADD: OnceLock<CParFun<(i64, i64), i64>> = OnceLock::new();
static FIB: OnceLock<DivConq<i64, i64>> = OnceLock::new();

/// Registers every label the lib tests use and fixes the node
/// identity. Idempotent; must run before any runtime starts.
pub(crate) fn init() {
    INIT.call_once(|| {
        provide::<i64>().expect("provide i64");
        provide::<bool>().expect("provide bool");
        provide::<String>().expect("provide String");
        provide::<Vec<i64>>().expect("provide Vec<i64>");
        provide_comp::<i64, i64, i64>().expect("provide comp");
        provide_div_conq::<i64, i64>().expect("provide dnc");
        provide_map_reduce::<i64>().expect("provide map-reduce");

        let _ = INCR.set(provide_fn("test/incr", |n: i64| n + 1).expect("register incr"));
        let _ = DOUBLE.set(provide_fn("test/double", |n: i64| n * 2).expect("register double"));
        let _ = SQUARE.set(
            provide_par_fn("test/square", |n: i64| Par::done(n * n)).expect("register square"),
        );
        let _ = IDENTITY.set(
            provide_par_fn("test/identity", Par::done).expect("register identity"),
        );
        let _ = ADD.set(
            provide_par_fn("test/add", |(a, b): (i64, i64)| Par::done(a + b))
                .expect("register add"),
        );
        let _ = FIB.set(DivConq::new(
            provide_fn("test/fib/trivial", |n: i64| n <= 1).expect("register trivial"),
            provide_fn("test/fib/decompose", |n: i64| vec![n - 1, n - 2])
                .expect("register decompose"),
            provide_fn("test/fib/combine", |(_, rs): (i64, Vec<i64>)| rs[0] + rs[1])
                .expect("register combine"),
            provide_par_fn("test/fib/leaf", Par::done).expect("register leaf"),
        ));

        // Labels exercised by the registry unit tests.
        registry::register_value(
            Label::new("test/registry/forty-two"),
            Arc::new(|_: &[u8]| Ok(Box::new(42_i64) as Box<dyn Any + Send>)),
        )
        .expect("register constant");
        registry::register_value(
            Label::new("test/registry/dup"),
            Arc::new(|_: &[u8]| Ok(Box::new(1_i64) as Box<dyn Any + Send>)),
        )
        .expect("register dup");
        let _ = registry::register_value(
            Label::new("test/registry/dup"),
            Arc::new(|_: &[u8]| Ok(Box::new(2_i64) as Box<dyn Any + Send>)),
        );

        node::set_my_node(NodeId::new("test-node")).expect("set node");
        node::set_all_nodes(vec![NodeId::new("test-node")]).expect("set nodes");
    });
}

pub(crate) fn incr_fun() -> CFun<i64, i64> {
    init();
    INCR.get().expect("init ran").clone()
}

pub(crate) fn double_fun() -> CFun<i64, i64> {
    init();
    DOUBLE.get().expect("init ran").clone()
}

pub(crate) fn square_par_fun() -> CParFun<i64, i64> {
    init();
    SQUARE.get().expect("init ran").clone()
}

pub(crate) fn identity_par_fun() -> CParFun<i64, i64> {
    init();
    IDENTITY.get().expect("init ran").clone()
}

pub(crate) fn add_par_fun() -> CParFun<(i64, i64), i64> {
    init();
    ADD.get().expect("init ran").clone()
}

pub(crate) fn fib_div_conq() -> DivConq<i64, i64> {
    init();
    FIB.get().expect("init ran").clone()
}

/// A runtime state with no workers, for direct unit calls.
pub(crate) fn bare_rt() -> Arc<RtState> {
    init();
    registry::seal();
    RtState::new(RuntimeConfig::new().workers(1).listen_on("test-node"))
}

/// Runs a plan on a fresh single-node runtime and shuts it down.
pub(crate) fn run<T: Send + 'static>(p: Par<T>) -> Result<T> {
    init();
    let runtime = Runtime::start(RuntimeConfig::new().workers(2).listen_on("test-node"))?;
    let result = runtime.run_par_io(p);
    let ended = runtime.shutdown();
    match (result, ended) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}
