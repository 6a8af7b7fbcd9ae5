//! End-to-end scenarios on a single-node cluster.
//!
//! Every test here drives the public API the way a user program would:
//! register the capability bundles, start a runtime, run a plan inside
//! `run_par_io`, and shut down cleanly.

use parsteal::closure::{provide, provide_fn, provide_par_fn, CFun, CParFun};
use parsteal::par::{self, Par};
use parsteal::skeleton::{
    map_reduce_range_thresh, par_divide_and_conquer, par_map, provide_div_conq,
    provide_map_reduce, push_map, DivConq, InclusiveRange,
};
use parsteal::strategy::force_cc;
use parsteal::{ErrorKind, Runtime, RuntimeConfig};
use std::sync::{Once, OnceLock};

static INIT: Once = Once::new();
static INCR: OnceLock<CFun<i64, i64>> = OnceLock::new();
static CONST42: OnceLock<CParFun<(), i64>> = OnceLock::new();
static IDENT: OnceLock<CParFun<i64, i64>> = OnceLock::new();
static ADD: OnceLock<CParFun<(i64, i64), i64>> = OnceLock::new();
static FIB: OnceLock<DivConq<i64, i64>> = OnceLock::new();

fn init() {
    INIT.call_once(|| {
        provide::<i64>().expect("provide i64");
        provide::<bool>().expect("provide bool");
        provide::<Vec<i64>>().expect("provide Vec<i64>");
        provide_div_conq::<i64, i64>().expect("provide dnc");
        provide_map_reduce::<i64>().expect("provide map-reduce");

        let _ = INCR.set(provide_fn("incr", |n: i64| n + 1).expect("incr"));
        let _ = CONST42.set(provide_par_fn("const42", |(): ()| Par::done(42_i64)).expect("c42"));
        let _ = IDENT.set(provide_par_fn("ident", Par::done).expect("ident"));
        let _ = ADD.set(
            provide_par_fn("add", |(a, b): (i64, i64)| Par::done(a + b)).expect("add"),
        );
        let _ = FIB.set(DivConq::new(
            provide_fn("fib/trivial", |n: i64| n <= 1).expect("trivial"),
            provide_fn("fib/decompose", |n: i64| vec![n - 1, n - 2]).expect("decompose"),
            provide_fn("fib/combine", |(_, rs): (i64, Vec<i64>)| rs[0] + rs[1])
                .expect("combine"),
            provide_par_fn("fib/leaf", Par::done).expect("leaf"),
        ));
    });
}

fn start() -> Runtime {
    init();
    Runtime::start(RuntimeConfig::new().workers(2).listen_on("test-node"))
        .expect("runtime start")
}

#[test]
fn spawned_constant_comes_back_through_the_cell() {
    let rt = start();
    let pc = CONST42.get().unwrap().bind(&()).expect("bind");
    let plan = par::spawn(pc).then(par::get);
    let v = rt.run_par_io(plan).expect("run");
    assert_eq!(v, 42);

    let stats = rt.stats();
    assert_eq!(stats.sparks_created, 1, "spawn places exactly one spark");
    assert_eq!(stats.sparks_converted, 1, "the spark converts exactly once");
    rt.shutdown().expect("clean shutdown");
}

#[test]
fn par_map_of_increment_preserves_order() {
    let rt = start();
    let f = INCR.get().unwrap();
    let plan = par_map(&force_cc::<i64>(), f, (0..10_i64).collect());
    let v = rt.run_par_io(plan).expect("run");
    assert_eq!(v, (1..=10).collect::<Vec<_>>());

    let stats = rt.stats();
    assert_eq!(stats.sparks_created, 10, "one spark per element");
    assert_eq!(stats.sparks_converted, 10);
    rt.shutdown().expect("clean shutdown");
}

#[test]
fn push_map_to_the_local_node_preserves_order() {
    let rt = start();
    let f = INCR.get().unwrap();
    // Eager placement on this node degenerates to a local fork, with
    // the same ordering contract as the spark-based map.
    let me = parsteal::node::my_node().expect("node identity");
    let plan = push_map(&force_cc::<i64>(), f, &[me], (0..10_i64).collect());
    let v = rt.run_par_io(plan).expect("run");
    assert_eq!(v, (1..=10).collect::<Vec<_>>());

    let stats = rt.stats();
    assert_eq!(stats.sparks_created, 0, "pushes never enter the spark pool");
    rt.shutdown().expect("clean shutdown");
}

#[test]
fn divide_and_conquer_fibonacci_of_ten_is_fifty_five() {
    let rt = start();
    let v = rt
        .run_par_io(par_divide_and_conquer(FIB.get().unwrap().clone(), 10))
        .expect("run");
    assert_eq!(v, 55);
    rt.shutdown().expect("clean shutdown");
}

#[test]
fn map_reduce_sums_one_to_a_thousand() {
    let rt = start();
    let plan = map_reduce_range_thresh(
        50,
        InclusiveRange::new(1, 1000),
        IDENT.get().unwrap(),
        ADD.get().unwrap(),
        0,
    );
    let v = rt.run_par_io(plan).expect("run");
    assert_eq!(v, 500_500);
    rt.shutdown().expect("clean shutdown");
}

#[test]
fn double_put_aborts_with_the_protocol_error() {
    let rt = start();
    let plan = par::new_ivar::<i64>().then(|iv| {
        let iv2 = iv.clone();
        par::put(iv.clone(), 1)
            .then(move |()| par::put(iv2, 2))
            .then(move |()| par::get(iv))
    });
    let err = rt.run_par_io(plan).expect_err("second put must abort");
    assert_eq!(err.kind(), ErrorKind::DoublePut);
}

#[test]
fn forked_chains_of_cells_resolve() {
    let rt = start();
    let plan = par::new_ivar::<i64>().then(|a| {
        par::new_ivar::<i64>().then(move |b| {
            let (a2, b2) = (a.clone(), b.clone());
            let producer = par::put(a2, 21);
            let doubler = par::get(a).then(move |v| par::put(b2, v * 2));
            par::fork(doubler)
                .then(move |()| par::fork(producer))
                .then(move |()| par::get(b))
        })
    });
    let v = rt.run_par_io(plan).expect("run");
    assert_eq!(v, 42);
    rt.shutdown().expect("clean shutdown");
}

#[test]
fn runtime_shuts_down_with_empty_pools() {
    let rt = start();
    let f = INCR.get().unwrap();
    let plan = par_map(&force_cc::<i64>(), f, (0..32_i64).collect());
    rt.run_par_io(plan).expect("run");
    // A clean shutdown proves quiescence: empty spark pool, empty
    // deques, and every globalised cell written.
    rt.shutdown().expect("quiescent shutdown");
}
