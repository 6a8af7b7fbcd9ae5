//! Algorithmic skeletons: task farms, divide-and-conquer, and
//! map-reduce over an integer range.
//!
//! The farms lift every element to a closure, apply the worker
//! function as a closure, and evaluate under a list strategy; results
//! come back in input order as unforced local values. The recursive
//! skeletons register their own recursive step so it can be shipped:
//! call [`provide_div_conq`] / [`provide_map_reduce`] (plus
//! [`crate::closure::provide`] for the element types) on every node
//! before the runtime starts.

use crate::closure::{ap, to_closure, CFun, CParFun, Closure, NetData, ParClosure};
use crate::error::Result;
use crate::node;
use crate::par::{self, Par};
use crate::registry::{self, Label};
use crate::strategy::{
    force_cc, par_closure_list, par_closure_list_chunked, par_closure_list_sliced,
    push_closure_list, push_rand_closure_list, StrategyClosure,
};
use crate::util::{codec, XorShift64};
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::sync::Arc;

fn collect_values<B: NetData>(cs: Vec<Closure<B>>) -> Par<Vec<B>> {
    let vs: Result<Vec<B>> = cs.iter().map(Closure::un_closure).collect();
    par::from_result(vs.map(Par::done))
}

fn lift_and_apply<A: NetData, B: NetData>(
    f: &CFun<A, B>,
    xs: Vec<A>,
) -> Result<Vec<Closure<B>>> {
    xs.into_iter().map(|x| ap(f, &to_closure(x)?)).collect()
}

// ---------------------------------------------------------------------------
// Task farms
// ---------------------------------------------------------------------------

/// Parallel map: applies `f` to every element under strategy `sc`,
/// preserving input order.
#[must_use]
pub fn par_map<A: NetData, B: NetData>(
    sc: &StrategyClosure<B>,
    f: &CFun<A, B>,
    xs: Vec<A>,
) -> Par<Vec<B>> {
    match lift_and_apply(f, xs) {
        Ok(cs) => par_closure_list(sc, cs).then(collect_values),
        Err(e) => Par::fail(e),
    }
}

/// [`par_map`] under the fully-forcing strategy.
#[must_use]
pub fn par_map_nf<A: NetData, B: NetData>(f: &CFun<A, B>, xs: Vec<A>) -> Par<Vec<B>> {
    par_map(&force_cc::<B>(), f, xs)
}

/// Parallel map with one spark per chunk of `k` elements.
#[must_use]
pub fn par_map_chunked<A: NetData, B: NetData>(
    k: usize,
    sc: &StrategyClosure<B>,
    f: &CFun<A, B>,
    xs: Vec<A>,
) -> Par<Vec<B>> {
    match lift_and_apply(f, xs) {
        Ok(cs) => par_closure_list_chunked(k, sc, cs).then(collect_values),
        Err(e) => Par::fail(e),
    }
}

/// Parallel map with one spark per interleaved slice, `k` slices.
#[must_use]
pub fn par_map_sliced<A: NetData, B: NetData>(
    k: usize,
    sc: &StrategyClosure<B>,
    f: &CFun<A, B>,
    xs: Vec<A>,
) -> Par<Vec<B>> {
    match lift_and_apply(f, xs) {
        Ok(cs) => par_closure_list_sliced(k, sc, cs).then(collect_values),
        Err(e) => Par::fail(e),
    }
}

/// Eager map: elements are pushed to `targets` round-robin.
#[must_use]
pub fn push_map<A: NetData, B: NetData>(
    sc: &StrategyClosure<B>,
    f: &CFun<A, B>,
    targets: &[node::NodeId],
    xs: Vec<A>,
) -> Par<Vec<B>> {
    match lift_and_apply(f, xs) {
        Ok(cs) => push_closure_list(sc, targets, cs).then(collect_values),
        Err(e) => Par::fail(e),
    }
}

/// Eager map: every element goes to a uniformly random target.
#[must_use]
pub fn push_rand_map<A: NetData, B: NetData>(
    sc: &StrategyClosure<B>,
    f: &CFun<A, B>,
    targets: &[node::NodeId],
    xs: Vec<A>,
) -> Par<Vec<B>> {
    match lift_and_apply(f, xs) {
        Ok(cs) => push_rand_closure_list(sc, targets, cs).then(collect_values),
        Err(e) => Par::fail(e),
    }
}

// ---------------------------------------------------------------------------
// Monadic task farms
// ---------------------------------------------------------------------------

/// Monadic parallel map: spawns `f` on every element lazily and
/// collects the results in input order.
#[must_use]
pub fn par_map_m<A: NetData, B: NetData>(f: &CParFun<A, B>, xs: Vec<A>) -> Par<Vec<B>> {
    let bound: Result<Vec<ParClosure<B>>> = xs.iter().map(|x| f.bind(x)).collect();
    match bound {
        Ok(pcs) => {
            let spawns = pcs.into_iter().map(par::spawn).collect();
            par::sequence(spawns)
                .then(|ivs| par::sequence(ivs.into_iter().map(par::get).collect()))
        }
        Err(e) => Par::fail(e),
    }
}

/// Monadic eager map: spawns `f` on every element, placed round-robin
/// over `targets`.
#[must_use]
pub fn push_map_m<A: NetData, B: NetData>(
    f: &CParFun<A, B>,
    targets: &[node::NodeId],
    xs: Vec<A>,
) -> Par<Vec<B>> {
    assert!(!targets.is_empty(), "push needs at least one target node");
    let bound: Result<Vec<ParClosure<B>>> = xs.iter().map(|x| f.bind(x)).collect();
    match bound {
        Ok(pcs) => {
            let spawns = pcs
                .into_iter()
                .zip(targets.iter().cycle())
                .map(|(pc, n)| par::spawn_at(pc, n.clone()))
                .collect();
            par::sequence(spawns)
                .then(|ivs| par::sequence(ivs.into_iter().map(par::get).collect()))
        }
        Err(e) => Par::fail(e),
    }
}

/// Fire-and-forget parallel map: sparks `f` on every element and
/// discards the results.
#[must_use]
pub fn par_map_m_<A: NetData, B: NetData>(f: &CParFun<A, B>, xs: Vec<A>) -> Par<()> {
    let tasks: Result<Vec<_>> = xs.iter().map(|x| f.task(x)).collect();
    match tasks {
        Ok(tcs) => {
            let sparks = tcs.into_iter().map(par::spark).collect();
            par::sequence(sparks).map(|_| ())
        }
        Err(e) => Par::fail(e),
    }
}

/// Fire-and-forget eager map, placed round-robin over `targets`.
#[must_use]
pub fn push_map_m_<A: NetData, B: NetData>(
    f: &CParFun<A, B>,
    targets: &[node::NodeId],
    xs: Vec<A>,
) -> Par<()> {
    assert!(!targets.is_empty(), "push needs at least one target node");
    let tasks: Result<Vec<_>> = xs.iter().map(|x| f.task(x)).collect();
    match tasks {
        Ok(tcs) => {
            let pushes = tcs
                .into_iter()
                .zip(targets.iter().cycle())
                .map(|(tc, n)| par::push_to(tc, n.clone()))
                .collect();
            par::sequence(pushes).map(|_| ())
        }
        Err(e) => Par::fail(e),
    }
}

/// Fire-and-forget eager map with uniformly random placement.
#[must_use]
pub fn push_rand_map_m_<A: NetData, B: NetData>(
    f: &CParFun<A, B>,
    targets: &[node::NodeId],
    xs: Vec<A>,
) -> Par<()> {
    assert!(!targets.is_empty(), "push needs at least one target node");
    let mut rng = XorShift64::from_entropy();
    let tasks: Result<Vec<_>> = xs.iter().map(|x| f.task(x)).collect();
    match tasks {
        Ok(tcs) => {
            let pushes = tcs
                .into_iter()
                .map(|tc| {
                    let n = targets[rng.next_usize(targets.len())].clone();
                    par::push_to(tc, n)
                })
                .collect();
            par::sequence(pushes).map(|_| ())
        }
        Err(e) => Par::fail(e),
    }
}

// ---------------------------------------------------------------------------
// Divide and conquer
// ---------------------------------------------------------------------------

/// The four shippable ingredients of a divide-and-conquer computation.
#[derive(Serialize, Deserialize, Clone)]
pub struct DivConq<P, R> {
    trivial: CFun<P, bool>,
    decompose: CFun<P, Vec<P>>,
    combine: CFun<(P, Vec<R>), R>,
    leaf: CParFun<P, R>,
}

impl<P: NetData, R: NetData> DivConq<P, R> {
    /// Bundles the ingredients.
    #[must_use]
    pub fn new(
        trivial: CFun<P, bool>,
        decompose: CFun<P, Vec<P>>,
        combine: CFun<(P, Vec<R>), R>,
        leaf: CParFun<P, R>,
    ) -> Self {
        Self {
            trivial,
            decompose,
            combine,
            leaf,
        }
    }
}

fn dnc_label<P, R>() -> Label {
    Label::new(format!(
        "parfn/dnc/{}/{}",
        type_name::<P>(),
        type_name::<R>()
    ))
}

/// Registers the recursive divide-and-conquer step for `(P, R)`.
pub fn provide_div_conq<P: NetData, R: NetData>() -> Result<()> {
    registry::register_value(
        dnc_label::<P, R>(),
        Arc::new(|bytes: &[u8]| {
            let (dc, p, eager): (DivConq<P, R>, P, bool) = codec::decode(bytes)?;
            Ok(Box::new(dnc_solve(dc, p, eager)) as Box<dyn Any + Send>)
        }),
    )
}

/// Divide-and-conquer with lazy (spark-based) recursion.
#[must_use]
pub fn par_divide_and_conquer<P: NetData, R: NetData>(dc: DivConq<P, R>, p: P) -> Par<R> {
    dnc_solve(dc, p, false)
}

/// Divide-and-conquer with eager placement on random nodes.
#[must_use]
pub fn push_divide_and_conquer<P: NetData, R: NetData>(dc: DivConq<P, R>, p: P) -> Par<R> {
    dnc_solve(dc, p, true)
}

fn dnc_sub_closure<P: NetData, R: NetData>(
    dc: &DivConq<P, R>,
    sub: &P,
    eager: bool,
) -> Result<ParClosure<R>> {
    Ok(ParClosure::from_parts(
        dnc_label::<P, R>(),
        codec::encode(&(dc, sub, eager))?,
    ))
}

fn dnc_solve<P: NetData, R: NetData>(dc: DivConq<P, R>, p: P, eager: bool) -> Par<R> {
    let trivial = match dc.trivial.call(p.clone()) {
        Ok(t) => t,
        Err(e) => return Par::fail(e),
    };
    if trivial {
        return par::from_result(dc.leaf.call(&p));
    }
    let subs = match dc.decompose.call(p.clone()) {
        Ok(s) => s,
        Err(e) => return Par::fail(e),
    };
    let spawned: Result<Vec<Par<_>>> = subs
        .iter()
        .map(|sub| {
            let pc = dnc_sub_closure(&dc, sub, eager)?;
            Ok(if eager {
                par::spawn_at(pc, random_node())
            } else {
                par::spawn(pc)
            })
        })
        .collect();
    match spawned {
        Ok(spawns) => par::sequence(spawns)
            .then(|ivs| par::sequence(ivs.into_iter().map(par::get).collect()))
            .then(move |rs| par::from_result(dc.combine.call((p, rs)).map(Par::done))),
        Err(e) => Par::fail(e),
    }
}

fn random_node() -> node::NodeId {
    let all = node::all_nodes().unwrap_or_default();
    node::try_my_node().map_or_else(
        || node::NodeId::new("local"),
        |me| {
            if all.is_empty() {
                me
            } else {
                let mut rng = XorShift64::from_entropy();
                all[rng.next_usize(all.len())].clone()
            }
        },
    )
}

// ---------------------------------------------------------------------------
// Map-reduce over an integer range
// ---------------------------------------------------------------------------

/// An integer range inclusive on both ends.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct InclusiveRange {
    /// First element.
    pub lo: i64,
    /// Last element (included).
    pub hi: i64,
}

impl InclusiveRange {
    /// Builds the range `[lo, hi]`.
    #[must_use]
    pub const fn new(lo: i64, hi: i64) -> Self {
        Self { lo, hi }
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct MapReduceArgs<T> {
    threshold: i64,
    range: InclusiveRange,
    f: CParFun<i64, T>,
    combine: CParFun<(T, T), T>,
    // None in shipped upper halves: the segment's first mapped element
    // seeds the fold, so the user's `init` is folded in exactly once.
    seed: Option<T>,
    eager: bool,
}

fn mrrt_label<T>() -> Label {
    Label::new(format!("parfn/mrrt/{}", type_name::<T>()))
}

/// Registers the recursive map-reduce step for `T`.
pub fn provide_map_reduce<T: NetData>() -> Result<()> {
    registry::register_value(
        mrrt_label::<T>(),
        Arc::new(|bytes: &[u8]| {
            let args: MapReduceArgs<T> = codec::decode(bytes)?;
            Ok(Box::new(mrrt_solve(args)) as Box<dyn Any + Send>)
        }),
    )
}

/// Map-reduce over `[lo, hi]` with threshold `t`: below the threshold
/// a sequential left fold of `combine` over `f(lo) .. f(hi)` starting
/// from `init`; above it, the upper half is solved in parallel (a
/// spark, stealable by any node) while the lower half is solved
/// locally. `combine` must be associative.
#[must_use]
pub fn map_reduce_range_thresh<T: NetData>(
    threshold: i64,
    range: InclusiveRange,
    f: &CParFun<i64, T>,
    combine: &CParFun<(T, T), T>,
    init: T,
) -> Par<T> {
    mrrt_solve(MapReduceArgs {
        threshold: threshold.max(1),
        range,
        f: f.clone(),
        combine: combine.clone(),
        seed: Some(init),
        eager: false,
    })
}

/// [`map_reduce_range_thresh`] with the upper halves pushed to random
/// nodes instead of sparked.
#[must_use]
pub fn push_map_reduce_range_thresh<T: NetData>(
    threshold: i64,
    range: InclusiveRange,
    f: &CParFun<i64, T>,
    combine: &CParFun<(T, T), T>,
    init: T,
) -> Par<T> {
    mrrt_solve(MapReduceArgs {
        threshold: threshold.max(1),
        range,
        f: f.clone(),
        combine: combine.clone(),
        seed: Some(init),
        eager: true,
    })
}

fn fold_range<T: NetData>(
    f: CParFun<i64, T>,
    combine: CParFun<(T, T), T>,
    acc: T,
    lo: i64,
    hi: i64,
) -> Par<T> {
    if lo > hi {
        return Par::done(acc);
    }
    par::from_result(f.call(&lo)).then(move |v| {
        par::from_result(combine.call(&(acc, v)))
            .then(move |acc| fold_range(f, combine, acc, lo + 1, hi))
    })
}

fn mrrt_solve<T: NetData>(args: MapReduceArgs<T>) -> Par<T> {
    let MapReduceArgs {
        threshold,
        range,
        f,
        combine,
        seed,
        eager,
    } = args;
    let InclusiveRange { lo, hi } = range;

    if hi - lo <= threshold {
        return match seed {
            Some(z) => fold_range(f, combine, z, lo, hi),
            // Segment seeded by its own first element.
            None => par::from_result(f.call(&lo)).then(move |v| {
                fold_range(f, combine, v, lo + 1, hi)
            }),
        };
    }

    let mid = lo + (hi - lo) / 2;
    let upper = MapReduceArgs {
        threshold,
        range: InclusiveRange::new(mid + 1, hi),
        f: f.clone(),
        combine: combine.clone(),
        seed: None,
        eager,
    };
    let upper_closure = codec::encode(&upper)
        .map(|payload| ParClosure::<T>::from_parts(mrrt_label::<T>(), payload));
    let pc = match upper_closure {
        Ok(pc) => pc,
        Err(e) => return Par::fail(e),
    };
    let spawn_upper = if eager {
        par::spawn_at(pc, random_node())
    } else {
        par::spawn(pc)
    };

    let lower = MapReduceArgs {
        threshold,
        range: InclusiveRange::new(lo, mid),
        f,
        combine: combine.clone(),
        seed,
        eager,
    };
    spawn_upper.then(move |upper_iv| {
        mrrt_solve(lower).then(move |l| {
            par::get(upper_iv).then(move |r| par::from_result(combine.call(&(l, r))))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn par_map_preserves_order_and_values() {
        test_support::init();
        let f = test_support::incr_fun();
        let v = test_support::run(par_map_nf(&f, (0..10_i64).collect())).expect("run");
        assert_eq!(v, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn par_map_equals_direct_application() {
        test_support::init();
        let f = test_support::incr_fun();
        let xs: Vec<i64> = (0..25).collect();
        let direct: Vec<i64> = xs.iter().map(|n| f.call(*n).expect("call")).collect();
        let mapped = test_support::run(par_map(&force_cc::<i64>(), &f, xs)).expect("run");
        assert_eq!(mapped, direct);
    }

    #[test]
    fn chunked_and_sliced_maps_agree_with_plain() {
        test_support::init();
        let f = test_support::double_fun();
        let xs: Vec<i64> = (0..17).collect();
        let expected: Vec<i64> = xs.iter().map(|n| n * 2).collect();
        let sc = force_cc::<i64>();
        assert_eq!(
            test_support::run(par_map_chunked(4, &sc, &f, xs.clone())).expect("run"),
            expected
        );
        assert_eq!(
            test_support::run(par_map_sliced(3, &sc, &f, xs)).expect("run"),
            expected
        );
    }

    #[test]
    fn monadic_farm_collects_in_order() {
        test_support::init();
        let f = test_support::square_par_fun();
        let v = test_support::run(par_map_m(&f, (1..=6_i64).collect())).expect("run");
        assert_eq!(v, vec![1, 4, 9, 16, 25, 36]);
    }

    #[test]
    fn discarding_farm_completes() {
        test_support::init();
        let f = test_support::square_par_fun();
        test_support::run(par_map_m_(&f, (0..8_i64).collect()).map(|()| 0_i64)).expect("run");
    }

    // EXECUTE to this node degenerates to a local fork, so the eager
    // farms run on a one-node cluster with the same contracts as the
    // spark-based ones.

    #[test]
    fn eager_maps_agree_with_plain_application() {
        test_support::init();
        let me = crate::node::my_node().expect("node identity");
        let f = test_support::double_fun();
        let xs: Vec<i64> = (0..13).collect();
        let expected: Vec<i64> = xs.iter().map(|n| n * 2).collect();
        let sc = force_cc::<i64>();
        assert_eq!(
            test_support::run(push_map(&sc, &f, &[me.clone()], xs.clone())).expect("run"),
            expected
        );
        assert_eq!(
            test_support::run(push_rand_map(&sc, &f, &[me], xs)).expect("run"),
            expected
        );
    }

    #[test]
    fn eager_monadic_farm_collects_in_order() {
        test_support::init();
        let me = crate::node::my_node().expect("node identity");
        let f = test_support::square_par_fun();
        let v = test_support::run(push_map_m(&f, &[me], (1..=6_i64).collect())).expect("run");
        assert_eq!(v, vec![1, 4, 9, 16, 25, 36]);
    }

    #[test]
    fn eager_discarding_farms_complete() {
        test_support::init();
        let me = crate::node::my_node().expect("node identity");
        let f = test_support::square_par_fun();
        test_support::run(push_map_m_(&f, &[me.clone()], (0..8_i64).collect()).map(|()| 0_i64))
            .expect("run");
        test_support::run(push_rand_map_m_(&f, &[me], (0..8_i64).collect()).map(|()| 0_i64))
            .expect("run");
    }

    #[test]
    fn eager_divide_and_conquer_computes_fibonacci() {
        test_support::init();
        let dc = test_support::fib_div_conq();
        let v = test_support::run(push_divide_and_conquer(dc, 10_i64)).expect("run");
        assert_eq!(v, 55);
    }

    #[test]
    fn eager_map_reduce_sums_the_range() {
        test_support::init();
        let f = test_support::identity_par_fun();
        let combine = test_support::add_par_fun();
        let plan =
            push_map_reduce_range_thresh(50, InclusiveRange::new(1, 1000), &f, &combine, 0);
        assert_eq!(test_support::run(plan).expect("run"), 500_500);
    }

    #[test]
    fn divide_and_conquer_computes_fibonacci() {
        test_support::init();
        let dc = test_support::fib_div_conq();
        let v = test_support::run(par_divide_and_conquer(dc, 10_i64)).expect("run");
        assert_eq!(v, 55);
    }

    #[test]
    fn map_reduce_sums_the_range() {
        test_support::init();
        let f = test_support::identity_par_fun();
        let combine = test_support::add_par_fun();
        let plan = map_reduce_range_thresh(50, InclusiveRange::new(1, 1000), &f, &combine, 0);
        assert_eq!(test_support::run(plan).expect("run"), 500_500);
    }

    #[test]
    fn map_reduce_matches_sequential_fold_for_many_thresholds() {
        test_support::init();
        let f = test_support::identity_par_fun();
        let combine = test_support::add_par_fun();
        let expected: i64 = (1..=100).sum();
        for t in [1, 2, 7, 50, 1000] {
            let plan =
                map_reduce_range_thresh(t, InclusiveRange::new(1, 100), &f, &combine, 0);
            assert_eq!(
                test_support::run(plan).expect("run"),
                expected,
                "threshold {t}"
            );
        }
    }

    #[test]
    fn map_reduce_degenerate_range_returns_init() {
        test_support::init();
        let f = test_support::identity_par_fun();
        let combine = test_support::add_par_fun();
        let plan = map_reduce_range_thresh(10, InclusiveRange::new(5, 4), &f, &combine, 7);
        assert_eq!(test_support::run(plan).expect("run"), 7);
    }
}
