//! Evaluation strategies and clustering combinators.
//!
//! A [`Strategy`] is a semantic identity in the task monad: applying
//! one to a value returns the same value, but controls where and how
//! eagerly it is evaluated. Strategies over closures come in a
//! shippable form ([`StrategyClosure`]) so a stolen spark can apply the
//! strategy on whichever node converts it.
//!
//! The proto-strategies [`spark_closure`] and [`push_closure`] are the
//! building blocks of the task farms: they return a pending cell
//! rather than a value, and their write-back wrapper travels with the
//! work.

use crate::cell::IVar;
use crate::closure::{eval_label, eval_vec_label, force_label, Closure, NetData, TaskClosure};
use crate::error::Result;
use crate::node::NodeId;
use crate::par::{self, Par};
use crate::registry::{self, Label};
use crate::sched::RtState;
use crate::util::{codec, XorShift64};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// A semantic identity controlling evaluation: `a -> Par a`.
pub struct Strategy<T> {
    f: Arc<dyn Fn(T) -> Par<T> + Send + Sync>,
}

impl<T: Send + 'static> Strategy<T> {
    /// Wraps an evaluation function as a strategy.
    pub fn new(f: impl Fn(T) -> Par<T> + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    /// Applies the strategy.
    #[must_use]
    pub fn apply(&self, x: T) -> Par<T> {
        (self.f)(x)
    }
}

impl<T> Clone for Strategy<T> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

/// Evaluates `x` under strategy `s`: `using(x, s) = s(x)`.
#[must_use]
pub fn using<T: Send + 'static>(x: T, s: &Strategy<T>) -> Par<T> {
    s.apply(x)
}

/// The do-nothing strategy.
#[must_use]
pub fn r0<T: Send + 'static>() -> Strategy<T> {
    Strategy::new(Par::done)
}

/// Head-normal-form evaluation. Rust is strict, so the value is
/// already evaluated by the time the strategy sees it.
#[must_use]
pub fn rseq<T: Send + 'static>() -> Strategy<T> {
    Strategy::new(Par::done)
}

/// Full normal-form evaluation. Coincides with [`rseq`] for plain
/// values; for closures, use [`force_cc`] to re-encode the payload.
#[must_use]
pub fn rdeepseq<T: Send + 'static>() -> Strategy<T> {
    Strategy::new(Par::done)
}

// ---------------------------------------------------------------------------
// Shippable strategies over closures
// ---------------------------------------------------------------------------

/// A registered, shippable strategy over `Closure<T>`.
#[derive(Serialize, Deserialize)]
pub struct StrategyClosure<T> {
    label: Label,
    env: Vec<u8>,
    #[serde(skip)]
    _t: PhantomData<fn(T)>,
}

impl<T: NetData> StrategyClosure<T> {
    pub(crate) fn resolve(
        &self,
    ) -> Result<Arc<dyn Fn(Closure<T>) -> Par<Closure<T>> + Send + Sync>> {
        Ok(registry::decode_as::<crate::closure::StratEntry<T>>(&self.label, &self.env)?.0)
    }

    /// The local [`Strategy`] this shippable form denotes.
    pub fn to_strategy(&self) -> Result<Strategy<Closure<T>>> {
        let f = self.resolve()?;
        Ok(Strategy::new(move |c| f(c)))
    }
}

impl<T> Clone for StrategyClosure<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            env: self.env.clone(),
            _t: PhantomData,
        }
    }
}

/// The fully-forcing closure strategy: evaluates the thunk and
/// replaces the wire payload with the evaluated value.
///
/// Registered by [`crate::closure::provide`]`::<T>()`.
#[must_use]
pub fn force_cc<T: NetData>() -> StrategyClosure<T> {
    StrategyClosure {
        label: force_label::<T>(),
        env: Vec::new(),
        _t: PhantomData,
    }
}

// ---------------------------------------------------------------------------
// Proto-strategies
// ---------------------------------------------------------------------------

fn eval_task<T: NetData>(
    rt: &Arc<RtState>,
    sc: &StrategyClosure<T>,
    x: &Closure<T>,
) -> Result<(Arc<IVar<Closure<T>>>, TaskClosure)> {
    let iv: Arc<IVar<Closure<T>>> = IVar::new();
    let gv = rt.globals().glob(&iv)?;
    let payload = codec::encode(&(sc, x, &gv))?;
    Ok((iv, TaskClosure::new(eval_label::<T>(), payload)))
}

/// Sparks the evaluation of `x` under `sc` and returns the pending
/// cell its result will arrive in.
#[must_use]
pub fn spark_closure<T: NetData>(
    sc: &StrategyClosure<T>,
    x: Closure<T>,
) -> Par<Arc<IVar<Closure<T>>>> {
    let sc = sc.clone();
    Par::new(move |rt, k| match eval_task(rt, &sc, &x) {
        Ok((iv, tc)) => {
            rt.add_spark(tc);
            k(rt, iv);
        }
        Err(e) => rt.fatal(e),
    })
}

/// Ships the evaluation of `x` under `sc` to `target` eagerly.
#[must_use]
pub fn push_closure<T: NetData>(
    sc: &StrategyClosure<T>,
    target: NodeId,
    x: Closure<T>,
) -> Par<Arc<IVar<Closure<T>>>> {
    let sc = sc.clone();
    Par::new(move |rt, k| {
        let res = eval_task(rt, &sc, &x).and_then(|(iv, tc)| {
            rt.push(&target, tc)?;
            Ok(iv)
        });
        match res {
            Ok(iv) => k(rt, iv),
            Err(e) => rt.fatal(e),
        }
    })
}

fn eval_vec_task<T: NetData>(
    rt: &Arc<RtState>,
    sc: &StrategyClosure<T>,
    xs: &[Closure<T>],
) -> Result<(Arc<IVar<Vec<Closure<T>>>>, TaskClosure)> {
    let iv: Arc<IVar<Vec<Closure<T>>>> = IVar::new();
    let gv = rt.globals().glob(&iv)?;
    let payload = codec::encode(&(sc, xs, &gv))?;
    Ok((iv, TaskClosure::new(eval_vec_label::<T>(), payload)))
}

/// Sparks the evaluation of a whole cluster of closures as one task.
fn spark_closure_vec<T: NetData>(
    sc: &StrategyClosure<T>,
    xs: Vec<Closure<T>>,
) -> Par<Arc<IVar<Vec<Closure<T>>>>> {
    let sc = sc.clone();
    Par::new(move |rt, k| match eval_vec_task(rt, &sc, &xs) {
        Ok((iv, tc)) => {
            rt.add_spark(tc);
            k(rt, iv);
        }
        Err(e) => rt.fatal(e),
    })
}

// ---------------------------------------------------------------------------
// List strategies
// ---------------------------------------------------------------------------

/// Sparks every element, then collects the results in input order.
#[must_use]
pub fn par_closure_list<T: NetData>(
    sc: &StrategyClosure<T>,
    xs: Vec<Closure<T>>,
) -> Par<Vec<Closure<T>>> {
    let sparks = xs.into_iter().map(|x| spark_closure(sc, x)).collect();
    par::sequence(sparks).then(|ivars| par::sequence(ivars.into_iter().map(par::get).collect()))
}

/// Pushes elements to `targets` cycled round-robin, then collects in
/// input order.
#[must_use]
pub fn push_closure_list<T: NetData>(
    sc: &StrategyClosure<T>,
    targets: &[NodeId],
    xs: Vec<Closure<T>>,
) -> Par<Vec<Closure<T>>> {
    assert!(!targets.is_empty(), "push needs at least one target node");
    let pushes = xs
        .into_iter()
        .zip(targets.iter().cycle())
        .map(|(x, n)| push_closure(sc, n.clone(), x))
        .collect();
    par::sequence(pushes).then(|ivars| par::sequence(ivars.into_iter().map(par::get).collect()))
}

/// Pushes every element to a uniformly random target node.
#[must_use]
pub fn push_rand_closure_list<T: NetData>(
    sc: &StrategyClosure<T>,
    targets: &[NodeId],
    xs: Vec<Closure<T>>,
) -> Par<Vec<Closure<T>>> {
    assert!(!targets.is_empty(), "push needs at least one target node");
    let mut rng = XorShift64::from_entropy();
    let pushes = xs
        .into_iter()
        .map(|x| {
            let n = targets[rng.next_usize(targets.len())].clone();
            push_closure(sc, n, x)
        })
        .collect();
    par::sequence(pushes).then(|ivars| par::sequence(ivars.into_iter().map(par::get).collect()))
}

/// Sparks one task per chunk of `k` contiguous elements.
#[must_use]
pub fn par_closure_list_chunked<T: NetData>(
    k: usize,
    sc: &StrategyClosure<T>,
    xs: Vec<Closure<T>>,
) -> Par<Vec<Closure<T>>> {
    let sparks = chunk(k, xs)
        .into_iter()
        .map(|c| spark_closure_vec(sc, c))
        .collect();
    par::sequence(sparks)
        .then(|ivars| par::sequence(ivars.into_iter().map(par::get).collect()))
        .map(unchunk)
}

/// Sparks one task per interleaved slice, `k` slices in all.
#[must_use]
pub fn par_closure_list_sliced<T: NetData>(
    k: usize,
    sc: &StrategyClosure<T>,
    xs: Vec<Closure<T>>,
) -> Par<Vec<Closure<T>>> {
    let sparks = slice(k, xs)
        .into_iter()
        .map(|s| spark_closure_vec(sc, s))
        .collect();
    par::sequence(sparks)
        .then(|ivars| par::sequence(ivars.into_iter().map(par::get).collect()))
        .map(unslice)
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

/// Evaluates via a clustered representation: cluster, evaluate under
/// `s`, uncluster. Requires `uncluster(cluster(x)) == x`.
pub fn eval_cluster_by<A, B>(
    cluster: impl Fn(A) -> B + Send + Sync + 'static,
    uncluster: impl Fn(B) -> A + Send + Sync + 'static,
    s: Strategy<B>,
) -> Strategy<A>
where
    A: Send + 'static,
    B: Send + 'static,
{
    let uncluster = Arc::new(uncluster);
    Strategy::new(move |x: A| {
        let un = Arc::clone(&uncluster);
        s.apply(cluster(x)).map(move |b| un(b))
    })
}

/// Splits into contiguous chunks of `k` elements; the last chunk may
/// be short. `chunk(3, [c1..c5]) == [[c1,c2,c3],[c4,c5]]`.
///
/// # Panics
///
/// Panics if `k` is zero.
#[must_use]
pub fn chunk<T>(k: usize, xs: Vec<T>) -> Vec<Vec<T>> {
    assert!(k >= 1, "chunk size must be at least 1");
    let mut out = Vec::with_capacity(xs.len().div_ceil(k));
    let mut current = Vec::with_capacity(k);
    for x in xs {
        current.push(x);
        if current.len() == k {
            out.push(std::mem::replace(&mut current, Vec::with_capacity(k)));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Concatenates chunks back: the inverse of [`chunk`].
#[must_use]
pub fn unchunk<T>(xss: Vec<Vec<T>>) -> Vec<T> {
    xss.into_iter().flatten().collect()
}

/// Splits into `k` interleaved subsequences.
/// `slice(3, [c1..c5]) == [[c1,c4],[c2,c5],[c3]]`.
///
/// # Panics
///
/// Panics if `k` is zero.
#[must_use]
pub fn slice<T>(k: usize, xs: Vec<T>) -> Vec<Vec<T>> {
    assert!(k >= 1, "slice count must be at least 1");
    let mut out: Vec<Vec<T>> = (0..k).map(|_| Vec::new()).collect();
    for (i, x) in xs.into_iter().enumerate() {
        out[i % k].push(x);
    }
    out
}

/// Interleaves slices back: the inverse of [`slice`].
#[must_use]
pub fn unslice<T>(xss: Vec<Vec<T>>) -> Vec<T> {
    let mut iters: Vec<_> = xss.into_iter().map(IntoIterator::into_iter).collect();
    let mut out = Vec::new();
    loop {
        let mut exhausted = true;
        for it in &mut iters {
            if let Some(x) = it.next() {
                out.push(x);
                exhausted = false;
            }
        }
        if exhausted {
            return out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::to_closure;
    use crate::test_support;

    #[test]
    fn chunking_matches_the_contract() {
        let xs = vec!["c1", "c2", "c3", "c4", "c5"];
        let chunks = chunk(3, xs.clone());
        assert_eq!(chunks, vec![vec!["c1", "c2", "c3"], vec!["c4", "c5"]]);
        assert_eq!(unchunk(chunks), xs);
    }

    #[test]
    fn slicing_matches_the_contract() {
        let xs = vec!["c1", "c2", "c3", "c4", "c5"];
        let slices = slice(3, xs.clone());
        assert_eq!(slices, vec![vec!["c1", "c4"], vec!["c2", "c5"], vec!["c3"]]);
        assert_eq!(unslice(slices), xs);
    }

    #[test]
    fn chunk_and_slice_invert_for_many_sizes() {
        for k in 1..=8 {
            for len in 0..=20 {
                let xs: Vec<i64> = (0..len).collect();
                assert_eq!(unchunk(chunk(k, xs.clone())), xs, "chunk k={k} len={len}");
                assert_eq!(unslice(slice(k, xs.clone())), xs, "slice k={k} len={len}");
            }
        }
    }

    #[test]
    fn strategies_are_semantic_identities() {
        test_support::init();
        for s in [r0::<i64>(), rseq::<i64>(), rdeepseq::<i64>()] {
            let v = test_support::run(using(42, &s)).expect("run");
            assert_eq!(v, 42);
        }
    }

    #[test]
    fn eval_cluster_by_preserves_the_value() {
        test_support::init();
        let s = eval_cluster_by(
            |xs: Vec<i64>| chunk(2, xs),
            unchunk,
            rseq::<Vec<Vec<i64>>>(),
        );
        let xs: Vec<i64> = (0..7).collect();
        let v = test_support::run(using(xs.clone(), &s)).expect("run");
        assert_eq!(v, xs);
    }

    #[test]
    fn par_closure_list_keeps_input_order() {
        test_support::init();
        let xs: Vec<Closure<i64>> = (0..10)
            .map(|n| to_closure(n).expect("lift"))
            .collect();
        let sc = force_cc::<i64>();
        let plan = par_closure_list(&sc, xs).then(|cs| {
            let vs: Result<Vec<i64>> = cs.iter().map(Closure::un_closure).collect();
            crate::par::from_result(vs.map(Par::done))
        });
        let v = test_support::run(plan).expect("run");
        assert_eq!(v, (0..10).collect::<Vec<_>>());
    }

    // Pushing to this node degenerates to a local fork, so the eager
    // proto-strategies are exercisable on a one-node cluster.

    #[test]
    fn push_closure_delivers_to_the_local_node() {
        test_support::init();
        let me = crate::node::my_node().expect("node identity");
        let sc = force_cc::<i64>();
        let plan = push_closure(&sc, me, to_closure(21_i64).expect("lift"))
            .then(par::get)
            .then(|c| crate::par::from_result(c.un_closure().map(Par::done)));
        assert_eq!(test_support::run(plan).expect("run"), 21);
    }

    #[test]
    fn push_closure_list_keeps_input_order() {
        test_support::init();
        let me = crate::node::my_node().expect("node identity");
        let xs: Vec<Closure<i64>> = (0..10)
            .map(|n| to_closure(n).expect("lift"))
            .collect();
        let sc = force_cc::<i64>();
        let plan = push_closure_list(&sc, &[me], xs).then(|cs| {
            let vs: Result<Vec<i64>> = cs.iter().map(Closure::un_closure).collect();
            crate::par::from_result(vs.map(Par::done))
        });
        let v = test_support::run(plan).expect("run");
        assert_eq!(v, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn push_rand_closure_list_keeps_input_order() {
        test_support::init();
        let me = crate::node::my_node().expect("node identity");
        let xs: Vec<Closure<i64>> = (0..10)
            .map(|n| to_closure(n).expect("lift"))
            .collect();
        let sc = force_cc::<i64>();
        let plan = push_rand_closure_list(&sc, &[me], xs).then(|cs| {
            let vs: Result<Vec<i64>> = cs.iter().map(Closure::un_closure).collect();
            crate::par::from_result(vs.map(Par::done))
        });
        let v = test_support::run(plan).expect("run");
        assert_eq!(v, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn chunked_and_sliced_list_strategies_preserve_order() {
        test_support::init();
        let sc = force_cc::<i64>();
        for k in [1, 3, 4] {
            let xs: Vec<Closure<i64>> = (0..11)
                .map(|n| to_closure(n).expect("lift"))
                .collect();
            let plan = par_closure_list_chunked(k, &sc, xs).then(|cs| {
                let vs: Result<Vec<i64>> = cs.iter().map(Closure::un_closure).collect();
                crate::par::from_result(vs.map(Par::done))
            });
            assert_eq!(
                test_support::run(plan).expect("run"),
                (0..11).collect::<Vec<_>>(),
                "chunked k={k}"
            );

            let xs: Vec<Closure<i64>> = (0..11)
                .map(|n| to_closure(n).expect("lift"))
                .collect();
            let plan = par_closure_list_sliced(k, &sc, xs).then(|cs| {
                let vs: Result<Vec<i64>> = cs.iter().map(Closure::un_closure).collect();
                crate::par::from_result(vs.map(Par::done))
            });
            assert_eq!(
                test_support::run(plan).expect("run"),
                (0..11).collect::<Vec<_>>(),
                "sliced k={k}"
            );
        }
    }
}
