//! Serializable closures.
//!
//! A [`Closure`] is an executable-plus-serializable value: a locally
//! usable thunk and a `(label, payload)` wire form. The wire form always
//! exists by construction; the thunk is a materialization cache filled
//! on first use. Shipping a closure to a peer and evaluating it there
//! yields the same value, because the label resolves to the same code
//! pointer in every node's static table.
//!
//! Shippable *functions* are handles naming registered code:
//!
//! - [`CFun`] — a pure function `A -> B`; applied to closures with
//!   [`ap`], composed with [`comp`]
//! - [`CParFun`] — a task-producing function `A -> Par<B>`; bound to an
//!   argument it becomes a [`ParClosure`] that `spawn` can ship
//! - [`crate::strategy::StrategyClosure`] — a shippable evaluation
//!   strategy over closures
//!
//! The capability bundle for an element type is installed by
//! [`provide`], which registers the value decoder, the forcing
//! strategy, and the eval/spawn task wrappers for that type.

use crate::cell::GIVar;
use crate::error::Result;
use crate::par::{self, Par};
use crate::registry::{self, Label};
use crate::util::codec;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

/// Capability bundle for values that can cross the wire.
pub trait NetData:
    Serialize + serde::de::DeserializeOwned + Send + Sync + Clone + 'static
{
}

impl<T> NetData for T where
    T: Serialize + serde::de::DeserializeOwned + Send + Sync + Clone + 'static
{
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

pub(crate) fn value_label<T>() -> Label {
    Label::new(format!("value/{}", type_name::<T>()))
}

fn ap_label<A, B>() -> Label {
    Label::new(format!("comb/ap/{}/{}", type_name::<A>(), type_name::<B>()))
}

fn comp_label<A, B, C>() -> Label {
    Label::new(format!(
        "comb/comp/{}/{}/{}",
        type_name::<A>(),
        type_name::<B>(),
        type_name::<C>()
    ))
}

pub(crate) fn force_label<T>() -> Label {
    Label::new(format!("strategy/force/{}", type_name::<T>()))
}

pub(crate) fn eval_label<T>() -> Label {
    Label::new(format!("task/eval/{}", type_name::<T>()))
}

pub(crate) fn eval_vec_label<T>() -> Label {
    Label::new(format!("task/evalvec/{}", type_name::<T>()))
}

pub(crate) fn spawn_label<T>() -> Label {
    Label::new(format!("task/spawn/{}", type_name::<T>()))
}

// ---------------------------------------------------------------------------
// Value closures
// ---------------------------------------------------------------------------

/// An executable-plus-serializable value.
///
/// The wire form is `(label, payload)`; the thunk is cached in-process
/// and never serialized. A closure received over the wire materializes
/// its thunk on first [`un_closure`](Closure::un_closure) by invoking
/// the registry lookup; an unknown label is a fatal protocol error.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: serde::de::DeserializeOwned"))]
pub struct Closure<T> {
    label: Label,
    payload: Vec<u8>,
    #[serde(skip)]
    cache: OnceLock<T>,
}

impl<T: NetData> Closure<T> {
    pub(crate) fn from_wire(label: Label, payload: Vec<u8>) -> Self {
        Self {
            label,
            payload,
            cache: OnceLock::new(),
        }
    }

    /// Returns the wire label.
    #[must_use]
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// Yields the thunk value, materializing it from the wire form if
    /// this closure arrived over the network.
    pub fn un_closure(&self) -> Result<T> {
        if let Some(v) = self.cache.get() {
            return Ok(v.clone());
        }
        let v: T = registry::decode_as(&self.label, &self.payload)?;
        let _ = self.cache.set(v.clone());
        Ok(v)
    }

    /// Returns true if the wire form's payload is the evaluated value.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.label == value_label::<T>()
    }

    /// Evaluates the thunk and returns a closure whose wire payload IS
    /// the evaluated value, so later serialization does not re-force.
    /// Idempotent on already-forced closures.
    pub fn force(&self) -> Result<Self> {
        if self.is_forced() {
            return Ok(self.clone());
        }
        to_closure(self.un_closure()?)
    }
}

impl<T: Clone> Clone for Closure<T> {
    fn clone(&self) -> Self {
        let cache = OnceLock::new();
        if let Some(v) = self.cache.get() {
            let _ = cache.set(v.clone());
        }
        Self {
            label: self.label.clone(),
            payload: self.payload.clone(),
            cache,
        }
    }
}

impl<T> fmt::Debug for Closure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("label", &self.label)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Lifts a value to a closure whose wire form names the value decoder
/// registered by [`provide`].
pub fn to_closure<T: NetData>(x: T) -> Result<Closure<T>> {
    let payload = codec::encode(&x)?;
    let c = Closure {
        label: value_label::<T>(),
        payload,
        cache: OnceLock::new(),
    };
    let _ = c.cache.set(x);
    Ok(c)
}

// ---------------------------------------------------------------------------
// Task closures
// ---------------------------------------------------------------------------

/// A shipped unit of work: a closure of type `Par<()>`.
///
/// This is what lives in the spark pool, travels in SCHEDULE when
/// stolen, and travels in EXECUTE when pushed.
#[derive(Clone, Serialize, Deserialize)]
pub struct TaskClosure {
    label: Label,
    payload: Vec<u8>,
    supervised: bool,
}

impl TaskClosure {
    pub(crate) fn new(label: Label, payload: Vec<u8>) -> Self {
        Self {
            label,
            payload,
            supervised: false,
        }
    }

    /// Marks this task for re-spark should the node it is stolen by
    /// fail before completing it.
    #[must_use]
    pub fn supervised(mut self) -> Self {
        self.supervised = true;
        self
    }

    /// Returns true if this task carries a recovery record.
    #[must_use]
    pub fn is_supervised(&self) -> bool {
        self.supervised
    }

    pub(crate) fn wire_parts(&self) -> (&Label, &[u8], bool) {
        (&self.label, &self.payload, self.supervised)
    }

    pub(crate) fn from_wire_parts(label: Label, payload: Vec<u8>, supervised: bool) -> Self {
        Self {
            label,
            payload,
            supervised,
        }
    }

    /// Returns the wire label.
    #[must_use]
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// Materializes the task by invoking its registered code pointer.
    pub fn to_par(&self) -> Result<Par<()>> {
        (registry::lookup_task(&self.label)?)(&self.payload)
    }
}

impl fmt::Debug for TaskClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskClosure")
            .field("label", &self.label)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A shipped plan producing a value: a closure of type `Par<T>`.
///
/// Built by [`CParFun::bind`]; consumed by `spawn`/`spawn_at`.
#[derive(Serialize, Deserialize)]
pub struct ParClosure<T> {
    label: Label,
    payload: Vec<u8>,
    #[serde(skip)]
    _t: PhantomData<fn() -> T>,
}

impl<T: NetData> ParClosure<T> {
    pub(crate) fn from_parts(label: Label, payload: Vec<u8>) -> Self {
        Self {
            label,
            payload,
            _t: PhantomData,
        }
    }

    /// Materializes the plan by invoking its registered code pointer.
    pub fn to_par(&self) -> Result<Par<T>> {
        registry::decode_as::<Par<T>>(&self.label, &self.payload)
    }
}

impl<T> Clone for ParClosure<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            payload: self.payload.clone(),
            _t: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ParClosure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParClosure")
            .field("label", &self.label)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Function handles
// ---------------------------------------------------------------------------

pub(crate) struct FnEntry<A, B>(pub(crate) Arc<dyn Fn(A) -> B + Send + Sync>);

/// A shippable pure function `A -> B`, named by a registry label.
///
/// Primitive handles come from [`provide_fn`]; composed handles from
/// [`comp`] carry the two inner handles in their environment and are
/// re-composed from registered primitives after transport.
#[derive(Serialize, Deserialize)]
pub struct CFun<A, B> {
    label: Label,
    env: Vec<u8>,
    #[serde(skip)]
    _p: PhantomData<fn(A) -> B>,
}

impl<A: NetData, B: NetData> CFun<A, B> {
    pub(crate) fn resolve(&self) -> Result<Arc<dyn Fn(A) -> B + Send + Sync>> {
        Ok(registry::decode_as::<FnEntry<A, B>>(&self.label, &self.env)?.0)
    }

    /// Applies the function locally.
    pub fn call(&self, a: A) -> Result<B> {
        Ok((self.resolve()?)(a))
    }
}

impl<A, B> Clone for CFun<A, B> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            env: self.env.clone(),
            _p: PhantomData,
        }
    }
}

impl<A, B> fmt::Debug for CFun<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CFun").field("label", &self.label).finish()
    }
}

/// Closure application: `ap(f, x)` is a closure whose thunk is `f(x)`
/// and whose wire form reconstructs the application from registered
/// primitives.
pub fn ap<A: NetData, B: NetData>(f: &CFun<A, B>, x: &Closure<A>) -> Result<Closure<B>> {
    Ok(Closure::from_wire(
        ap_label::<A, B>(),
        codec::encode(&(f, x))?,
    ))
}

/// Closure composition: `comp(g, f)` is a function handle computing
/// `g(f(a))`, rebuilt from its parts on the receiving node.
///
/// Requires [`provide_comp`]`::<A, B, C>()` at startup.
pub fn comp<A: NetData, B: NetData, C: NetData>(
    g: &CFun<B, C>,
    f: &CFun<A, B>,
) -> Result<CFun<A, C>> {
    Ok(CFun {
        label: comp_label::<A, B, C>(),
        env: codec::encode(&(g, f))?,
        _p: PhantomData,
    })
}

/// A shippable task-producing function `A -> Par<B>`.
#[derive(Serialize, Deserialize)]
pub struct CParFun<A, B> {
    label: Label,
    task_label: Label,
    #[serde(skip)]
    _p: PhantomData<fn(A) -> B>,
}

impl<A: NetData, B: NetData> CParFun<A, B> {
    /// Binds an argument, producing a shippable plan closure.
    pub fn bind(&self, a: &A) -> Result<ParClosure<B>> {
        Ok(ParClosure {
            label: self.label.clone(),
            payload: codec::encode(a)?,
            _t: PhantomData,
        })
    }

    /// Applies the function locally.
    pub fn call(&self, a: &A) -> Result<Par<B>> {
        registry::decode_as::<Par<B>>(&self.label, &codec::encode(a)?)
    }

    /// Binds an argument into a result-discarding task closure.
    pub fn task(&self, a: &A) -> Result<TaskClosure> {
        Ok(TaskClosure::new(self.task_label.clone(), codec::encode(a)?))
    }
}

impl<A, B> Clone for CParFun<A, B> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            task_label: self.task_label.clone(),
            _p: PhantomData,
        }
    }
}

impl<A, B> fmt::Debug for CParFun<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CParFun")
            .field("label", &self.label)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub(crate) struct StratEntry<T>(
    pub(crate) Arc<dyn Fn(Closure<T>) -> Par<Closure<T>> + Send + Sync>,
);

/// Installs the capability bundle for element type `T`: the value
/// decoder, the forcing strategy, and the eval/spawn task wrappers.
///
/// Must be called on every node, before the runtime starts, for every
/// element type whose closures cross the wire.
pub fn provide<T: NetData>() -> Result<()> {
    registry::register_value(
        value_label::<T>(),
        Arc::new(|bytes: &[u8]| Ok(Box::new(codec::decode::<T>(bytes)?) as Box<dyn Any + Send>)),
    )?;

    registry::register_value(
        force_label::<T>(),
        Arc::new(|_env: &[u8]| {
            let strat: StratEntry<T> = StratEntry(Arc::new(|c: Closure<T>| match c.force() {
                Ok(forced) => Par::done(forced),
                Err(e) => Par::fail(e),
            }));
            Ok(Box::new(strat) as Box<dyn Any + Send>)
        }),
    )?;

    registry::register_task(
        eval_label::<T>(),
        Arc::new(|bytes: &[u8]| {
            let (sc, x, gv): (
                crate::strategy::StrategyClosure<T>,
                Closure<T>,
                GIVar<Closure<T>>,
            ) = codec::decode(bytes)?;
            let strat = sc.resolve()?;
            Ok(strat(x).then(move |r| par::rput(gv, r)))
        }),
    )?;

    registry::register_task(
        eval_vec_label::<T>(),
        Arc::new(|bytes: &[u8]| {
            let (sc, xs, gv): (
                crate::strategy::StrategyClosure<T>,
                Vec<Closure<T>>,
                GIVar<Vec<Closure<T>>>,
            ) = codec::decode(bytes)?;
            let strat = sc.resolve()?;
            let plans = xs.into_iter().map(|x| strat(x)).collect();
            Ok(par::sequence(plans).then(move |rs| par::rput(gv, rs)))
        }),
    )?;

    registry::register_task(
        spawn_label::<T>(),
        Arc::new(|bytes: &[u8]| {
            let (pc, gv): (ParClosure<T>, GIVar<T>) = codec::decode(bytes)?;
            Ok(pc.to_par()?.then(move |v| par::rput(gv, v)))
        }),
    )
}

/// Registers a pure function under `fn/<name>` and returns its handle.
///
/// Also installs the apply combinator for `(A, B)` so closures built
/// with [`ap`] decode on every node.
pub fn provide_fn<A: NetData, B: NetData>(name: &str, f: fn(A) -> B) -> Result<CFun<A, B>> {
    let label = Label::new(format!("fn/{name}"));
    registry::register_value(
        label.clone(),
        Arc::new(move |_env: &[u8]| {
            Ok(Box::new(FnEntry::<A, B>(Arc::new(f))) as Box<dyn Any + Send>)
        }),
    )?;
    registry::register_value(
        ap_label::<A, B>(),
        Arc::new(|bytes: &[u8]| {
            let (cf, xc): (CFun<A, B>, Closure<A>) = codec::decode(bytes)?;
            let f = cf.resolve()?;
            Ok(Box::new(f(xc.un_closure()?)) as Box<dyn Any + Send>)
        }),
    )?;
    Ok(CFun {
        label,
        env: Vec::new(),
        _p: PhantomData,
    })
}

/// Installs the composition combinator for `(A, B, C)`, enabling
/// [`comp`]`::<A, B, C>` handles to decode on every node.
pub fn provide_comp<A: NetData, B: NetData, C: NetData>() -> Result<()> {
    registry::register_value(
        comp_label::<A, B, C>(),
        Arc::new(|env: &[u8]| {
            let (g, f): (CFun<B, C>, CFun<A, B>) = codec::decode(env)?;
            let rg = g.resolve()?;
            let rf = f.resolve()?;
            Ok(Box::new(FnEntry::<A, C>(Arc::new(move |a| rg(rf(a))))) as Box<dyn Any + Send>)
        }),
    )?;
    registry::register_value(
        ap_label::<A, C>(),
        Arc::new(|bytes: &[u8]| {
            let (cf, xc): (CFun<A, C>, Closure<A>) = codec::decode(bytes)?;
            let f = cf.resolve()?;
            Ok(Box::new(f(xc.un_closure()?)) as Box<dyn Any + Send>)
        }),
    )
}

/// Registers a task-producing function under `parfn/<name>` and
/// returns its handle.
pub fn provide_par_fn<A: NetData, B: NetData>(
    name: &str,
    f: fn(A) -> Par<B>,
) -> Result<CParFun<A, B>> {
    let label = Label::new(format!("parfn/{name}"));
    let task_label = Label::new(format!("task/do/{name}"));
    registry::register_value(
        label.clone(),
        Arc::new(move |bytes: &[u8]| {
            Ok(Box::new(f(codec::decode::<A>(bytes)?)) as Box<dyn Any + Send>)
        }),
    )?;
    registry::register_task(
        task_label.clone(),
        Arc::new(move |bytes: &[u8]| Ok(f(codec::decode::<A>(bytes)?).then(|_| Par::done(())))),
    )?;
    Ok(CParFun {
        label,
        task_label,
        _p: PhantomData,
    })
}
