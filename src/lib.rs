//! Parsteal: a distributed-memory task-parallel runtime with explicit,
//! serializable closures.
//!
//! # Overview
//!
//! A user program expresses computation as a plan in the [`par::Par`] monad,
//! producing values through single-assignment cells. The runtime schedules
//! that work across a fixed set of networked nodes using both lazy
//! work-stealing (*sparks*, stolen via a FISH/SCHEDULE protocol) and eager
//! placement (*pushes*, delivered via EXECUTE).
//!
//! # Core Guarantees
//!
//! - **Write-once cells**: every [`cell::IVar`] accepts exactly one
//!   successful put; all readers observe the same value
//! - **Transparent closures**: a [`closure::Closure`] is locally executable
//!   and wire-serializable; shipping it to a peer and evaluating there
//!   yields the same value
//! - **Sealed registry**: the static table of code pointers is populated
//!   before the runtime starts and is identical on every node
//! - **Work conservation**: idle workers steal from sibling deques, then
//!   fish sparks from random peers
//!
//! # Module Structure
//!
//! - [`node`]: node identity and the process-wide node list
//! - [`debug`]: leveled stderr diagnostics, prefixed by the emitting node
//! - [`config`]: runtime configuration
//! - [`registry`]: the static table mapping labels to code pointers
//! - [`closure`]: serializable closures and function handles
//! - [`cell`]: single-assignment cells, local and globally addressable
//! - [`par`]: the task monad and its primitives
//! - [`sched`]: the worker pool, spark pool, and stealing logic
//! - [`comm`]: message envelopes and the inter-node transport
//! - [`strategy`]: evaluation strategies and clustering combinators
//! - [`skeleton`]: parallel maps, divide-and-conquer, map-reduce
//! - [`runtime`]: startup, the run loop, and orderly shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod cell;
pub mod closure;
pub mod comm;
pub mod config;
pub mod debug;
pub mod error;
pub mod node;
pub mod par;
pub mod registry;
pub mod runtime;
pub mod sched;
pub mod skeleton;
pub mod strategy;
#[cfg(test)]
pub(crate) mod test_support;
pub mod util;

pub use closure::{to_closure, CFun, CParFun, Closure, NetData, ParClosure, TaskClosure};
pub use config::RuntimeConfig;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use node::NodeId;
pub use par::Par;
pub use runtime::Runtime;
pub use skeleton::InclusiveRange;
pub use strategy::{force_cc, using, Strategy, StrategyClosure};
