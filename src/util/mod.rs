//! Internal utilities.

pub(crate) mod codec;
pub mod rng;

pub use rng::XorShift64;
