//! Leveled stderr diagnostics.
//!
//! Every debug line is written to standard error prefixed by the
//! emitting node's identifier. The level gates what is emitted:
//!
//! | Level | Emission |
//! |-------|----------|
//! | 0 | none |
//! | 1 | final stats |
//! | 2 | static table dump on main |
//! | 3 | spark create/convert |
//! | 4 | outbound messages |
//! | 5 | inbound messages |
//! | 6 | GIVar operations |
//! | 7 | IVar block/unblock events |
//! | 8 | registry updates |
//! | 9 | node failure events |
//!
//! A line at level N is emitted when the configured level is >= N.

use crate::node;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

/// Debug emission classes, by level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DebugLevel {
    /// No emission.
    Off = 0,
    /// Final statistics at shutdown.
    Stats = 1,
    /// Static table dump on the main node.
    TableDump = 2,
    /// Spark creation and conversion.
    Sparks = 3,
    /// Outbound messages.
    MsgOut = 4,
    /// Inbound messages.
    MsgIn = 5,
    /// Globalised cell operations.
    GIVars = 6,
    /// Cell block/unblock events.
    IVars = 7,
    /// Registry updates.
    Registry = 8,
    /// Node failure events.
    Failure = 9,
}

impl DebugLevel {
    /// Converts a raw configuration value, saturating at the maximum.
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Off,
            1 => Self::Stats,
            2 => Self::TableDump,
            3 => Self::Sparks,
            4 => Self::MsgOut,
            5 => Self::MsgIn,
            6 => Self::GIVars,
            7 => Self::IVars,
            8 => Self::Registry,
            _ => Self::Failure,
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(0);

/// Sets the process-wide debug level.
pub fn set_level(level: u8) {
    LEVEL.store(level.min(9), Ordering::Relaxed);
}

/// Returns true if the given level is currently emitted.
#[must_use]
pub fn enabled(level: DebugLevel) -> bool {
    LEVEL.load(Ordering::Relaxed) >= level as u8
}

/// Emits one diagnostic line at the given level.
///
/// The line is prefixed with the emitting node, or `<unset>` before
/// communication init. Prefer [`crate::debug_at!`] which skips argument
/// formatting when the level is off.
pub fn emit(level: DebugLevel, line: &str) {
    if !enabled(level) {
        return;
    }
    let node = node::try_my_node().map_or_else(|| "<unset>".to_owned(), |n| n.to_string());
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{node}: {line}");
}

/// Emits one error line regardless of the configured level.
///
/// Errors are always user-visible: the line carries the node tag and
/// the error kind.
pub fn emit_error(line: &str) {
    let node = node::try_my_node().map_or_else(|| "<unset>".to_owned(), |n| n.to_string());
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{node}: {line}");
}

/// Emits a formatted diagnostic line, skipping formatting when the
/// level is off.
#[macro_export]
macro_rules! debug_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::debug::enabled($level) {
            $crate::debug::emit($level, &format!($($arg)*));
        }
    };
}
