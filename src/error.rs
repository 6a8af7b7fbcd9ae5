//! Error types and error handling strategy.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - An error inside a task terminates that task and, absent a
//!   fault-tolerance layer, the whole computation, tagged by the
//!   emitting node
//! - Protocol violations (double put, unknown label) are fatal

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Identity ===
    /// The local node identity was read before communication init.
    NodeIdUnset,

    // === Registry ===
    /// A closure label was not found in the static table; the peers are
    /// running divergent binaries.
    RegistryMiss,
    /// The static table was modified after it was sealed.
    RegistrySealed,
    /// The static table was read before it was sealed.
    RegistryUnsealed,

    // === Cells ===
    /// Second write to a single-assignment cell.
    DoublePut,

    // === Wire ===
    /// Truncated or malformed envelope.
    WireDecode,
    /// The transport reported a send/recv failure; the peer is
    /// considered failed.
    PeerUnreachable,

    // === Termination ===
    /// Quiescence was reached with outstanding globalised cells.
    TerminationViolation,
    /// The runtime is shutting down.
    Shutdown,

    // === Internal ===
    /// Internal runtime error (bug).
    Internal,
}

/// The main error type for runtime operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error indicates a protocol violation that
    /// must abort the computation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self.kind, ErrorKind::Shutdown)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for runtime operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::DoublePut);
        assert_eq!(err.to_string(), "DoublePut");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::RegistryMiss).with_context("label missing");
        assert_eq!(err.to_string(), "RegistryMiss: label missing");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::WireDecode)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn result_ext_adds_context() {
        let res: Result<()> = Err(Error::new(ErrorKind::PeerUnreachable));
        let err = res.context("send failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::PeerUnreachable);
        assert_eq!(err.to_string(), "PeerUnreachable: send failed");
    }

    #[test]
    fn shutdown_is_not_fatal() {
        assert!(!Error::new(ErrorKind::Shutdown).is_fatal());
        assert!(Error::new(ErrorKind::DoublePut).is_fatal());
    }
}
