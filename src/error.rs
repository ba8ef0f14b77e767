//! Error taxonomy for the crate.
//!
//! Mirrors the source's four-way split (system / resolution / TLS / misuse) plus the two
//! transient conditions the thread pool can raise. Every variant implements
//! [`std::error::Error`] via `thiserror` so callers can match on domain or simply propagate.

use std::fmt;
use std::io;

/// A single library error, tagged by domain.
///
/// `on_error` callbacks receive this by value and must not retain it past the callback (it is
/// cheap to construct and not meant to be an archival record, matching the source's "never
/// retained beyond the callback" contract).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A failed syscall. Covers connect/accept/read/write/bind/listen failures.
    #[error("system error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake, record, or shutdown failure. The session is unusable once this fires;
    /// the socket transitions to `Closed`.
    #[cfg(feature = "tls")]
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// An address record was invalid (failed to bind, unparsable, wrong family for the
    /// operation). Kept distinct from `Io` per SPEC_FULL §7.2 even though resolution itself is
    /// out of scope for this crate.
    #[error("address error: {0}")]
    Address(String),

    /// A setup-phase misuse: opening an already-open file, writing after `write_eof`, double
    /// `listen`, etc. Always returned synchronously, never delivered via `on_error`.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    /// The thread pool's submission queue is at capacity; the caller should retry the
    /// operation later rather than block.
    #[error("thread pool queue is full")]
    PoolBusy,

    /// A task was submitted to a pool whose worker threads have already been torn down
    /// (the owning `Loop` is being dropped).
    #[error("thread pool has shut down")]
    PoolShutdown,
}

impl Error {
    /// Construct an [`Error::Address`] from a `Display`-able reason.
    pub fn address(reason: impl fmt::Display) -> Error {
        Error::Address(reason.to_string())
    }

    /// True for errors that the state machine treats as fatal, i.e. that must schedule the
    /// owning object's close path (SPEC_FULL §7 propagation rule).
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() != io::ErrorKind::WouldBlock,
            #[cfg(feature = "tls")]
            Error::Tls(_) => true,
            Error::Address(_) => true,
            Error::Misuse(_) => false,
            Error::PoolBusy => false,
            Error::PoolShutdown => true,
        }
    }
}

/// Crate-wide result alias for setup-phase (synchronous) operations.
pub type Result<T> = std::result::Result<T, Error>;
