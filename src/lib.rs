//! Callback-driven evented I/O: non-blocking TCP sockets (optionally TLS-wrapped), a listener,
//! and a thread-pool-backed pseudo-asynchronous file I/O bridge, all driven by a single
//! cooperative event loop.
//!
//! This crate is the target-language incarnation of a C core built around `libuv`-style
//! callback objects: every component — [`reactor::Loop`], [`server::Server`], [`socket::Socket`],
//! [`file::File`] — embeds a set of caller-supplied callback closures and an opaque `data` slot
//! (a generic type parameter here, standing in for the source's `void*`) instead of a trait a
//! caller implements, which keeps each object's event surface explicit at its construction site.
//!
//! # Quick tour
//!
//! - [`reactor::Loop`] wraps [`mio::Poll`] with a timer wheel and a deferred-callback queue.
//! - [`socket::Socket`] is a non-blocking TCP stream with an integrated write queue, inactivity
//!   timer, and (with the `tls` feature, on by default) a [`rustls`]-backed handshake/record/
//!   shutdown state machine.
//! - [`server::Server`] listens and hands accepted connections to a user hook as fresh, not-yet-
//!   attached `Socket`s.
//! - [`file::File`] bridges blocking file syscalls through [`pool::Pool`]'s worker threads and
//!   re-enters the loop thread for every completion.
//! - [`buffer::Buffer`] is the caller-owned write payload; its `Drop` impl is the release hook
//!   the source describes as being invoked "exactly once, regardless of outcome."
//!
//! No logger is installed by this crate; initialize one (`env_logger` or otherwise) in your
//! application if you want to see the `trace`/`debug`/`warn`/`error` call sites this crate emits
//! at state transitions and error paths.

#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod error;
#[cfg(unix)]
pub mod file;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod socket;
#[cfg(feature = "tls")]
pub mod tls;
mod timer;

pub use buffer::Buffer;
pub use error::{Error, Result};
#[cfg(unix)]
pub use file::{File, FileCallbacks, FileConfig, OpenFlags};
pub use pool::{Pool, PoolConfig};
pub use reactor::{Loop, LoopConfig};
pub use server::{Server, ServerCallbacks, ServerConfig, ServerState};
pub use socket::{Socket, SocketCallbacks, SocketConfig, State as SocketState};
#[cfg(feature = "tls")]
pub use tls::TlsSession;
