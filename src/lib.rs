//! # asyncoro
//!
//! Cooperative, single-threaded coroutine runtime with integrated
//! event-driven I/O, message passing, and an optional distributed layer.
//!
//! Coroutine bodies run on stackful fibers ([`fiber`]) driven by a single
//! scheduler thread ([`scheduler`]). Bodies suspend at explicit points —
//! socket I/O, a mailbox `receive`, a timer `sleep`, acquiring a
//! synchronization primitive — and are resumed in the scheduler's own time,
//! cooperatively, with no pre-emption. A [`scheduler::Handle`] is the
//! thread-safe entry point: spawn coroutines, send them messages, and drive
//! the run loop from any thread.
//!
//! Coroutine bodies should never call a blocking API directly. The one
//! sanctioned escape hatch is [`offload::OffloadPool::run_blocking`], which
//! hands the call to a small worker pool and suspends the caller on its own
//! mailbox until the result is ready.
//!
//! ## Layers
//!
//! - [`sync`] / [`channel`] — in-process coordination: locks, a condition
//!   variable, an event, a semaphore, and named broadcast channels.
//! - [`net`] — non-blocking TCP/UDP sockets (optionally TLS via
//!   `native-tls`) driven through the scheduler's notifier.
//! - [`dist`] — UDP broadcast peer discovery, an authenticated TCP
//!   request/reply transport, and remote references to coroutines and
//!   channels living on another peer.
//!
//! See `demos/echo.rs` for a minimal TCP echo server built on this API.

#![warn(missing_docs)]

/// Crate-wide error type and result alias.
pub mod error;
/// Timer heap backing scheduled wakeups.
pub mod clock;
/// Wire-safe value type carried across mailboxes, channels, and the network.
pub mod message;
/// Stackful fibers built on the `context` crate.
pub mod fiber;
/// Coroutine state: identity, mailbox, monitors, hot-swap.
pub mod coroutine;
/// Readiness multiplexer (`mio`-backed, with a `select`-based fallback).
pub mod notifier;
/// The run loop and its thread-safe external `Handle`.
pub mod scheduler;
/// Blocking-call offload pool.
pub mod offload;
/// In-process synchronization primitives.
pub mod sync;
/// Named broadcast channels.
pub mod channel;
/// Coroutine-aware async sockets.
pub mod net;
/// Peer discovery, transport, and remote references.
pub mod dist;

pub use coroutine::{CoroId, Monitor, State};
pub use error::{AsyncoroError, Result};
pub use message::{Message, Value};
pub use offload::OffloadPool;
pub use scheduler::{Config, Coro, Handle};

/// Build and start a scheduler in one call: construct a `Handle` from
/// `config`, spawn `f` as its first coroutine, and run to completion on the
/// calling thread.
///
/// Shorthand for the common case of a process with a single entry-point
/// coroutine and no further setup.
pub fn start<F>(config: Config, f: F)
where
    F: for<'y> FnOnce(Coro<'y>) -> Result<Value> + Send + 'static,
{
    let stack_size = if config.stack_size == 0 {
        fiber::Fiber::DEFAULT_STACK_SIZE
    } else {
        config.stack_size
    };
    let handle = Handle::new(&config);
    if let Err(e) = dist::bootstrap(&handle, &config) {
        log::error!("failed to bring up the distributed layer: {}", e);
    }
    handle.spawn("main", stack_size, f);
    handle.run();
}
