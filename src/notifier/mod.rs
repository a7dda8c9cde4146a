//! The portable readiness multiplexer.
//!
//! `Notifier` is the uniform interface the scheduler drives; two backends
//! implement it. [`mio_backend::MioNotifier`] is preferred everywhere `mio`
//! has a real selector (epoll/kqueue/IOCP); [`select_backend::SelectNotifier`]
//! is a `libc::select`-based fallback for targets, or test configurations,
//! that want a selector with no OS-specific dependency at all.

pub mod mio_backend;
pub mod select_backend;

use std::os::unix::io::RawFd;
use std::time::Duration;

bitflags::bitflags! {
    /// Interest (and, symmetrically, observed readiness) on a file
    /// descriptor.
    #[derive(Default)]
    pub struct Interest: u8 {
        const READ  = 0b0001;
        const WRITE = 0b0010;
        const HUP   = 0b0100;
        const ERROR = 0b1000;
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub interest: Interest,
}

/// Uniform multiplexer interface driven by the scheduler's run loop.
pub trait Notifier: Send {
    /// Start watching `fd` for `interest`.
    fn register(&mut self, fd: RawFd, interest: Interest);
    /// Change the watched interest for an already-registered `fd`.
    fn modify(&mut self, fd: RawFd, interest: Interest);
    /// Stop watching `fd` entirely.
    fn unregister(&mut self, fd: RawFd);
    /// Drop one or more interests from `fd` without unregistering it.
    fn clear(&mut self, fd: RawFd, interest: Interest);

    /// Block for at most `timeout` (`None` = forever, `Some(Duration::ZERO)`
    /// = don't block at all) waiting for readiness, returning whatever
    /// fired.
    fn poll(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<ReadyEvent>>;

    /// Unblock a concurrent `poll` call from another thread.
    fn interrupt(&self);

    /// Register a per-fd timeout that should cause `poll` to return once it
    /// elapses, even with no readiness to report.
    fn add_timeout(&mut self, fd: RawFd, deadline: std::time::Instant);
    /// Cancel a previously registered per-fd timeout.
    fn del_timeout(&mut self, fd: RawFd);
}

/// Construct the preferred backend for this platform.
pub fn default_notifier() -> Box<dyn Notifier> {
    Box::new(mio_backend::MioNotifier::new().expect("failed to create the default notifier"))
}
