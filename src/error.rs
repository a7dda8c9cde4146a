//! Crate-wide error type.
//!
//! Mirrors the abstract error kinds of the design: every failure a coroutine
//! can observe, plus two kinds (`Io`, `Codec`) that only exist because Rust
//! has real `std::io`/`bincode` errors to wrap instead of assuming they exist.

use crate::coroutine::CoroId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AsyncoroError>;

/// Everything that can go wrong in a coroutine, a socket, a primitive wait,
/// or the distributed layer.
#[derive(thiserror::Error, Debug)]
pub enum AsyncoroError {
    /// A wait (socket I/O, primitive acquire, `receive`) exceeded its deadline.
    #[error("timed out")]
    Timeout,

    /// OS or protocol-level socket failure. `Hangup` is carried as
    /// `Network("hangup")` rather than as a separate variant, matching the
    /// design's "distinguished sub-case" wording.
    #[error("network error: {0}")]
    Network(String),

    /// Operating on a closed socket, or a coroutine not in the expected
    /// state for the requested transition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A channel or coroutine name that is already registered.
    #[error("duplicate name: {0}")]
    Duplicate(String),

    /// A request whose `auth` token did not match ours.
    #[error("authentication failure")]
    AuthFailure,

    /// Delivered to a monitor when `target` terminates.
    #[error("coroutine {target:?} terminated: {cause}")]
    Monitor {
        /// The coroutine that terminated.
        target: CoroId,
        /// Either the stringified terminal value or the uncaught error.
        cause: String,
    },

    /// Wire (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Any I/O error not otherwise classified.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AsyncoroError {
    /// Build a `Network` error from an `io::Error`, collapsing EOF-ish
    /// conditions into the distinguished `"hangup"` case used throughout
    /// the async socket state machine.
    pub fn network(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            UnexpectedEof | ConnectionReset | BrokenPipe => {
                AsyncoroError::Network("hangup".to_owned())
            }
            _ => AsyncoroError::Network(err.to_string()),
        }
    }

    /// True for the distinguished hangup sub-case.
    pub fn is_hangup(&self) -> bool {
        matches!(self, AsyncoroError::Network(msg) if msg == "hangup")
    }
}

impl Clone for AsyncoroError {
    fn clone(&self) -> Self {
        match self {
            AsyncoroError::Timeout => AsyncoroError::Timeout,
            AsyncoroError::Network(s) => AsyncoroError::Network(s.clone()),
            AsyncoroError::InvalidState(s) => AsyncoroError::InvalidState(s.clone()),
            AsyncoroError::Duplicate(s) => AsyncoroError::Duplicate(s.clone()),
            AsyncoroError::AuthFailure => AsyncoroError::AuthFailure,
            AsyncoroError::Monitor { target, cause } => AsyncoroError::Monitor {
                target: *target,
                cause: cause.clone(),
            },
            AsyncoroError::Codec(e) => AsyncoroError::InvalidState(format!("codec: {}", e)),
            AsyncoroError::Io(e) => AsyncoroError::Network(e.to_string()),
        }
    }
}

/// Helper used when a terminal value could not be serialized for a remote
/// monitor: substitute the type name rather than dropping the notification.
pub fn opaque_type_name<T>() -> String {
    std::any::type_name::<T>().to_owned()
}
