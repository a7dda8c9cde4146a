//! Coroutine-aware async sockets.
//!
//! Every operation here follows the same shape: try the underlying
//! nonblocking call, and if it would block, park the calling coroutine on
//! the fd's read or write waiter slot until the notifier reports readiness
//! (or a timeout fires), then retry. `Coro::await_ready` is the shared
//! primitive; `do_io` below is just that retry loop factored out.

pub mod tcp;
pub mod udp;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{AsyncoroError, Result};
use crate::notifier::Interest;
use crate::scheduler::Coro;

/// Drive a single nonblocking operation to completion, suspending on `fd`
/// readiness for `interest` each time it reports `WouldBlock`.
fn do_io<T>(
    coro: &mut Coro<'_>,
    fd: RawFd,
    interest: Interest,
    timeout: Option<Duration>,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !coro.await_ready(fd, interest, timeout)? {
                    return Err(AsyncoroError::Timeout);
                }
            }
            Err(e) => return Err(AsyncoroError::network(&e)),
        }
    }
}

/// Drive a `native_tls` handshake to completion. `native_tls` doesn't tell
/// us which direction a `WouldBlock` wants (unlike a raw `WantRead`/
/// `WantWrite` OpenSSL error would), so we just wait on both and retry;
/// sockets here are always registered for both interests anyway.
fn drive_handshake<S>(
    coro: &mut Coro<'_>,
    fd: RawFd,
    timeout: Option<Duration>,
    mut attempt: std::result::Result<native_tls::TlsStream<S>, native_tls::HandshakeError<S>>,
) -> Result<native_tls::TlsStream<S>>
where
    S: io::Read + io::Write,
{
    coro.enter_call();
    let result = (|| loop {
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(native_tls::HandshakeError::Failure(e)) => {
                return Err(AsyncoroError::Network(e.to_string()))
            }
            Err(native_tls::HandshakeError::WouldBlock(mid)) => {
                if !coro.await_ready(fd, Interest::READ | Interest::WRITE, timeout)? {
                    return Err(AsyncoroError::Timeout);
                }
                attempt = mid.handshake();
            }
        }
    })();
    coro.exit_call();
    result
}

/// Build a TLS server identity from PEM-encoded certificate and key bytes,
/// as named by `Config::tls_identity`'s `certfile`/`keyfile` paths.
pub fn load_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<native_tls::Identity> {
    native_tls::Identity::from_pkcs8(cert_pem, key_pem)
        .map_err(|e| AsyncoroError::InvalidState(format!("bad TLS identity: {}", e)))
}

pub use tcp::{AsyncTcpListener, AsyncTcpStream};
pub use udp::AsyncUdpSocket;
