//! Async TCP stream and listener, with an optional TLS sub-state.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use log::trace;

use crate::error::{AsyncoroError, Result};
use crate::notifier::Interest;
use crate::scheduler::{Coro, Handle};

use super::{do_io, drive_handshake};

enum Transport {
    Plain(mio::net::TcpStream),
    Tls(Box<native_tls::TlsStream<mio::net::TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// A non-blocking TCP connection driven through the scheduler's notifier.
/// Owned by whichever coroutine last operated on it; concurrent reads (or
/// concurrent writes) from two coroutines on the same stream are not
/// supported, matching the single read-waiter/write-waiter slot the
/// scheduler keeps per fd.
pub struct AsyncTcpStream {
    io: Transport,
    handle: Handle,
    fd: RawFd,
}

impl AsyncTcpStream {
    fn from_mio(handle: Handle, io: mio::net::TcpStream) -> Self {
        let fd = io.as_raw_fd();
        handle.with_notifier(|n| n.register(fd, Interest::READ | Interest::WRITE));
        AsyncTcpStream {
            io: Transport::Plain(io),
            handle,
            fd,
        }
    }

    /// Connect to `addr`, completing once the socket becomes writable and
    /// carries no pending error.
    pub fn connect(coro: &mut Coro<'_>, addr: SocketAddr, timeout: Option<Duration>) -> Result<Self> {
        let io = mio::net::TcpStream::connect(&addr).map_err(|e| AsyncoroError::network(&e))?;
        let mut sock = AsyncTcpStream::from_mio(coro.handle().clone(), io);
        if !coro.await_ready(sock.fd, Interest::WRITE, timeout)? {
            return Err(AsyncoroError::Timeout);
        }
        sock.check_connected()?;
        Ok(sock)
    }

    /// Connect, then perform a TLS client handshake for `domain` before
    /// returning.
    pub fn connect_tls(
        coro: &mut Coro<'_>,
        addr: SocketAddr,
        domain: &str,
        connector: &native_tls::TlsConnector,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let plain = AsyncTcpStream::connect(coro, addr, timeout)?;
        let fd = plain.fd;
        let handle = plain.handle.clone();
        let raw = match plain.io {
            Transport::Plain(s) => s,
            Transport::Tls(_) => unreachable!("freshly connected socket is always plain"),
        };
        let attempt = connector.connect(domain, raw);
        let tls = drive_handshake(coro, fd, timeout, attempt)?;
        Ok(AsyncTcpStream {
            io: Transport::Tls(Box::new(tls)),
            handle,
            fd,
        })
    }

    fn check_connected(&self) -> Result<()> {
        let raw = match &self.io {
            Transport::Plain(s) => s,
            Transport::Tls(_) => return Ok(()),
        };
        match raw.take_error() {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(AsyncoroError::network(&e)),
            Err(e) => Err(AsyncoroError::network(&e)),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let raw = match &self.io {
            Transport::Plain(s) => s,
            Transport::Tls(s) => s.get_ref(),
        };
        raw.peer_addr().map_err(|e| AsyncoroError::network(&e))
    }

    /// Receive up to `n` bytes. An empty result means the peer closed the
    /// connection in an orderly way.
    pub fn recv(&mut self, coro: &mut Coro<'_>, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let got = do_io(coro, self.fd, Interest::READ, timeout, || self.io.read(&mut buf))?;
        buf.truncate(got);
        Ok(buf)
    }

    /// Receive exactly `n` bytes, or an empty vector on a short read
    /// (orderly close before `n` bytes arrived).
    pub fn recvall(&mut self, coro: &mut Coro<'_>, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = do_io(coro, self.fd, Interest::READ, timeout, || {
                self.io.read(&mut buf[filled..])
            })?;
            if got == 0 {
                return Ok(Vec::new());
            }
            filled += got;
        }
        Ok(buf)
    }

    /// Write at most `buf.len()` bytes, returning the amount actually
    /// written.
    pub fn send(&mut self, coro: &mut Coro<'_>, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        do_io(coro, self.fd, Interest::WRITE, timeout, || self.io.write(buf))
    }

    /// Write every byte of `buf`, looping until it has all gone out.
    pub fn sendall(&mut self, coro: &mut Coro<'_>, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = do_io(coro, self.fd, Interest::WRITE, timeout, || {
                self.io.write(&buf[sent..])
            })?;
            if n == 0 {
                return Err(AsyncoroError::Network("hangup".to_owned()));
            }
            sent += n;
        }
        Ok(())
    }

    /// Length-prefixed send: `u32` big-endian length followed by `payload`.
    pub fn send_message(&mut self, coro: &mut Coro<'_>, payload: &[u8], timeout: Option<Duration>) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| AsyncoroError::InvalidState("message too large to frame".to_owned()))?;
        self.sendall(coro, &len.to_be_bytes(), timeout)?;
        self.sendall(coro, payload, timeout)
    }

    /// Length-prefixed receive. Returns an empty vector on orderly hangup
    /// (either while reading the length prefix or the body).
    pub fn receive_message(&mut self, coro: &mut Coro<'_>, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let len_buf = self.recvall(coro, 4, timeout)?;
        if len_buf.is_empty() {
            return Ok(Vec::new());
        }
        let len = u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;
        self.recvall(coro, len, timeout)
    }
}

impl Drop for AsyncTcpStream {
    fn drop(&mut self) {
        self.handle.with_notifier(|n| n.unregister(self.fd));
    }
}

/// A non-blocking TCP listener.
pub struct AsyncTcpListener {
    io: mio::net::TcpListener,
    handle: Handle,
    fd: RawFd,
}

impl AsyncTcpListener {
    pub fn bind(handle: &Handle, addr: SocketAddr) -> Result<Self> {
        let io = mio::net::TcpListener::bind(&addr).map_err(|e| AsyncoroError::network(&e))?;
        let fd = io.as_raw_fd();
        handle.with_notifier(|n| n.register(fd, Interest::READ));
        trace!("listening on {}", addr);
        Ok(AsyncTcpListener {
            io,
            handle: handle.clone(),
            fd,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.io.local_addr().map_err(|e| AsyncoroError::network(&e))
    }

    /// Accept the next connection, yielding a plain (non-TLS) stream.
    pub fn accept(&mut self, coro: &mut Coro<'_>, timeout: Option<Duration>) -> Result<(AsyncTcpStream, SocketAddr)> {
        let (stream, addr) = do_io(coro, self.fd, Interest::READ, timeout, || self.io.accept())?;
        Ok((AsyncTcpStream::from_mio(self.handle.clone(), stream), addr))
    }

    /// Accept the next connection and complete a TLS server handshake on it
    /// before returning.
    pub fn accept_tls(
        &mut self,
        coro: &mut Coro<'_>,
        acceptor: &native_tls::TlsAcceptor,
        timeout: Option<Duration>,
    ) -> Result<(AsyncTcpStream, SocketAddr)> {
        let (plain, addr) = self.accept(coro, timeout)?;
        let fd = plain.fd;
        let handle = plain.handle.clone();
        let raw = match plain.io {
            Transport::Plain(s) => s,
            Transport::Tls(_) => unreachable!("freshly accepted socket is always plain"),
        };
        let attempt = acceptor.accept(raw);
        let tls = drive_handshake(coro, fd, timeout, attempt)?;
        Ok((
            AsyncTcpStream {
                io: Transport::Tls(Box::new(tls)),
                handle,
                fd,
            },
            addr,
        ))
    }
}

impl Drop for AsyncTcpListener {
    fn drop(&mut self) {
        self.handle.with_notifier(|n| n.unregister(self.fd));
    }
}
