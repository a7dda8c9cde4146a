//! Async UDP datagram socket. Used directly by application code, and by the
//! discovery layer for its broadcast `PING`/`ACK` exchange.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{AsyncoroError, Result};
use crate::notifier::Interest;
use crate::scheduler::{Coro, Handle};

use super::do_io;

pub struct AsyncUdpSocket {
    io: mio::net::UdpSocket,
    handle: Handle,
    fd: RawFd,
}

impl AsyncUdpSocket {
    pub fn bind(handle: &Handle, addr: SocketAddr) -> Result<Self> {
        let io = mio::net::UdpSocket::bind(&addr).map_err(|e| AsyncoroError::network(&e))?;
        let fd = io.as_raw_fd();
        handle.with_notifier(|n| n.register(fd, Interest::READ | Interest::WRITE));
        Ok(AsyncUdpSocket {
            io,
            handle: handle.clone(),
            fd,
        })
    }

    /// Enable broadcast datagrams (used by discovery's UDP `PING`).
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.io.set_broadcast(on).map_err(|e| AsyncoroError::network(&e))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.io.local_addr().map_err(|e| AsyncoroError::network(&e))
    }

    pub fn recvfrom(
        &mut self,
        coro: &mut Coro<'_>,
        n: usize,
        timeout: Option<Duration>,
    ) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; n];
        let (len, from) = do_io(coro, self.fd, Interest::READ, timeout, || self.io.recv_from(&mut buf))?;
        buf.truncate(len);
        Ok((buf, from))
    }

    pub fn sendto(
        &mut self,
        coro: &mut Coro<'_>,
        buf: &[u8],
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        do_io(coro, self.fd, Interest::WRITE, timeout, || self.io.send_to(buf, &addr))
    }
}

impl Drop for AsyncUdpSocket {
    fn drop(&mut self) {
        self.handle.with_notifier(|n| n.unregister(self.fd));
    }
}
