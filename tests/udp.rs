//! A UDP datagram sent from one coroutine-owned socket is observed by
//! another, address and payload intact.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncoro::fiber::Fiber;
use asyncoro::net::udp::AsyncUdpSocket;
use asyncoro::Value;

#[test]
fn datagram_roundtrips_between_two_sockets() {
    let handle = common::test_handle();
    let observed = Arc::new(Mutex::new(None));
    let observed2 = observed.clone();
    let loopback = |port: u16| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let h2 = handle.clone();

    handle.spawn("receiver", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        let mut socket = AsyncUdpSocket::bind(coro.handle(), loopback(0))?;
        let addr = socket.local_addr()?;

        h2.spawn("sender", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            let mut socket = AsyncUdpSocket::bind(coro.handle(), loopback(0))?;
            socket.sendto(&mut coro, b"ping", addr, Some(Duration::from_secs(2)))?;
            Ok(Value::None)
        });

        let (datagram, _from) = socket.recvfrom(&mut coro, 64, Some(Duration::from_secs(2)))?;
        observed2.lock().unwrap().replace(datagram);
        Ok(Value::None)
    });

    handle.run();
    assert_eq!(observed.lock().unwrap().as_deref(), Some(&b"ping"[..]));
}
