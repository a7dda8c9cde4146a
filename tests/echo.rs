//! S1: a listener accepts one connection and echoes a single
//! length-prefixed message back to it.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncoro::fiber::Fiber;
use asyncoro::net::tcp::{AsyncTcpListener, AsyncTcpStream};
use asyncoro::Value;

#[test]
fn echo_roundtrip_over_length_prefixed_framing() {
    let handle = common::test_handle();
    let observed = Arc::new(Mutex::new(None));
    let observed2 = observed.clone();

    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let h2 = handle.clone();

    handle.spawn("listener", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        let mut listener = AsyncTcpListener::bind(coro.handle(), loopback)?;
        let addr = listener.local_addr()?;

        h2.spawn("dialer", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            let mut conn =
                AsyncTcpStream::connect(&mut coro, addr, Some(Duration::from_secs(2)))?;
            conn.send_message(&mut coro, b"hello", Some(Duration::from_secs(2)))?;
            let reply = conn.receive_message(&mut coro, Some(Duration::from_secs(2)))?;
            observed2.lock().unwrap().replace(reply);
            Ok(Value::None)
        });

        let (mut conn, _peer) = listener.accept(&mut coro, Some(Duration::from_secs(2)))?;
        let msg = conn.receive_message(&mut coro, Some(Duration::from_secs(2)))?;
        conn.send_message(&mut coro, &msg, Some(Duration::from_secs(2)))?;
        Ok(Value::None)
    });

    handle.run();
    assert_eq!(observed.lock().unwrap().as_deref(), Some(&b"hello"[..]));
}
