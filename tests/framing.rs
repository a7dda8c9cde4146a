//! Invariant 5: `receive_message(send_message(x)) == x` for representative
//! sizes, including ones that force several partial reads through
//! `recvall`'s loop.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncoro::fiber::Fiber;
use asyncoro::net::tcp::{AsyncTcpListener, AsyncTcpStream};
use asyncoro::Value;

fn roundtrip(payload: Vec<u8>) -> Vec<u8> {
    let handle = common::test_handle();
    let observed = Arc::new(Mutex::new(None));
    let observed2 = observed.clone();
    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let h2 = handle.clone();
    let payload_to_send = payload;

    handle.spawn("listener", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        let mut listener = AsyncTcpListener::bind(coro.handle(), loopback)?;
        let addr = listener.local_addr()?;

        h2.spawn("dialer", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            let mut conn =
                AsyncTcpStream::connect(&mut coro, addr, Some(Duration::from_secs(5)))?;
            conn.send_message(&mut coro, &payload_to_send, Some(Duration::from_secs(5)))?;
            Ok(Value::None)
        });

        let (mut conn, _peer) = listener.accept(&mut coro, Some(Duration::from_secs(5)))?;
        let received = conn.receive_message(&mut coro, Some(Duration::from_secs(5)))?;
        observed2.lock().unwrap().replace(received);
        Ok(Value::None)
    });

    handle.run();
    observed.lock().unwrap().take().expect("listener should have received a message")
}

#[test]
fn empty_payload_roundtrips() {
    assert_eq!(roundtrip(Vec::new()), Vec::new());
}

#[test]
fn small_payload_roundtrips() {
    assert_eq!(roundtrip(b"hello, world".to_vec()), b"hello, world".to_vec());
}

#[test]
fn payload_larger_than_one_socket_buffer_roundtrips() {
    // Larger than a typical default socket buffer, to force `recvall` (and
    // the sender's `sendall`) through multiple partial read/write loops.
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
    assert_eq!(roundtrip(payload.clone()), payload);
}
