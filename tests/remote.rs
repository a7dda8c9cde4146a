//! S6: a coroutine on one peer is registered under a name, located and
//! delivered to from a second peer.
//!
//! Each peer is a separate scheduler on its own OS thread (a `Handle::run`
//! blocks its calling thread until shutdown, exactly like two independent
//! processes). UDP broadcast discovery is skipped in favor of handing the
//! first peer's advertised `Location` to the second directly, since relying
//! on an actual broadcast reaching both ends isn't guaranteed in every test
//! network namespace; everything downstream of discovery (locate, deliver,
//! auth) is exercised exactly as broadcast discovery would have set it up.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use asyncoro::dist::{self, RemoteCoro};
use asyncoro::fiber::Fiber;
use asyncoro::scheduler::Config;
use asyncoro::Value;

#[test]
fn remote_deliver_reaches_a_coroutine_located_by_name_on_another_peer() {
    let (location_tx, location_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();

    let p1 = thread::spawn(move || {
        let config = Config::new()
            .node("127.0.0.1")
            .tcp_port(0)
            .udp_port(51601)
            .name("p1")
            .secret("shared-secret");
        let handle = asyncoro::scheduler::Handle::new(&config);
        let ctx = dist::bootstrap(&handle, &config)
            .expect("bootstrap should succeed")
            .expect("node is configured");
        location_tx.send(ctx.local.clone()).unwrap();

        let reg_ctx = ctx.clone();
        handle.spawn("registrant", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            reg_ctx.register_coro("R", coro.id)?;
            let v = coro.receive(Some(Duration::from_secs(5)), Value::from("timed-out"))?;
            result_tx.send(v).ok();
            Ok(Value::None)
        });
        handle.run();
    });

    let p1_location = location_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("p1 should have advertised its location");

    let p2 = thread::spawn(move || {
        let config = Config::new()
            .node("127.0.0.1")
            .tcp_port(0)
            .udp_port(51602)
            .name("p2")
            .secret("shared-secret");
        let handle = asyncoro::scheduler::Handle::new(&config);
        let ctx = dist::bootstrap(&handle, &config)
            .expect("bootstrap should succeed")
            .expect("node is configured");

        handle.spawn("caller", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            let remote = RemoteCoro::locate(&ctx, &mut coro, p1_location.clone(), "R")?;
            let failures = remote.deliver(&ctx, &mut coro, Value::from("hi"), Some(Duration::from_secs(5)))?;
            assert_eq!(failures, 0);
            Ok(Value::None)
        });
        handle.run();
    });

    p2.join().expect("p2's scheduler thread panicked");
    p1.join().expect("p1's scheduler thread panicked");

    let received = result_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("p1's registrant should have observed the delivery");
    assert_eq!(received, Value::Text("hi".to_owned()));
}
