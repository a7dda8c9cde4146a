//! A broadcast `Channel` with `min_receivers = 2` holds `deliver` until both
//! subscribers are registered, reaches both of them, and does not
//! retroactively reach a subscriber that registers afterward.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncoro::channel::ChannelRegistry;
use asyncoro::fiber::Fiber;
use asyncoro::Value;

#[test]
fn channel_delivery_waits_for_min_receivers_and_is_not_retroactive() {
    let handle = common::test_handle();
    let registry = ChannelRegistry::new();
    let channel = registry.create("chan", 2, None).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let delivered_ok = Arc::new(Mutex::new(None));
    let late_received = Arc::new(Mutex::new(None));

    for name in ["sub-1", "sub-2"] {
        let chan = channel.clone();
        let received = received.clone();
        handle.spawn(name, Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            chan.subscribe(coro.handle(), coro.id);
            let v = coro.receive(Some(Duration::from_secs(2)), Value::None)?;
            received.lock().unwrap().push(v);
            Ok(Value::None)
        });
    }

    let deliverer_channel = channel.clone();
    let delivered_ok2 = delivered_ok.clone();
    let h2 = handle.clone();
    let late_received2 = late_received.clone();
    handle.spawn("deliverer", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        let ok = deliverer_channel.deliver(&mut coro, Value::from("x"), Some(Duration::from_secs(2)))?;
        delivered_ok2.lock().unwrap().replace(ok);

        // Subscribe strictly after the delivery above completed: it must
        // not retroactively reach this subscriber.
        let late_channel = deliverer_channel.clone();
        h2.spawn("late-sub", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            late_channel.subscribe(coro.handle(), coro.id);
            let v = coro.receive(Some(Duration::from_millis(50)), Value::from("nothing"))?;
            late_received2.lock().unwrap().replace(v);
            Ok(Value::None)
        });
        Ok(Value::None)
    });

    handle.run();

    assert_eq!(delivered_ok.lock().unwrap().take(), Some(true));
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 2);
    for v in received.iter() {
        assert_eq!(v, &Value::tagged("chan", Value::from("x")));
    }
    assert_eq!(
        late_received.lock().unwrap().take(),
        Some(Value::Text("nothing".to_owned()))
    );
}
