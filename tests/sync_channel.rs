//! S4: a `SyncChannel` with `min_receivers = 2` holds `deliver` until both
//! recipients are parked in `receive`, reaches both of them directly (no
//! mailbox queue), and does not retroactively reach a recipient that calls
//! `receive` after delivery completed.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncoro::channel::ChannelRegistry;
use asyncoro::fiber::Fiber;
use asyncoro::Value;

#[test]
fn sync_channel_delivery_waits_for_min_receivers_and_is_not_retroactive() {
    let handle = common::test_handle();
    let registry = ChannelRegistry::new();
    let channel = registry.create_sync("barrier", 2, None).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let delivered_ok = Arc::new(Mutex::new(None));
    let late_received = Arc::new(Mutex::new(None));

    for name in ["sub-1", "sub-2"] {
        let chan = channel.clone();
        let received = received.clone();
        handle.spawn(name, Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            let v = chan.receive(&mut coro, Some(Duration::from_secs(2)))?;
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

        // Call `receive` strictly after the delivery above completed: it
        // must not retroactively reach this recipient.
        let late_channel = deliverer_channel.clone();
        h2.spawn("late-sub", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            let v = late_channel.receive(&mut coro, Some(Duration::from_millis(50)))?;
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
        assert_eq!(v, &Value::tagged("barrier", Value::from("x")));
    }
    // `receive`'s own alarm value, since the late subscriber timed out
    // rather than getting woken with a payload.
    assert_eq!(late_received.lock().unwrap().take(), Some(Value::None));
}

#[test]
fn sync_channel_send_before_anyone_is_waiting_reaches_nobody_and_is_not_queued() {
    let handle = common::test_handle();
    let registry = ChannelRegistry::new();
    let channel = registry.create_sync("no-queue", 0, None).unwrap();

    let reached = Arc::new(Mutex::new(None));
    let received = Arc::new(Mutex::new(None));

    let sender_channel = channel.clone();
    let reached2 = reached.clone();
    handle.spawn("sender", Fiber::DEFAULT_STACK_SIZE, move |coro| {
        let n = sender_channel.send(&coro, Value::from("early"));
        reached2.lock().unwrap().replace(n);
        Ok(Value::None)
    });

    let receiver_channel = channel.clone();
    let received2 = received.clone();
    handle.spawn("late-receiver", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        // Spawned after "sender" above, which never suspends — by the time
        // this body starts, that `send` has already completed and reached
        // nobody, since nothing was parked in `receive` yet. There is no
        // queue to retroactively satisfy this call.
        let v = receiver_channel.receive(&mut coro, Some(Duration::from_millis(50)))?;
        received2.lock().unwrap().replace(v);
        Ok(Value::None)
    });

    handle.run();

    assert_eq!(reached.lock().unwrap().take(), Some(0));
    assert_eq!(received.lock().unwrap().take(), Some(Value::None));
}
