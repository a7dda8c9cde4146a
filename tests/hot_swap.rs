//! S5: hot-swapping a sleeping, hot-swappable coroutine replaces its body
//! before it wakes — the original body's continuation never runs — and the
//! new body still observes a message sent to the coroutine before the
//! swap, since the mailbox is untouched by a swap.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asyncoro::fiber::Fiber;
use asyncoro::Value;

#[test]
fn hot_swap_replaces_a_sleeping_body_and_preserves_its_mailbox() {
    let handle = common::test_handle();
    let original_resumed = Arc::new(AtomicBool::new(false));
    let new_body_result = Arc::new(Mutex::new(None));

    let original_resumed2 = original_resumed.clone();
    let target_id = handle.spawn("swappable", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        coro.handle().set_hot_swappable(coro.id, true);
        coro.sleep(Duration::from_millis(500))?;
        original_resumed2.store(true, Ordering::SeqCst);
        Ok(Value::None)
    });

    let new_body_result2 = new_body_result.clone();
    handle.spawn("controller", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        // Let `target_id` reach its sleep before swapping it out.
        coro.sleep(Duration::from_millis(50))?;

        coro.handle()
            .deliver_message(target_id, None, Value::from("pre-swap"));
        coro.handle().hot_swap_with(target_id, move |mut coro| {
            let v = coro.receive(Some(Duration::from_secs(1)), Value::None)?;
            new_body_result2.lock().unwrap().replace(v);
            Ok(Value::None)
        });
        Ok(Value::None)
    });

    handle.run();

    assert!(
        !original_resumed.load(Ordering::SeqCst),
        "the original body's post-sleep continuation should never have run"
    );
    assert_eq!(
        new_body_result.lock().unwrap().take(),
        Some(Value::Text("pre-swap".to_owned()))
    );
}
