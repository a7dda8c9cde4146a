//! S3: a monitor observes a `Monitor` exception carrying the watched
//! coroutine's id and terminal cause the moment it fails.

mod common;

use std::sync::{Arc, Mutex};

use asyncoro::fiber::Fiber;
use asyncoro::{AsyncoroError, Value};

#[test]
fn monitor_is_notified_of_a_watched_coroutines_failure() {
    let handle = common::test_handle();
    let observed = Arc::new(Mutex::new(None));
    let observed2 = observed.clone();

    let b_id = handle.spawn("watched", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        // Wait for the watcher to register before failing, so the
        // monitor is always in place by the time we terminate.
        coro.receive(None, Value::None)?;
        Err(AsyncoroError::InvalidState("boom".to_owned()))
    });

    handle.spawn("watcher", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        coro.monitor(b_id);
        coro.send(b_id, Value::None);
        match coro.suspend() {
            Err(AsyncoroError::Monitor { target, cause }) => {
                observed2.lock().unwrap().replace((target, cause));
            }
            other => panic!("expected a Monitor exception, got {:?}", other),
        }
        Ok(Value::None)
    });

    handle.run();
    let (target, cause) = observed.lock().unwrap().take().expect("watcher should have run");
    assert_eq!(target, b_id);
    assert!(cause.contains("boom"), "cause was: {}", cause);
}
