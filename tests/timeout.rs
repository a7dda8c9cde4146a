//! S2: a `receive` with no sender resumes with the alarm value after its
//! deadline, not before.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use asyncoro::fiber::Fiber;
use asyncoro::Value;

#[test]
fn receive_times_out_with_alarm_after_the_deadline() {
    let handle = common::test_handle();
    let result = Arc::new(Mutex::new(None));
    let result2 = result.clone();

    let started = Instant::now();
    handle.spawn("waiter", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        let v = coro.receive(Some(Duration::from_millis(100)), Value::from("T"))?;
        result2.lock().unwrap().replace((v, started.elapsed()));
        Ok(Value::None)
    });

    handle.run();
    let (value, elapsed) = result.lock().unwrap().take().expect("waiter should have run");
    assert_eq!(value, Value::Text("T".to_owned()));
    assert!(
        elapsed >= Duration::from_millis(100),
        "resumed after only {:?}",
        elapsed
    );
}
