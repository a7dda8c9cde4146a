//! `OffloadPool::run_blocking` hands work to a worker thread and suspends
//! the caller until the result (or failure) comes back.

mod common;

use std::sync::{Arc, Mutex};

use asyncoro::fiber::Fiber;
use asyncoro::{OffloadPool, Value};

#[test]
fn run_blocking_returns_the_workers_result() {
    let handle = common::test_handle();
    let pool = OffloadPool::new(2);
    let observed = Arc::new(Mutex::new(None));
    let observed2 = observed.clone();

    handle.spawn("caller", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        let v = pool.run_blocking(&mut coro, || Ok(Value::Int(6 * 7)))?;
        observed2.lock().unwrap().replace(v);
        Ok(Value::None)
    });

    handle.run();
    assert_eq!(observed.lock().unwrap().take(), Some(Value::Int(42)));
}

#[test]
fn run_blocking_propagates_the_workers_error() {
    let handle = common::test_handle();
    let pool = OffloadPool::new(1);
    let observed = Arc::new(Mutex::new(None));
    let observed2 = observed.clone();

    handle.spawn("caller", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        let result = pool.run_blocking(&mut coro, || {
            Err(asyncoro::AsyncoroError::InvalidState("disk on fire".to_owned()))
        });
        observed2.lock().unwrap().replace(result.is_err());
        Ok(Value::None)
    });

    handle.run();
    assert_eq!(observed.lock().unwrap().take(), Some(true));
}
