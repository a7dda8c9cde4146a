//! Shared test scaffolding: a deterministic `Handle` built on the
//! `select`-based notifier fallback, matching the one `scheduler.rs`'s own
//! unit tests use, so these integration tests don't depend on `mio`'s
//! event ordering.

use asyncoro::fiber::Fiber;
use asyncoro::notifier::select_backend::SelectNotifier;
use asyncoro::scheduler::Handle;

#[allow(dead_code)]
pub fn test_handle() -> Handle {
    Handle::with_notifier(
        Box::new(SelectNotifier::new().unwrap()),
        Fiber::DEFAULT_STACK_SIZE,
    )
}
