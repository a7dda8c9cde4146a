//! Synchronization primitives: lock, reentrant lock, condition variable,
//! event, semaphore. All integrate with the scheduler through a coroutine's
//! ordinary suspend/resume path and a FIFO wait queue — there is no OS
//! blocking anywhere in this module, only `Coro::suspend`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::coroutine::CoroId;
use crate::error::{AsyncoroError, Result};
use crate::message::Value;
use crate::scheduler::{Coro, Handle};

/// FIFO queue of coroutines parked on a primitive, guarded by an ordinary
/// `std::sync::Mutex` since it may be touched from coroutine bodies running
/// on the single scheduler thread as well as, for `Handle`-level
/// operations, other threads.
#[derive(Default)]
struct WaitQueue {
    waiters: VecDeque<CoroId>,
}

impl WaitQueue {
    fn push(&mut self, id: CoroId) {
        self.waiters.push_back(id);
    }
    fn pop(&mut self) -> Option<CoroId> {
        self.waiters.pop_front()
    }
    fn pop_n(&mut self, n: usize) -> Vec<CoroId> {
        let n = n.min(self.waiters.len());
        self.waiters.drain(..n).collect()
    }
    fn drain_all(&mut self) -> Vec<CoroId> {
        self.waiters.drain(..).collect()
    }
}

fn wake(handle: &Handle, id: CoroId, value: Value) {
    handle.resume(id, value);
}

/// A mutual-exclusion lock with no concept of ownership depth: a second
/// `acquire` by the same coroutine that already owns it will block forever,
/// matching a plain (non-reentrant) lock.
#[derive(Clone, Default)]
pub struct Lock {
    state: Arc<Mutex<LockState>>,
}

#[derive(Default)]
struct LockState {
    owner: Option<CoroId>,
    queue: WaitQueue,
}

impl Lock {
    pub fn new() -> Self {
        Lock::default()
    }

    /// Acquire the lock. If `blocking` is false and the lock is already
    /// held, returns `Ok(false)` immediately instead of suspending.
    pub fn acquire(&self, coro: &mut Coro<'_>, blocking: bool) -> Result<bool> {
        loop {
            let should_wait = {
                let mut st = self.state.lock().unwrap();
                match st.owner {
                    None => {
                        st.owner = Some(coro.id);
                        false
                    }
                    Some(_) => {
                        if !blocking {
                            return Ok(false);
                        }
                        st.queue.push(coro.id);
                        true
                    }
                }
            };
            if !should_wait {
                return Ok(true);
            }
            coro.suspend()?;
            // Woken because we were handed ownership directly by `release`;
            // loop once more only in case of a spurious wake.
            let st = self.state.lock().unwrap();
            if st.owner == Some(coro.id) {
                return Ok(true);
            }
        }
    }

    /// Release the lock, handing it directly to the next waiter if any.
    /// Releasing needs no suspend capability, only the ability to resume
    /// whoever is handed ownership next, so it takes a `Handle` rather than
    /// a `&mut Coro` — callers typically pass `coro.handle()`.
    pub fn release(&self, handle: &Handle, owner: CoroId) -> Result<()> {
        let next = {
            let mut st = self.state.lock().unwrap();
            if st.owner != Some(owner) {
                return Err(AsyncoroError::InvalidState(
                    "release by non-owner".to_owned(),
                ));
            }
            let next = st.queue.pop();
            st.owner = next;
            next
        };
        if let Some(id) = next {
            wake(handle, id, Value::None);
        }
        Ok(())
    }
}

/// Reentrant lock: the owner may `acquire` repeatedly; `release` only hands
/// off ownership once the depth returns to zero.
#[derive(Clone, Default)]
pub struct RLock {
    state: Arc<Mutex<RLockState>>,
}

#[derive(Default)]
struct RLockState {
    owner: Option<CoroId>,
    depth: u32,
    queue: WaitQueue,
}

impl RLock {
    pub fn new() -> Self {
        RLock::default()
    }

    pub fn acquire(&self, coro: &mut Coro<'_>) -> Result<()> {
        loop {
            let should_wait = {
                let mut st = self.state.lock().unwrap();
                match st.owner {
                    Some(owner) if owner == coro.id => {
                        st.depth += 1;
                        false
                    }
                    None => {
                        st.owner = Some(coro.id);
                        st.depth = 1;
                        false
                    }
                    Some(_) => {
                        st.queue.push(coro.id);
                        true
                    }
                }
            };
            if !should_wait {
                return Ok(());
            }
            coro.suspend()?;
            let st = self.state.lock().unwrap();
            if st.owner == Some(coro.id) {
                return Ok(());
            }
        }
    }

    pub fn release(&self, handle: &Handle, owner: CoroId) -> Result<()> {
        let next = {
            let mut st = self.state.lock().unwrap();
            if st.owner != Some(owner) {
                return Err(AsyncoroError::InvalidState(
                    "release by non-owner".to_owned(),
                ));
            }
            st.depth -= 1;
            if st.depth > 0 {
                return Ok(());
            }
            let next = st.queue.pop();
            st.owner = next;
            if next.is_some() {
                st.depth = 1;
            }
            next
        };
        if let Some(id) = next {
            wake(handle, id, Value::None);
        }
        Ok(())
    }

    fn depth(&self) -> u32 {
        self.state.lock().unwrap().depth
    }

    fn force_release_all(&self, handle: &Handle) -> u32 {
        let mut st = self.state.lock().unwrap();
        let saved = st.depth;
        st.depth = 0;
        let next = st.queue.pop();
        st.owner = next;
        if next.is_some() {
            st.depth = 1;
        }
        drop(st);
        if let Some(id) = next {
            wake(handle, id, Value::None);
        }
        saved
    }

    fn restore(&self, coro: &mut Coro<'_>, depth: u32) -> Result<()> {
        loop {
            let acquired = {
                let mut st = self.state.lock().unwrap();
                match st.owner {
                    None => {
                        st.owner = Some(coro.id);
                        st.depth = depth;
                        true
                    }
                    Some(owner) if owner == coro.id => {
                        st.depth = depth;
                        true
                    }
                    Some(_) => {
                        st.queue.push(coro.id);
                        false
                    }
                }
            };
            if acquired {
                return Ok(());
            }
            // Handed back in by a `release`/`restore` elsewhere; loop once
            // more to claim it at the right depth.
            coro.suspend()?;
        }
    }
}

/// Condition variable with reentrant-lock owner semantics.
#[derive(Clone)]
pub struct Condition {
    lock: RLock,
    notify: Arc<Mutex<WaitQueue>>,
}

impl Condition {
    pub fn new(lock: RLock) -> Self {
        Condition {
            lock,
            notify: Arc::new(Mutex::new(WaitQueue::default())),
        }
    }

    /// Release the lock (saving its depth), wait to be notified (or time
    /// out), then reacquire the lock restoring the saved depth.
    pub fn wait(&self, coro: &mut Coro<'_>, timeout: Option<Duration>) -> Result<bool> {
        // Bracket the whole release/suspend/reacquire sequence: a hot swap
        // landing between `force_release_all` and `restore` would replace
        // this body before the lock is ever reacquired, stranding it
        // released at a depth nobody will restore.
        coro.enter_call();
        let result = (|| {
            let depth = self.lock.force_release_all(coro.handle());
            self.notify.lock().unwrap().push(coro.id);

            let woke = coro.receive(timeout, Value::Bool(false))?;
            let notified = !matches!(woke, Value::Bool(false));

            self.lock.restore(coro, depth)?;
            Ok(notified)
        })();
        coro.exit_call();
        result
    }

    pub fn notify(&self, handle: &Handle, n: usize) {
        let waiters = self.notify.lock().unwrap().pop_n(n);
        for id in waiters {
            wake(handle, id, Value::Bool(true));
        }
    }

    pub fn notify_all(&self, handle: &Handle) {
        let waiters = self.notify.lock().unwrap().drain_all();
        for id in waiters {
            wake(handle, id, Value::Bool(true));
        }
    }

    pub fn owner_depth(&self) -> u32 {
        self.lock.depth()
    }
}

/// A boolean flag with FIFO wakeup on `set`.
#[derive(Clone, Default)]
pub struct Event {
    state: Arc<Mutex<EventState>>,
}

#[derive(Default)]
struct EventState {
    flag: bool,
    queue: WaitQueue,
}

impl Event {
    pub fn new() -> Self {
        Event::default()
    }

    pub fn wait(&self, coro: &mut Coro<'_>, timeout: Option<Duration>) -> Result<bool> {
        {
            let mut st = self.state.lock().unwrap();
            if st.flag {
                return Ok(true);
            }
            st.queue.push(coro.id);
        }
        let woke = coro.receive(timeout, Value::Bool(false))?;
        Ok(matches!(woke, Value::Bool(true)))
    }

    pub fn set(&self, handle: &Handle) {
        let waiters = {
            let mut st = self.state.lock().unwrap();
            st.flag = true;
            st.queue.drain_all()
        };
        for id in waiters {
            wake(handle, id, Value::Bool(true));
        }
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().flag = false;
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().unwrap().flag
    }
}

/// A non-negative counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    state: Arc<Mutex<SemaphoreState>>,
}

struct SemaphoreState {
    count: u32,
    queue: WaitQueue,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Semaphore {
            state: Arc::new(Mutex::new(SemaphoreState {
                count: initial,
                queue: WaitQueue::default(),
            })),
        }
    }

    pub fn acquire(&self, coro: &mut Coro<'_>) -> Result<()> {
        loop {
            let should_wait = {
                let mut st = self.state.lock().unwrap();
                if st.count > 0 {
                    st.count -= 1;
                    false
                } else {
                    st.queue.push(coro.id);
                    true
                }
            };
            if !should_wait {
                return Ok(());
            }
            coro.suspend()?;
            // A release() that targeted us directly already decremented on
            // our behalf; a spurious wake just loops back to re-check.
        }
    }

    pub fn release(&self, handle: &Handle) {
        let next = {
            let mut st = self.state.lock().unwrap();
            let next = st.queue.pop();
            if next.is_none() {
                st.count += 1;
            }
            next
        };
        if let Some(id) = next {
            wake(handle, id, Value::None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn test_handle() -> Handle {
        Handle::with_notifier(
            Box::new(crate::notifier::select_backend::SelectNotifier::new().unwrap()),
            Fiber::DEFAULT_STACK_SIZE,
        )
    }

    #[test]
    fn lock_serializes_two_contending_coroutines() {
        let handle = test_handle();
        let lock = Lock::new();
        let order = StdArc::new(std::sync::Mutex::new(Vec::new()));

        for (name, tag) in [("first", 1), ("second", 2)] {
            let lock = lock.clone();
            let order = order.clone();
            handle.spawn(name, Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
                lock.acquire(&mut coro, true)?;
                order.lock().unwrap().push(tag);
                lock.release(coro.handle(), coro.id)?;
                Ok(Value::None)
            });
        }
        handle.run();
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn semaphore_admits_only_its_initial_count_at_once() {
        let handle = test_handle();
        let sem = Semaphore::new(1);
        let inside = StdArc::new(AtomicUsize::new(0));
        let max_inside = StdArc::new(AtomicUsize::new(0));

        for name in ["a", "b"] {
            let sem = sem.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handle.spawn(name, Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
                sem.acquire(&mut coro)?;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                coro.yield_now()?;
                inside.fetch_sub(1, Ordering::SeqCst);
                sem.release(coro.handle());
                Ok(Value::None)
            });
        }
        handle.run();
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_wakes_everyone_waiting_when_set() {
        let handle = test_handle();
        let event = Event::new();
        let woke = StdArc::new(AtomicUsize::new(0));

        for name in ["a", "b", "c"] {
            let event = event.clone();
            let woke = woke.clone();
            handle.spawn(name, Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
                if event.wait(&mut coro, Some(Duration::from_secs(2)))? {
                    woke.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Value::None)
            });
        }

        handle.spawn("setter", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            coro.yield_now()?;
            event.set(coro.handle());
            Ok(Value::None)
        });

        handle.run();
        assert_eq!(woke.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn condition_wait_reacquires_the_lock_before_returning() {
        let handle = test_handle();
        let lock = RLock::new();
        let cond = Condition::new(lock.clone());
        let held_on_wake = StdArc::new(std::sync::Mutex::new(None));

        let held_on_wake2 = held_on_wake.clone();
        let waiter_lock = lock.clone();
        let waiter_cond = cond.clone();
        handle.spawn("waiter", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            waiter_lock.acquire(&mut coro)?;
            waiter_cond.wait(&mut coro, Some(Duration::from_secs(2)))?;
            held_on_wake2.lock().unwrap().replace(waiter_lock.owner_depth());
            waiter_lock.release(coro.handle(), coro.id)?;
            Ok(Value::None)
        });

        handle.spawn("notifier", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            lock.acquire(&mut coro)?;
            cond.notify_all(coro.handle());
            lock.release(coro.handle(), coro.id)?;
            Ok(Value::None)
        });

        handle.run();
        assert_eq!(*held_on_wake.lock().unwrap(), Some(1));
    }
}
