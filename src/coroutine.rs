//! The coroutine: identity, state, mailbox, exception queue, and the
//! bookkeeping around monitors and hot-swap.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{AsyncoroError, Result};
use crate::fiber::{Body, Fiber, StepOutcome};
use crate::message::{Message, Value};

/// Process-unique coroutine identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroId(pub u64);

impl fmt::Display for CoroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_CORO_ID: AtomicU64 = AtomicU64::new(1);

impl CoroId {
    pub(crate) fn fresh() -> CoroId {
        CoroId(NEXT_CORO_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state of a live coroutine. `Terminated` coroutines are removed
/// from every table rather than represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// In the ready set, waiting for its next step.
    Scheduled,
    /// Currently executing (there is at most one such coroutine).
    Running,
    /// Suspended on a plain `suspend()`, optionally with a timeout.
    Suspended,
    /// Suspended awaiting socket readiness.
    AwaitingIO,
    /// Suspended awaiting a mailbox message.
    AwaitingMessage,
}

/// Who should be notified when a coroutine terminates, and how.
#[derive(Debug, Clone)]
pub enum Monitor {
    Local(CoroId),
    Remote(crate::dist::remote::RemoteCoro),
}

/// A target body waiting to replace the current one once the coroutine
/// reaches a safe point (call depth zero, not currently running).
pub struct PendingSwap {
    pub body: Body,
}

/// A cooperatively scheduled task.
pub struct Coroutine {
    pub id: CoroId,
    pub name: String,
    pub state: State,
    fiber: Fiber,

    /// Value to deliver on the next resume; also the last value produced.
    pub value: Result<Value>,

    /// Pending exceptions to throw into the body, FIFO.
    exceptions: VecDeque<AsyncoroError>,

    /// Messages sent to this coroutine but not yet delivered to a waiting
    /// `receive()`.
    mailbox: VecDeque<Message>,

    /// Absolute deadline while suspended, and the alarm value to deliver if
    /// it fires before anything else resumes the coroutine.
    pub timeout: Option<(Instant, Value)>,

    /// Coroutines (or remote peers) to notify on termination.
    monitors: Vec<Monitor>,

    /// Depth of nested sub-coroutine calls the running body is inside.
    /// Zero means "at its own top-level frame" — the only state in which
    /// hot-swap may apply immediately and in which the coroutine is
    /// eligible to be monitored-terminated cleanly.
    call_depth: u32,

    /// Set by the coroutine itself via `set_hot_swappable`.
    pub hot_swappable: bool,

    /// A replacement body requested while ineligible; applied at the next
    /// safe point (`call_depth == 0`, not running).
    pending_swap: Option<PendingSwap>,

    /// Daemon coroutines don't delay scheduler shutdown.
    pub daemon: bool,
}

impl Coroutine {
    /// Build a coroutine around a pre-allocated id. Callers that need the id
    /// before the body closure runs (to capture it for `send`/`receive`/etc.)
    /// mint it with `CoroId::fresh()` first and pass it in here.
    pub(crate) fn with_id(id: CoroId, name: impl Into<String>, stack_size: usize, body: Body) -> Self {
        Coroutine {
            id,
            name: name.into(),
            state: State::Scheduled,
            fiber: Fiber::new(stack_size, body),
            value: Ok(Value::None),
            exceptions: VecDeque::new(),
            mailbox: VecDeque::new(),
            timeout: None,
            monitors: Vec::new(),
            call_depth: 0,
            hot_swappable: false,
            pending_swap: None,
            daemon: false,
        }
    }

    pub fn is_eligible_for_hot_swap(&self) -> bool {
        self.hot_swappable && self.call_depth == 0 && !matches!(self.state, State::Running)
    }

    /// Overwrite the nested-call depth directly. The scheduler tracks
    /// `enter_call`/`exit_call` in a side table while this coroutine is
    /// mid-step (and therefore absent from its own table), then folds the
    /// result back onto the persisted value here once it's reinserted —
    /// see `scheduler::Handle::enter_call`.
    pub(crate) fn set_call_depth(&mut self, depth: u32) {
        self.call_depth = depth;
    }

    /// Push an exception to be thrown on the coroutine's next step. If it
    /// is currently suspended, this makes it immediately schedulable.
    pub fn throw(&mut self, exc: AsyncoroError) {
        self.exceptions.push_back(exc);
        if !matches!(self.state, State::Running | State::Scheduled) {
            self.timeout = None;
            self.state = State::Scheduled;
        }
    }

    pub fn has_pending_exception(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// Request a hot swap. The replacement is stashed either way; `step`
    /// applies it as soon as the coroutine is at `call_depth == 0` with no
    /// exception ahead of it in the queue — immediately, if it is eligible
    /// right now (suspended, not nested), or at its next safe point
    /// otherwise. If the coroutine is suspended, waking it (e.g. via a
    /// dummy `resume`) is the caller's responsibility; `throw`-ing a
    /// harmless no-op is not needed because a suspended, eligible
    /// coroutine is picked up the moment the scheduler next considers it
    /// (timers and I/O wake it on their own schedule otherwise).
    pub fn hot_swap(&mut self, new_body: Body) {
        self.pending_swap = Some(PendingSwap { body: new_body });
        if self.is_eligible_for_hot_swap() && matches!(self.state, State::Suspended) {
            // Nothing else will wake a plain `Suspended` coroutine; force
            // it back onto the ready set so the swap is applied promptly.
            self.timeout = None;
            self.state = State::Scheduled;
        }
    }

    pub fn has_pending_swap(&self) -> bool {
        self.pending_swap.is_some()
    }

    /// Apply a pending swap now: rebuild the fiber from the replacement
    /// body. The mailbox is left untouched by design.
    fn apply_pending_swap(&mut self, stack_size: usize) {
        if let Some(swap) = self.pending_swap.take() {
            self.fiber = Fiber::new(stack_size, swap.body);
            self.value = Ok(Value::None);
            self.exceptions.clear();
        }
    }

    /// Append a message to the mailbox. Returned in FIFO order by
    /// `take_message`.
    pub fn deliver_message(&mut self, msg: Message) {
        self.mailbox.push_back(msg);
        if matches!(self.state, State::AwaitingMessage) {
            self.state = State::Scheduled;
            self.timeout = None;
        }
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.mailbox.pop_front()
    }

    pub fn has_message(&self) -> bool {
        !self.mailbox.is_empty()
    }

    pub fn add_monitor(&mut self, monitor: Monitor) {
        self.monitors.push(monitor);
    }

    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    /// Run one step: pop a pending exception (or apply a due hot swap)
    /// before resuming the body with the current value.
    pub(crate) fn step(&mut self, stack_size: usize) -> StepOutcome {
        if self.call_depth == 0 && self.has_pending_swap() && !self.has_pending_exception() {
            self.apply_pending_swap(stack_size);
        }

        self.state = State::Running;
        let input = if let Some(exc) = self.exceptions.pop_front() {
            Err(exc)
        } else {
            std::mem::replace(&mut self.value, Ok(Value::None))
        };
        self.fiber.resume(input)
    }

    pub fn is_finished(&self) -> bool {
        self.fiber.is_finished()
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}
