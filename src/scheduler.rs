//! The run loop: ready/suspended coroutines, the timer heap, the notifier,
//! and the external, thread-safe `Handle` surface used to drive it all from
//! outside the scheduler thread.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::ReentrantMutex;

use crate::clock::{sleep_bound, TimerHeap};
use crate::coroutine::{Coroutine, CoroId, Monitor, State};
use crate::error::{AsyncoroError, Result};
use crate::fiber::{Body, Fiber, StepOutcome};
use crate::message::{Message, Value};
use crate::notifier::{default_notifier, Interest, Notifier};

/// What a socket/primitive is waiting for on one fd.
#[derive(Default)]
struct IoWaiters {
    read: Option<CoroId>,
    write: Option<CoroId>,
}

/// Everything the run loop owns. Reached only through `Handle`, which
/// serializes access behind a reentrant lock — reentrant because a
/// coroutine body resuming another coroutine (e.g. releasing a lock that
/// wakes its next owner) re-enters scheduler methods from the same thread
/// that is already inside `run()`.
struct Scheduler {
    coros: HashMap<CoroId, Coroutine>,
    ready: VecDeque<CoroId>,
    timers: TimerHeap,
    notifier: Box<dyn Notifier>,
    io_waiters: HashMap<RawFd, IoWaiters>,
    /// Nested-call depth per coroutine, mutated unconditionally rather than
    /// through `coros.get_mut`: a coroutine bracketing `enter_call`/
    /// `exit_call` around its own suspend points (the TLS handshake retry
    /// loop, a condition-variable wait) calls these on itself while it is
    /// mid-step and therefore absent from `coros` (see `step_one`). This
    /// map is the durable side channel; `step_one` copies the current depth
    /// back onto the `Coroutine` when it reinserts it after a suspend, the
    /// same way `io_waiters`/`timers` survive a self-targeted wait.
    call_depths: HashMap<CoroId, u32>,
    polling: bool,
    terminate: bool,
    stack_size: usize,
    non_daemon_live: usize,
    /// Set once the distributed layer bootstraps; forwards a terminated
    /// coroutine's remote monitors to `dist`'s outbound request queue.
    /// `None` when no `node` was configured, or before bootstrap runs.
    remote_monitor_sink: Option<Arc<dyn Fn(crate::dist::remote::RemoteCoro, String) + Send + Sync>>,
}

impl Scheduler {
    fn new(notifier: Box<dyn Notifier>, stack_size: usize) -> Self {
        Scheduler {
            coros: HashMap::new(),
            ready: VecDeque::new(),
            timers: TimerHeap::new(),
            notifier,
            io_waiters: HashMap::new(),
            call_depths: HashMap::new(),
            polling: false,
            terminate: false,
            stack_size,
            non_daemon_live: 0,
            remote_monitor_sink: None,
        }
    }

    fn push_ready(&mut self, id: CoroId) {
        if !self.ready.contains(&id) {
            self.ready.push_back(id);
        }
    }

    fn wake_if_polling(&self) {
        if self.polling {
            self.notifier.interrupt();
        }
    }
}

/// Settings recognized at scheduler construction. Mirrors the design's
/// configuration surface; everything networking-related here is wired
/// through once the distributed layer is built on top of this scheduler.
#[derive(Clone, Default)]
pub struct Config {
    pub node: Option<String>,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub ext_ip_addr: Option<String>,
    pub name: Option<String>,
    pub secret: Option<String>,
    pub certfile: Option<String>,
    pub keyfile: Option<String>,
    pub stack_size: usize,
}

impl Config {
    pub fn new() -> Self {
        Config {
            stack_size: Fiber::DEFAULT_STACK_SIZE,
            ..Config::default()
        }
    }

    pub fn node(mut self, addr: impl Into<String>) -> Self {
        self.node = Some(addr.into());
        self
    }
    pub fn udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }
    pub fn ext_ip_addr(mut self, addr: impl Into<String>) -> Self {
        self.ext_ip_addr = Some(addr.into());
        self
    }
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
    pub fn tls_identity(mut self, certfile: impl Into<String>, keyfile: impl Into<String>) -> Self {
        self.certfile = Some(certfile.into());
        self.keyfile = Some(keyfile.into());
        self
    }
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }
}

/// A cloneable, thread-safe reference to a running (or not-yet-started)
/// scheduler. This is what coroutine bodies, other threads, and the
/// distributed layer all hold instead of a bare `&Scheduler`.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<ReentrantMutex<RefCell<Scheduler>>>,
}

/// Context handed to a running coroutine body: its own id plus the handle
/// needed to talk back to the scheduler, paired with the `Yielder` that
/// actually performs the stack switch.
pub struct Coro<'y> {
    pub id: CoroId,
    handle: Handle,
    yielder: &'y mut crate::fiber::Yielder<'y>,
}

impl<'y> Coro<'y> {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Suspend unconditionally, returning whatever value/exception is next
    /// delivered to this coroutine.
    pub fn suspend(&mut self) -> Result<Value> {
        self.yielder.suspend()
    }

    /// Yield the processor without actually going to sleep: rejoin the back
    /// of the ready queue and come back around at the scheduler's next
    /// pass.
    pub fn yield_now(&mut self) -> Result<Value> {
        self.handle.reschedule(self.id);
        self.suspend()
    }

    /// Suspend for `dur`, waking with `Value::None` either because the
    /// timer fired or because something else resumed us first.
    pub fn sleep(&mut self, dur: Duration) -> Result<Value> {
        self.handle
            .arm_timeout(self.id, Instant::now() + dur, Value::None);
        let result = self.suspend();
        self.handle.disarm_timeout(self.id);
        result
    }

    /// Block waiting for a mailbox message, honoring an optional deadline.
    /// On timeout, returns `alarm` rather than propagating `Timeout`,
    /// matching `suspend(timeout, alarm)` in the design.
    pub fn receive(&mut self, timeout: Option<Duration>, alarm: Value) -> Result<Value> {
        if let Some(msg) = self.handle.take_message(self.id) {
            return Ok(msg.payload);
        }
        if timeout == Some(Duration::from_secs(0)) {
            return Ok(alarm);
        }
        self.handle.set_state(self.id, State::AwaitingMessage);
        if let Some(d) = timeout {
            self.handle
                .arm_timeout(self.id, Instant::now() + d, alarm.clone());
        }
        let woke = self.suspend();
        self.handle.disarm_timeout(self.id);
        match woke {
            Ok(Value::None) => match self.handle.take_message(self.id) {
                Some(msg) => Ok(msg.payload),
                None => Ok(alarm),
            },
            other => other,
        }
    }

    /// Send a message to another coroutine's mailbox.
    pub fn send(&self, target: CoroId, payload: Value) {
        self.handle.deliver_message(target, Some(self.id), payload);
    }

    /// Register a monitor: `self` is notified when `target` terminates.
    pub fn monitor(&self, target: CoroId) {
        self.handle.add_monitor(target, Monitor::Local(self.id));
    }

    /// Enter a nested sub-computation (TLS handshake retry loop, a
    /// condition-variable release/reacquire) that must suspend without
    /// making this coroutine eligible for hot-swap in the meantime.
    pub fn enter_call(&self) {
        self.handle.enter_call(self.id);
    }

    /// Leave a sub-computation entered with [`Coro::enter_call`].
    pub fn exit_call(&self) {
        self.handle.exit_call(self.id);
    }

    /// Suspend until `fd` is ready for `interest`, or `timeout` elapses
    /// first (returning `Ok(false)` in that case). Used by the async socket
    /// layer, which owns fds the scheduler itself knows nothing about
    /// beyond their readiness waiters.
    pub fn await_ready(
        &mut self,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.handle.await_io(self.id, fd, interest);
        if let Some(d) = timeout {
            self.handle
                .arm_timeout(self.id, Instant::now() + d, Value::Bool(false));
        }
        let woke = self.suspend();
        self.handle.disarm_timeout(self.id);
        self.handle.cancel_io_wait(fd, interest);
        match woke? {
            Value::Bool(false) => Ok(false),
            _ => Ok(true),
        }
    }
}

impl Handle {
    /// Create a fresh, not-yet-run scheduler using the preferred backend
    /// notifier (`mio`), or the one supplied via a future `notifier`
    /// config hook.
    pub fn new(config: &Config) -> Self {
        Handle {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(Scheduler::new(
                default_notifier(),
                if config.stack_size == 0 {
                    Fiber::DEFAULT_STACK_SIZE
                } else {
                    config.stack_size
                },
            )))),
        }
    }

    /// Create a scheduler around an explicit notifier (used by tests that
    /// want the deterministic `select`-based fallback).
    pub fn with_notifier(notifier: Box<dyn Notifier>, stack_size: usize) -> Self {
        Handle {
            inner: Arc::new(ReentrantMutex::new(RefCell::new(Scheduler::new(
                notifier, stack_size,
            )))),
        }
    }

    /// Take the reentrant lock and run `f` against the scheduler state.
    /// Reentrant: a coroutine body that (transitively) calls back into the
    /// `Handle` while already inside `run()` on this thread re-enters here
    /// safely; the `RefCell` still catches any accidental aliasing bug.
    fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        let guard = self.inner.lock();
        let mut sched = guard.borrow_mut();
        f(&mut sched)
    }

    /// Spawn a new coroutine. Safe to call before `run()`, from inside a
    /// running body, or from any other thread.
    pub fn spawn<F>(&self, name: impl Into<String>, stack_size: usize, f: F) -> CoroId
    where
        F: for<'y> FnOnce(Coro<'y>) -> Result<Value> + Send + 'static,
    {
        let id = CoroId::fresh();
        let handle = self.clone();
        let body: Body = Box::new(move |yielder| {
            let coro = Coro { id, handle, yielder };
            f(coro)
        });

        self.with_scheduler(|sched| {
            let coro = Coroutine::with_id(id, name, stack_size, body);
            if !coro.daemon {
                sched.non_daemon_live += 1;
            }
            sched.coros.insert(id, coro);
            sched.push_ready(id);
            sched.wake_if_polling();
        });
        trace!("spawned coroutine {}", id);
        id
    }

    pub fn set_daemon(&self, id: CoroId, daemon: bool) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                if coro.daemon != daemon {
                    if daemon {
                        sched.non_daemon_live = sched.non_daemon_live.saturating_sub(1);
                    } else {
                        sched.non_daemon_live += 1;
                    }
                }
                coro.daemon = daemon;
            }
        });
    }

    pub fn set_hot_swappable(&self, id: CoroId, swappable: bool) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.hot_swappable = swappable;
            }
        });
    }

    /// Mark `id` as inside a nested sub-computation (a TLS handshake, a
    /// condition-variable wait mid-release/reacquire) — ineligible for hot
    /// swap or clean monitor termination until a matching `exit_call`.
    ///
    /// Always called by a coroutine on itself, which means `id` is absent
    /// from `coros` for as long as it's mid-step (`step_one` removes it
    /// before stepping); the depth is tracked in `call_depths` instead and
    /// copied onto the `Coroutine` once it's reinserted after a suspend.
    pub fn enter_call(&self, id: CoroId) {
        self.with_scheduler(|sched| {
            *sched.call_depths.entry(id).or_insert(0) += 1;
        });
    }

    pub fn exit_call(&self, id: CoroId) {
        self.with_scheduler(|sched| {
            if let Some(depth) = sched.call_depths.get_mut(&id) {
                *depth = depth.saturating_sub(1);
            }
        });
    }

    /// Resume a coroutine with a specific value, regardless of its current
    /// wait reason. Mismatched state is logged and ignored, matching the
    /// design's "a resume whose state does not match is logged and
    /// ignored".
    pub fn resume(&self, id: CoroId, value: Value) {
        self.with_scheduler(|sched| match sched.coros.get_mut(&id) {
            Some(coro) if !matches!(coro.state, State::Running) => {
                coro.value = Ok(value);
                coro.state = State::Scheduled;
                coro.timeout = None;
                sched.push_ready(id);
                sched.wake_if_polling();
            }
            Some(_) => warn!("resume({}) ignored: coroutine is currently running", id),
            None => warn!("resume({}) ignored: no such coroutine", id),
        });
    }

    pub fn throw(&self, id: CoroId, exc: AsyncoroError) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.throw(exc);
                sched.push_ready(id);
                sched.wake_if_polling();
            }
        });
    }

    pub fn terminate_coro(&self, id: CoroId) {
        self.throw(id, AsyncoroError::InvalidState("terminated".to_owned()));
    }

    pub fn hot_swap(&self, id: CoroId, body: Body) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.hot_swap(body);
                if matches!(coro.state, State::Scheduled) {
                    sched.push_ready(id);
                }
                sched.wake_if_polling();
            }
        });
    }

    /// Convenience wrapper over [`Handle::hot_swap`] for the common case of
    /// a replacement body written the same way a spawned one is — against
    /// `Coro` rather than the raw `Yielder` `Body` deals in directly.
    pub fn hot_swap_with<F>(&self, id: CoroId, f: F)
    where
        F: for<'y> FnOnce(Coro<'y>) -> Result<Value> + Send + 'static,
    {
        let handle = self.clone();
        let body: Body = Box::new(move |yielder| {
            let coro = Coro { id, handle, yielder };
            f(coro)
        });
        self.hot_swap(id, body);
    }

    /// Install the closure the distributed layer uses to forward a
    /// terminated coroutine's remote monitors onward. Called once by
    /// `dist::bootstrap` when `Config::node` is set; a no-op scheduler
    /// never has one installed.
    pub fn set_remote_monitor_sink(
        &self,
        sink: Arc<dyn Fn(crate::dist::remote::RemoteCoro, String) + Send + Sync>,
    ) {
        self.with_scheduler(|sched| sched.remote_monitor_sink = Some(sink));
    }

    pub fn add_monitor(&self, target: CoroId, monitor: Monitor) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&target) {
                coro.add_monitor(monitor);
            }
        });
    }

    pub fn deliver_message(&self, target: CoroId, sender: Option<CoroId>, payload: Value) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&target) {
                coro.deliver_message(Message::new(sender, payload));
                if matches!(coro.state, State::Scheduled) {
                    sched.push_ready(target);
                    sched.wake_if_polling();
                }
            }
        });
    }

    fn take_message(&self, id: CoroId) -> Option<Message> {
        self.with_scheduler(|sched| sched.coros.get_mut(&id).and_then(|c| c.take_message()))
    }

    fn set_state(&self, id: CoroId, state: State) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.state = state;
            }
        });
    }

    fn reschedule(&self, id: CoroId) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.state = State::Scheduled;
            }
            sched.push_ready(id);
        });
    }

    fn arm_timeout(&self, id: CoroId, deadline: Instant, alarm: Value) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.timeout = Some((deadline, alarm.clone()));
            }
            sched.timers.push(id, deadline, alarm);
        });
    }

    fn disarm_timeout(&self, id: CoroId) {
        self.with_scheduler(|sched| {
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.timeout = None;
            }
        });
    }

    /// Register this coroutine as waiting for `interest` on `fd`. Used by
    /// the async socket layer; `fd` must already be registered with the
    /// notifier.
    pub fn await_io(&self, id: CoroId, fd: RawFd, interest: Interest) {
        self.with_scheduler(|sched| {
            {
                let waiters = sched.io_waiters.entry(fd).or_default();
                if interest.contains(Interest::READ) {
                    waiters.read = Some(id);
                }
                if interest.contains(Interest::WRITE) {
                    waiters.write = Some(id);
                }
            }
            if let Some(coro) = sched.coros.get_mut(&id) {
                coro.state = State::AwaitingIO;
            }
        });
    }

    pub fn cancel_io_wait(&self, fd: RawFd, interest: Interest) {
        self.with_scheduler(|sched| {
            if let Some(waiters) = sched.io_waiters.get_mut(&fd) {
                if interest.contains(Interest::READ) {
                    waiters.read = None;
                }
                if interest.contains(Interest::WRITE) {
                    waiters.write = None;
                }
            }
        });
    }

    /// Access the notifier directly (register/modify/unregister/timeouts).
    /// Exposed for the async socket layer, which owns fds the scheduler
    /// itself knows nothing about beyond their readiness waiters.
    pub fn with_notifier<R>(&self, f: impl FnOnce(&mut dyn Notifier) -> R) -> R {
        self.with_scheduler(|sched| f(&mut *sched.notifier))
    }

    /// Request scheduler shutdown. If `await_non_daemons`, `run()` keeps
    /// looping until every non-daemon coroutine has terminated even after
    /// this call; otherwise the very next pass tears everything down.
    pub fn terminate(&self, await_non_daemons: bool) {
        self.with_scheduler(|sched| {
            if !await_non_daemons {
                sched.non_daemon_live = 0;
            }
            sched.terminate = true;
            sched.wake_if_polling();
        });
    }

    pub fn coro_count(&self) -> usize {
        self.with_scheduler(|sched| sched.coros.len())
    }

    /// Drive the run loop on the calling thread until termination is
    /// requested and every non-daemon coroutine has finished.
    pub fn run(&self) {
        loop {
            if self.drive_one_pass() {
                break;
            }
        }
    }

    /// One iteration of the run loop described in the design: drain
    /// immediate readiness, poll (possibly blocking), expire timers, step
    /// every ready coroutine once. Returns `true` once shutdown is
    /// complete.
    fn drive_one_pass(&self) -> bool {
        self.pump_io(Some(Duration::from_secs(0)));

        let should_block = self.with_scheduler(|sched| sched.ready.is_empty() && !sched.terminate);
        if should_block {
            let bound = self.with_scheduler(|sched| sleep_bound(&sched.timers, Instant::now()));
            self.with_scheduler(|sched| sched.polling = true);
            self.pump_io(bound);
            self.with_scheduler(|sched| sched.polling = false);
        }

        self.expire_timers();
        self.step_ready_snapshot();

        self.with_scheduler(|sched| {
            if sched.terminate && sched.non_daemon_live == 0 && sched.ready.is_empty() {
                debug!("scheduler shutting down");
                true
            } else {
                false
            }
        })
    }

    fn pump_io(&self, timeout: Option<Duration>) {
        let events = self.with_scheduler(|sched| match sched.notifier.poll(timeout) {
            Ok(events) => events,
            Err(e) => {
                warn!("notifier poll failed: {}", e);
                Vec::new()
            }
        });
        if events.is_empty() {
            return;
        }
        self.with_scheduler(|sched| {
            for event in events {
                let waiters = match sched.io_waiters.get_mut(&event.fd) {
                    Some(w) => w,
                    None => continue,
                };
                if (event.interest.contains(Interest::READ) || event.interest.is_empty())
                    && waiters.read.is_some()
                {
                    let id = waiters.read.take().unwrap();
                    if let Some(coro) = sched.coros.get_mut(&id) {
                        coro.value = Ok(Value::None);
                        coro.state = State::Scheduled;
                        sched.ready.push_back(id);
                    }
                }
                if (event.interest.contains(Interest::WRITE) || event.interest.is_empty())
                    && waiters.write.is_some()
                {
                    let id = waiters.write.take().unwrap();
                    if let Some(coro) = sched.coros.get_mut(&id) {
                        coro.value = Ok(Value::None);
                        coro.state = State::Scheduled;
                        sched.ready.push_back(id);
                    }
                }
            }
        });
    }

    fn expire_timers(&self) {
        self.with_scheduler(|sched| {
            let now = Instant::now();
            let coros = &sched.coros;
            let fired = sched.timers.drain_expired(now, |entry| {
                coros
                    .get(&entry.coro)
                    .map(|c| matches!(c.timeout, Some((d, _)) if d == entry.deadline))
                    .unwrap_or(false)
            });
            for entry in fired {
                if let Some(coro) = sched.coros.get_mut(&entry.coro) {
                    if !matches!(coro.state, State::Running) {
                        coro.value = Ok(entry.alarm);
                        coro.timeout = None;
                        coro.state = State::Scheduled;
                        sched.ready.push_back(entry.coro);
                    }
                }
            }
        });
    }

    fn step_ready_snapshot(&self) {
        let snapshot: Vec<CoroId> = self.with_scheduler(|sched| {
            let mut ready = VecDeque::new();
            std::mem::swap(&mut ready, &mut sched.ready);
            ready.into_iter().collect()
        });

        for id in snapshot {
            self.step_one(id);
        }
    }

    /// Step one coroutine. The coroutine is temporarily removed from the
    /// scheduler's table and stepped *outside* the scheduler borrow: the
    /// body we're resuming may itself call back into this `Handle` (e.g.
    /// `Coro::send` to another coroutine, or a nested `spawn`), and those
    /// reentrant calls need to take their own borrow of the scheduler
    /// state. Holding our own borrow across the fiber switch would make
    /// that second borrow panic.
    fn step_one(&self, id: CoroId) {
        let taken = self.with_scheduler(|sched| {
            let stack_size = sched.stack_size;
            match sched.coros.get(&id).map(|c| c.state) {
                Some(State::Scheduled) => sched.coros.remove(&id).map(|c| (c, stack_size)),
                _ => None,
            }
        });
        let (mut coro, stack_size) = match taken {
            Some(pair) => pair,
            None => return,
        };

        let outcome = coro.step(stack_size);

        match outcome {
            StepOutcome::Suspended => {
                self.with_scheduler(|sched| {
                    // The body itself set the right wait state before
                    // suspending (AwaitingIO/AwaitingMessage/Suspended); if
                    // it left it Running, this was either a plain suspend
                    // or a self-targeted `yield_now`, which already pushed
                    // us onto `sched.ready` while we were mid-step (and so
                    // couldn't update our own state, having been removed
                    // from `sched.coros` for the duration of the step).
                    if matches!(coro.state, State::Running) {
                        coro.state = if sched.ready.contains(&id) {
                            State::Scheduled
                        } else {
                            State::Suspended
                        };
                    }
                    // Same reasoning: a self-targeted `enter_call`/`exit_call`
                    // during the step just landed in `call_depths` rather than
                    // on `coro` directly, since `coro` wasn't in `coros` at
                    // the time. Fold it back in now that it's visible again.
                    if let Some(&depth) = sched.call_depths.get(&id) {
                        coro.set_call_depth(depth);
                    }
                    sched.coros.insert(id, coro);
                });
            }
            StepOutcome::Returned(result) => {
                self.finish_coroutine(id, coro, result);
            }
            StepOutcome::Panicked(payload) => {
                let msg = panic_message(&payload);
                warn!("coroutine {} panicked: {}", id, msg);
                self.finish_coroutine(id, coro, Err(AsyncoroError::InvalidState(msg)));
            }
        }
    }

    fn finish_coroutine(&self, id: CoroId, coro: Coroutine, result: Result<Value>) {
        let cause = match &result {
            Ok(v) => format!("{:?}", v),
            Err(e) => e.to_string(),
        };
        if let Err(e) = &result {
            debug!("coroutine {} terminated with error: {}", id, e);
        } else {
            trace!("coroutine {} terminated normally", id);
        }

        self.with_scheduler(|sched| {
            sched.call_depths.remove(&id);
            if !coro.daemon {
                sched.non_daemon_live = sched.non_daemon_live.saturating_sub(1);
                // Mirrors a thread pool whose only non-daemon thread just
                // exited: once nothing is left to justify keeping the run
                // loop alive, shut it down rather than block forever
                // servicing only daemon coroutines (offload workers, the
                // dist daemons) that nobody is waiting on.
                if sched.non_daemon_live == 0 {
                    sched.terminate = true;
                    sched.wake_if_polling();
                }
            }
            for monitor in coro.monitors() {
                match monitor {
                    Monitor::Local(watcher) => {
                        if let Some(w) = sched.coros.get_mut(watcher) {
                            w.throw(AsyncoroError::Monitor {
                                target: id,
                                cause: cause.clone(),
                            });
                            sched.push_ready(*watcher);
                        }
                    }
                    Monitor::Remote(remote) => match &sched.remote_monitor_sink {
                        Some(sink) => sink(remote.clone(), cause.clone()),
                        None => warn!(
                            "coroutine {} terminated with a remote monitor at {} but no node is configured",
                            id, remote.location
                        ),
                    },
                }
            }
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "coroutine panicked with a non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    fn test_handle() -> Handle {
        Handle::with_notifier(
            Box::new(crate::notifier::select_backend::SelectNotifier::new().unwrap()),
            Fiber::DEFAULT_STACK_SIZE,
        )
    }

    #[test]
    fn runs_a_trivial_coroutine_to_completion() {
        let handle = test_handle();
        let ran = StdArc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        handle.spawn("trivial", Fiber::DEFAULT_STACK_SIZE, move |_coro| {
            ran2.store(true, Ordering::SeqCst);
            Ok(Value::Int(1))
        });
        handle.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn sleep_wakes_after_duration() {
        let handle = test_handle();
        let woke = StdArc::new(AtomicBool::new(false));
        let woke2 = woke.clone();
        handle.spawn("sleeper", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            coro.sleep(Duration::from_millis(20))?;
            woke2.store(true, Ordering::SeqCst);
            Ok(Value::None)
        });
        handle.run();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn receive_times_out_with_alarm() {
        let handle = test_handle();
        let seen = StdArc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        handle.spawn("waiter", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            let v = coro.receive(Some(Duration::from_millis(20)), Value::from("T"))?;
            *seen2.lock().unwrap() = Some(v);
            Ok(Value::None)
        });
        handle.run();
        assert_eq!(*seen.lock().unwrap(), Some(Value::Text("T".to_owned())));
    }

    #[test]
    fn send_then_receive_delivers_fifo() {
        let handle = test_handle();
        let results = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let results2 = results.clone();

        let receiver_id = StdArc::new(std::sync::Mutex::new(None));
        let receiver_id2 = receiver_id.clone();

        let h2 = handle.clone();
        handle.spawn("receiver", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            *receiver_id2.lock().unwrap() = Some(coro.id);
            let a = coro.receive(None, Value::None)?;
            let b = coro.receive(None, Value::None)?;
            results2.lock().unwrap().push(a);
            results2.lock().unwrap().push(b);
            Ok(Value::None)
        });

        // Give the receiver a chance to register, then send from a
        // spawned sender coroutine once we know its id.
        h2.spawn("sender", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
            // Busy-yield until the receiver id is published.
            let target = loop {
                if let Some(id) = *receiver_id.lock().unwrap() {
                    break id;
                }
                coro.yield_now()?;
            };
            coro.send(target, Value::from(1i64));
            coro.send(target, Value::from(2i64));
            Ok(Value::None)
        });

        handle.run();
        assert_eq!(
            *results.lock().unwrap(),
            vec![Value::Int(1), Value::Int(2)]
        );
    }
}
