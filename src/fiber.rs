//! Stackful fiber built on the `context` crate.
//!
//! Each coroutine owns one `Fiber`: a protected guard-paged stack plus a
//! `context::Context` pointing into it. Resuming a fiber is a single
//! `Context::resume` stack switch. Because the switch only carries a raw
//! `usize`, the actual payload (a `Result<Value, AsyncoroError>` going in,
//! a `StepOutcome` coming out) is smuggled through a thread-local slot for
//! the duration of each switch, following the same pattern used by other
//! `context`-based coroutine libraries (a `Switch`/`Transfer` thread-local
//! that is always empty except mid-handoff).
//!
//! This is the one module in the crate with a deliberately unsafe core;
//! everything above it (`coroutine.rs` and up) is ordinary safe Rust.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::error::{AsyncoroError, Result};
use crate::message::Value;

/// A coroutine body: runs until it returns or suspends via `Yielder`.
pub type Body = Box<dyn FnOnce(&mut Yielder) -> Result<Value> + Send>;

/// What a fiber hands back to the scheduler when it switches out.
pub enum StepOutcome {
    /// The body suspended itself (I/O, message wait, sleep, primitive
    /// acquire, explicit yield). It will be resumed later with a
    /// `Result<Value, AsyncoroError>`.
    Suspended,
    /// The body ran to completion, successfully or with an uncaught error.
    Returned(Result<Value>),
    /// The body panicked. Carried separately from `Returned` so the
    /// scheduler can log it distinctly before treating the coroutine as
    /// terminated with an uncaught error.
    Panicked(Box<dyn Any + Send>),
}

enum ResumeOp {
    Start(Body),
    Deliver(Result<Value>),
}

enum SlotPayload {
    ToFiber(ResumeOp),
    FromFiber(StepOutcome),
}

thread_local! {
    static SLOT: RefCell<Option<SlotPayload>> = RefCell::new(None);
}

/// Handed to the running body so it can suspend itself at any point.
pub struct Yielder<'a> {
    context: &'a mut Option<Context>,
}

impl<'a> Yielder<'a> {
    /// Suspend the fiber, switching back to whoever resumed it. Returns the
    /// value the scheduler later delivers, or the exception it throws.
    pub fn suspend(&mut self) -> Result<Value> {
        let ctx = self
            .context
            .take()
            .expect("fiber context missing at suspend point");
        SLOT.with(|s| {
            *s.borrow_mut() = Some(SlotPayload::FromFiber(StepOutcome::Suspended));
        });
        let transfer = unsafe { ctx.resume(0) };
        *self.context = Some(transfer.context);
        SLOT.with(|s| match s.borrow_mut().take() {
            Some(SlotPayload::ToFiber(ResumeOp::Deliver(v))) => v,
            _ => unreachable!("fiber resumed without a pending delivery"),
        })
    }
}

extern "C" fn trampoline(t: Transfer) -> ! {
    let body = SLOT.with(|s| match s.borrow_mut().take() {
        Some(SlotPayload::ToFiber(ResumeOp::Start(body))) => body,
        _ => unreachable!("fiber entered without a body"),
    });

    let mut ctx_slot = Some(t.context);
    let outcome = {
        let mut yielder = Yielder {
            context: &mut ctx_slot,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| body(&mut yielder))) {
            Ok(value) => StepOutcome::Returned(value),
            Err(payload) => StepOutcome::Panicked(payload),
        }
    };

    let ctx = ctx_slot.take().expect("context missing at fiber exit");
    SLOT.with(|s| {
        *s.borrow_mut() = Some(SlotPayload::FromFiber(outcome));
    });
    unsafe {
        ctx.resume(0);
    }
    unreachable!("a finished fiber was resumed again");
}

/// A stackful fiber: a guarded stack plus the saved machine context.
pub struct Fiber {
    context: Option<Context>,
    stack: Option<ProtectedFixedSizeStack>,
    body: Option<Body>,
}

impl Fiber {
    /// Default stack size, matching the teacher's own default.
    pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

    pub fn new(stack_size: usize, body: Body) -> Self {
        let stack = ProtectedFixedSizeStack::new(stack_size)
            .expect("failed to allocate a guarded coroutine stack");
        let context = Context::new(&stack, trampoline);
        Fiber {
            context: Some(context),
            stack: Some(stack),
            body: Some(body),
        }
    }

    /// Whether this fiber has not yet run at all.
    pub fn is_fresh(&self) -> bool {
        self.body.is_some()
    }

    /// Whether the fiber has returned, been replaced, or panicked.
    pub fn is_finished(&self) -> bool {
        self.context.is_none()
    }

    /// Resume the fiber, delivering `input`. On the very first call `input`
    /// is discarded, since there is no suspend point yet to deliver it to.
    pub fn resume(&mut self, input: Result<Value>) -> StepOutcome {
        let ctx = self
            .context
            .take()
            .expect("attempted to resume a finished fiber");
        let op = match self.body.take() {
            Some(body) => ResumeOp::Start(body),
            None => ResumeOp::Deliver(input),
        };
        SLOT.with(|s| {
            *s.borrow_mut() = Some(SlotPayload::ToFiber(op));
        });
        let transfer = unsafe { ctx.resume(0) };
        let outcome = SLOT.with(|s| match s.borrow_mut().take() {
            Some(SlotPayload::FromFiber(outcome)) => outcome,
            _ => unreachable!("fiber switched out without an outcome"),
        });
        match outcome {
            StepOutcome::Suspended => {
                self.context = Some(transfer.context);
            }
            _ => {
                // Finished (returned or panicked): release the stack.
                self.stack = None;
            }
        }
        outcome
    }
}

// The stack and saved context never alias another thread's data; the
// scheduler that owns a `Fiber` only ever resumes it from its own thread.
unsafe impl Send for Fiber {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_to_completion_without_suspending() {
        let mut fiber = Fiber::new(Fiber::DEFAULT_STACK_SIZE, Box::new(|_y| Ok(Value::Int(42))));
        match fiber.resume(Ok(Value::None)) {
            StepOutcome::Returned(Ok(Value::Int(42))) => {}
            _ => panic!("expected immediate return of 42"),
        }
        assert!(fiber.is_finished());
    }

    #[test]
    fn suspends_and_resumes_with_delivered_value() {
        let mut fiber = Fiber::new(
            Fiber::DEFAULT_STACK_SIZE,
            Box::new(|y| {
                let v = y.suspend()?;
                Ok(v)
            }),
        );
        match fiber.resume(Ok(Value::None)) {
            StepOutcome::Suspended => {}
            _ => panic!("expected suspend"),
        }
        match fiber.resume(Ok(Value::Int(7))) {
            StepOutcome::Returned(Ok(Value::Int(7))) => {}
            _ => panic!("expected the delivered value echoed back"),
        }
    }

    #[test]
    fn thrown_exception_propagates_as_err() {
        let mut fiber = Fiber::new(
            Fiber::DEFAULT_STACK_SIZE,
            Box::new(|y| {
                let v = y.suspend()?;
                Ok(v)
            }),
        );
        fiber.resume(Ok(Value::None));
        match fiber.resume(Err(AsyncoroError::Timeout)) {
            StepOutcome::Returned(Err(AsyncoroError::Timeout)) => {}
            _ => panic!("expected the thrown Timeout to propagate out"),
        }
    }
}
