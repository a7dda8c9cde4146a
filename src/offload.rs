//! Blocking-call offload: the only sanctioned way a coroutine body may call
//! a blocking API without stalling the scheduler thread.
//!
//! A small fixed-size pool of `std::thread`s drains a job queue; the
//! calling coroutine suspends on its own one-shot mailbox until the result
//! comes back. This replaces the teacher's `sync()`, which relied on the
//! unsound `thread_scoped` crate to borrow stack data across a thread
//! boundary; here the closure is `'static` and owns whatever it needs, and
//! the result crosses back through an ordinary channel instead.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{AsyncoroError, Result};
use crate::message::Value;
use crate::scheduler::Coro;

type Job = Box<dyn FnOnce() -> Result<Value> + Send>;

struct Pool {
    tx: Sender<Job>,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl Pool {
    fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..size.max(1))
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("asyncoro-offload-{}", i))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn offload worker thread")
            })
            .collect();
        Pool {
            tx,
            _workers: workers,
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = rx.lock().unwrap();
            guard.recv()
        };
        match job {
            Ok(job) => {
                job();
            }
            Err(_) => break,
        }
    }
}

/// A bounded pool of blocking-call workers. Typically one per scheduler;
/// shared via `Arc` by whatever constructs it (the `Handle`'s owner).
#[derive(Clone)]
pub struct OffloadPool {
    pool: Arc<Pool>,
}

impl OffloadPool {
    pub const DEFAULT_SIZE: usize = 4;

    pub fn new(size: usize) -> Self {
        OffloadPool {
            pool: Arc::new(Pool::new(size)),
        }
    }

    /// Run `f` on a worker thread, suspending `coro` until it completes.
    /// `f` must be `'static` — it owns everything it touches, rather than
    /// borrowing from the coroutine's stack.
    pub fn run_blocking<F>(&self, coro: &mut Coro<'_>, f: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        let handle = coro.handle().clone();
        let waiter = coro.id;
        let job: Job = Box::new(move || {
            let result = f();
            let payload = match &result {
                Ok(v) => v.clone(),
                Err(e) => Value::Tagged("offload-error".to_owned(), Box::new(Value::Text(e.to_string()))),
            };
            handle.deliver_message(waiter, None, payload);
            result
        });

        self.pool
            .tx
            .send(job)
            .map_err(|_| AsyncoroError::InvalidState("offload pool shut down".to_owned()))?;

        match coro.receive(None, Value::None)? {
            Value::Tagged(tag, payload) if tag == "offload-error" => {
                let msg = payload.as_text().unwrap_or("offloaded call failed").to_owned();
                Err(AsyncoroError::InvalidState(msg))
            }
            other => Ok(other),
        }
    }
}
