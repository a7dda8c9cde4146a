//! Fallback notifier backend: a `libc::select`-based selector running on
//! its own helper thread.
//!
//! This backend exists for targets (or tests) that want a selector with no
//! OS-specific event-queue dependency. Per the single-writer resolution in
//! the design notes: only the helper thread spawned here ever touches the
//! fd/timeout tables; the scheduler thread only ever talks to it through
//! the command channel and the outbox, so there is no shared mutable state
//! to race on.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use super::{Interest, Notifier, ReadyEvent};

enum Command {
    Register(RawFd, Interest),
    Modify(RawFd, Interest),
    Unregister(RawFd),
    Clear(RawFd, Interest),
    AddTimeout(RawFd, Instant),
    DelTimeout(RawFd),
    Shutdown,
}

/// `select`-based notifier. The constructor spawns the single helper
/// thread that owns all mutable selector state for its lifetime.
pub struct SelectNotifier {
    cmd_tx: Sender<Command>,
    out_tx: Sender<Vec<ReadyEvent>>,
    out_rx: Receiver<Vec<ReadyEvent>>,
    helper_wake: UnixStream,
    worker: Option<thread::JoinHandle<()>>,
}

impl SelectNotifier {
    pub fn new() -> std::io::Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();
        let (helper_wake, worker_wake) = UnixStream::pair()?;
        helper_wake.set_nonblocking(true)?;
        worker_wake.set_nonblocking(true)?;

        let worker_out_tx = out_tx.clone();
        let worker = thread::Builder::new()
            .name("asyncoro-select-notifier".to_owned())
            .spawn(move || worker_loop(cmd_rx, worker_out_tx, worker_wake))?;

        Ok(SelectNotifier {
            cmd_tx,
            out_tx,
            out_rx,
            helper_wake,
            worker: Some(worker),
        })
    }

    fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
        let mut w = &self.helper_wake;
        let _ = w.write_all(&[0u8]);
    }
}

impl Drop for SelectNotifier {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let mut w = &self.helper_wake;
        let _ = w.write_all(&[0u8]);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Notifier for SelectNotifier {
    fn register(&mut self, fd: RawFd, interest: Interest) {
        self.send(Command::Register(fd, interest));
    }
    fn modify(&mut self, fd: RawFd, interest: Interest) {
        self.send(Command::Modify(fd, interest));
    }
    fn unregister(&mut self, fd: RawFd) {
        self.send(Command::Unregister(fd));
    }
    fn clear(&mut self, fd: RawFd, interest: Interest) {
        self.send(Command::Clear(fd, interest));
    }

    fn poll(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<ReadyEvent>> {
        let batch = match timeout {
            None => self.out_rx.recv().ok(),
            Some(d) => match self.out_rx.recv_timeout(d) {
                Ok(batch) => Some(batch),
                Err(RecvTimeoutError::Timeout) => Some(Vec::new()),
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        Ok(batch.unwrap_or_default())
    }

    fn interrupt(&self) {
        // An empty batch on the outbox is enough to unblock a blocking
        // `recv()`/`recv_timeout()` in `poll()` above, without needing to
        // wake the helper thread itself.
        let _ = self.out_tx.send(Vec::new());
    }

    fn add_timeout(&mut self, fd: RawFd, deadline: Instant) {
        self.send(Command::AddTimeout(fd, deadline));
    }
    fn del_timeout(&mut self, fd: RawFd) {
        self.send(Command::DelTimeout(fd));
    }
}

fn worker_loop(cmd_rx: Receiver<Command>, out_tx: Sender<Vec<ReadyEvent>>, wake: UnixStream) {
    let mut interests: HashMap<RawFd, Interest> = HashMap::new();
    let mut timeouts: HashMap<RawFd, Instant> = HashMap::new();
    let wake_fd = wake.as_raw_fd();
    let mut wake = wake;

    'outer: loop {
        // Drain all pending commands before building the fd sets, so a
        // burst of registrations only costs one `select` call.
        loop {
            match cmd_rx.try_recv() {
                Ok(Command::Register(fd, i)) | Ok(Command::Modify(fd, i)) => {
                    interests.insert(fd, i);
                }
                Ok(Command::Unregister(fd)) => {
                    interests.remove(&fd);
                    timeouts.remove(&fd);
                }
                Ok(Command::Clear(fd, i)) => {
                    if let Some(cur) = interests.get_mut(&fd) {
                        cur.remove(i);
                    }
                }
                Ok(Command::AddTimeout(fd, when)) => {
                    timeouts.insert(fd, when);
                }
                Ok(Command::DelTimeout(fd)) => {
                    timeouts.remove(&fd);
                }
                Ok(Command::Shutdown) => break 'outer,
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => break 'outer,
            }
        }

        let now = Instant::now();
        let next_timeout = timeouts.values().min().copied();
        let select_timeout = next_timeout.map(|d| d.saturating_duration_since(now));

        let ready = match select_wait(&interests, wake_fd, select_timeout) {
            Ok(r) => r,
            Err(_) => Vec::new(),
        };

        if ready.iter().any(|e| e.fd == wake_fd) {
            drain_wake_pipe(&mut wake);
        }

        let now = Instant::now();
        let mut out: Vec<ReadyEvent> = ready.into_iter().filter(|e| e.fd != wake_fd).collect();
        let fired: Vec<RawFd> = timeouts
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in fired {
            timeouts.remove(&fd);
            out.push(ReadyEvent {
                fd,
                interest: Interest::empty(),
            });
        }

        if !out.is_empty() {
            let _ = out_tx.send(out);
        }
    }
}

fn drain_wake_pipe(wake: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match wake.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

/// One `select(2)` call over the current interest table plus the worker's
/// own wake fd.
fn select_wait(
    interests: &HashMap<RawFd, Interest>,
    wake_fd: RawFd,
    timeout: Option<Duration>,
) -> std::io::Result<Vec<ReadyEvent>> {
    unsafe {
        let mut read_set: libc::fd_set = mem::zeroed();
        let mut write_set: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut read_set);
        libc::FD_ZERO(&mut write_set);
        libc::FD_SET(wake_fd, &mut read_set);

        let mut max_fd = wake_fd;
        for (&fd, interest) in interests {
            if interest.contains(Interest::READ) {
                libc::FD_SET(fd, &mut read_set);
            }
            if interest.contains(Interest::WRITE) {
                libc::FD_SET(fd, &mut write_set);
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map(|t| t as *mut libc::timeval)
            .unwrap_or(std::ptr::null_mut());

        let rc = libc::select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            std::ptr::null_mut(),
            tv_ptr,
        );
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut out = Vec::new();
        if libc::FD_ISSET(wake_fd, &read_set) {
            out.push(ReadyEvent {
                fd: wake_fd,
                interest: Interest::READ,
            });
        }
        for (&fd, _) in interests {
            let mut interest = Interest::empty();
            if libc::FD_ISSET(fd, &read_set) {
                interest |= Interest::READ;
            }
            if libc::FD_ISSET(fd, &write_set) {
                interest |= Interest::WRITE;
            }
            if !interest.is_empty() {
                out.push(ReadyEvent { fd, interest });
            }
        }
        Ok(out)
    }
}
