//! Remote references: handles to a coroutine or channel living on another
//! peer, plus the RCI (remote coroutine invocation) constructor registry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::coroutine::CoroId;
use crate::error::{AsyncoroError, Result};
use crate::message::Value;
use crate::scheduler::{Coro, Handle};

use super::transport::{exchange, Reply, RemoteTarget, Request, RequestKind};
use super::{build_request, DistContext, Location};

/// A reference to a coroutine living on a remote peer.
#[derive(Debug, Clone)]
pub struct RemoteCoro {
    pub name: Option<String>,
    pub id: CoroId,
    pub location: Location,
}

impl RemoteCoro {
    /// Resolve `name` at `location` into a `RemoteCoro`, synchronously.
    pub fn locate(ctx: &DistContext, coro: &mut Coro<'_>, location: Location, name: &str) -> Result<RemoteCoro> {
        let request = build_request(
            ctx,
            location.clone(),
            RequestKind::LocateCoro { name: name.to_owned() },
        );
        match exchange(coro, &request)? {
            Reply::Ack(Value::Int(id)) => Ok(RemoteCoro {
                name: Some(name.to_owned()),
                id: CoroId(id as u64),
                location,
            }),
            Reply::Ack(_) => Err(AsyncoroError::InvalidState("malformed locate_coro reply".to_owned())),
            Reply::Nak(msg) => Err(AsyncoroError::InvalidState(msg)),
        }
    }

    /// Fire-and-forget: buffer the request on the outbound queue and
    /// return immediately.
    pub fn send(&self, ctx: &DistContext, payload: Value) {
        let request = build_request(
            ctx,
            self.location.clone(),
            RequestKind::Send {
                target: RemoteTarget::Coro {
                    name: self.name.clone(),
                    id: self.id,
                },
                payload,
            },
        );
        ctx.enqueue(self.location.clone(), request, None);
    }

    /// Awaited delivery. Returns `0` on success (an `Ack`), matching the
    /// local channel `send`'s "count of failures" convention, or a nonzero
    /// failure count otherwise.
    pub fn deliver(&self, ctx: &DistContext, coro: &mut Coro<'_>, payload: Value, timeout: Option<Duration>) -> Result<i64> {
        let request = build_request(
            ctx,
            self.location.clone(),
            RequestKind::Send {
                target: RemoteTarget::Coro {
                    name: self.name.clone(),
                    id: self.id,
                },
                payload,
            },
        );
        await_reply(ctx, coro, self.location.clone(), request, timeout)
    }

    /// Register the calling coroutine as a remote monitor of `self`.
    pub fn monitor(&self, ctx: &DistContext, coro: &mut Coro<'_>) -> Result<()> {
        let request = build_request(
            ctx,
            self.location.clone(),
            RequestKind::Monitor {
                target: RemoteTarget::Coro {
                    name: self.name.clone(),
                    id: self.id,
                },
                monitor_location: ctx.local.clone(),
                monitor_id: coro.id,
            },
        );
        match exchange(coro, &request)? {
            Reply::Ack(_) => Ok(()),
            Reply::Nak(msg) => Err(AsyncoroError::InvalidState(msg)),
        }
    }
}

/// A reference to a named broadcast channel living on a remote peer.
#[derive(Debug, Clone)]
pub struct RemoteChannel {
    pub name: String,
    pub location: Location,
}

impl RemoteChannel {
    pub fn locate(ctx: &DistContext, coro: &mut Coro<'_>, location: Location, name: &str) -> Result<RemoteChannel> {
        let request = build_request(
            ctx,
            location.clone(),
            RequestKind::LocateChannel { name: name.to_owned() },
        );
        match exchange(coro, &request)? {
            Reply::Ack(_) => Ok(RemoteChannel {
                name: name.to_owned(),
                location,
            }),
            Reply::Nak(msg) => Err(AsyncoroError::InvalidState(msg)),
        }
    }

    pub fn send(&self, ctx: &DistContext, payload: Value) {
        let request = build_request(
            ctx,
            self.location.clone(),
            RequestKind::Send {
                target: RemoteTarget::Channel(self.name.clone()),
                payload,
            },
        );
        ctx.enqueue(self.location.clone(), request, None);
    }

    /// Register `coro` as a subscriber of this channel on its owning peer.
    pub fn subscribe(&self, ctx: &DistContext, coro: &mut Coro<'_>) -> Result<()> {
        let request = build_request(
            ctx,
            self.location.clone(),
            RequestKind::Subscribe {
                channel: self.name.clone(),
                subscriber: coro.id,
                subscriber_location: ctx.local.clone(),
            },
        );
        match exchange(coro, &request)? {
            Reply::Ack(_) => Ok(()),
            Reply::Nak(msg) => Err(AsyncoroError::InvalidState(msg)),
        }
    }

    pub fn deliver(&self, ctx: &DistContext, coro: &mut Coro<'_>, payload: Value, timeout: Option<Duration>) -> Result<bool> {
        let request = build_request(
            ctx,
            self.location.clone(),
            RequestKind::Send {
                target: RemoteTarget::Channel(self.name.clone()),
                payload,
            },
        );
        Ok(await_reply(ctx, coro, self.location.clone(), request, timeout)? == 0)
    }
}

/// Queue `request`, suspend on our own mailbox until the daemon delivers
/// the reply (tagged `dist-nak`/`dist-error` on failure, per
/// `transport::run_daemon`), and translate it back into a failure count.
fn await_reply(
    ctx: &DistContext,
    coro: &mut Coro<'_>,
    dest: Location,
    request: Request,
    timeout: Option<Duration>,
) -> Result<i64> {
    ctx.enqueue(dest, request, Some(coro.id));
    match coro.receive(timeout, Value::None)? {
        Value::Tagged(tag, _) if tag == "dist-nak" || tag == "dist-error" => Ok(1),
        _ => Ok(0),
    }
}

type Constructor = Box<dyn Fn(&Handle, Value) -> Result<CoroId> + Send + Sync>;

/// Registry of named RCI constructors: `run_rci(location, name, args)`
/// creates a coroutine at the target peer and hands back a reference to
/// it. Each process registers whatever constructors it wants reachable
/// remotely.
#[derive(Default)]
pub struct RciRegistry {
    constructors: Mutex<HashMap<String, Constructor>>,
}

impl RciRegistry {
    pub fn new() -> Self {
        RciRegistry::default()
    }

    pub fn register(&self, name: impl Into<String>, ctor: Constructor) {
        self.constructors.lock().unwrap().insert(name.into(), ctor);
    }

    pub fn has(&self, name: &str) -> bool {
        self.constructors.lock().unwrap().contains_key(name)
    }

    pub fn run(&self, handle: &Handle, name: &str, args: Value) -> Result<CoroId> {
        let constructors = self.constructors.lock().unwrap();
        match constructors.get(name) {
            Some(ctor) => ctor(handle, args),
            None => Err(AsyncoroError::InvalidState(format!("no such RCI constructor: {}", name))),
        }
    }

    /// Ask `location` to run RCI `name` with `args`, returning a remote
    /// reference to the resulting coroutine.
    pub fn run_remote(
        ctx: &DistContext,
        coro: &mut Coro<'_>,
        location: Location,
        name: &str,
        args: Value,
    ) -> Result<RemoteCoro> {
        let request = build_request(
            ctx,
            location.clone(),
            RequestKind::RunRci {
                name: name.to_owned(),
                args,
            },
        );
        match exchange(coro, &request)? {
            Reply::Ack(Value::Int(id)) => Ok(RemoteCoro {
                name: None,
                id: CoroId(id as u64),
                location,
            }),
            Reply::Ack(_) => Err(AsyncoroError::InvalidState("malformed run_rci reply".to_owned())),
            Reply::Nak(msg) => Err(AsyncoroError::InvalidState(msg)),
        }
    }
}
