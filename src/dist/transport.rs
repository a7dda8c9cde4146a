//! Wire types and the request/reply exchange: one TCP connection per
//! request, length-prefixed `bincode` framing (reusing the same
//! `send_message`/`receive_message` convention as `net::tcp`).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::coroutine::CoroId;
use crate::error::{AsyncoroError, Result};
use crate::message::Value;
use crate::net::tcp::{AsyncTcpListener, AsyncTcpStream};
use crate::scheduler::Coro;

use super::{derive_auth, DistContext, Location, PeerSignature};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What a remote reference points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteTarget {
    Coro { name: Option<String>, id: CoroId },
    Channel(String),
}

/// The body of every request, matching the kinds enumerated in the design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestKind {
    Send { target: RemoteTarget, payload: Value },
    Subscribe { channel: String, subscriber: CoroId, subscriber_location: Location },
    LocateCoro { name: String },
    LocateChannel { name: String },
    LocatePeer { name: String },
    LocateRci { name: String },
    RunRci { name: String, args: Value },
    Monitor { target: RemoteTarget, monitor_location: Location, monitor_id: CoroId },
    Exception { monitor: CoroId, source: Location, cause: String },
    Ping { location: Location, signature: PeerSignature },
}

/// A full request envelope as it goes out on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub source: Option<Location>,
    pub dest: Location,
    pub auth: String,
    pub kind: RequestKind,
}

/// A reply: either an acknowledgement carrying a value, or a failure
/// reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Ack(Value),
    Nak(String),
}

fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    bincode::serialize(v).map_err(AsyncoroError::Codec)
}
fn decode<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(AsyncoroError::Codec)
}

/// Perform one request/reply exchange: connect, send the framed request,
/// wait for the framed reply, disconnect. Exposed to `remote` for the
/// `locate_*` helpers, which want a synchronous reply rather than routing
/// through the outbound daemon queue.
pub(crate) fn exchange(coro: &mut Coro<'_>, request: &Request) -> Result<Reply> {
    let mut stream = AsyncTcpStream::connect(coro, request.dest.addr, Some(REQUEST_TIMEOUT))?;
    let body = encode(request)?;
    stream.send_message(coro, &body, Some(REQUEST_TIMEOUT))?;
    let reply_bytes = stream.receive_message(coro, Some(REQUEST_TIMEOUT))?;
    if reply_bytes.is_empty() {
        return Err(AsyncoroError::Network("hangup".to_owned()));
    }
    decode(&reply_bytes)
}

/// The outbound daemon: drains `ctx.outbound`, performs each exchange, and
/// delivers the reply (or failure) to the waiter's mailbox if one was
/// given. Runs as a daemon coroutine for the lifetime of the scheduler.
pub fn run_daemon(coro: &mut Coro<'_>, ctx: Arc<DistContext>) -> Result<Value> {
    loop {
        match ctx.pop_outbound() {
            Some(job) => {
                let result = exchange(coro, &job.request);
                if let Some(waiter) = job.waiter {
                    let payload = match result {
                        Ok(Reply::Ack(v)) => v,
                        Ok(Reply::Nak(msg)) => Value::tagged("dist-nak", Value::Text(msg)),
                        Err(e) => Value::tagged("dist-error", Value::Text(e.to_string())),
                    };
                    coro.handle().deliver_message(waiter, None, payload);
                } else if let Err(e) = result {
                    warn!("fire-and-forget request to {} failed: {}", job.dest, e);
                }
            }
            None => {
                ctx.outbound_signal.clear();
                ctx.outbound_signal.wait(coro, Some(Duration::from_millis(200)))?;
            }
        }
    }
}

/// Validate a request's `auth` against what we derive for its claimed
/// source peer, registering the peer (idempotently) if it is new.
fn authenticate(ctx: &DistContext, request: &Request) -> Result<()> {
    let source = match &request.source {
        Some(s) => s,
        None => return Ok(()),
    };
    if let RequestKind::Ping { signature, .. } = &request.kind {
        ctx.peers.upsert(source.clone(), signature.clone(), &ctx.secret);
        return Ok(());
    }
    match ctx.peers.get(source) {
        Some(entry) if entry.auth == request.auth => Ok(()),
        _ => Err(AsyncoroError::AuthFailure),
    }
}

fn handle_request(ctx: &Arc<DistContext>, coro: &mut Coro<'_>, request: Request) -> Reply {
    if let Err(e) = authenticate(ctx, &request) {
        return Reply::Nak(e.to_string());
    }
    match request.kind {
        RequestKind::Ping { location, signature } => {
            ctx.peers.upsert(location, signature, &ctx.secret);
            Reply::Ack(Value::None)
        }
        RequestKind::LocateCoro { name } => match ctx.lookup_coro(&name) {
            Some(id) => Reply::Ack(Value::Int(id.0 as i64)),
            None => Reply::Nak(format!("no such coroutine: {}", name)),
        },
        RequestKind::LocateChannel { name } => match ctx.channels.get(&name) {
            Some(_) => Reply::Ack(Value::None),
            None => Reply::Nak(format!("no such channel: {}", name)),
        },
        RequestKind::LocatePeer { name } => {
            let found = ctx.peers.locations().into_iter().any(|l| l.name == name);
            if found {
                Reply::Ack(Value::None)
            } else {
                Reply::Nak(format!("unknown peer: {}", name))
            }
        }
        RequestKind::LocateRci { name } => {
            if ctx.rci.has(&name) {
                Reply::Ack(Value::None)
            } else {
                Reply::Nak(format!("no such RCI constructor: {}", name))
            }
        }
        RequestKind::RunRci { name, args } => match ctx.rci.run(&ctx.handle, &name, args) {
            Ok(id) => Reply::Ack(Value::Int(id.0 as i64)),
            Err(e) => Reply::Nak(e.to_string()),
        },
        RequestKind::Send { target, payload } => match target {
            RemoteTarget::Coro { id, .. } => {
                coro.handle().deliver_message(id, None, payload);
                Reply::Ack(Value::None)
            }
            RemoteTarget::Channel(name) => match ctx.channels.get(&name) {
                Some(chan) => {
                    let failures = chan.send(coro, payload);
                    if failures == 0 {
                        Reply::Ack(Value::None)
                    } else {
                        Reply::Nak(format!("{} deliveries failed", failures))
                    }
                }
                None => Reply::Nak(format!("no such channel: {}", name)),
            },
        },
        RequestKind::Subscribe { channel, subscriber, subscriber_location } => match ctx.channels.get(&channel) {
            Some(chan) => {
                chan.subscribe_remote(coro.handle(), ctx.clone(), subscriber_location, subscriber);
                Reply::Ack(Value::None)
            }
            None => Reply::Nak(format!("no such channel: {}", channel)),
        },
        RequestKind::Monitor { target, monitor_location, monitor_id } => match target {
            RemoteTarget::Coro { id, .. } => {
                coro.handle().add_monitor(
                    id,
                    crate::coroutine::Monitor::Remote(super::RemoteCoro {
                        name: None,
                        id: monitor_id,
                        location: monitor_location,
                    }),
                );
                Reply::Ack(Value::None)
            }
            RemoteTarget::Channel(name) => Reply::Nak(format!("cannot monitor a channel: {}", name)),
        },
        RequestKind::Exception { monitor, cause, source } => {
            coro.handle().throw(
                monitor,
                AsyncoroError::Monitor {
                    target: monitor,
                    cause: format!("{} ({})", cause, source),
                },
            );
            Reply::Ack(Value::None)
        }
    }
}

/// One accepted connection: read exactly one request, dispatch it, write
/// exactly one reply, then close. Simpler than pipelining multiple
/// requests per connection, and the request volume this layer expects
/// (discovery handshakes, occasional remote sends) doesn't need more.
fn serve_connection(ctx: Arc<DistContext>, coro: &mut Coro<'_>, mut stream: AsyncTcpStream) {
    let body = match stream.receive_message(coro, Some(REQUEST_TIMEOUT)) {
        Ok(b) if !b.is_empty() => b,
        Ok(_) => return,
        Err(e) => {
            warn!("reading request failed: {}", e);
            return;
        }
    };
    let request: Request = match decode(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!("decoding request failed: {}", e);
            return;
        }
    };
    let reply = handle_request(&ctx, coro, request);
    let reply_body = match encode(&reply) {
        Ok(b) => b,
        Err(e) => {
            warn!("encoding reply failed: {}", e);
            return;
        }
    };
    if let Err(e) = stream.send_message(coro, &reply_body, Some(REQUEST_TIMEOUT)) {
        warn!("writing reply failed: {}", e);
    }
}

/// The inbound server: accepts connections and spawns a short-lived
/// coroutine per connection to serve its single request.
pub fn run_server(coro: &mut Coro<'_>, ctx: Arc<DistContext>, mut listener: AsyncTcpListener) -> Result<Value> {
    loop {
        let (stream, peer) = listener.accept(coro, None)?;
        debug!("accepted distributed-layer connection from {}", peer);
        let ctx2 = ctx.clone();
        coro.handle().spawn(
            "dist-conn",
            crate::fiber::Fiber::DEFAULT_STACK_SIZE,
            move |mut c| {
                serve_connection(ctx2, &mut c, stream);
                Ok(Value::None)
            },
        );
    }
}
