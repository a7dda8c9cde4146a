//! Broadcast channels: named, process-wide pub/sub endpoints with an
//! asynchronous (queued-per-subscriber) flavor and a synchronous
//! (direct-handoff, no queue) flavor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::coroutine::CoroId;
use crate::dist::{build_request, DistContext, Location};
use crate::dist::transport::{RemoteTarget, RequestKind};
use crate::error::{AsyncoroError, Result};
use crate::message::Value;
use crate::scheduler::{Coro, Handle};
use crate::sync::Event;

/// Either a coroutine local to this process or a reference to one on a
/// remote peer, identified by its `(Location, CoroId)` so a repeat
/// `subscribe_remote` from the same peer is a no-op rather than a second
/// entry.
pub enum Subscriber {
    Local(CoroId),
    Remote(Location, CoroId, Arc<dyn Fn(Value) + Send + Sync>),
}

type Transform = Box<dyn Fn(&str, Value) -> Option<Value> + Send + Sync>;

struct ChannelInner {
    name: String,
    subscribers: Mutex<Vec<Subscriber>>,
    transform: Option<Transform>,
    min_receivers: usize,
    gate: Event,
}

/// An asynchronous broadcast channel: `send` enqueues on every current
/// subscriber's mailbox (or best-effort network send for remote ones).
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// An async or sync channel registered under the same name. Both flavors
/// share one namespace: registering a `SyncChannel` as "updates" blocks a
/// later `create("updates", ...)` just as surely as a second `create`
/// would, matching a registry that keeps both kinds in one dict.
#[derive(Clone)]
enum ChannelEntry {
    Async(Channel),
    Sync(SyncChannel),
}

/// Process-wide channel name registry. Construction with a duplicate name
/// is a `Duplicate` error.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, ChannelEntry>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    pub fn create(
        &self,
        name: impl Into<String>,
        min_receivers: usize,
        transform: Option<Transform>,
    ) -> Result<Channel> {
        let name = name.into();
        let mut channels = self.channels.write().unwrap();
        if channels.contains_key(&name) {
            return Err(AsyncoroError::Duplicate(name));
        }
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                name: name.clone(),
                subscribers: Mutex::new(Vec::new()),
                transform,
                min_receivers,
                gate: Event::new(),
            }),
        };
        channels.insert(name, ChannelEntry::Async(channel.clone()));
        Ok(channel)
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        match self.channels.read().unwrap().get(name)? {
            ChannelEntry::Async(c) => Some(c.clone()),
            ChannelEntry::Sync(_) => None,
        }
    }

    pub fn create_sync(
        &self,
        name: impl Into<String>,
        min_receivers: usize,
        transform: Option<Transform>,
    ) -> Result<SyncChannel> {
        let name = name.into();
        let mut channels = self.channels.write().unwrap();
        if channels.contains_key(&name) {
            return Err(AsyncoroError::Duplicate(name));
        }
        let channel = SyncChannel {
            inner: Arc::new(SyncChannelInner {
                name: name.clone(),
                transform,
                min_receivers,
                gate: Event::new(),
                recipients: Mutex::new(Vec::new()),
            }),
        };
        channels.insert(name, ChannelEntry::Sync(channel.clone()));
        Ok(channel)
    }

    pub fn get_sync(&self, name: &str) -> Option<SyncChannel> {
        match self.channels.read().unwrap().get(name)? {
            ChannelEntry::Sync(c) => Some(c.clone()),
            ChannelEntry::Async(_) => None,
        }
    }
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Subscribe `id`. Idempotent: subscribing twice is a no-op. Takes a
    /// `Handle` (rather than a `Coro`) purely to wake anyone parked in
    /// `deliver` waiting for `min_receivers` to be reached — subscribing
    /// itself never suspends.
    pub fn subscribe(&self, handle: &Handle, id: CoroId) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        if !subs.iter().any(|s| matches!(s, Subscriber::Local(existing) if *existing == id)) {
            subs.push(Subscriber::Local(id));
        }
        let reached = subs.len() >= self.inner.min_receivers;
        drop(subs);
        if reached {
            self.inner.gate.set(handle);
        }
    }

    /// Subscribe a coroutine living at `location` on another peer. Delivery
    /// is best-effort: each broadcast enqueues a `Send` request on `ctx`'s
    /// outbound queue rather than awaiting an ack.
    pub fn subscribe_remote(&self, handle: &Handle, ctx: Arc<DistContext>, location: Location, id: CoroId) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        let already = subs
            .iter()
            .any(|s| matches!(s, Subscriber::Remote(l, i, _) if *l == location && *i == id));
        if !already {
            let dest = location.clone();
            let deliver = move |payload: Value| {
                let request = build_request(
                    &ctx,
                    dest.clone(),
                    RequestKind::Send {
                        target: RemoteTarget::Coro { name: None, id },
                        payload,
                    },
                );
                ctx.enqueue(dest.clone(), request, None);
            };
            subs.push(Subscriber::Remote(location, id, Arc::new(deliver)));
        }
        let reached = subs.len() >= self.inner.min_receivers;
        drop(subs);
        if reached {
            self.inner.gate.set(handle);
        }
    }

    /// Unsubscribe `id`. Safe to call on a non-subscriber. If this drops the
    /// subscriber count back below `min_receivers`, the gate is cleared so a
    /// future `deliver` call parks again until it is re-reached.
    pub fn unsubscribe(&self, id: CoroId) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.retain(|s| !matches!(s, Subscriber::Local(existing) if *existing == id));
        if subs.len() < self.inner.min_receivers {
            self.inner.gate.clear();
        }
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    fn wrapped(&self, payload: Value) -> Option<Value> {
        let payload = match &self.inner.transform {
            Some(t) => t(&self.inner.name, payload)?,
            None => payload,
        };
        Some(Value::tagged(self.inner.name.clone(), payload))
    }

    /// Fire-and-forget broadcast: local deliveries land on the subscriber's
    /// mailbox directly, remote ones are enqueued on the outbound queue.
    /// Both are "best effort" at this layer, so this always returns `0`;
    /// the negative-count-of-failures shape is kept for API stability with
    /// `deliver`, which does observe a real failure (a timed-out gate).
    pub fn send(&self, coro: &Coro<'_>, payload: Value) -> i64 {
        let wrapped = match self.wrapped(payload) {
            Some(w) => w,
            None => return 0,
        };
        let subs: Vec<_> = self
            .inner
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|s| match s {
                Subscriber::Local(id) => SubscriberSnapshot::Local(*id),
                Subscriber::Remote(_, _, deliver) => SubscriberSnapshot::Remote(deliver.clone()),
            })
            .collect();

        for sub in subs {
            match sub {
                SubscriberSnapshot::Local(id) => {
                    coro.handle().deliver_message(id, None, wrapped.clone());
                }
                SubscriberSnapshot::Remote(deliver) => deliver(wrapped.clone()),
            }
        }
        0
    }

    /// Await `min_receivers` subscribers, then broadcast. Returns `true` on
    /// success, or `alarm` semantics via `Err(Timeout)` mapped by the
    /// caller if `timeout` elapses first.
    pub fn deliver(
        &self,
        coro: &mut Coro<'_>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        while self.subscriber_count() < self.inner.min_receivers {
            if !self.inner.gate.wait(coro, timeout)? {
                return Ok(false);
            }
            // A stale `set` (e.g. a subscriber having since dropped back
            // out) can wake us with the count still short; `unsubscribe`
            // clears the gate in that case, but re-check rather than
            // trusting a single wakeup.
        }
        Ok(self.send(coro, payload) == 0)
    }
}

enum SubscriberSnapshot {
    Local(CoroId),
    Remote(Arc<dyn Fn(Value) + Send + Sync>),
}

struct SyncChannelInner {
    name: String,
    transform: Option<Transform>,
    min_receivers: usize,
    gate: Event,
    recipients: Mutex<Vec<CoroId>>,
}

/// A synchronous channel: delivers only to coroutines currently blocked in
/// `receive`, by resuming them directly rather than enqueuing on a mailbox.
/// There is no queue — a `send`/`deliver` that finds nobody waiting reaches
/// nobody, and a coroutine that calls `receive` after delivery completed
/// gets nothing from it. Cannot be transported across nodes.
#[derive(Clone)]
pub struct SyncChannel {
    inner: Arc<SyncChannelInner>,
}

impl SyncChannel {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn recipient_count(&self) -> usize {
        self.inner.recipients.lock().unwrap().len()
    }

    fn wrapped(&self, payload: Value) -> Option<Value> {
        let payload = match &self.inner.transform {
            Some(t) => t(&self.inner.name, payload)?,
            None => payload,
        };
        Some(Value::tagged(self.inner.name.clone(), payload))
    }

    /// Register as a recipient of the next `send`/`deliver`, then block
    /// until it arrives or `timeout` elapses. Consumed by exactly one
    /// delivery: once woken (or timed out), this coroutine is removed from
    /// the recipient list again, same as `Channel::unsubscribe` after the
    /// fact rather than on request.
    pub fn receive(&self, coro: &mut Coro<'_>, timeout: Option<Duration>) -> Result<Value> {
        {
            let mut recipients = self.inner.recipients.lock().unwrap();
            recipients.push(coro.id);
            let reached = recipients.len() >= self.inner.min_receivers;
            drop(recipients);
            if reached {
                self.inner.gate.set(coro.handle());
            }
        }
        let result = coro.receive(timeout, Value::None);
        let mut recipients = self.inner.recipients.lock().unwrap();
        recipients.retain(|id| *id != coro.id);
        if recipients.len() < self.inner.min_receivers {
            self.inner.gate.clear();
        }
        result
    }

    /// Deliver `payload` directly to every coroutine currently parked in
    /// `receive`. Returns the number reached; never blocks.
    pub fn send(&self, coro: &Coro<'_>, payload: Value) -> usize {
        let wrapped = match self.wrapped(payload) {
            Some(w) => w,
            None => return 0,
        };
        let recipients: Vec<CoroId> = self.inner.recipients.lock().unwrap().drain(..).collect();
        let n = recipients.len();
        for id in recipients {
            coro.handle().resume(id, wrapped.clone());
        }
        if self.inner.min_receivers > 0 {
            self.inner.gate.clear();
        }
        n
    }

    /// Await `min_receivers` recipients, then `send`. Returns `true` once
    /// delivered, or `false` if `timeout` elapses first.
    pub fn deliver(
        &self,
        coro: &mut Coro<'_>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        while self.recipient_count() < self.inner.min_receivers {
            if !self.inner.gate.wait(coro, timeout)? {
                return Ok(false);
            }
        }
        self.send(coro, payload);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::transport::{RemoteTarget, RequestKind};
    use crate::fiber::Fiber;
    use crate::notifier::select_backend::SelectNotifier;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_handle() -> Handle {
        Handle::with_notifier(
            Box::new(SelectNotifier::new().unwrap()),
            Fiber::DEFAULT_STACK_SIZE,
        )
    }

    fn peer(port: u16) -> Location {
        Location {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            name: "peer".to_owned(),
        }
    }

    #[test]
    fn subscribe_remote_is_idempotent_and_send_enqueues_one_request_per_remote_subscriber() {
        let handle = test_handle();
        let ctx = Arc::new(DistContext::new(
            handle.clone(),
            peer(9001),
            "secret".to_owned(),
            ChannelRegistry::new(),
        ));
        let registry = ChannelRegistry::new();
        let channel = registry.create("updates", 1, None).unwrap();
        let remote_id = CoroId(7);
        let remote_location = peer(9002);

        channel.subscribe_remote(&handle, ctx.clone(), remote_location.clone(), remote_id);
        // A repeat subscription from the same (location, id) is a no-op.
        channel.subscribe_remote(&handle, ctx.clone(), remote_location.clone(), remote_id);
        assert_eq!(channel.subscriber_count(), 1);

        handle.spawn("sender", Fiber::DEFAULT_STACK_SIZE, move |coro| {
            channel.send(&coro, Value::from("tick"));
            Ok(Value::None)
        });
        handle.run();

        let sent = ctx.pop_outbound().expect("subscribe_remote should have enqueued a Send");
        assert_eq!(sent.dest, remote_location);
        match sent.request.kind {
            RequestKind::Send { target: RemoteTarget::Coro { id, .. }, payload } => {
                assert_eq!(id, remote_id);
                assert_eq!(payload, Value::tagged("updates", Value::from("tick")));
            }
            other => panic!("unexpected request kind: {:?}", other),
        }
        assert!(ctx.pop_outbound().is_none());
    }
}
