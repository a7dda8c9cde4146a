//! Distributed layer: peer discovery over UDP broadcast, a length-prefixed
//! TCP request/reply transport, and remote coroutine/channel references
//! built on top of it.
//!
//! Everything here is optional: a scheduler with no `node` configured never
//! starts a `DistContext`, and every module above (coroutine monitors,
//! channels) degrades to "local only" without one.

pub mod discovery;
pub mod remote;
pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::channel::ChannelRegistry;
use crate::coroutine::CoroId;
use crate::error::{AsyncoroError, Result};
use crate::fiber::Fiber;
use crate::net::tcp::AsyncTcpListener;
use crate::scheduler::{Config, Handle};
use crate::sync::Event;

pub use remote::{RciRegistry, RemoteChannel, RemoteCoro};
pub use transport::{Reply, Request, RequestKind};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Build a request envelope addressed to `dest`, stamped with our identity
/// and the auth token `dest` should expect from us. Shared by `remote`
/// (locate/send/monitor/RCI calls) and `discovery` (the `Ping` handshake).
pub(crate) fn build_request(ctx: &DistContext, dest: Location, kind: RequestKind) -> Request {
    let auth = derive_auth(&ctx.signature, &ctx.secret);
    Request {
        id: fresh_request_id(),
        source: Some(ctx.local.clone()),
        dest,
        auth,
        kind,
    }
}

/// Default UDP discovery port, used when `Config::udp_port` is `0`.
pub const DEFAULT_UDP_PORT: u16 = 51350;

/// A peer's advertised address and process name. The wire identity of a
/// node; everything else (signature, auth) is session-local state we keep
/// about it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub addr: SocketAddr,
    pub name: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// 20 random bytes minted once per process at startup, hex-encoded for the
/// wire. Two peers derive the same `auth` token from each other's
/// signature plus their shared secret, so a signature collision or replay
/// from a third party can't forge it without also knowing the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSignature(pub String);

impl PeerSignature {
    pub fn fresh() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        PeerSignature(hex_encode(&bytes))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).expect("writing to a String never fails");
    }
    s
}

/// `auth = SHA1(peer-signature || shared-secret)`, hex-encoded.
pub fn derive_auth(peer_signature: &PeerSignature, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(peer_signature.0.as_bytes());
    hasher.update(secret.as_bytes());
    hex_encode(&hasher.finalize())
}

/// What we remember about a discovered peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub signature: PeerSignature,
    pub auth: String,
}

/// Process-wide peer table. Keyed by `Location` so that a repeated `PING`
/// from an already-known address updates the entry in place rather than
/// duplicating it (the idempotent-handshake property).
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<Location, PeerEntry>>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable::default()
    }

    pub fn upsert(&self, location: Location, signature: PeerSignature, secret: &str) {
        let auth = derive_auth(&signature, secret);
        self.peers
            .lock()
            .unwrap()
            .insert(location, PeerEntry { signature, auth });
    }

    pub fn get(&self, location: &Location) -> Option<PeerEntry> {
        self.peers.lock().unwrap().get(location).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn locations(&self) -> Vec<Location> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }
}

/// A queued outbound request awaiting delivery by the transport daemon.
pub struct OutboundRequest {
    pub dest: Location,
    pub request: Request,
    /// Coroutine to wake with the reply, if anyone awaited it.
    pub waiter: Option<CoroId>,
}

/// Everything the distributed layer needs: our own identity, the peer
/// table, the outbound request queue a dedicated daemon coroutine drains,
/// the RCI constructor registry, and a name -> id directory for coroutines
/// registered for remote lookup.
pub struct DistContext {
    pub handle: Handle,
    pub local: Location,
    pub secret: String,
    pub signature: PeerSignature,
    pub peers: PeerTable,
    pub outbound: Mutex<VecDeque<OutboundRequest>>,
    /// Signalled whenever `enqueue` adds work, so the transport daemon's
    /// otherwise-polling wait loop wakes promptly instead of only at its
    /// next timeout.
    pub outbound_signal: Event,
    pub rci: RciRegistry,
    pub channels: ChannelRegistry,
    pub named_coros: Mutex<HashMap<String, CoroId>>,
}

impl DistContext {
    pub fn new(handle: Handle, local: Location, secret: String, channels: ChannelRegistry) -> Self {
        DistContext {
            handle,
            local,
            secret,
            signature: PeerSignature::fresh(),
            peers: PeerTable::new(),
            outbound: Mutex::new(VecDeque::new()),
            outbound_signal: Event::new(),
            rci: RciRegistry::new(),
            channels,
            named_coros: Mutex::new(HashMap::new()),
        }
    }

    pub fn pop_outbound(&self) -> Option<OutboundRequest> {
        self.outbound.lock().unwrap().pop_front()
    }

    /// Register a coroutine under a process-wide name so remote peers can
    /// `locate_coro` it.
    pub fn register_coro(&self, name: impl Into<String>, id: CoroId) -> Result<()> {
        let name = name.into();
        let mut named = self.named_coros.lock().unwrap();
        if named.contains_key(&name) {
            return Err(crate::error::AsyncoroError::Duplicate(name));
        }
        named.insert(name, id);
        Ok(())
    }

    pub fn lookup_coro(&self, name: &str) -> Option<CoroId> {
        self.named_coros.lock().unwrap().get(name).copied()
    }

    /// Enqueue a fire-and-forget (or awaited, if `waiter` is set) outbound
    /// request for the transport daemon to pick up.
    pub fn enqueue(&self, dest: Location, request: Request, waiter: Option<CoroId>) {
        self.outbound.lock().unwrap().push_back(OutboundRequest {
            dest,
            request,
            waiter,
        });
        self.outbound_signal.set(&self.handle);
    }
}

/// Bring up the distributed layer if `config.node` is set: bind the TCP
/// service, mint our `Location`/`PeerSignature`, and spawn the four daemon
/// coroutines (`inbound server`, `outbound drainer`, `broadcaster`,
/// `listener`) as daemons so they never block shutdown. Returns `Ok(None)`
/// untouched when no `node` is configured, matching §6's "no networking"
/// default.
pub fn bootstrap(handle: &Handle, config: &Config) -> Result<Option<Arc<DistContext>>> {
    let node = match &config.node {
        Some(node) => node.clone(),
        None => return Ok(None),
    };

    let bind_addr: SocketAddr = format!("{}:{}", node, config.tcp_port)
        .parse()
        .map_err(|e| AsyncoroError::InvalidState(format!("invalid node address: {}", e)))?;
    let listener = AsyncTcpListener::bind(handle, bind_addr)?;
    let local_addr = listener.local_addr()?;

    let advertise_host = config.ext_ip_addr.clone().unwrap_or(node);
    let advertise_addr: SocketAddr = format!("{}:{}", advertise_host, local_addr.port())
        .parse()
        .map_err(|e| AsyncoroError::InvalidState(format!("invalid ext_ip_addr: {}", e)))?;
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| format!("{}:{}", advertise_addr.ip(), advertise_addr.port()));

    let local = Location { addr: advertise_addr, name };
    let secret = config.secret.clone().unwrap_or_default();
    let ctx = Arc::new(DistContext::new(handle.clone(), local, secret, ChannelRegistry::new()));

    let sink_ctx = ctx.clone();
    handle.set_remote_monitor_sink(Arc::new(move |remote: RemoteCoro, cause: String| {
        let request = build_request(
            &sink_ctx,
            remote.location.clone(),
            RequestKind::Exception {
                monitor: remote.id,
                source: sink_ctx.local.clone(),
                cause,
            },
        );
        sink_ctx.enqueue(remote.location, request, None);
    }));

    let udp_port = if config.udp_port == 0 { DEFAULT_UDP_PORT } else { config.udp_port };

    let server_ctx = ctx.clone();
    let server_id = handle.spawn("dist-server", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        transport::run_server(&mut coro, server_ctx, listener)
    });
    let daemon_ctx = ctx.clone();
    let daemon_id = handle.spawn("dist-daemon", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        transport::run_daemon(&mut coro, daemon_ctx)
    });
    let bcast_ctx = ctx.clone();
    let bcast_id = handle.spawn("dist-broadcaster", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        discovery::run_broadcaster(&mut coro, bcast_ctx, udp_port)
    });
    let listen_ctx = ctx.clone();
    let listen_id = handle.spawn("dist-listener", Fiber::DEFAULT_STACK_SIZE, move |mut coro| {
        discovery::run_listener(&mut coro, listen_ctx, udp_port)
    });
    for id in [server_id, daemon_id, bcast_id, listen_id] {
        handle.set_daemon(id, true);
    }

    Ok(Some(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loc(port: u16) -> Location {
        Location {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            name: "peer".to_owned(),
        }
    }

    #[test]
    fn repeated_pings_from_a_known_peer_update_rather_than_duplicate() {
        let table = PeerTable::new();
        let location = loc(9000);
        let sig = PeerSignature::fresh();

        table.upsert(location.clone(), sig.clone(), "secret");
        assert_eq!(table.len(), 1);

        // A second PING from the same signature: entry count unchanged.
        table.upsert(location.clone(), sig.clone(), "secret");
        assert_eq!(table.len(), 1);

        // A re-handshake with a fresh signature (the peer restarted):
        // still the same entry, updated in place.
        let new_sig = PeerSignature::fresh();
        table.upsert(location.clone(), new_sig.clone(), "secret");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&location).unwrap().signature, new_sig);
    }

    #[test]
    fn derive_auth_is_a_function_of_both_signature_and_secret() {
        let sig = PeerSignature::fresh();
        let a = derive_auth(&sig, "one");
        let b = derive_auth(&sig, "two");
        assert_ne!(a, b);
        assert_eq!(a, derive_auth(&sig, "one"));
    }
}
