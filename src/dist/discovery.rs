//! UDP broadcast discovery: periodically announce ourselves, and answer
//! announcements from others with a TCP handshake that seeds both peer
//! tables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{AsyncoroError, Result};
use crate::message::Value;
use crate::net::udp::AsyncUdpSocket;
use crate::scheduler::Coro;

use super::transport::{exchange, Reply, RequestKind};
use super::{build_request, DistContext, Location, PeerSignature};

const PING_PREFIX: &[u8] = b"PING:";
const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

fn broadcast_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)), port)
}

/// Encode a UDP ping datagram: `"PING:"` followed by a `bincode`-serialized
/// `(Location, PeerSignature)` pair.
fn encode_ping(location: &Location, signature: &PeerSignature) -> Result<Vec<u8>> {
    let body = bincode::serialize(&(location, signature)).map_err(AsyncoroError::Codec)?;
    let mut datagram = Vec::with_capacity(PING_PREFIX.len() + body.len());
    datagram.extend_from_slice(PING_PREFIX);
    datagram.extend_from_slice(&body);
    Ok(datagram)
}

fn decode_ping(datagram: &[u8]) -> Option<(Location, PeerSignature)> {
    let body = datagram.strip_prefix(PING_PREFIX)?;
    bincode::deserialize(body).ok()
}

/// Daemon coroutine: broadcast a `PING` datagram on `udp_port` every
/// [`BROADCAST_INTERVAL`], forever.
pub fn run_broadcaster(coro: &mut Coro<'_>, ctx: Arc<DistContext>, udp_port: u16) -> Result<Value> {
    let mut socket = AsyncUdpSocket::bind(coro.handle(), SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
    socket.set_broadcast(true)?;
    let dest = broadcast_addr(udp_port);
    loop {
        let datagram = encode_ping(&ctx.local, &ctx.signature)?;
        if let Err(e) = socket.sendto(coro, &datagram, dest, Some(Duration::from_secs(1))) {
            warn!("broadcasting discovery ping failed: {}", e);
        }
        coro.sleep(BROADCAST_INTERVAL)?;
    }
}

/// Daemon coroutine: listen on `udp_port` for `PING` datagrams from other
/// peers and, for anyone new (or anyone whose signature has changed since
/// we last heard from them), complete the TCP handshake that seeds both
/// sides' peer tables.
pub fn run_listener(coro: &mut Coro<'_>, ctx: Arc<DistContext>, udp_port: u16) -> Result<Value> {
    let mut socket = AsyncUdpSocket::bind(coro.handle(), SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), udp_port))?;
    loop {
        let (datagram, from) = socket.recvfrom(coro, 2048, None)?;
        let (location, signature) = match decode_ping(&datagram) {
            Some(pair) => pair,
            None => {
                debug!("ignoring malformed discovery datagram from {}", from);
                continue;
            }
        };
        if location == ctx.local {
            continue; // our own broadcast, looped back
        }
        let known = ctx.peers.get(&location);
        if known.as_ref().map(|e| &e.signature) == Some(&signature) {
            continue; // already know this peer with this signature
        }
        if let Err(e) = handshake(&ctx, coro, location.clone()) {
            warn!("discovery handshake with {} failed: {}", location, e);
            continue;
        }
        ctx.peers.upsert(location, signature, &ctx.secret);
    }
}

/// Open a TCP connection to `location` and exchange a `Ping` request,
/// confirming it is reachable and letting it record our own signature in
/// the same round trip (its inbound `authenticate` upserts us on receipt).
fn handshake(ctx: &DistContext, coro: &mut Coro<'_>, location: Location) -> Result<()> {
    let request = build_request(
        ctx,
        location,
        RequestKind::Ping {
            location: ctx.local.clone(),
            signature: ctx.signature.clone(),
        },
    );
    match exchange(coro, &request)? {
        Reply::Ack(_) => Ok(()),
        Reply::Nak(msg) => Err(AsyncoroError::InvalidState(msg)),
    }
}
