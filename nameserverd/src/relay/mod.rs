pub mod socket;
pub mod targets;

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use anyhow::{Context, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use shared::protocol::{encode_search_request, MAX_UDP_PACKET};
use shared::types::SearchRequest;

pub use socket::RelaySocket;
pub use targets::{BroadcastTarget, TargetInterface};

/// Outcome of one `forward` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub attempted: usize,
    pub failed: usize,
}

/// Re-broadcasts searches nobody answered directly, so normal discovery
/// still reaches the servers.
///
/// Encoding and sending happen under the buffer lock, so relays are
/// serialized. Each family's socket has its own lock around the
/// option-set-and-send sequence.
pub struct SearchRelay<S = socket2::Socket> {
    v4: Mutex<S>,
    v6: Mutex<S>,
    buffer: Mutex<BytesMut>,
    targets: Vec<BroadcastTarget>,
}

impl SearchRelay<socket2::Socket> {
    /// Open both relay sockets. Failing to open either is fatal.
    pub fn bind(targets: Vec<BroadcastTarget>) -> Result<Self> {
        let v4 = socket::open_v4().context("Failed to open IPv4 relay socket")?;
        let v6 = socket::open_v6().context("Failed to open IPv6 relay socket")?;
        let relay = Self::with_sockets(v4, v6, targets);

        tracing::debug!(
            "Relaying searches from UDP {:?} and {:?}",
            relay.local_addr_v4(),
            relay.local_addr_v6()
        );
        for target in &relay.targets {
            tracing::info!("Relay target {}", target);
        }
        Ok(relay)
    }
}

impl<S: RelaySocket> SearchRelay<S> {
    pub fn with_sockets(v4: S, v6: S, targets: Vec<BroadcastTarget>) -> Self {
        Self {
            v4: Mutex::new(v4),
            v6: Mutex::new(v6),
            buffer: Mutex::new(BytesMut::with_capacity(MAX_UDP_PACKET)),
            targets,
        }
    }

    pub fn targets(&self) -> &[BroadcastTarget] {
        &self.targets
    }

    /// Local address of the socket used for IPv4 targets
    pub fn local_addr_v4(&self) -> Option<SocketAddr> {
        self.v4.lock().local_addr().ok()
    }

    /// Local address of the socket used for IPv6 targets
    pub fn local_addr_v6(&self) -> Option<SocketAddr> {
        self.v6.lock().local_addr().ok()
    }

    /// Send the search to every target once, with the client as reply-to.
    /// A failed target is logged and does not stop the others.
    pub fn forward(&self, request: &SearchRequest) -> RelayReport {
        tracing::info!(
            "Forwarding search: {} searches for {} (seq {})",
            request.client,
            request.name,
            request.seq
        );

        let mut report = RelayReport::default();
        let mut buffer = self.buffer.lock();
        buffer.clear();

        let channels = [(request.cid, request.name.as_str())];
        if let Err(e) = encode_search_request(&mut buffer, false, request.seq, &channels, request.client) {
            tracing::warn!("Failed to encode search for {}: {}", request.name, e);
            return report;
        }
        if buffer.len() > MAX_UDP_PACKET {
            tracing::warn!(
                "Search for {} needs {} bytes, more than one datagram",
                request.name,
                buffer.len()
            );
            return report;
        }

        for target in &self.targets {
            report.attempted += 1;
            tracing::trace!(
                "Sending search to UDP {}, response addr {}\n{}",
                target,
                request.client,
                hex::encode(&buffer[..])
            );
            if let Err(e) = self.send(&buffer, target) {
                report.failed += 1;
                tracing::warn!("Failed to send search for {} to {}: {}", request.name, target, e);
            }
        }
        report
    }

    fn send(&self, frame: &[u8], target: &BroadcastTarget) -> io::Result<()> {
        if target.address.is_ipv4() {
            let socket = self.v4.lock();
            if target.multicast {
                let interface = match target.interface {
                    Some(TargetInterface::V4(ip)) => ip,
                    _ => Ipv4Addr::UNSPECIFIED,
                };
                socket.set_multicast_v4(interface, target.ttl)?;
            }
            socket.send_to(frame, target.address)?;
        } else {
            let socket = self.v6.lock();
            if target.multicast {
                let interface = match target.interface {
                    Some(TargetInterface::V6(index)) => index,
                    _ => 0,
                };
                socket.set_multicast_v6(interface, target.ttl)?;
            }
            socket.send_to(frame, target.address)?;
        }
        Ok(())
    }
}
