//! UDP search listener: receives searches, runs each searched channel
//! through the decision engine and relays the ones it did not answer.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::{self, GUID_SIZE, MAX_UDP_PACKET};
use shared::types::SearchRequest;
use crate::directory::Directory;
use crate::relay::{targets, RelaySocket, SearchRelay};
use crate::search::{ReplySender, SearchDecisionEngine};

/// Bind a search listener. Port sharing is allowed so IOCs on the same
/// host can listen on the discovery port too.
pub fn bind_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    } else {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    UdpSocket::from_std(socket.into())
}

/// Minimum time between two re-reads of the interface list.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

type InterfaceLister = Box<dyn Fn() -> io::Result<HashSet<IpAddr>> + Send + Sync>;

/// Addresses of every interface on this host.
pub fn interface_ips() -> io::Result<HashSet<IpAddr>> {
    Ok(targets::local_interfaces()?.into_iter().map(|i| i.ip).collect())
}

/// This host's addresses. Interfaces can gain addresses after startup, so
/// an unknown address triggers a re-read of the interface list.
pub struct LocalAddrs {
    ips: RwLock<HashSet<IpAddr>>,
    last_refresh: Mutex<Option<Instant>>,
    lister: InterfaceLister,
}

impl LocalAddrs {
    pub fn new<F>(ips: HashSet<IpAddr>, lister: F) -> Self
    where
        F: Fn() -> io::Result<HashSet<IpAddr>> + Send + Sync + 'static,
    {
        Self {
            ips: RwLock::new(ips),
            last_refresh: Mutex::new(None),
            lister: Box::new(lister),
        }
    }

    /// An address the interface list cannot be read for is treated as local.
    fn contains(&self, ip: IpAddr) -> bool {
        if self.ips.read().contains(&ip) {
            return true;
        }

        {
            let mut last = self.last_refresh.lock();
            if last.is_some_and(|t| t.elapsed() < REFRESH_INTERVAL) {
                return false;
            }
            *last = Some(Instant::now());
        }

        match (self.lister)() {
            Ok(ips) => {
                let found = ips.contains(&ip);
                if found {
                    tracing::info!("Found new local address {}", ip);
                }
                *self.ips.write() = ips;
                found
            }
            Err(e) => {
                tracing::warn!("Failed to re-read local interfaces: {}", e);
                true
            }
        }
    }
}

/// Source ports of the relay sockets, one per family.
#[derive(Debug, Default, Clone, Copy)]
struct RelayPorts {
    v4: Option<u16>,
    v6: Option<u16>,
}

impl RelayPorts {
    fn matches(&self, src: SocketAddr) -> bool {
        let port = if src.is_ipv4() { self.v4 } else { self.v6 };
        port == Some(src.port())
    }
}

pub struct SearchServer<D, S = Socket> {
    engine: SearchDecisionEngine<D>,
    relay: Option<Arc<SearchRelay<S>>>,
    guid: [u8; GUID_SIZE],
    v4: Arc<UdpSocket>,
    v6: Option<Arc<UdpSocket>>,
    relay_ports: RelayPorts,
    local_addrs: LocalAddrs,
    in_flight: Arc<Semaphore>,
}

impl<D, S> SearchServer<D, S>
where
    D: Directory + 'static,
    S: RelaySocket + 'static,
{
    pub fn new(
        engine: SearchDecisionEngine<D>,
        relay: Option<SearchRelay<S>>,
        v4: UdpSocket,
        v6: Option<UdpSocket>,
        local_addrs: LocalAddrs,
        max_in_flight: usize,
    ) -> Self {
        let relay_ports = relay
            .as_ref()
            .map(|r| RelayPorts {
                v4: r.local_addr_v4().map(|a| a.port()),
                v6: r.local_addr_v6().map(|a| a.port()),
            })
            .unwrap_or_default();

        Self {
            engine,
            relay: relay.map(Arc::new),
            guid: rand::random(),
            v4: Arc::new(v4),
            v6: v6.map(Arc::new),
            relay_ports,
            local_addrs,
            in_flight: Arc::new(Semaphore::new(max_in_flight.min(Semaphore::MAX_PERMITS))),
        }
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        std::iter::once(&self.v4)
            .chain(self.v6.iter())
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Start one receive loop per listening socket.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        std::iter::once(self.v4.clone())
            .chain(self.v6.clone())
            .map(|socket| {
                let server = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { server.listen(socket, cancel).await })
            })
            .collect()
    }

    async fn listen(self: Arc<Self>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_UDP_PACKET * 2];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.dispatch(&buf[..len], src),
                        Err(e) => tracing::warn!("Error receiving search datagram: {}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Search listener shutting down");
                    break;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, datagram: &[u8], src: SocketAddr) {
        if self.is_own_datagram(src) {
            tracing::trace!("Ignoring relayed search from {}", src);
            return;
        }

        let searches = match protocol::decode_search_requests(datagram) {
            Ok(searches) => searches,
            Err(e) => {
                tracing::debug!("Dropping malformed datagram from {}: {}", src, e);
                return;
            }
        };

        for search in searches {
            let client = if search.response.ip().is_unspecified() {
                SocketAddr::new(src.ip(), search.response.port())
            } else {
                search.response
            };

            for (cid, name) in search.channels {
                let Ok(permit) = self.in_flight.clone().try_acquire_owned() else {
                    tracing::warn!("Too many searches in flight, dropping search for {} from {}", name, client);
                    continue;
                };
                let request = SearchRequest {
                    seq: search.seq,
                    cid,
                    name,
                    client,
                };
                let server = self.clone();
                tokio::spawn(async move {
                    server.process(request).await;
                    drop(permit);
                });
            }
        }
    }

    async fn process(self: Arc<Self>, request: SearchRequest) {
        let reply = UdpReply {
            socket: self.socket_for(request.client),
            guid: self.guid,
            seq: request.seq,
            cid: request.cid,
            client: request.client,
        };
        if self.engine.handle(&request, &reply).await {
            return;
        }

        let Some(relay) = self.relay.clone() else {
            return;
        };
        match tokio::task::spawn_blocking(move || relay.forward(&request)).await {
            Ok(report) if report.failed > 0 => {
                tracing::debug!("Relay reached {} of {} targets", report.attempted - report.failed, report.attempted);
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Relay task failed: {}", e),
        }
    }

    /// Datagrams sent by our own relay sockets come back to the listener
    /// through broadcast; answering them would relay the search again.
    fn is_own_datagram(&self, src: SocketAddr) -> bool {
        self.relay_ports.matches(src) && self.local_addrs.contains(src.ip())
    }

    fn socket_for(&self, client: SocketAddr) -> Option<Arc<UdpSocket>> {
        if client.is_ipv4() {
            Some(self.v4.clone())
        } else {
            self.v6.clone()
        }
    }
}

/// Sends a positive search response back to the searching client.
struct UdpReply {
    socket: Option<Arc<UdpSocket>>,
    guid: [u8; GUID_SIZE],
    seq: u32,
    cid: u32,
    client: SocketAddr,
}

#[async_trait]
impl ReplySender for UdpReply {
    async fn reply(&self, server: SocketAddr) {
        let Some(socket) = &self.socket else {
            tracing::warn!("No listener socket can reach client {}", self.client);
            return;
        };

        let mut buf = BytesMut::with_capacity(64);
        if let Err(e) = protocol::encode_search_response(&mut buf, &self.guid, self.seq, server, &[self.cid]) {
            tracing::warn!("Failed to encode search response: {}", e);
            return;
        }
        if let Err(e) = socket.send_to(&buf, self.client).await {
            tracing::warn!("Failed to send search response to {}: {}", self.client, e);
        }
    }
}
