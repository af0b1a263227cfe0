use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::{ResolvedAddress, SearchRequest};
use crate::directory::Directory;

/// Searching for this PV name stops the daemon.
pub const QUIT_NAME: &str = "QUIT";

/// Answers a client's search with the address of the server that has the PV.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn reply(&self, server: SocketAddr);
}

/// One-shot shutdown trigger shared by the search path and `main`.
#[derive(Clone)]
pub struct ShutdownLatch {
    token: CancellationToken,
    released: Arc<AtomicBool>,
}

impl ShutdownLatch {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true only for the call that actually released the latch.
    pub fn release(&self) -> bool {
        let first = !self.released.swap(true, Ordering::AcqRel);
        if first {
            self.token.cancel();
        }
        first
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Decides, per search, between a direct reply and normal discovery.
pub struct SearchDecisionEngine<D> {
    directory: D,
    shutdown: ShutdownLatch,
    /// Budget for one search: directory lookup plus override host resolution
    deadline: Duration,
}

impl<D: Directory> SearchDecisionEngine<D> {
    pub fn new(directory: D, shutdown: ShutdownLatch, deadline: Duration) -> Self {
        Self { directory, shutdown, deadline }
    }

    /// Handle one searched channel. Returns true when the search was answered
    /// here and default discovery must be suppressed.
    pub async fn handle(&self, request: &SearchRequest, reply: &dyn ReplySender) -> bool {
        let started = Instant::now();
        tracing::info!(
            "{} searches for {} (seq {}, cid {})",
            request.client,
            request.name,
            request.seq,
            request.cid
        );

        if request.name == QUIT_NAME && self.shutdown.release() {
            tracing::info!("Received search for {}, shutting down", QUIT_NAME);
        }

        let Some(address) = self.directory.lookup(&request.name).await else {
            tracing::debug!("No override for {}, passing through", request.name);
            return false;
        };

        let remaining = self.deadline.saturating_sub(started.elapsed());
        let Some(server) = to_socket_addr(&address, remaining).await else {
            return false;
        };

        tracing::info!(" --> Sending client {} to {}", request.client, server);
        reply.reply(server).await;
        true
    }
}

/// Resolve the override host, which may be a name rather than an IP.
/// Name resolution gets whatever is left of the search deadline.
async fn to_socket_addr(address: &ResolvedAddress, remaining: Duration) -> Option<SocketAddr> {
    if let Ok(ip) = address.host.parse() {
        return Some(SocketAddr::new(ip, address.port));
    }

    if remaining.is_zero() {
        tracing::warn!("No time left to resolve override host {}, passing through", address.host);
        return None;
    }

    let lookup = tokio::net::lookup_host((address.host.as_str(), address.port));
    match tokio::time::timeout(remaining, lookup).await {
        Err(_) => {
            tracing::warn!("Timed out resolving override host {}", address.host);
            None
        }
        Ok(Ok(mut addrs)) => {
            let addr = addrs.next();
            if addr.is_none() {
                tracing::warn!("Override host {} resolved to no addresses", address.host);
            }
            addr
        }
        Ok(Err(e)) => {
            tracing::warn!("Failed to resolve override host {}: {}", address.host, e);
            None
        }
    }
}
