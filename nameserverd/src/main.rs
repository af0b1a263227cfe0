mod config;
mod directory;
mod relay;
mod search;
mod server;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::directory::ChannelFinderClient;
use crate::relay::{targets, SearchRelay};
use crate::search::{SearchDecisionEngine, ShutdownLatch, QUIT_NAME};
use crate::server::{LocalAddrs, SearchServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nameserverd=info"))
        )
        .init();

    tracing::info!("Starting nameserverd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/pv-nameserver/nameserverd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let directory = ChannelFinderClient::new(config.directory.clone())?;
    tracing::info!(
        "Using directory {}{} (timeout {:?})",
        config.directory.url,
        config.directory.resource_path,
        config.directory.timeout()
    );

    // Released by ctrl-c or by a search for QUIT
    let shutdown = ShutdownLatch::new(CancellationToken::new());
    let engine = SearchDecisionEngine::new(directory, shutdown.clone(), config.directory.timeout());

    // Needed for the relay targets and to recognize our own relayed searches
    let interfaces = targets::local_interfaces().context("Failed to list local network interfaces")?;

    let relay = if config.relay.enabled {
        let relay_targets = targets::build_targets(&config.relay, config.discovery.broadcast_port, &interfaces)?;
        let relay = SearchRelay::bind(relay_targets)?;
        tracing::info!("Relaying unresolved searches to {} targets", relay.targets().len());
        Some(relay)
    } else {
        tracing::info!("Search relay disabled");
        None
    };

    let port = config.discovery.server_port;
    let v4_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let v4 = server::bind_listener(v4_addr)
        .with_context(|| format!("Failed to bind search listener on {}", v4_addr))?;

    let v6 = if config.discovery.ipv6 {
        let v6_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        match server::bind_listener(v6_addr) {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!("IPv6 search listener unavailable on {}: {}", v6_addr, e);
                None
            }
        }
    } else {
        None
    };

    let local_addrs = LocalAddrs::new(interfaces.iter().map(|i| i.ip).collect(), server::interface_ips);

    let server = Arc::new(SearchServer::new(
        engine,
        relay,
        v4,
        v6,
        local_addrs,
        config.discovery.max_in_flight,
    ));
    for addr in server.local_addrs() {
        tracing::info!("Listening for searches on UDP {}", addr);
    }
    tracing::info!("For UDP search, run 'pvget' or 'pvxget' with EPICS_PVA_BROADCAST_PORT={}", port);
    tracing::info!("Run 'pvget {}' to stop", QUIT_NAME);

    let handles = server.spawn(shutdown.token().clone());

    // Wait for shutdown signal
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutdown signal received");
            shutdown.release();
        }
        _ = shutdown.token().cancelled() => {
            tracing::info!("Shutdown requested by search");
        }
    }

    // Wait for all listeners to stop
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
