//! Where relayed searches go.
//!
//! Targets are worked out once at startup. Interface changes while the
//! daemon runs are not picked up.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use anyhow::{Context, Result};
use crate::config::RelayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetInterface {
    /// IPv4 multicast goes out of the interface with this address
    V4(Ipv4Addr),
    /// IPv6 multicast goes out of the interface with this index
    V6(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastTarget {
    pub address: SocketAddr,
    pub interface: Option<TargetInterface>,
    pub ttl: u32,
    pub multicast: bool,
}

impl BroadcastTarget {
    pub fn new(address: SocketAddr, interface: Option<TargetInterface>, ttl: u32) -> Self {
        Self {
            address,
            interface,
            ttl,
            multicast: address.ip().is_multicast(),
        }
    }
}

impl fmt::Display for BroadcastTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if self.multicast {
            write!(f, " (multicast, ttl {}", self.ttl)?;
            match self.interface {
                Some(TargetInterface::V4(ip)) => write!(f, ", via {})", ip),
                Some(TargetInterface::V6(index)) => write!(f, ", via if#{})", index),
                None => write!(f, ")"),
            }
        } else {
            Ok(())
        }
    }
}

/// A local network interface address, as far as target selection cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub ip: IpAddr,
    pub broadcast: Option<Ipv4Addr>,
    pub index: Option<u32>,
    pub loopback: bool,
}

pub fn local_interfaces() -> io::Result<Vec<LocalInterface>> {
    let interfaces = if_addrs::get_if_addrs()?
        .into_iter()
        .map(|iface| {
            let broadcast = match &iface.addr {
                if_addrs::IfAddr::V4(v4) => v4.broadcast,
                if_addrs::IfAddr::V6(_) => None,
            };
            LocalInterface {
                loopback: iface.is_loopback(),
                ip: iface.ip(),
                broadcast,
                index: iface.index,
                name: iface.name,
            }
        })
        .collect();
    Ok(interfaces)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("invalid TTL {0:?}")]
    InvalidTtl(String),
    #[error("no interface {0:?} with a matching address family")]
    UnknownInterface(String),
}

/// Broadcast address of every non-loopback IPv4 interface, or the limited
/// broadcast address when there is none.
pub fn broadcast_targets(interfaces: &[LocalInterface], port: u16) -> Vec<BroadcastTarget> {
    let mut targets = Vec::new();
    for iface in interfaces.iter().filter(|i| !i.loopback) {
        if let Some(broadcast) = iface.broadcast {
            let target = BroadcastTarget::new(SocketAddr::from((broadcast, port)), None, 1);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    if targets.is_empty() {
        targets.push(BroadcastTarget::new(
            SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            None,
            1,
        ));
    }
    targets
}

/// Parse `host[:port][,ttl][@interface]`, e.g. `224.0.2.3,255@eth0` or
/// `[ff02::42:1]:5076@eth0`.
pub fn parse_target(
    entry: &str,
    default_port: u16,
    default_ttl: u32,
    interfaces: &[LocalInterface],
) -> Result<BroadcastTarget, TargetError> {
    let entry = entry.trim();
    let (rest, iface_name) = match entry.rsplit_once('@') {
        Some((rest, name)) => (rest, Some(name.trim())),
        None => (entry, None),
    };
    let (addr, ttl) = match rest.rsplit_once(',') {
        Some((addr, ttl)) => {
            let ttl = ttl
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|t| (1..=255).contains(t))
                .ok_or_else(|| TargetError::InvalidTtl(ttl.to_string()))?;
            (addr.trim(), ttl)
        }
        None => (rest.trim(), default_ttl),
    };

    let address = addr
        .parse::<SocketAddr>()
        .or_else(|_| addr.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, default_port)))
        .map_err(|_| TargetError::InvalidAddress(addr.to_string()))?;

    let interface = match iface_name {
        Some(name) => Some(resolve_interface(name, address.ip(), interfaces)?),
        None => None,
    };

    Ok(BroadcastTarget::new(address, interface, ttl))
}

fn resolve_interface(
    name: &str,
    target: IpAddr,
    interfaces: &[LocalInterface],
) -> Result<TargetInterface, TargetError> {
    let mut candidates = interfaces.iter().filter(|i| i.name == name);
    let found = match target {
        IpAddr::V4(_) => candidates.find_map(|i| match i.ip {
            IpAddr::V4(ip) => Some(TargetInterface::V4(ip)),
            IpAddr::V6(_) => None,
        }),
        IpAddr::V6(_) => candidates.find_map(|i| i.index.map(TargetInterface::V6)),
    };
    found.ok_or_else(|| TargetError::UnknownInterface(name.to_string()))
}

/// All relay targets for the configured discovery port.
pub fn build_targets(
    config: &RelayConfig,
    port: u16,
    interfaces: &[LocalInterface],
) -> Result<Vec<BroadcastTarget>> {
    let mut targets = Vec::new();
    if config.auto_address_list {
        targets.extend(broadcast_targets(interfaces, port));
    }
    for entry in &config.address_list {
        let target = parse_target(entry, port, config.multicast_ttl, interfaces)
            .with_context(|| format!("Invalid relay address {:?}", entry))?;
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    Ok(targets)
}
