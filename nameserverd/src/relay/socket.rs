use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// The socket operations the relay performs. Multicast interface and TTL
/// are set per send, so they are part of the trait rather than of setup.
pub trait RelaySocket: Send + Sync {
    fn set_multicast_v4(&self, interface: Ipv4Addr, ttl: u32) -> io::Result<()>;
    fn set_multicast_v6(&self, interface: u32, hops: u32) -> io::Result<()>;
    fn send_to(&self, frame: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl RelaySocket for Socket {
    fn set_multicast_v4(&self, interface: Ipv4Addr, ttl: u32) -> io::Result<()> {
        Socket::set_multicast_if_v4(self, &interface)?;
        Socket::set_multicast_ttl_v4(self, ttl)
    }

    fn set_multicast_v6(&self, interface: u32, hops: u32) -> io::Result<()> {
        Socket::set_multicast_if_v6(self, interface)?;
        Socket::set_multicast_hops_v6(self, hops)
    }

    fn send_to(&self, frame: &[u8], target: SocketAddr) -> io::Result<usize> {
        Socket::send_to(self, frame, &SockAddr::from(target))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Socket::local_addr(self)?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "socket has no IP address"))
    }
}

/// IPv4 relay socket on an ephemeral port, allowed to send broadcasts.
pub fn open_v4() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.bind(&SockAddr::from(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))))?;
    Ok(socket)
}

/// IPv6 relay socket on an ephemeral port.
pub fn open_v6() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.bind(&SockAddr::from(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))))?;
    Ok(socket)
}
