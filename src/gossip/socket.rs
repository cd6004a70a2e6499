// Socket Layer for CoreLink Gossip
//
// Three UDP sockets per node: a multicast sender (TTL 1, LAN only), a
// multicast receiver joined to the gossip group, and a unicast
// responder on port+1 for anti-entropy replies. Bind failures are
// fatal and propagate to the caller; send failures after startup are
// the caller's to swallow.

use crate::error::{LinkError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

pub(crate) struct GossipSockets {
    pub mcast_send: UdpSocket,
    pub mcast_recv: UdpSocket,
    pub unicast: UdpSocket,

    /// Destination for heartbeats and digest requests.
    group: SocketAddrV4,

    /// Peers' anti-entropy responder port (gossip port + 1).
    anti_entropy_port: u16,
}

impl GossipSockets {
    /// Bind all three sockets. `port` carries multicast gossip;
    /// `port + 1` carries unicast anti-entropy responses.
    pub fn bind(group: Ipv4Addr, port: u16, ttl: u32) -> Result<Self> {
        let anti_entropy_port = port.checked_add(1).ok_or_else(|| {
            LinkError::Configuration(format!("Gossip port {} leaves no room for port+1", port))
        })?;

        // Multicast sender: unbound beyond an ephemeral port, TTL
        // capped so gossip never leaves the subnet.
        let send = new_udp_socket()?;
        send.set_multicast_ttl_v4(ttl)
            .map_err(|e| LinkError::Network(format!("Failed to set multicast TTL: {}", e)))?;
        send.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into())
            .map_err(|e| LinkError::Network(format!("Failed to bind send socket: {}", e)))?;

        // Multicast receiver: reusable bind on the gossip port, joined
        // to the group on INADDR_ANY.
        let recv = new_udp_socket()?;
        set_reusable(&recv)?;
        recv.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())
            .map_err(|e| LinkError::Network(format!("Failed to bind port {}: {}", port, e)))?;
        recv.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| LinkError::Network(format!("Failed to join multicast group: {}", e)))?;

        // Unicast responder for anti-entropy replies.
        let unicast = new_udp_socket()?;
        set_reusable(&unicast)?;
        unicast
            .bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), anti_entropy_port).into())
            .map_err(|e| {
                LinkError::Network(format!("Failed to bind port {}: {}", anti_entropy_port, e))
            })?;

        Ok(Self {
            mcast_send: into_tokio(send)?,
            mcast_recv: into_tokio(recv)?,
            unicast: into_tokio(unicast)?,
            group: SocketAddrV4::new(group, port),
            anti_entropy_port,
        })
    }

    /// Send one datagram to the gossip group.
    pub async fn send_multicast(&self, data: &[u8]) -> Result<()> {
        self.mcast_send
            .send_to(data, SocketAddr::V4(self.group))
            .await
            .map_err(|e| LinkError::Network(format!("Multicast send failed: {}", e)))?;
        Ok(())
    }

    /// Send one datagram to a peer's anti-entropy responder.
    pub async fn send_unicast(&self, data: &[u8], peer: IpAddr) -> Result<()> {
        self.unicast
            .send_to(data, SocketAddr::new(peer, self.anti_entropy_port))
            .await
            .map_err(|e| LinkError::Network(format!("Unicast send failed: {}", e)))?;
        Ok(())
    }
}

fn new_udp_socket() -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| LinkError::Network(format!("Failed to create socket: {}", e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| LinkError::Network(format!("Failed to set nonblocking: {}", e)))?;
    Ok(socket)
}

fn set_reusable(socket: &Socket) -> Result<()> {
    socket
        .set_reuse_address(true)
        .map_err(|e| LinkError::Network(format!("Failed to set reuse address: {}", e)))?;

    // Lets several nodes share one host, which the gossip port layout
    // assumes.
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| LinkError::Network(format!("Failed to set reuse port: {}", e)))?;

    Ok(())
}

fn into_tokio(socket: Socket) -> Result<UdpSocket> {
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| LinkError::Network(format!("Failed to create tokio socket: {}", e)))
}
