use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

/// Kernel receive buffer requested for TS-over-UDP input
const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Binds a non-blocking IPv4 UDP socket for transport stream input, joining
/// the group on `iface` when `addr` is multicast.
pub fn create_udp_socket(addr: SocketAddr, iface: Option<Ipv4Addr>) -> anyhow::Result<std::net::UdpSocket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        _ => anyhow::bail!("only IPv4 is supported"),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // best effort; the kernel may clamp it
    let _ = socket.set_recv_buffer_size(RECV_BUFFER_BYTES);
    socket.bind(&addr.into())?;

    if ip.is_multicast() {
        let iface = iface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(&ip, &iface)?;
        info!(group = %ip, iface = %iface, "joined multicast group");
    }

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
