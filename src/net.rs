//! Socket construction
//!
//! All sockets are built through socket2 so options land before bind, then
//! converted to std types and registered with the runtime as non-blocking.

use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use std::ffi::CString;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};

/// Upstream interface selection for multicast membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iface {
    Any,
    Addr(Ipv4Addr),
    Index(u32),
}

/// Interpret a config value as either an interface IPv4 address or a name.
pub fn parse_iface(spec: &str) -> io::Result<Iface> {
    if spec.is_empty() {
        return Ok(Iface::Any);
    }
    if let Ok(addr) = spec.parse::<Ipv4Addr>() {
        return Ok(Iface::Addr(addr));
    }
    let name = CString::new(spec)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name with NUL"))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such interface: {}", spec),
        ));
    }
    Ok(Iface::Index(index))
}

/// Listener with `SO_REUSEPORT` so every worker binds the same address and
/// the kernel spreads accepted connections.
pub fn reuseport_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// UDP socket bound to the multicast port with the group joined on the
/// configured upstream interface. Membership is never dropped for rejoin;
/// `rejoin_multicast` simply re-asserts it.
pub fn multicast_socket(
    group: SocketAddrV4,
    source: Option<Ipv4Addr>,
    iface: Iface,
    rcvbuf: usize,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if rcvbuf > 0 {
        // Bursty carrier feeds overflow the default buffer quickly.
        let _ = socket.set_recv_buffer_size(rcvbuf);
    }
    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
    socket.bind(&bind.into())?;
    join_group(&socket, group, source, iface)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn join_group(
    socket: &Socket,
    group: SocketAddrV4,
    source: Option<Ipv4Addr>,
    iface: Iface,
) -> io::Result<()> {
    match source {
        Some(src) => {
            // Source-specific membership takes an interface address; an
            // index cannot be expressed through this option.
            let if_addr = match iface {
                Iface::Addr(a) => a,
                Iface::Any => Ipv4Addr::UNSPECIFIED,
                Iface::Index(_) => {
                    log::warn!(
                        "source-specific join on interface index unsupported, using routing default"
                    );
                    Ipv4Addr::UNSPECIFIED
                }
            };
            socket.join_ssm_v4(&src, group.ip(), &if_addr)
        }
        None => {
            let target = match iface {
                Iface::Any => InterfaceIndexOrAddress::Address(Ipv4Addr::UNSPECIFIED),
                Iface::Addr(a) => InterfaceIndexOrAddress::Address(a),
                Iface::Index(i) => InterfaceIndexOrAddress::Index(i),
            };
            socket.join_multicast_v4_n(group.ip(), &target)
        }
    }
}

/// Re-assert group membership. The kernel answers `EADDRINUSE` when the
/// membership already exists, which is the expected case.
pub fn rejoin_multicast(
    socket: &UdpSocket,
    group: SocketAddrV4,
    source: Option<Ipv4Addr>,
    iface: Iface,
) -> io::Result<()> {
    let sock = socket2::SockRef::from(socket);
    match join_group(&sock, group, source, iface) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Plain unconnected UDP socket (FCC signaling/media, RTSP RTP/RTCP, STUN).
pub fn udp_socket(bind: SocketAddr, rcvbuf: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if rcvbuf > 0 {
        let _ = socket.set_recv_buffer_size(rcvbuf);
    }
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The local port a socket ended up bound to.
pub fn local_port(socket: &UdpSocket) -> io::Result<u16> {
    Ok(socket.local_addr()?.port())
}
