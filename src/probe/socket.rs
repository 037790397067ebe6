use anyhow::{anyhow, Context, Result};
use pnet::datalink;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::config::AddrFamily;

/// Receive buffer size for the raw receivers; responses arrive in bursts of
/// up to `probe_rate * max_ttl` packets per second.
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Poll interval for cancellation checks on blocking receive loops.
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

fn new_raw_socket(family: AddrFamily, protocol: Protocol) -> Result<Socket> {
    let domain = match family {
        AddrFamily::Ip4 => Domain::IPV4,
        AddrFamily::Ip6 => Domain::IPV6,
    };

    Socket::new(domain, Type::RAW, Some(protocol)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            let binary_path = std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "ecmptrace".to_string());
            anyhow!(
                "insufficient permissions for raw sockets: {}\n\n\
                 Fix options:\n\
                 \u{2022} Run with sudo: sudo ecmptrace <target>\n\
                 \u{2022} Add capability: sudo setcap cap_net_raw+ep {}",
                e,
                binary_path
            )
        } else {
            anyhow!("creating raw socket: {}", e)
        }
    })
}

/// Raw TCP socket used by a sender to inject SYN probes.
///
/// Bound to the source address; TTL and TOS are per-sender socket options.
pub fn open_send_socket(
    family: AddrFamily,
    src_addr: IpAddr,
    ttl: u8,
    tos: u32,
) -> Result<Socket> {
    let socket = new_raw_socket(family, Protocol::TCP)?;

    let bind_addr = SocketAddr::new(src_addr, 0);
    socket
        .bind(&SockAddr::from(bind_addr))
        .with_context(|| format!("binding send socket to {}", src_addr))?;

    match family {
        AddrFamily::Ip4 => {
            socket.set_ttl(ttl as u32).context("setting IP_TTL")?;
            socket.set_tos(tos).context("setting IP_TOS")?;
        }
        AddrFamily::Ip6 => {
            socket
                .set_unicast_hops_v6(ttl as u32)
                .context("setting IPV6_UNICAST_HOPS")?;
            socket.set_tclass_v6(tos).context("setting IPV6_TCLASS")?;
        }
    }

    Ok(socket)
}

/// Raw TCP socket for collecting RST/ACK responses from the target.
pub fn open_tcp_recv_socket(family: AddrFamily) -> Result<Socket> {
    let socket = new_raw_socket(family, Protocol::TCP)?;
    socket
        .set_read_timeout(Some(RECV_POLL_TIMEOUT))
        .context("setting read timeout")?;
    socket
        .set_recv_buffer_size(RECV_BUFFER_SIZE)
        .context("sizing receive buffer")?;
    Ok(socket)
}

/// Raw ICMP / ICMPv6 socket for collecting TTL-exceeded errors.
pub fn open_icmp_recv_socket(family: AddrFamily) -> Result<Socket> {
    let protocol = match family {
        AddrFamily::Ip4 => Protocol::ICMPV4,
        AddrFamily::Ip6 => Protocol::ICMPV6,
    };
    let socket = new_raw_socket(family, protocol)?;
    socket
        .set_read_timeout(Some(RECV_POLL_TIMEOUT))
        .context("setting read timeout")?;
    socket
        .set_recv_buffer_size(RECV_BUFFER_SIZE)
        .context("sizing receive buffer")?;
    Ok(socket)
}

/// Receive one datagram, returning the byte count and the source address.
pub fn recv_from(socket: &Socket, buffer: &mut [u8]) -> std::io::Result<(usize, Option<IpAddr>)> {
    let uninit: &mut [MaybeUninit<u8>] = unsafe {
        std::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut MaybeUninit<u8>, buffer.len())
    };
    let (len, addr) = socket.recv_from(uninit)?;
    Ok((len, addr.as_socket().map(|s| s.ip())))
}

/// Send a probe toward the target. The port in the socket address is zero:
/// the real ports live inside the hand-built TCP header, and IPv6 raw
/// sockets reject a non-zero port here.
pub fn send_probe(socket: &Socket, packet: &[u8], target: IpAddr) -> std::io::Result<usize> {
    let addr = SockAddr::from(SocketAddr::new(target, 0));
    socket.send_to(packet, &addr)
}

/// Auto-discover the source address: the first non-loopback interface
/// address in the requested family.
pub fn discover_source_addr(family: AddrFamily) -> Result<IpAddr> {
    let candidates = datalink::interfaces()
        .into_iter()
        .flat_map(|iface| iface.ips.into_iter().map(|net| net.ip()))
        .collect::<Vec<_>>();

    pick_source_addr(&candidates, family)
        .ok_or_else(|| anyhow!("could not find a source address in family {}", family))
}

fn pick_source_addr(candidates: &[IpAddr], family: AddrFamily) -> Option<IpAddr> {
    candidates
        .iter()
        .find(|ip| !ip.is_loopback() && family.matches(ip))
        .copied()
}
