//! ICMP TTL-exceeded receiver
//!
//! Reads the raw ICMP (or ICMPv6) socket on a dedicated thread, filters for
//! "TTL exceeded in transit", and recovers the probe stamp from the 8 bytes
//! of TCP header the router quoted back. Everything else on the socket is
//! silently dropped.

use anyhow::Result;
use std::net::IpAddr;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::AddrFamily;
use crate::probe::packet::parse_quoted_tcp;
use crate::probe::socket::{open_icmp_recv_socket, recv_from};
use crate::probe::stamp;
use crate::state::{IcmpResponse, Probe, ResponseEvent, UNKNOWN_HOP};
use crate::trace::spawn_receiver_thread;

const ICMP_HEADER_SIZE: usize = 8;
const QUOTED_TCP_SIZE: usize = 8;

/// Family-dependent wire layout of a TTL-exceeded error as read from the
/// raw socket.
#[derive(Debug, Clone, Copy)]
struct WireLayout {
    /// Outer IP header bytes the kernel hands us: 20 for IPv4 raw sockets,
    /// none for IPv6.
    outer_ip: usize,
    /// IP header of the original probe quoted inside the error.
    inner_ip: usize,
    /// "time exceeded" message type: 11 for ICMP, 3 for ICMPv6.
    msg_type: u8,
}

impl WireLayout {
    fn for_family(family: AddrFamily) -> Self {
        match family {
            AddrFamily::Ip4 => Self {
                outer_ip: 20,
                inner_ip: 20,
                msg_type: 11,
            },
            AddrFamily::Ip6 => Self {
                outer_ip: 0,
                inner_ip: 40,
                msg_type: 3,
            },
        }
    }

    fn min_len(&self) -> usize {
        self.outer_ip + ICMP_HEADER_SIZE + self.inner_ip + QUOTED_TCP_SIZE
    }
}

/// Open the ICMP socket and spawn the receive thread.
pub fn spawn_icmp_receiver(
    family: AddrFamily,
    cancel: CancellationToken,
) -> Result<(JoinHandle<Result<()>>, mpsc::Receiver<ResponseEvent>)> {
    let socket = open_icmp_recv_socket(family)?;
    let (tx, rx) = mpsc::channel(64);

    let handle = spawn_receiver_thread("icmp", move || {
        debug!("icmp receiver starting");
        let layout = WireLayout::for_family(family);
        let mut buffer = vec![0u8; layout.min_len()];

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (n, from) = match recv_from(&socket, &mut buffer) {
                Ok(got) => got,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    // socket torn down; normal termination
                    debug!(error = %e, "icmp receive ended");
                    break;
                }
            };

            let Some(from_addr) = from else { continue };
            let Some(response) = parse_ttl_exceeded(layout, &buffer[..n], from_addr) else {
                continue;
            };

            trace!(
                port = response.probe.src_port,
                ttl = response.probe.ttl,
                from = %response.from_addr,
                "ttl exceeded"
            );
            if tx.blocking_send(ResponseEvent::Icmp(response)).is_err() {
                break;
            }
        }
        debug!("icmp receiver done");
        Ok(())
    });

    Ok((handle, rx))
}

/// Recover an `IcmpResponse` from one raw datagram, or `None` when it is
/// not a TTL-exceeded error for one of our probes.
fn parse_ttl_exceeded(layout: WireLayout, buf: &[u8], from_addr: IpAddr) -> Option<IcmpResponse> {
    if buf.len() < layout.min_len() {
        return None;
    }

    // IPv4 headers carrying options would shift every offset; drop them
    if layout.outer_ip > 0 && buf[0] != 0x45 {
        return None;
    }
    if buf[layout.outer_ip] != layout.msg_type || buf[layout.outer_ip + 1] != 0 {
        return None;
    }
    let inner_ip_start = layout.outer_ip + ICMP_HEADER_SIZE;
    if layout.inner_ip == 20 && buf[inner_ip_start] != 0x45 {
        return None;
    }

    let quoted = &buf[inner_ip_start + layout.inner_ip..];
    let (src_port, seq_num) = parse_quoted_tcp(quoted)?;
    let (ttl, stamp_ts) = stamp::decode(seq_num);
    let rtt_ms = stamp::rtt_ms(stamp_ts, stamp::now_ms())?;

    Some(IcmpResponse {
        probe: Probe { src_port, ttl },
        from_addr,
        from_name: UNKNOWN_HOP.to_string(),
        rtt_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn router() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 20, 0, 1))
    }

    /// Outer IPv4 + ICMP time-exceeded + quoted IPv4 + 8 bytes of TCP.
    fn v4_ttl_exceeded(src_port: u16, seq_num: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 56];
        buf[0] = 0x45; // outer IPv4, no options
        buf[9] = 1; // ICMP
        buf[20] = 11; // time exceeded
        buf[21] = 0; // in transit
        buf[28] = 0x45; // quoted IPv4, no options
        buf[37] = 6; // quoted protocol TCP
        buf[48..50].copy_from_slice(&src_port.to_be_bytes());
        buf[52..56].copy_from_slice(&seq_num.to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_v4_ttl_exceeded() {
        let layout = WireLayout::for_family(AddrFamily::Ip4);
        let seq = stamp::encode(7, stamp::now_ms());
        let buf = v4_ttl_exceeded(33005, seq);

        let resp = parse_ttl_exceeded(layout, &buf, router()).unwrap();
        assert_eq!(resp.probe.src_port, 33005);
        assert_eq!(resp.probe.ttl, 7);
        assert_eq!(resp.from_addr, router());
        assert_eq!(resp.from_name, UNKNOWN_HOP);
        assert!(resp.rtt_ms < 1000);
    }

    #[test]
    fn test_parse_v6_ttl_exceeded() {
        // no outer header on the IPv6 raw socket; inner IPv6 header is 40 bytes
        let layout = WireLayout::for_family(AddrFamily::Ip6);
        let seq = stamp::encode(3, stamp::now_ms());
        let mut buf = vec![0u8; 56];
        buf[0] = 3; // ICMPv6 time exceeded
        buf[1] = 0;
        buf[48..50].copy_from_slice(&33017u16.to_be_bytes());
        buf[52..56].copy_from_slice(&seq.to_be_bytes());

        let from: IpAddr = "2001:db8::9".parse().unwrap();
        let resp = parse_ttl_exceeded(layout, &buf, from).unwrap();
        assert_eq!(resp.probe.src_port, 33017);
        assert_eq!(resp.probe.ttl, 3);
        assert_eq!(resp.from_addr, from);
    }

    #[test]
    fn test_wrong_type_or_code_dropped() {
        let layout = WireLayout::for_family(AddrFamily::Ip4);
        let seq = stamp::encode(7, stamp::now_ms());

        let mut echo_reply = v4_ttl_exceeded(33005, seq);
        echo_reply[20] = 0;
        assert!(parse_ttl_exceeded(layout, &echo_reply, router()).is_none());

        let mut reassembly = v4_ttl_exceeded(33005, seq);
        reassembly[21] = 1; // fragment reassembly time exceeded
        assert!(parse_ttl_exceeded(layout, &reassembly, router()).is_none());
    }

    #[test]
    fn test_short_datagram_dropped() {
        let layout = WireLayout::for_family(AddrFamily::Ip4);
        let buf = v4_ttl_exceeded(33005, stamp::encode(7, stamp::now_ms()));
        assert!(parse_ttl_exceeded(layout, &buf[..55], router()).is_none());
        assert!(parse_ttl_exceeded(layout, &[], router()).is_none());
    }

    #[test]
    fn test_ip_options_dropped() {
        let layout = WireLayout::for_family(AddrFamily::Ip4);
        let seq = stamp::encode(7, stamp::now_ms());

        let mut outer_options = v4_ttl_exceeded(33005, seq);
        outer_options[0] = 0x46;
        assert!(parse_ttl_exceeded(layout, &outer_options, router()).is_none());

        let mut inner_options = v4_ttl_exceeded(33005, seq);
        inner_options[28] = 0x46;
        assert!(parse_ttl_exceeded(layout, &inner_options, router()).is_none());
    }

    #[test]
    fn test_future_stamp_dropped() {
        let layout = WireLayout::for_family(AddrFamily::Ip4);
        let future = (stamp::now_ms() + 60_000) & 0x00ff_ffff;
        let buf = v4_ttl_exceeded(33005, stamp::encode(7, future));
        assert!(parse_ttl_exceeded(layout, &buf, router()).is_none());
    }
}
