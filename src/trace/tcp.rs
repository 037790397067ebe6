//! TCP RST/ACK receiver
//!
//! Probes that outlive every router on the path reach the target, which
//! answers a SYN with RST (closed port) or SYN/ACK (open port). Either way
//! the acknowledgement number is our ISN plus one, so the stamp survives the
//! round trip even though the original header is gone.

use anyhow::Result;
use std::net::IpAddr;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::AddrFamily;
use crate::probe::packet::{TcpHeader, TCP_FLAG_ACK, TCP_FLAG_RST, TCP_HEADER_SIZE};
use crate::probe::socket::{open_tcp_recv_socket, recv_from};
use crate::probe::stamp;
use crate::state::{Probe, ResponseEvent, TcpResponse};
use crate::trace::spawn_receiver_thread;

/// Open the raw TCP socket and spawn the receive thread.
pub fn spawn_tcp_receiver(
    family: AddrFamily,
    target: IpAddr,
    target_port: u16,
    max_ttl: u8,
    cancel: CancellationToken,
) -> Result<(JoinHandle<Result<()>>, mpsc::Receiver<ResponseEvent>)> {
    let socket = open_tcp_recv_socket(family)?;
    let (tx, rx) = mpsc::channel(64);

    // IPv4 raw sockets prepend the IP header; IPv6 delivers bare TCP
    let ip_hdr_size = match family {
        AddrFamily::Ip4 => 20,
        AddrFamily::Ip6 => 0,
    };

    let handle = spawn_receiver_thread("tcp", move || {
        debug!("tcp receiver starting");
        let mut buffer = vec![0u8; ip_hdr_size + TCP_HEADER_SIZE];

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
                    debug!(error = %e, "tcp receive ended");
                    break;
                }
            };

            let Some(from_addr) = from else { continue };
            let Some(response) =
                parse_target_response(ip_hdr_size, &buffer[..n], from_addr, target, target_port, max_ttl)
            else {
                continue;
            };

            trace!(
                port = response.probe.src_port,
                ttl = response.probe.ttl,
                rtt = response.rtt_ms,
                "target answered"
            );
            if tx.blocking_send(ResponseEvent::Tcp(response)).is_err() {
                break;
            }
        }
        debug!("tcp receiver done");
        Ok(())
    });

    Ok((handle, rx))
}

/// Match one raw TCP datagram against the probes: it must come from the
/// target address and port, carry RST or ACK, and yield a plausible stamp
/// from `ack - 1`.
fn parse_target_response(
    ip_hdr_size: usize,
    buf: &[u8],
    from_addr: IpAddr,
    target: IpAddr,
    target_port: u16,
    max_ttl: u8,
) -> Option<TcpResponse> {
    if buf.len() < ip_hdr_size + TCP_HEADER_SIZE {
        return None;
    }
    let tcp = TcpHeader::parse(&buf[ip_hdr_size..])?;

    if tcp.source != target_port {
        return None;
    }
    if tcp.flags & TCP_FLAG_RST != TCP_FLAG_RST && tcp.flags & TCP_FLAG_ACK != TCP_FLAG_ACK {
        return None;
    }
    if from_addr != target {
        return None;
    }

    // the target acknowledged ISN + 1
    let (ttl, stamp_ts) = stamp::decode(tcp.ack_num.wrapping_sub(1));
    if ttl < 1 || ttl > max_ttl {
        return None;
    }
    let rtt_ms = stamp::rtt_ms(stamp_ts, stamp::now_ms())?;

    Some(TcpResponse {
        probe: Probe {
            src_port: tcp.destination,
            ttl,
        },
        rtt_ms,
    })
}
