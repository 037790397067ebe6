//! Per-TTL SYN sender
//!
//! One sender task per TTL sweeps the source-port range at a steady rate,
//! stamping the TTL and send time into each ISN. Every transmitted probe is
//! published on the outbound stream so the correlator can count it; a probe
//! that cannot be published because the stop token fired is not counted.

use anyhow::Result;
use rand::Rng;
use socket2::Socket;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::probe::packet::build_syn;
use crate::probe::socket::{open_send_socket, send_probe};
use crate::probe::stamp;
use crate::state::Probe;

/// Fraction of the probe interval used as uniform pacing jitter, to keep
/// parallel senders from synchronizing their bursts.
const JITTER_FRACTION: f64 = 0.025;

/// Open the raw socket for one TTL and spawn its send loop.
///
/// Socket setup errors are returned synchronously so startup can abort with
/// a privilege hint before any probes fly.
pub fn spawn_sender(
    config: &Config,
    src_addr: IpAddr,
    target: IpAddr,
    ttl: u8,
    stop: CancellationToken,
) -> Result<mpsc::Receiver<Probe>> {
    let socket = open_send_socket(config.family, src_addr, ttl, config.tos)?;

    // rendezvous-style channel: pacing starts once the probe is accepted
    let (tx, rx) = mpsc::channel(1);

    let span = config.max_src_ports;
    let total = config.max_src_ports as u64 * config.num_iters as u64;
    let base = config.base_src_port;
    let target_port = config.target_port;
    let interval = probe_interval(config.probe_rate);

    tokio::spawn(async move {
        debug!(ttl, "sender starting");
        run_send_loop(
            socket, src_addr, target, target_port, ttl, base, span, total, interval, tx, stop,
        )
        .await;
    });

    Ok(rx)
}

#[allow(clippy::too_many_arguments)]
async fn run_send_loop(
    socket: Socket,
    src_addr: IpAddr,
    target: IpAddr,
    target_port: u16,
    ttl: u8,
    base_src_port: u16,
    max_src_ports: u16,
    total_probes: u64,
    interval: Duration,
    tx: mpsc::Sender<Probe>,
    stop: CancellationToken,
) {
    for i in 0..total_probes {
        let src_port = sweep_port(base_src_port, max_src_ports, i);
        let seq_num = stamp::encode(ttl, stamp::now_ms());
        let packet = build_syn(src_addr, target, src_port, target_port, seq_num);

        if let Err(e) = send_probe(&socket, &packet, target) {
            error!(ttl, error = %e, "error sending probe");
            return;
        }

        // next deadline is anchored before the publish so time spent blocked
        // on the channel counts toward the pacing interval
        let deadline = Instant::now() + jittered_delay(interval);

        tokio::select! {
            sent = tx.send(Probe { src_port, ttl }) => {
                if sent.is_err() {
                    debug!(ttl, "probe stream closed");
                    return;
                }
            }
            _ = stop.cancelled() => {
                debug!(ttl, "sender exiting prematurely");
                return;
            }
        }

        tokio::time::sleep_until(deadline).await;
    }
    debug!(ttl, "sender done");
}

fn sweep_port(base_src_port: u16, max_src_ports: u16, i: u64) -> u16 {
    base_src_port + (i % max_src_ports as u64) as u16
}

fn probe_interval(probe_rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / probe_rate as f64)
}

fn jittered_delay(interval: Duration) -> Duration {
    let spread = interval.as_secs_f64() * JITTER_FRACTION;
    let jitter = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((interval.as_secs_f64() + jitter).max(0.0))
}
