//! Correlator and lossy-path classifier
//!
//! The correlator is the only owner of the counter maps. Senders feed it
//! probe records, the resolver pool feeds it response records; it tallies
//! sent against received per (source port, TTL) cell, watches for paths
//! that change mid-run, winds down senders once the target starts
//! answering, and classifies each per-port hit-rate vector at the end.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::state::{IcmpResponse, Probe, Report, ResponseEvent, TcpResponse, UNKNOWN_HOP};

/// How long receivers keep draining after the last sender exits.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything a run produced, ready for rendering.
#[derive(Debug)]
pub struct TraceSummary {
    /// Full counters for every port in the sweep, truncated at the target.
    pub counters: Report,
    /// The ports selected for the report: lossy ones, or all non-flapped
    /// ones under `show_all`.
    pub lossy: Report,
    /// Ports whose path changed during the measurement.
    pub flapped: BTreeSet<u16>,
    /// Smallest TTL at which the target answered.
    pub last_closed: u8,
}

pub struct Correlator {
    target_name: String,
    base_src_port: u16,
    max_src_ports: u16,
    max_ttl: u8,
    show_all: bool,
    drain_grace: Duration,
    /// Stop token for the sender at TTL `index + 1`.
    sender_stops: Vec<CancellationToken>,
    recv_stop: CancellationToken,
    counters: Report,
    flapped: BTreeSet<u16>,
    last_closed: u8,
}

impl Correlator {
    pub fn new(
        config: &Config,
        target_name: impl Into<String>,
        sender_stops: Vec<CancellationToken>,
        recv_stop: CancellationToken,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            base_src_port: config.base_src_port,
            max_src_ports: config.max_src_ports,
            max_ttl: config.max_ttl,
            show_all: config.show_all,
            drain_grace: DRAIN_GRACE,
            sender_stops,
            recv_stop,
            counters: Report::for_port_range(
                config.base_src_port,
                config.max_src_ports,
                config.max_ttl,
            ),
            flapped: BTreeSet::new(),
            last_closed: config.max_ttl,
        }
    }

    /// Override the drain grace; scenario tests shorten it.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Consume both merged streams until the response stream closes, then
    /// truncate and classify.
    pub async fn run(
        mut self,
        mut probes: mpsc::Receiver<Probe>,
        mut responses: mpsc::Receiver<ResponseEvent>,
    ) -> TraceSummary {
        let mut probes_open = true;

        loop {
            tokio::select! {
                probe = probes.recv(), if probes_open => {
                    match probe {
                        Some(probe) => self.record_sent(probe),
                        None => {
                            probes_open = false;
                            debug!("all senders finished");
                            let recv_stop = self.recv_stop.clone();
                            let grace = self.drain_grace;
                            tokio::spawn(async move {
                                // let in-flight responses land before
                                // stopping the receivers
                                tokio::time::sleep(grace).await;
                                recv_stop.cancel();
                            });
                        }
                    }
                }
                response = responses.recv() => {
                    match response {
                        Some(ResponseEvent::Icmp(resp)) => self.record_icmp(resp),
                        Some(ResponseEvent::Tcp(resp)) => self.record_tcp(resp),
                        None => break,
                    }
                }
            }
        }

        // the response stream only closes after the receivers exit, so any
        // probes still queued are from senders that finished long ago
        if probes_open {
            while let Some(probe) = probes.recv().await {
                self.record_sent(probe);
            }
        }

        self.finish()
    }

    /// Raw sockets observe unrelated traffic too; only events addressed to
    /// cells of the sweep may touch the counters.
    fn in_sweep(&self, probe: &Probe) -> bool {
        let port_end = self.base_src_port as u32 + self.max_src_ports as u32;
        (self.base_src_port as u32..port_end).contains(&(probe.src_port as u32))
            && probe.ttl >= 1
            && probe.ttl <= self.max_ttl
    }

    fn record_sent(&mut self, probe: Probe) {
        if !self.in_sweep(&probe) {
            return;
        }
        if let Some(row) = self.counters.sent.get_mut(&probe.src_port) {
            row[probe.ttl as usize - 1] += 1;
        }
    }

    fn record_icmp(&mut self, resp: IcmpResponse) {
        if !self.in_sweep(&resp.probe) {
            return;
        }
        let Probe { src_port, ttl } = resp.probe;
        let idx = ttl as usize - 1;

        if let Some(row) = self.counters.rcvd.get_mut(&src_port) {
            row[idx] += 1;
        }
        if let Some(hops) = self.counters.paths.get_mut(&src_port) {
            let prev = &hops[idx];
            if prev != UNKNOWN_HOP && *prev != resp.from_name {
                debug!(
                    port = src_port,
                    ttl,
                    from = %prev,
                    to = %resp.from_name,
                    "source port flapped"
                );
                self.flapped.insert(src_port);
            }
            hops[idx] = resp.from_name;
        }
    }

    fn record_tcp(&mut self, resp: TcpResponse) {
        if !self.in_sweep(&resp.probe) {
            return;
        }
        let Probe { src_port, ttl } = resp.probe;

        // Senders probing beyond the TTL where the target already answers
        // only produce noise; stop each of them exactly once. The watermark
        // makes later responses at equal or higher TTLs a no-op.
        for t in ttl..self.last_closed {
            self.sender_stops[t as usize].cancel();
        }
        if ttl < self.last_closed {
            self.last_closed = ttl;
        }

        let idx = ttl as usize - 1;
        if let Some(row) = self.counters.rcvd.get_mut(&src_port) {
            row[idx] += 1;
        }
        if let Some(hops) = self.counters.paths.get_mut(&src_port) {
            hops[idx] = self.target_name.clone();
        }
    }

    fn finish(mut self) -> TraceSummary {
        self.counters.truncate_at_target(&self.target_name);

        if !self.flapped.is_empty() {
            info!(
                "{} of {} ports changed their paths while tracing",
                self.flapped.len(),
                self.max_src_ports
            );
        }

        let lossy = self.classify();
        TraceSummary {
            counters: self.counters,
            lossy,
            flapped: self.flapped,
            last_closed: self.last_closed,
        }
    }

    fn classify(&self) -> Report {
        let mut lossy = Report::new();

        for (port, sent) in &self.counters.sent {
            if self.flapped.contains(port) {
                continue;
            }
            let Some(rcvd) = self.counters.rcvd.get(port) else {
                continue;
            };
            if rcvd.iter().all(|&r| r == 0) {
                debug!(port = *port, "no responses received for port");
                continue;
            }

            let rates = match hit_rates(sent, rcvd) {
                Ok(rates) => rates,
                Err(e) => {
                    warn!(port = *port, error = %e, "could not normalize counters");
                    continue;
                }
            };

            if is_lossy(&rates) || self.show_all {
                lossy.sent.insert(*port, sent.clone());
                lossy.rcvd.insert(*port, rcvd.clone());
                if let Some(hops) = self.counters.paths.get(port) {
                    lossy.paths.insert(*port, hops.clone());
                }
            }
        }

        lossy
    }
}

/// Normalize received by sent counts into per-TTL hit rates.
pub fn hit_rates(sent: &[u32], rcvd: &[u32]) -> Result<Vec<f64>> {
    if sent.len() != rcvd.len() {
        bail!("length mismatch for sent/rcvd");
    }
    Ok(sent
        .iter()
        .zip(rcvd)
        .map(|(&s, &r)| r as f64 / s as f64)
        .collect())
}

/// Detect a monotone decline: hit rates never recover downstream, and some
/// hop strictly dominates everything after it with more than two hops left.
/// Short anomalies at the very end of the path are edge noise, not loss.
pub fn is_lossy(hit_rates: &[f64]) -> bool {
    if hit_rates.windows(2).any(|w| w[1] > w[0]) {
        return false;
    }
    hit_rates.iter().enumerate().any(|(i, &rate)| {
        hit_rates.len() - i > 2 && hit_rates[i + 1..].iter().all(|&later| later < rate)
    })
}
