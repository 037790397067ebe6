use std::collections::BTreeMap;

use serde::Serialize;

use crate::state::UNKNOWN_HOP;

/// Per-port counters accumulated over a run.
///
/// Three parallel maps keyed by source port; each value is a vector indexed
/// by TTL-1. `paths` holds hop names (`"?"` until a response names the hop),
/// `sent` and `rcvd` hold probe counters. The JSON field names are part of
/// the output format consumed by downstream tooling.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    #[serde(rename = "Paths")]
    pub paths: BTreeMap<u16, Vec<String>>,
    #[serde(rename = "Sent")]
    pub sent: BTreeMap<u16, Vec<u32>>,
    #[serde(rename = "Rcvd")]
    pub rcvd: BTreeMap<u16, Vec<u32>>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create rows for every port in the sweep, `max_ttl` entries each.
    pub fn for_port_range(base_src_port: u16, max_src_ports: u16, max_ttl: u8) -> Self {
        let mut report = Self::new();
        for port in base_src_port..base_src_port.saturating_add(max_src_ports) {
            report
                .paths
                .insert(port, vec![UNKNOWN_HOP.to_string(); max_ttl as usize]);
            report.sent.insert(port, vec![0; max_ttl as usize]);
            report.rcvd.insert(port, vec![0; max_ttl as usize]);
        }
        report
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Drop the trailing entries of every row past the first hop named
    /// `target`: once the target answers at some TTL, the entries beyond it
    /// are leftovers from senders that were still probing longer paths.
    pub fn truncate_at_target(&mut self, target: &str) {
        for (port, hops) in self.paths.iter_mut() {
            if let Some(at) = hops.iter().position(|name| name == target) {
                hops.truncate(at + 1);
                if let Some(sent) = self.sent.get_mut(port) {
                    sent.truncate(at + 1);
                }
                if let Some(rcvd) = self.rcvd.get_mut(port) {
                    rcvd.truncate(at + 1);
                }
            }
        }
    }
}
