use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::state::{ResponseEvent, UNKNOWN_HOP};

/// Reverse-DNS lookup with a per-run cache.
///
/// A sweep revisits the same handful of routers thousands of times; both
/// hits and misses are cached so each hop address is resolved once.
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<IpAddr, Option<String>>>,
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsLookup {
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// First PTR name for `ip` without the trailing dot, or `None` when the
    /// lookup fails or returns nothing.
    pub async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        if let Some(cached) = self.cache.read().get(&ip) {
            return cached.clone();
        }

        let hostname = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(_) => None,
        };

        self.cache.write().insert(ip, hostname.clone());
        hostname
    }
}

/// Spawn `num_resolvers` workers over one shared input stream.
///
/// Each worker names the router in ICMP records and passes everything else
/// through untouched. A single lookup can block for seconds, which is why
/// the pool is wide; ordering across workers is not preserved and the
/// correlator does not rely on it.
pub fn spawn_resolvers(
    num_resolvers: usize,
    input: mpsc::Receiver<ResponseEvent>,
) -> Vec<mpsc::Receiver<ResponseEvent>> {
    spawn_resolvers_with(Arc::new(DnsLookup::new()), num_resolvers, input)
}

pub fn spawn_resolvers_with(
    dns: Arc<DnsLookup>,
    num_resolvers: usize,
    input: mpsc::Receiver<ResponseEvent>,
) -> Vec<mpsc::Receiver<ResponseEvent>> {
    let input = Arc::new(Mutex::new(input));

    (0..num_resolvers)
        .map(|_| {
            let dns = dns.clone();
            let input = input.clone();
            let (tx, rx) = mpsc::channel(16);

            tokio::spawn(async move {
                loop {
                    let event = { input.lock().await.recv().await };
                    let Some(event) = event else { break };

                    let event = match event {
                        ResponseEvent::Icmp(mut resp) => {
                            resp.from_name = dns
                                .reverse_lookup(resp.from_addr)
                                .await
                                .unwrap_or_else(|| UNKNOWN_HOP.to_string());
                            ResponseEvent::Icmp(resp)
                        }
                        other => other,
                    };

                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });

            rx
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{IcmpResponse, Probe, TcpResponse};
    use crate::trace::merge;
    use std::net::Ipv4Addr;

    fn seeded_dns(ip: IpAddr, name: Option<&str>) -> Arc<DnsLookup> {
        let dns = DnsLookup::new();
        dns.cache.write().insert(ip, name.map(String::from));
        Arc::new(dns)
    }

    #[tokio::test]
    async fn test_cached_name_short_circuits() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dns = seeded_dns(ip, Some("r1.example.net"));
        assert_eq!(
            dns.reverse_lookup(ip).await,
            Some("r1.example.net".to_string())
        );
    }

    #[tokio::test]
    async fn test_cached_failure_short_circuits() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let dns = seeded_dns(ip, None);
        assert_eq!(dns.reverse_lookup(ip).await, None);
    }

    #[tokio::test]
    async fn test_pool_names_hops_and_passes_tcp_through() {
        let hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dns = seeded_dns(hop, Some("r1.example.net"));

        let (tx, input) = mpsc::channel(8);
        let mut output = merge(spawn_resolvers_with(dns, 4, input));

        let probe = Probe {
            src_port: 33000,
            ttl: 1,
        };
        tx.send(ResponseEvent::Icmp(IcmpResponse {
            probe,
            from_addr: hop,
            from_name: UNKNOWN_HOP.to_string(),
            rtt_ms: 3,
        }))
        .await
        .unwrap();
        tx.send(ResponseEvent::Tcp(TcpResponse { probe, rtt_ms: 9 }))
            .await
            .unwrap();
        drop(tx);

        let mut icmp_names = Vec::new();
        let mut tcp_count = 0;
        while let Some(event) = output.recv().await {
            match event {
                ResponseEvent::Icmp(resp) => icmp_names.push(resp.from_name),
                ResponseEvent::Tcp(resp) => {
                    assert_eq!(resp.rtt_ms, 9);
                    tcp_count += 1;
                }
            }
        }
        assert_eq!(icmp_names, vec!["r1.example.net".to_string()]);
        assert_eq!(tcp_count, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_hop_stays_unknown() {
        let hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
        let dns = seeded_dns(hop, None);

        let (tx, input) = mpsc::channel(8);
        let mut output = merge(spawn_resolvers_with(dns, 2, input));

        tx.send(ResponseEvent::Icmp(IcmpResponse {
            probe: Probe {
                src_port: 33001,
                ttl: 4,
            },
            from_addr: hop,
            from_name: UNKNOWN_HOP.to_string(),
            rtt_ms: 12,
        }))
        .await
        .unwrap();
        drop(tx);

        match output.recv().await {
            Some(ResponseEvent::Icmp(resp)) => assert_eq!(resp.from_name, UNKNOWN_HOP),
            other => panic!("expected icmp response, got {:?}", other),
        }
        assert!(output.recv().await.is_none());
    }
}
