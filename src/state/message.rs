use std::net::IpAddr;

/// Name placeholder for hops that have not answered or resolved.
pub const UNKNOWN_HOP: &str = "?";

/// Identity of one outgoing SYN, as published by a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub src_port: u16,
    pub ttl: u8,
}

/// A TTL-exceeded message from an intermediate router, correlated back to
/// the probe via the stamp quoted in the embedded TCP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpResponse {
    pub probe: Probe,
    /// Router that generated the ICMP error.
    pub from_addr: IpAddr,
    /// Reverse-DNS name of `from_addr`; `"?"` until the resolver fills it.
    pub from_name: String,
    pub rtt_ms: u32,
}

/// A RST/ACK from the target itself; the path is complete at this TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpResponse {
    pub probe: Probe,
    pub rtt_ms: u32,
}

/// Tagged response record carried on the receiver/resolver streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Icmp(IcmpResponse),
    Tcp(TcpResponse),
}
