use std::fmt;
use std::net::IpAddr;

use anyhow::{bail, Error, Result};

use crate::cli::Args;

/// Address family the whole pipeline operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrFamily {
    #[default]
    Ip4,
    Ip6,
}

impl AddrFamily {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ip4" => Some(Self::Ip4),
            "ip6" => Some(Self::Ip6),
            _ => None,
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Ip4 => ip.is_ipv4(),
            Self::Ip6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip4 => write!(f, "ip4"),
            Self::Ip6 => write!(f, "ip6"),
        }
    }
}

/// Runtime configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub min_ttl: u8,
    pub max_ttl: u8,
    pub base_src_port: u16,
    pub max_src_ports: u16,
    /// Sweeps of the full port range each sender performs:
    /// `max_time * probe_rate / max_src_ports`.
    pub num_iters: u32,
    pub target_port: u16,
    pub probe_rate: u32,
    pub tos: u32,
    pub num_resolvers: usize,
    pub family: AddrFamily,
    pub max_columns: usize,
    pub show_all: bool,
    pub json_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_ttl: 1,
            max_ttl: 30,
            base_src_port: 32768,
            max_src_ports: 256,
            num_iters: 22,
            target_port: 22,
            probe_rate: 96,
            tos: 140,
            num_resolvers: 32,
            family: AddrFamily::Ip4,
            max_columns: 4,
            show_all: false,
            json_output: false,
        }
    }
}

impl TryFrom<&Args> for Config {
    type Error = Error;

    fn try_from(args: &Args) -> Result<Self> {
        let Some(family) = AddrFamily::parse(&args.addr_family) else {
            bail!("unknown address family: {}", args.addr_family);
        };

        let num_iters =
            (args.max_time * args.probe_rate as u64 / args.max_src_ports as u64) as u32;
        if num_iters <= 1 {
            bail!(
                "number of iterations too low, increase probe rate / run time \
                 or decrease the source port range"
            );
        }

        Ok(Self {
            min_ttl: args.min_ttl,
            max_ttl: args.max_ttl,
            base_src_port: args.base_src_port,
            max_src_ports: args.max_src_ports,
            num_iters,
            target_port: args.target_port,
            probe_rate: args.probe_rate,
            tos: args.tos,
            num_resolvers: args.num_resolvers,
            family,
            max_columns: args.max_columns,
            show_all: args.show_all,
            json_output: args.json_output,
        })
    }
}
