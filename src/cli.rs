use clap::Parser;

/// Diagnose per-flow packet loss across ECMP paths by sweeping source ports
/// with ranged-TTL TCP SYN probes
#[derive(Parser, Debug, Clone)]
#[command(name = "ecmptrace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target host to trace toward (IP address or hostname)
    #[arg(required = true)]
    pub target: String,

    /// Maximum TTL to probe
    #[arg(long = "max-ttl", default_value = "30")]
    pub max_ttl: u8,

    /// TTL to start at
    #[arg(long = "min-ttl", default_value = "1")]
    pub min_ttl: u8,

    /// Number of source ports to sweep per TTL
    #[arg(long = "max-src-ports", default_value = "256")]
    pub max_src_ports: u16,

    /// Intended run time in seconds
    #[arg(long = "max-time", default_value = "60")]
    pub max_time: u64,

    /// Destination TCP port to probe
    #[arg(long = "target-port", default_value = "22")]
    pub target_port: u16,

    /// Probes per second per TTL
    #[arg(long = "probe-rate", default_value = "96")]
    pub probe_rate: u32,

    /// IP TOS / IPv6 traffic class on outgoing probes
    #[arg(long = "tos", default_value = "140")]
    pub tos: u32,

    /// Number of reverse-DNS workers
    #[arg(long = "num-resolvers", default_value = "32")]
    pub num_resolvers: usize,

    /// Address family to probe in (ip4, ip6)
    #[arg(long = "addr-family", default_value = "ip4")]
    pub addr_family: String,

    /// Maximum number of port columns per report table
    #[arg(long = "max-columns", default_value = "4")]
    pub max_columns: usize,

    /// Show all paths, regardless of loss detection
    #[arg(long = "show-all")]
    pub show_all: bool,

    /// Source address for probes (default: auto-discover)
    #[arg(long = "src-addr")]
    pub src_addr: Option<String>,

    /// Output raw JSON data instead of tables
    #[arg(long = "json")]
    pub json_output: bool,

    /// First source port of the sweep
    #[arg(long = "base-src-port", default_value = "32768")]
    pub base_src_port: u16,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if !["ip4", "ip6"].contains(&self.addr_family.as_str()) {
            return Err(format!(
                "Unknown address family: {}. Use ip4 or ip6",
                self.addr_family
            ));
        }

        if self.min_ttl == 0 {
            return Err("Min TTL must be at least 1".into());
        }
        if self.max_ttl < self.min_ttl {
            return Err("Max TTL must not be below min TTL".into());
        }

        if self.max_src_ports == 0 {
            return Err("Source port span must be at least 1".into());
        }
        if self.base_src_port as u32 + self.max_src_ports as u32 > 65536 {
            return Err(format!(
                "Source port sweep {}..{} exceeds the port space",
                self.base_src_port,
                self.base_src_port as u32 + self.max_src_ports as u32
            ));
        }

        if self.probe_rate == 0 {
            return Err("Probe rate must be positive".into());
        }
        if self.num_resolvers == 0 {
            return Err("Resolver count must be at least 1".into());
        }
        if self.max_columns == 0 {
            return Err("Max columns must be at least 1".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["ecmptrace"];
        argv.extend_from_slice(extra);
        argv.push("example.com");
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_contract() {
        let args = parse(&[]);
        assert_eq!(args.max_ttl, 30);
        assert_eq!(args.min_ttl, 1);
        assert_eq!(args.max_src_ports, 256);
        assert_eq!(args.max_time, 60);
        assert_eq!(args.target_port, 22);
        assert_eq!(args.probe_rate, 96);
        assert_eq!(args.tos, 140);
        assert_eq!(args.num_resolvers, 32);
        assert_eq!(args.addr_family, "ip4");
        assert_eq!(args.max_columns, 4);
        assert!(!args.show_all);
        assert_eq!(args.src_addr, None);
        assert!(!args.json_output);
        assert_eq!(args.base_src_port, 32768);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_missing_target_rejected() {
        assert!(Args::try_parse_from(["ecmptrace"]).is_err());
    }

    #[test]
    fn test_bad_family_rejected() {
        let args = parse(&["--addr-family", "ip5"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_ttl_bounds() {
        assert!(parse(&["--min-ttl", "0"]).validate().is_err());
        assert!(parse(&["--min-ttl", "10", "--max-ttl", "5"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_port_span_overflow_rejected() {
        let args = parse(&["--base-src-port", "65000", "--max-src-ports", "1000"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(parse(&["--probe-rate", "0"]).validate().is_err());
    }
}
