use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;

/// DNS speaks port 53 unless told otherwise.
pub const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Parser, Debug)]
#[command(author, version, about = "Blocking DNS forwarder", long_about = None)]
pub struct Args {
    /// Upstream resolver, IPv4 with optional :port (defaults to :53).
    #[arg(long = "upstream", env = "UPSTREAM_DNS_SERVER_ADDR")]
    pub upstream: String,

    /// Local bind address, IPv4 with optional :port (defaults to :53).
    #[arg(long = "listen", env = "DNS_LISTEN_ADDR")]
    pub listen: String,

    /// Runtime mode; controls only logging verbosity.
    #[arg(long = "mode", env = "ENV_MODE", value_enum, default_value_t = EnvMode::Prod)]
    pub mode: EnvMode,

    /// Exact-match domain blocklist, one FQDN per line.
    #[arg(long = "blocklist-file", env = "BLOCKLIST_FILE")]
    pub blocklist_file: Option<PathBuf>,

    /// AdBlock-Plus rule files. Repeatable; the env form is comma-separated.
    #[arg(long = "rule-file", env = "RULE_FILES", value_delimiter = ',')]
    pub rule_files: Vec<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    Dev,
    Prod,
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvMode::Dev => f.write_str("dev"),
            EnvMode::Prod => f.write_str("prod"),
        }
    }
}

/// Validated runtime configuration. Everything network-facing is pinned to
/// IPv4 here so the rest of the crate never sees an IPv6 endpoint.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: SocketAddrV4,
    pub listen: SocketAddrV4,
    pub mode: EnvMode,
    pub blocklist_file: Option<PathBuf>,
    pub rule_files: Vec<PathBuf>,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.upstream.trim().is_empty() {
            return Err(ConfigError::MissingOption("UPSTREAM_DNS_SERVER_ADDR"));
        }
        if args.listen.trim().is_empty() {
            return Err(ConfigError::MissingOption("DNS_LISTEN_ADDR"));
        }

        Ok(Self {
            upstream: parse_ipv4_endpoint(&args.upstream)?,
            listen: parse_ipv4_endpoint(&args.listen)?,
            mode: args.mode,
            blocklist_file: args.blocklist_file,
            rule_files: args.rule_files,
        })
    }
}

/// Parses `1.1.1.1` or `1.1.1.1:5353` into an IPv4 socket address, filling
/// in port 53 when omitted. IPv6 input is rejected outright.
pub fn parse_ipv4_endpoint(input: &str) -> Result<SocketAddrV4, ConfigError> {
    let input = input.trim();

    if let Ok(addr) = SocketAddr::from_str(input) {
        return match addr {
            SocketAddr::V4(v4) => Ok(v4),
            SocketAddr::V6(v6) => Err(ConfigError::UpstreamNotIpv4(IpAddr::V6(*v6.ip()))),
        };
    }

    match IpAddr::from_str(input) {
        Ok(IpAddr::V4(ip)) => Ok(SocketAddrV4::new(ip, DEFAULT_DNS_PORT)),
        Ok(IpAddr::V6(ip)) => Err(ConfigError::UpstreamNotIpv4(IpAddr::V6(ip))),
        Err(err) => Err(ConfigError::InvalidAddr {
            addr: input.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn endpoint_with_port_is_taken_verbatim() {
        let addr = parse_ipv4_endpoint("9.9.9.9:5353").expect("parse");
        assert_eq!(addr, "9.9.9.9:5353".parse::<SocketAddrV4>().unwrap());
    }

    #[test]
    fn endpoint_without_port_defaults_to_53() {
        let addr = parse_ipv4_endpoint("1.1.1.1").expect("parse");
        assert_eq!(addr.port(), 53);
        assert_eq!(*addr.ip(), Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn ipv6_endpoint_is_rejected() {
        assert!(matches!(
            parse_ipv4_endpoint("::1"),
            Err(ConfigError::UpstreamNotIpv4(_))
        ));
        assert!(matches!(
            parse_ipv4_endpoint("[2606:4700::1111]:53"),
            Err(ConfigError::UpstreamNotIpv4(_))
        ));
    }

    #[test]
    fn garbage_endpoint_is_rejected() {
        assert!(matches!(
            parse_ipv4_endpoint("not-an-address"),
            Err(ConfigError::InvalidAddr { .. })
        ));
    }

    #[test]
    fn empty_required_options_are_reported_by_name() {
        let args = Args {
            upstream: String::new(),
            listen: "0.0.0.0:53".into(),
            mode: EnvMode::Prod,
            blocklist_file: None,
            rule_files: Vec::new(),
        };
        match Config::from_args(args) {
            Err(ConfigError::MissingOption(name)) => {
                assert_eq!(name, "UPSTREAM_DNS_SERVER_ADDR")
            }
            other => panic!("expected missing option, got {other:?}"),
        }
    }
}
