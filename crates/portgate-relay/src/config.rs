//! Relay server configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Port ranges handed out to tunnels when none are configured.
///
/// Deliberately disjoint so operators can carve firewall rules per block.
pub fn default_port_ranges() -> Vec<RangeInclusive<u16>> {
    vec![
        20000..=25000,
        30000..=35000,
        40000..=45000,
        50000..=55000,
        60000..=65000,
    ]
}

/// Configuration for [`RelayServer`](crate::RelayServer).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address both the control listener and public listeners bind to
    pub bind_addr: IpAddr,
    /// Port the control listener accepts agent connections on
    pub control_port: u16,
    /// Hostname advertised to agents in public URLs
    pub public_host: String,
    /// Allowed public port ranges (inclusive)
    pub port_ranges: Vec<RangeInclusive<u16>>,
    /// How long to wait for an agent response to a relayed HTTP request
    pub request_deadline: Duration,
    /// How long to wait for the agent to acknowledge a new TCP connection
    pub ready_deadline: Duration,
    /// How long a fresh control connection has to send its registration
    pub handshake_deadline: Duration,
    /// Interval between per-session metrics flushes
    pub metrics_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: 7000,
            public_host: "127.0.0.1".to_string(),
            port_ranges: default_port_ranges(),
            request_deadline: Duration::from_secs(30),
            ready_deadline: Duration::from_secs(10),
            handshake_deadline: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Socket address of the control listener.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.control_port)
    }

    /// Parse a comma-separated range list like `"20000-25000,30000-35000"`.
    ///
    /// Used by the CLI; single ports (`"9000"`) are accepted as one-port
    /// ranges.
    pub fn parse_port_ranges(input: &str) -> Result<Vec<RangeInclusive<u16>>, String> {
        let mut ranges = Vec::new();
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let range = match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u16 = lo
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid port in range '{}'", part))?;
                    let hi: u16 = hi
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid port in range '{}'", part))?;
                    if lo > hi {
                        return Err(format!("range '{}' is reversed", part));
                    }
                    lo..=hi
                }
                None => {
                    let port: u16 = part
                        .parse()
                        .map_err(|_| format!("invalid port '{}'", part))?;
                    port..=port
                }
            };
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err("no port ranges given".to_string());
        }
        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.control_port, 7000);
        assert_eq!(config.port_ranges.len(), 5);
        assert_eq!(config.control_addr().port(), 7000);
        assert_eq!(config.request_deadline, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_port_ranges() {
        let ranges = RelayConfig::parse_port_ranges("20000-25000,30000-35000").unwrap();
        assert_eq!(ranges, vec![20000..=25000, 30000..=35000]);
    }

    #[test]
    fn test_parse_single_port() {
        let ranges = RelayConfig::parse_port_ranges("9000").unwrap();
        assert_eq!(ranges, vec![9000..=9000]);
    }

    #[test]
    fn test_parse_with_whitespace() {
        let ranges = RelayConfig::parse_port_ranges(" 20000-25000 , 40000-45000 ").unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn test_parse_rejects_reversed_range() {
        assert!(RelayConfig::parse_port_ranges("25000-20000").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RelayConfig::parse_port_ranges("abc").is_err());
        assert!(RelayConfig::parse_port_ranges("20000-xyz").is_err());
        assert!(RelayConfig::parse_port_ranges("").is_err());
    }
}
