//! Admission screening
//!
//! Every public connection and every registration attempt passes an
//! admission gate before the relay does any work for it. Gates see only
//! the source address. HTTP listeners turn a deny into 429 or 403; TCP
//! listeners and the control handshake drop or refuse the connection.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Too many recent connections from this source
    RateLimited,
    /// Source matched a blocklist entry
    Blocked(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RateLimited => write!(f, "rate limited"),
            DenyReason::Blocked(entry) => write!(f, "blocked by {}", entry),
        }
    }
}

#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn check(&self, source: IpAddr) -> Admission;
}

/// Gate that admits everyone. The default when no screening is configured.
pub struct AllowAll;

#[async_trait]
impl AdmissionGate for AllowAll {
    async fn check(&self, _source: IpAddr) -> Admission {
        Admission::Allow
    }
}

/// Per-source sliding window rate limiter.
///
/// Keeps the admission timestamps of the last `window` per source and
/// denies once `limit` is reached. An admitted check counts immediately.
/// Sources whose window has fully drained are swept out periodically so
/// the table does not grow with every IP ever seen.
pub struct SlidingWindowGate {
    limit: usize,
    window: Duration,
    hits: DashMap<IpAddr, Vec<Instant>>,
    checks: AtomicUsize,
}

const SWEEP_EVERY: usize = 1024;

impl SlidingWindowGate {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: DashMap::new(),
            checks: AtomicUsize::new(0),
        }
    }

    /// Number of sources currently tracked.
    pub fn source_count(&self) -> usize {
        self.hits.len()
    }

    fn sweep(&self, now: Instant) {
        self.hits.retain(|_, stamps| {
            stamps.retain(|t| now.duration_since(*t) < self.window);
            !stamps.is_empty()
        });
    }
}

#[async_trait]
impl AdmissionGate for SlidingWindowGate {
    async fn check(&self, source: IpAddr) -> Admission {
        let now = Instant::now();
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }
        let mut entry = self.hits.entry(source).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.limit {
            return Admission::Deny(DenyReason::RateLimited);
        }
        entry.push(now);
        Admission::Allow
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidrError {
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
}

/// An IP network in CIDR form. A bare address is a /32 or /128.
#[derive(Debug, Clone, PartialEq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
    source: String,
}

impl IpNetwork {
    fn parse(s: &str) -> Result<Self, CidrError> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str)
                .map_err(|_| CidrError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = prefix_str
                .parse::<u8>()
                .map_err(|_| CidrError::InvalidCidr(s.to_string()))?;

            let max_prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix_len > max_prefix {
                return Err(CidrError::InvalidCidr(s.to_string()));
            }

            Ok(Self {
                addr,
                prefix_len,
                source: s.to_string(),
            })
        } else {
            let addr =
                IpAddr::from_str(s).map_err(|_| CidrError::InvalidIpAddress(s.to_string()))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Ok(Self {
                addr,
                prefix_len,
                source: s.to_string(),
            })
        }
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net_ip), IpAddr::V4(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u32::from(net_ip);
                let test_bits = u32::from(*test_ip);
                let mask = !0u32 << (32 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            (IpAddr::V6(net_ip), IpAddr::V6(test_ip)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let net_bits = u128::from(net_ip);
                let test_bits = u128::from(*test_ip);
                let mask = !0u128 << (128 - self.prefix_len);
                (net_bits & mask) == (test_bits & mask)
            }
            // IPv4 and IPv6 never match each other
            _ => false,
        }
    }
}

/// Denies sources matching any configured CIDR entry.
#[derive(Debug)]
pub struct CidrBlocklistGate {
    networks: Vec<IpNetwork>,
}

impl CidrBlocklistGate {
    pub fn new<I, S>(entries: I) -> Result<Self, CidrError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut networks = Vec::new();
        for entry in entries {
            networks.push(IpNetwork::parse(entry.as_ref())?);
        }
        Ok(Self { networks })
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[async_trait]
impl AdmissionGate for CidrBlocklistGate {
    async fn check(&self, source: IpAddr) -> Admission {
        for network in &self.networks {
            if network.contains(&source) {
                return Admission::Deny(DenyReason::Blocked(network.source.clone()));
            }
        }
        Admission::Allow
    }
}

/// Runs gates in order; the first deny wins.
pub struct AdmissionChain {
    gates: Vec<Arc<dyn AdmissionGate>>,
}

impl AdmissionChain {
    pub fn new(gates: Vec<Arc<dyn AdmissionGate>>) -> Self {
        Self { gates }
    }
}

#[async_trait]
impl AdmissionGate for AdmissionChain {
    async fn check(&self, source: IpAddr) -> Admission {
        for gate in &self.gates {
            if let Admission::Deny(reason) = gate.check(source).await {
                return Admission::Deny(reason);
            }
        }
        Admission::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert_eq!(AllowAll.check(ip(1)).await, Admission::Allow);
    }

    #[tokio::test]
    async fn test_sliding_window_denies_over_limit() {
        let gate = SlidingWindowGate::new(2, Duration::from_secs(60));

        assert_eq!(gate.check(ip(1)).await, Admission::Allow);
        assert_eq!(gate.check(ip(1)).await, Admission::Allow);
        assert_eq!(
            gate.check(ip(1)).await,
            Admission::Deny(DenyReason::RateLimited)
        );
        // A different source has its own window.
        assert_eq!(gate.check(ip(2)).await, Admission::Allow);
    }

    #[tokio::test]
    async fn test_sliding_window_recovers() {
        let gate = SlidingWindowGate::new(1, Duration::from_millis(40));

        assert_eq!(gate.check(ip(1)).await, Admission::Allow);
        assert_eq!(
            gate.check(ip(1)).await,
            Admission::Deny(DenyReason::RateLimited)
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gate.check(ip(1)).await, Admission::Allow);
    }

    #[tokio::test]
    async fn test_sliding_window_sweeps_stale_sources() {
        let gate = SlidingWindowGate::new(8, Duration::from_millis(10));

        for last in 0..100u8 {
            let _ = gate.check(ip(last)).await;
        }
        assert_eq!(gate.source_count(), 100);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Enough traffic from one source to pass a sweep boundary; the
        // drained windows must be dropped, not kept forever.
        for _ in 0..SWEEP_EVERY {
            let _ = gate.check(ip(200)).await;
        }
        assert_eq!(gate.source_count(), 1);
    }

    #[tokio::test]
    async fn test_cidr_blocklist() {
        let gate = CidrBlocklistGate::new(["203.0.113.0/24", "198.51.100.7"]).unwrap();

        assert!(matches!(
            gate.check(ip(50)).await,
            Admission::Deny(DenyReason::Blocked(_))
        ));
        assert!(matches!(
            gate.check("198.51.100.7".parse().unwrap()).await,
            Admission::Deny(DenyReason::Blocked(_))
        ));
        assert_eq!(
            gate.check("198.51.100.8".parse().unwrap()).await,
            Admission::Allow
        );
    }

    #[tokio::test]
    async fn test_cidr_v6() {
        let gate = CidrBlocklistGate::new(["2001:db8::/32"]).unwrap();

        assert!(matches!(
            gate.check("2001:db8::1".parse().unwrap()).await,
            Admission::Deny(_)
        ));
        assert_eq!(gate.check("2001:db9::1".parse().unwrap()).await, Admission::Allow);
        // An IPv4 source never matches a v6 entry.
        assert_eq!(gate.check(ip(1)).await, Admission::Allow);
    }

    #[test]
    fn test_cidr_parse_errors() {
        assert!(matches!(
            CidrBlocklistGate::new(["not-an-ip"]).unwrap_err(),
            CidrError::InvalidIpAddress(_)
        ));
        assert!(matches!(
            CidrBlocklistGate::new(["10.0.0.0/33"]).unwrap_err(),
            CidrError::InvalidCidr(_)
        ));
        assert!(matches!(
            CidrBlocklistGate::new(["10.0.0.0/abc"]).unwrap_err(),
            CidrError::InvalidCidr(_)
        ));
    }

    #[tokio::test]
    async fn test_chain_first_deny_wins() {
        let block = Arc::new(CidrBlocklistGate::new(["203.0.113.0/24"]).unwrap());
        let window = Arc::new(SlidingWindowGate::new(100, Duration::from_secs(60)));
        let chain = AdmissionChain::new(vec![block, window]);

        assert!(matches!(
            chain.check(ip(1)).await,
            Admission::Deny(DenyReason::Blocked(_))
        ));
        assert_eq!(chain.check("198.51.100.1".parse().unwrap()).await, Admission::Allow);
    }

    #[tokio::test]
    async fn test_empty_chain_allows() {
        let chain = AdmissionChain::new(Vec::new());
        assert_eq!(chain.check(ip(1)).await, Admission::Allow);
    }
}
