//! Client IP resolution.
//!
//! Forwarding headers are only believed when the TCP peer is one of our own proxies;
//! otherwise anyone could pick the address they get banned under.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::cidr::IpRangeList;

/// Address used when no valid client IP can be determined
pub const UNKNOWN_CLIENT_IP: &str = "0.0.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpExtractionConfig {
    /// Headers consulted in order; the first one holding a valid address wins
    pub client_ip_headers: Vec<String>,
    /// Peers (exact IPs or CIDR ranges) whose forwarding headers are honored
    pub trusted_proxies: Vec<String>,
    /// When false, headers are honored from any peer. Only safe behind a proxy that
    /// always overwrites them.
    pub require_trusted_proxy: bool,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            client_ip_headers: ["X-Forwarded-For", "X-Real-IP", "CF-Connecting-IP"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            trusted_proxies: ["127.0.0.1", "::1", "10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            require_trusted_proxy: true,
        }
    }
}

/// Where a resolved address came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIp {
    Forwarded { ip: String, header: String },
    Peer { ip: String },
}

impl ClientIp {
    pub fn ip(&self) -> &str {
        match self {
            ClientIp::Forwarded { ip, .. } | ClientIp::Peer { ip } => ip,
        }
    }
}

/// Strategy for resolving the client IP of a request
pub trait ClientIpStrategy: Send + Sync {
    /// Always returns a parseable address; `0.0.0.0` when nothing valid is found
    fn client_ip(&self, peer_ip: &str, headers: &[(String, String)]) -> String;
}

/// Honors forwarding headers when the peer is a trusted proxy
pub struct ProxyHeaderStrategy {
    config: IpExtractionConfig,
    trusted_proxies: IpRangeList,
}

impl ProxyHeaderStrategy {
    pub fn new(config: IpExtractionConfig) -> Self {
        let trusted_proxies = IpRangeList::from_entries(&config.trusted_proxies);
        Self {
            config,
            trusted_proxies,
        }
    }
}

impl ClientIpStrategy for ProxyHeaderStrategy {
    fn client_ip(&self, peer_ip: &str, headers: &[(String, String)]) -> String {
        let resolved = resolve_client_ip(&self.config, &self.trusted_proxies, peer_ip, headers);
        normalize_ip(resolved.ip())
    }
}

/// Uses the TCP peer address and ignores headers entirely
pub struct DirectConnectionStrategy;

impl ClientIpStrategy for DirectConnectionStrategy {
    fn client_ip(&self, peer_ip: &str, _headers: &[(String, String)]) -> String {
        normalize_ip(peer_ip)
    }
}

pub fn resolve_client_ip(
    config: &IpExtractionConfig,
    trusted_proxies: &IpRangeList,
    peer_ip: &str,
    headers: &[(String, String)],
) -> ClientIp {
    let peer = || ClientIp::Peer {
        ip: peer_ip.to_string(),
    };

    if config.require_trusted_proxy && !trusted_proxies.contains(peer_ip) {
        debug!("Peer {} is not a trusted proxy, ignoring forwarding headers", peer_ip);
        return peer();
    }

    let forwarded = config.client_ip_headers.iter().find_map(|name| {
        let value = find_header(headers, name)?;
        // `client, proxy1, proxy2`: the client is leftmost
        let candidate = value.split(',').next().unwrap_or("").trim();
        if parse_strict(candidate).is_some() {
            Some(ClientIp::Forwarded {
                ip: candidate.to_string(),
                header: name.clone(),
            })
        } else {
            warn!("Ignoring malformed address {:?} in {}", candidate, name);
            None
        }
    });

    forwarded.unwrap_or_else(peer)
}

/// Canonical form of a valid IP, or `0.0.0.0`
pub fn normalize_ip(ip: &str) -> String {
    parse_strict(ip).map_or_else(|| UNKNOWN_CLIENT_IP.to_string(), |addr| addr.to_string())
}

/// Case-insensitive header lookup
pub fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

/// Rejects anything carrying whitespace or control characters before parsing
fn parse_strict(ip: &str) -> Option<IpAddr> {
    if ip.is_empty() || ip.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return None;
    }
    ip.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(config: &IpExtractionConfig, peer_ip: &str, headers: &[(String, String)]) -> ClientIp {
        let trusted = IpRangeList::from_entries(&config.trusted_proxies);
        resolve_client_ip(config, &trusted, peer_ip, headers)
    }

    fn header(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn test_leftmost_forwarded_address() {
        let config = IpExtractionConfig::default();
        let headers = vec![header("X-Forwarded-For", "203.0.113.1, 198.51.100.2")];

        assert_eq!(
            resolve(&config, "127.0.0.1", &headers),
            ClientIp::Forwarded {
                ip: "203.0.113.1".to_string(),
                header: "X-Forwarded-For".to_string()
            }
        );
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let config = IpExtractionConfig {
            trusted_proxies: vec!["10.0.0.1".to_string()],
            ..Default::default()
        };
        let headers = vec![header("X-Forwarded-For", "203.0.113.1")];

        assert_eq!(
            resolve(&config, "1.2.3.4", &headers),
            ClientIp::Peer {
                ip: "1.2.3.4".to_string()
            }
        );
    }

    #[test]
    fn test_trust_check_can_be_disabled() {
        let config = IpExtractionConfig {
            trusted_proxies: Vec::new(),
            require_trusted_proxy: false,
            ..Default::default()
        };
        let headers = vec![header("CF-Connecting-IP", "203.0.113.8")];
        assert_eq!(resolve(&config, "1.2.3.4", &headers).ip(), "203.0.113.8");
    }

    #[test]
    fn test_trusted_proxy_range() {
        let config = IpExtractionConfig::default();
        let headers = vec![header("X-Real-IP", "203.0.113.5")];
        assert_eq!(resolve(&config, "10.20.30.40", &headers).ip(), "203.0.113.5");
    }

    #[test]
    fn test_configured_header_order_wins() {
        let config = IpExtractionConfig::default();
        let headers = vec![
            header("X-Real-IP", "203.0.113.2"),
            header("x-forwarded-for", "203.0.113.1"),
        ];
        assert_eq!(resolve(&config, "127.0.0.1", &headers).ip(), "203.0.113.1");
    }

    #[test]
    fn test_malformed_values_fall_back_to_peer() {
        let config = IpExtractionConfig::default();

        for bad in ["256.1.1.1", "192.168.1", "192.168.1.1:80", "not-an-ip", "", "192 .168.1.1"] {
            let headers = vec![header("X-Forwarded-For", bad)];
            assert_eq!(
                resolve(&config, "192.168.1.100", &headers).ip(),
                "192.168.1.100",
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_normalize_ip() {
        assert_eq!(normalize_ip("203.0.113.1"), "203.0.113.1");
        assert_eq!(normalize_ip("2001:0db8:0000:0000:0000:0000:0000:0001"), "2001:db8::1");
        assert_eq!(normalize_ip("garbage"), UNKNOWN_CLIENT_IP);
        assert_eq!(normalize_ip(""), UNKNOWN_CLIENT_IP);
        assert_eq!(normalize_ip("1.2.3.4\n"), UNKNOWN_CLIENT_IP);
    }

    #[test]
    fn test_strategies_always_return_valid_ip() {
        let proxy = ProxyHeaderStrategy::new(IpExtractionConfig::default());
        assert_eq!(proxy.client_ip("unix-socket", &[]), UNKNOWN_CLIENT_IP);
        assert_eq!(
            proxy.client_ip("127.0.0.1", &[header("X-Forwarded-For", "198.51.100.9")]),
            "198.51.100.9"
        );

        let direct = DirectConnectionStrategy;
        assert_eq!(
            direct.client_ip("192.0.2.4", &[header("X-Forwarded-For", "198.51.100.9")]),
            "192.0.2.4"
        );
        assert_eq!(direct.client_ip("???", &[]), UNKNOWN_CLIENT_IP);
    }
}
