use std::net::IpAddr;
use std::str::FromStr;

/// One whitelist entry: a single address or a network prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    Single(IpAddr),
    Network { addr: IpAddr, prefix_len: u8 },
}

impl IpRange {
    /// Parse `203.0.113.7`, `192.168.0.0/16` or `2001:db8::/32`
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();

        match entry.split_once('/') {
            Some((addr, prefix)) => {
                let addr = IpAddr::from_str(addr.trim()).ok()?;
                let prefix_len: u8 = prefix.trim().parse().ok()?;
                let max = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if prefix_len > max {
                    return None;
                }
                Some(IpRange::Network { addr, prefix_len })
            }
            None => IpAddr::from_str(entry).ok().map(IpRange::Single),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match *self {
            IpRange::Single(addr) => addr == *ip,
            IpRange::Network { addr, prefix_len } => match (addr, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = if prefix_len == 0 {
                        0
                    } else {
                        !0u32 << (32 - u32::from(prefix_len))
                    };
                    (u32::from(*ip) & mask) == (u32::from(net) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = if prefix_len == 0 {
                        0
                    } else {
                        !0u128 << (128 - u32::from(prefix_len))
                    };
                    (u128::from(*ip) & mask) == (u128::from(net) & mask)
                }
                _ => false,
            },
        }
    }
}

/// Check whether `ip` falls inside `cidr`. Unparseable input never matches.
pub fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    let Ok(ip) = IpAddr::from_str(ip.trim()) else {
        return false;
    };
    match IpRange::parse(cidr) {
        Some(range @ IpRange::Network { .. }) => range.contains(&ip),
        _ => false,
    }
}

/// Parsed list of addresses and ranges
#[derive(Debug, Clone, Default)]
pub struct IpRangeList {
    ranges: Vec<IpRange>,
}

impl IpRangeList {
    /// Parse a newline-separated list. Blank lines and `#` comments (whole-line or
    /// trailing) are skipped, as are entries that do not parse.
    pub fn parse_lines(text: &str) -> Self {
        let ranges = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let range = IpRange::parse(line);
                if range.is_none() {
                    tracing::warn!("Ignoring invalid IP whitelist entry: {}", line);
                }
                range
            })
            .collect();
        Self { ranges }
    }

    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        Self {
            ranges: entries
                .iter()
                .filter_map(|entry| IpRange::parse(entry.as_ref()))
                .collect(),
        }
    }

    pub fn contains(&self, ip: &str) -> bool {
        match IpAddr::from_str(ip.trim()) {
            Ok(ip) => self.ranges.iter().any(|range| range.contains(&ip)),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cidr_matching() {
        assert!(ip_in_cidr("192.168.1.5", "192.168.0.0/16"));
        assert!(!ip_in_cidr("192.168.1.5", "192.168.2.0/24"));
        assert!(ip_in_cidr("192.168.255.255", "192.168.0.0/16"));
        assert!(!ip_in_cidr("192.169.1.1", "192.168.0.0/16"));

        assert!(ip_in_cidr("10.0.0.1", "10.0.0.0/8"));
        assert!(!ip_in_cidr("11.0.0.1", "10.0.0.0/8"));
        assert!(ip_in_cidr("1.2.3.4", "0.0.0.0/0"));
    }

    #[test]
    fn test_ipv6_cidr_matching() {
        assert!(ip_in_cidr("2001:db8::1", "2001:db8::/32"));
        assert!(ip_in_cidr("2001:db8:ffff::1", "2001:db8::/32"));
        assert!(!ip_in_cidr("2001:db9::1", "2001:db8::/32"));
        assert!(ip_in_cidr("::1", "::1/128"));

        // Families never cross-match
        assert!(!ip_in_cidr("192.168.1.1", "::/0"));
        assert!(!ip_in_cidr("::1", "0.0.0.0/0"));
    }

    #[test]
    fn test_invalid_cidr_never_matches() {
        assert!(!ip_in_cidr("192.168.1.1", "192.168.0.0/33"));
        assert!(!ip_in_cidr("192.168.1.1", "192.168.0.0/abc"));
        assert!(!ip_in_cidr("not-an-ip", "192.168.0.0/16"));
        assert!(!ip_in_cidr("192.168.1.1", "192.168.1.1"));
    }

    #[test]
    fn test_parse_lines_skips_comments_and_blanks() {
        let list = IpRangeList::parse_lines(
            "# PayPal\n64.4.240.0/21\n\n54.187.174.169 # Stripe\n   \nnot-an-ip\n2001:db8::/32\n",
        );

        assert_eq!(list.len(), 3);
        assert!(list.contains("64.4.241.10"));
        assert!(list.contains("54.187.174.169"));
        assert!(!list.contains("54.187.174.170"));
        assert!(list.contains("2001:db8::42"));
    }

    #[test]
    fn test_exact_ip_entry() {
        let list = IpRangeList::from_entries(&["127.0.0.1", "::1"]);
        assert!(list.contains("127.0.0.1"));
        assert!(list.contains("::1"));
        assert!(!list.contains("127.0.0.2"));
    }

    proptest! {
        #[test]
        fn prop_address_inside_its_own_prefix(a: u32, prefix in 0u8..=32) {
            let ip = std::net::Ipv4Addr::from(a).to_string();
            let cidr = format!("{}/{}", ip, prefix);
            prop_assert!(ip_in_cidr(&ip, &cidr));
        }

        #[test]
        fn prop_network_match_is_prefix_equality(a: u32, b: u32, prefix in 1u8..=32) {
            let mask = !0u32 << (32 - u32::from(prefix));
            let ip = std::net::Ipv4Addr::from(a).to_string();
            let cidr = format!("{}/{}", std::net::Ipv4Addr::from(b), prefix);
            prop_assert_eq!(ip_in_cidr(&ip, &cidr), (a & mask) == (b & mask));
        }

        #[test]
        fn prop_ipv6_address_inside_its_own_prefix(a: u128, prefix in 0u8..=128) {
            let ip = std::net::Ipv6Addr::from(a).to_string();
            let cidr = format!("{}/{}", ip, prefix);
            prop_assert!(ip_in_cidr(&ip, &cidr));
        }
    }
}
