// Category membership is matched through a pluggable matcher rather than by
// direct value comparison: the category data feed maintains precomputed
// domain and address sets per category, and the matcher answers membership
// questions against a snapshot of those sets.

use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Pluggable category membership test, injected wherever category-typed
/// rules or exception attributes are matched. Implementations must be total.
pub trait CategoryMatcher: Send + Sync {
    /// Whether `domain` belongs to `category` (suffix matching included).
    fn domain_in_category(&self, category: &str, domain: &str) -> bool;

    /// Whether `ip` belongs to `category`.
    fn ip_in_category(&self, category: &str, ip: &str) -> bool;

    /// Convenience: either the destination name or address is in the category.
    fn matches(&self, category: &str, name: Option<&str>, ip: Option<&str>) -> bool {
        name.map(|n| self.domain_in_category(category, n))
            .unwrap_or(false)
            || ip.map(|i| self.ip_in_category(category, i)).unwrap_or(false)
    }
}

/// Snapshot-backed matcher over precomputed category sets.
#[derive(Debug, Default)]
pub struct SetCategoryMatcher {
    domains: std::collections::HashMap<String, HashSet<String>>,
    networks: std::collections::HashMap<String, Vec<Ipv4Network>>,
}

impl SetCategoryMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a category's domain set. Entries may be bare domains
    /// (matched as themselves or any subdomain).
    pub fn load_domains(&mut self, category: &str, domains: impl IntoIterator<Item = String>) {
        self.domains
            .entry(category.to_string())
            .or_default()
            .extend(domains.into_iter().map(|d| d.to_lowercase()));
    }

    /// Register a category's address set, accepting both plain IPs and CIDRs.
    pub fn load_addresses(&mut self, category: &str, addrs: impl IntoIterator<Item = String>) {
        let nets = self.networks.entry(category.to_string()).or_default();
        for a in addrs {
            let parsed = if a.contains('/') {
                a.parse::<Ipv4Network>().ok()
            } else {
                a.parse::<Ipv4Addr>()
                    .ok()
                    .and_then(|ip| Ipv4Network::new(ip, 32).ok())
            };
            if let Some(net) = parsed {
                nets.push(net);
            }
        }
    }
}

impl CategoryMatcher for SetCategoryMatcher {
    fn domain_in_category(&self, category: &str, domain: &str) -> bool {
        let Some(set) = self.domains.get(category) else {
            return false;
        };
        let domain = domain.to_lowercase();
        if set.contains(&domain) {
            return true;
        }
        // suffix walk: a.b.c matches entries b.c and c
        let mut rest = domain.as_str();
        while let Some(idx) = rest.find('.') {
            rest = &rest[idx + 1..];
            if set.contains(rest) {
                return true;
            }
        }
        false
    }

    fn ip_in_category(&self, category: &str, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            return false;
        };
        self.networks
            .get(category)
            .map(|nets| nets.iter().any(|n| n.contains(addr)))
            .unwrap_or(false)
    }
}

/// Matcher that knows no categories. Used where category data is absent.
#[derive(Debug, Default)]
pub struct NullCategoryMatcher;

impl CategoryMatcher for NullCategoryMatcher {
    fn domain_in_category(&self, _category: &str, _domain: &str) -> bool {
        false
    }

    fn ip_in_category(&self, _category: &str, _ip: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn games_matcher() -> SetCategoryMatcher {
        let mut m = SetCategoryMatcher::new();
        m.load_domains("games", vec!["battle.net".to_string(), "steam.com".to_string()]);
        m.load_addresses("games", vec!["5.42.0.0/16".to_string(), "9.9.9.9".to_string()]);
        m
    }

    #[test]
    fn test_domain_membership_with_subdomains() {
        let m = games_matcher();
        assert!(m.domain_in_category("games", "battle.net"));
        assert!(m.domain_in_category("games", "us.battle.net"));
        assert!(m.domain_in_category("games", "STEAM.com"));
        assert!(!m.domain_in_category("games", "example.com"));
        assert!(!m.domain_in_category("porn", "battle.net"));
    }

    #[test]
    fn test_ip_membership() {
        let m = games_matcher();
        assert!(m.ip_in_category("games", "5.42.17.3"));
        assert!(m.ip_in_category("games", "9.9.9.9"));
        assert!(!m.ip_in_category("games", "9.9.9.8"));
        assert!(!m.ip_in_category("games", "not-an-ip"));
    }
}
