//! Live ACL and route resolution.
//!
//! Given a local identity and a remote target, pick the single best-matching
//! rule: candidates are filtered by constraint satisfiability, then local
//! membership, then remote target match, pre-sorted by rank ascending so the
//! first hit wins. Backend set contents are read through a snapshot cache
//! refreshed at most once per minute.

use ipnetwork::Ipv4Network;
use parking_lot::RwLock;
use policy_engine::{
    domain_covers, is_private_ipv4, port_range_covers, Action, CategoryMatcher, Direction,
    Policy, TargetType,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::PacketFilterBackend;
use crate::collaborators::VpnClientStatus;
use crate::policy_manager::PolicyManager;

const SNAPSHOT_REFRESH: Duration = Duration::from_secs(60);

// ============================================================================
// QUERY
// ============================================================================

/// One traffic decision request.
#[derive(Debug, Clone, Default)]
pub struct AclQuery {
    pub local_mac: Option<String>,
    pub local_guid: Option<String>,
    pub local_tags: Vec<String>,
    pub local_intf: Option<String>,
    pub local_port: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_domain: Option<String>,
    pub remote_port: Option<String>,
    pub protocol: Option<String>,
    pub direction: Direction,
}

impl AclQuery {
    pub fn outbound_to_ip(mac: &str, ip: &str) -> Self {
        AclQuery {
            local_mac: Some(mac.to_string()),
            remote_ip: Some(ip.to_string()),
            direction: Direction::Outbound,
            ..AclQuery::default()
        }
    }
}

// ============================================================================
// SET SNAPSHOT CACHE
// ============================================================================

struct SnapshotEntry {
    members: HashSet<String>,
    fetched_at: Instant,
}

/// Read-mostly view of backend set contents. Lookups race only against the
/// refresh, never against each other.
pub struct SetSnapshotCache {
    backend: Arc<dyn PacketFilterBackend>,
    entries: RwLock<HashMap<String, SnapshotEntry>>,
}

impl SetSnapshotCache {
    pub fn new(backend: Arc<dyn PacketFilterBackend>) -> Self {
        SetSnapshotCache {
            backend,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, set: &str, member: &str) -> bool {
        {
            let entries = self.entries.read();
            if let Some(e) = entries.get(set) {
                if e.fetched_at.elapsed() < SNAPSHOT_REFRESH {
                    return e.members.contains(member);
                }
            }
        }
        let members: HashSet<String> = self
            .backend
            .set_members(set)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        let hit = members.contains(member);
        self.entries.write().insert(
            set.to_string(),
            SnapshotEntry {
                members,
                fetched_at: Instant::now(),
            },
        );
        hit
    }
}

// ============================================================================
// DECISION ENGINE
// ============================================================================

pub struct DecisionEngine {
    policies: Arc<PolicyManager>,
    categories: Arc<dyn CategoryMatcher>,
    vpn: Arc<dyn VpnClientStatus>,
    snapshots: SetSnapshotCache,
}

impl DecisionEngine {
    pub fn new(
        policies: Arc<PolicyManager>,
        categories: Arc<dyn CategoryMatcher>,
        vpn: Arc<dyn VpnClientStatus>,
        backend: Arc<dyn PacketFilterBackend>,
    ) -> Self {
        DecisionEngine {
            policies,
            categories,
            vpn,
            snapshots: SetSnapshotCache::new(backend),
        }
    }

    /// Best block/allow rule for this traffic, rank-ascending first hit.
    pub async fn check_acl(&self, query: &AclQuery) -> Option<Policy> {
        let candidates = self.live_rules(|p| p.action != Action::Route);
        self.first_hit(&candidates, query).await
    }

    /// Best route rule for this traffic. VPN-backed routes whose client is
    /// not viable are filtered before ranking.
    pub async fn check_route(&self, query: &AclQuery) -> Option<Policy> {
        let mut candidates = Vec::new();
        for p in self.live_rules(|p| p.action == Action::Route) {
            if self.route_viable(&p).await {
                candidates.push(p);
            }
        }
        self.first_hit(&candidates, query).await
    }

    fn live_rules<F>(&self, keep: F) -> Vec<Policy>
    where
        F: Fn(&Policy) -> bool,
    {
        let now = policy_engine::now_ts();
        let mut rules: Vec<Policy> = self
            .policies
            .load_active_policies()
            .into_iter()
            .filter(|p| {
                !p.disabled
                    && !p.is_expired_at(now)
                    && !p.is_idle_at(now)
                    && p.in_schedule_at(now)
                    && keep(p)
            })
            .collect();
        rules.sort_by_key(|p| p.rank());
        rules
    }

    async fn first_hit(&self, rules: &[Policy], query: &AclQuery) -> Option<Policy> {
        for rule in rules {
            // sub-rules are only reachable through their group
            if rule.parent_rg_id.is_some() {
                continue;
            }
            if !constraints_ok(rule, query) || !local_matches(rule, query) {
                continue;
            }
            if rule.ptype == TargetType::MatchGroup {
                // indirect into the group's sub-rules, same checks
                for sub in rules
                    .iter()
                    .filter(|s| s.parent_rg_id.as_deref() == Some(rule.target.as_str()))
                {
                    if constraints_ok(sub, query) && self.remote_matches(sub, query).await {
                        return Some(sub.clone());
                    }
                }
                continue;
            }
            if self.remote_matches(rule, query).await {
                return Some(rule.clone());
            }
        }
        None
    }

    async fn remote_matches(&self, rule: &Policy, query: &AclQuery) -> bool {
        let ip = query.remote_ip.as_deref();
        let domain = query.remote_domain.as_deref().map(|d| d.to_lowercase());

        match rule.ptype {
            TargetType::Ip => {
                if ip == Some(rule.target.as_str()) {
                    return true;
                }
                // per-rule sets may hold additional addresses
                if let (Some(ip), Some(pid)) = (ip, &rule.pid) {
                    return self
                        .snapshots
                        .contains(&format!("rule_{}_set", pid.as_str()), ip)
                        .await;
                }
                false
            }
            TargetType::Net => {
                let Some(addr) = ip.and_then(|s| s.parse::<Ipv4Addr>().ok()) else {
                    return false;
                };
                rule.target
                    .parse::<Ipv4Network>()
                    .map(|net| net.contains(addr))
                    .unwrap_or(false)
            }
            TargetType::Domain | TargetType::Dns => {
                if let Some(d) = &domain {
                    if domain_matches_target(&rule.target, d) {
                        return true;
                    }
                }
                // domain rules also cover resolved addresses via their set
                if let (Some(ip), Some(pid)) = (ip, &rule.pid) {
                    return self
                        .snapshots
                        .contains(&format!("rule_{}_set", pid.as_str()), ip)
                        .await;
                }
                false
            }
            TargetType::Category | TargetType::Country => {
                if let Some(d) = &domain {
                    if self.categories.domain_in_category(&rule.target, d) {
                        return true;
                    }
                }
                if let Some(ip) = ip {
                    if self.categories.ip_in_category(&rule.target, ip) {
                        return true;
                    }
                    // aggregate set membership as maintained by the data feed
                    let set = match rule.action {
                        Action::Allow => format!("category_{}_allow", rule.target),
                        _ => format!("category_{}_block", rule.target),
                    };
                    return self.snapshots.contains(&set, ip).await;
                }
                false
            }
            TargetType::Internet | TargetType::Mac => match ip.and_then(|s| s.parse::<Ipv4Addr>().ok()) {
                Some(addr) => !is_private_ipv4(addr),
                None => domain.is_some(),
            },
            TargetType::Intranet => ip
                .and_then(|s| s.parse::<Ipv4Addr>().ok())
                .map(is_private_ipv4)
                .unwrap_or(false),
            TargetType::RemotePort => query
                .remote_port
                .as_deref()
                .map(|p| port_range_covers(&rule.target, p))
                .unwrap_or(false),
            // local-entity rules constrain all remote traffic for the entity
            TargetType::Tag | TargetType::Network | TargetType::Device | TargetType::DevicePort => {
                true
            }
            TargetType::MatchGroup => false,
        }
    }

    async fn route_viable(&self, rule: &Policy) -> bool {
        // route target is the VPN profile backing it
        let profile = rule.target.as_str();
        if !self.vpn.is_enabled(profile).await {
            return false;
        }
        if self.vpn.is_connected(profile).await {
            return true;
        }
        // disconnected: only a hard route with the kill switch stays viable
        let soft = rule.route_type.as_deref() == Some("soft");
        !soft && self.vpn.is_strict(profile).await
    }
}

// ============================================================================
// FILTERS
// ============================================================================

/// Direction, local-port, remote-port and protocol constraints must all be
/// satisfiable for this query.
fn constraints_ok(rule: &Policy, query: &AclQuery) -> bool {
    if !rule.direction.covers(query.direction) {
        return false;
    }
    if let Some(spec) = &rule.local_port {
        match &query.local_port {
            Some(p) => {
                if !port_range_covers(spec, p) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(spec) = &rule.remote_port {
        if rule.ptype != TargetType::RemotePort {
            match &query.remote_port {
                Some(p) => {
                    if !port_range_covers(spec, p) {
                        return false;
                    }
                }
                None => return false,
            }
        }
    }
    if let Some(proto) = &rule.protocol {
        match &query.protocol {
            Some(p) => {
                if !p.eq_ignore_ascii_case(proto) {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

/// Scope membership on the local side: mac/guid/tag/interface lists AND
/// local-entity target types.
fn local_matches(rule: &Policy, query: &AclQuery) -> bool {
    if !rule.scope.is_empty() {
        match &query.local_mac {
            Some(mac) => {
                if !rule.scope.iter().any(|m| m == mac) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if !rule.guids.is_empty() {
        match &query.local_guid {
            Some(g) => {
                if !rule.guids.iter().any(|x| x == g) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if !rule.tags.is_empty() {
        let hit = rule
            .tags
            .iter()
            .map(|t| t.strip_prefix("tag:").unwrap_or(t))
            .any(|t| query.local_tags.iter().any(|lt| lt == t));
        if !hit {
            return false;
        }
    }
    if !rule.intfs.is_empty() {
        let hit = rule
            .intfs
            .iter()
            .map(|i| i.strip_prefix("intf:").unwrap_or(i))
            .any(|i| query.local_intf.as_deref() == Some(i));
        if !hit {
            return false;
        }
    }

    match rule.ptype {
        TargetType::Mac => {
            rule.target == "*"
                || rule.target == "any"
                || query.local_mac.as_deref() == Some(rule.target.as_str())
        }
        TargetType::Device => {
            query.local_guid.as_deref() == Some(rule.target.as_str())
                || query.local_mac.as_deref() == Some(rule.target.as_str())
        }
        TargetType::Tag => {
            let t = rule.target.strip_prefix("tag:").unwrap_or(&rule.target);
            query.local_tags.iter().any(|lt| lt == t)
        }
        TargetType::Network => {
            let t = rule.target.strip_prefix("intf:").unwrap_or(&rule.target);
            query.local_intf.as_deref() == Some(t)
        }
        _ => true,
    }
}

/// Domain target match: `/re/` targets are regular expressions, everything
/// else is exact-or-suffix.
fn domain_matches_target(target: &str, domain: &str) -> bool {
    if target.len() > 2 && target.starts_with('/') && target.ends_with('/') {
        let pattern = &target[1..target.len() - 1];
        return Regex::new(pattern)
            .map(|re| re.is_match(domain))
            .unwrap_or(false);
    }
    domain_covers(target, domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::collaborators::NullCollaborators;
    use crate::policy_manager::{PolicyCreateOutcome, PolicyManagerDeps};
    use crate::store::Store;
    use crate::timers::TimerService;
    use async_trait::async_trait;
    use policy_engine::NullCategoryMatcher;

    fn engine_with(
        vpn: Arc<dyn VpnClientStatus>,
    ) -> (DecisionEngine, Arc<PolicyManager>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let nulls = Arc::new(NullCollaborators);
        let mgr = PolicyManager::start(PolicyManagerDeps {
            store: Arc::new(Store::new()),
            backend: backend.clone(),
            timers: TimerService::start(),
            cron: nulls.clone(),
            quota: nulls.clone(),
            dns: nulls.clone(),
            categories: nulls.clone(),
            cloud_domains: vec![],
        });
        let engine = DecisionEngine::new(
            mgr.clone(),
            Arc::new(NullCategoryMatcher),
            vpn,
            backend.clone(),
        );
        (engine, mgr, backend)
    }

    fn engine() -> (DecisionEngine, Arc<PolicyManager>, Arc<MemoryBackend>) {
        engine_with(Arc::new(NullCollaborators))
    }

    async fn created(mgr: &PolicyManager, p: Policy) -> policy_engine::PolicyId {
        match mgr.create_policy(p).await.unwrap() {
            PolicyCreateOutcome::Created(pid) => pid,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scoped_rule_wins_over_unscoped() {
        let (engine, mgr, _) = engine();
        created(&mgr, Policy::new(TargetType::Ip, "1.2.3.4")).await;
        let mut scoped = Policy::new(TargetType::Ip, "1.2.3.4");
        scoped.scope = vec!["AA:BB:CC:DD:EE:FF".to_string()];
        let scoped_pid = created(&mgr, scoped).await;

        let hit = engine
            .check_acl(&AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(hit.pid, Some(scoped_pid));
        assert_eq!(hit.rank(), 0);
    }

    #[tokio::test]
    async fn test_unscoped_rule_covers_other_devices() {
        let (engine, mgr, _) = engine();
        let pid = created(&mgr, Policy::new(TargetType::Ip, "1.2.3.4")).await;
        let hit = engine
            .check_acl(&AclQuery::outbound_to_ip("11:22:33:44:55:66", "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(hit.pid, Some(pid));

        assert!(engine
            .check_acl(&AclQuery::outbound_to_ip("11:22:33:44:55:66", "5.6.7.8"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_domain_rule_matches_by_name_and_regex() {
        let (engine, mgr, _) = engine();
        created(&mgr, Policy::new(TargetType::Domain, "evil.com")).await;

        let q = AclQuery {
            local_mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
            remote_domain: Some("cdn.evil.com".to_string()),
            direction: Direction::Outbound,
            ..AclQuery::default()
        };
        assert!(engine.check_acl(&q).await.is_some());

        created(&mgr, Policy::new(TargetType::Domain, "/^ads[0-9]+\\./")).await;
        let q = AclQuery {
            remote_domain: Some("ads42.tracker.net".to_string()),
            direction: Direction::Outbound,
            ..AclQuery::default()
        };
        assert!(engine.check_acl(&q).await.is_some());
    }

    #[tokio::test]
    async fn test_domain_rule_matches_resolved_ip_via_set_snapshot() {
        let (engine, mgr, backend) = engine();
        let pid = created(&mgr, Policy::new(TargetType::Domain, "evil.com")).await;
        // the enforcement path created the per-rule set; seed a resolved ip
        backend
            .add_to_set(&format!("rule_{}_set", pid.as_str()), &["6.6.6.6".to_string()])
            .await
            .unwrap();
        let hit = engine
            .check_acl(&AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "6.6.6.6"))
            .await;
        assert_eq!(hit.unwrap().pid, Some(pid));
    }

    #[tokio::test]
    async fn test_direction_and_port_constraints() {
        let (engine, mgr, _) = engine();
        let mut p = Policy::new(TargetType::Ip, "1.2.3.4");
        p.direction = Direction::Inbound;
        p.remote_port = Some("440-450".to_string());
        created(&mgr, p).await;

        let mut q = AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "1.2.3.4");
        q.remote_port = Some("443".to_string());
        // outbound traffic cannot hit an inbound-only rule
        assert!(engine.check_acl(&q).await.is_none());

        q.direction = Direction::Inbound;
        assert!(engine.check_acl(&q).await.is_some());

        q.remote_port = Some("9999".to_string());
        assert!(engine.check_acl(&q).await.is_none());
    }

    #[tokio::test]
    async fn test_match_group_indirection() {
        let (engine, mgr, _) = engine();
        let mut group = Policy::new(TargetType::MatchGroup, "rg-1");
        group.scope = vec!["AA:BB:CC:DD:EE:FF".to_string()];
        created(&mgr, group).await;
        let mut sub = Policy::new(TargetType::Ip, "7.7.7.7");
        sub.parent_rg_id = Some("rg-1".to_string());
        let sub_pid = created(&mgr, sub).await;

        // reachable through the group for the scoped device
        let hit = engine
            .check_acl(&AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "7.7.7.7"))
            .await;
        assert_eq!(hit.unwrap().pid, Some(sub_pid));

        // not reachable for a device outside the group's scope: the sub-rule
        // itself is skipped at top level
        assert!(engine
            .check_acl(&AclQuery::outbound_to_ip("11:22:33:44:55:66", "7.7.7.7"))
            .await
            .is_none());
    }

    struct DeadVpn;

    #[async_trait]
    impl VpnClientStatus for DeadVpn {
        async fn is_enabled(&self, _p: &str) -> bool {
            true
        }
        async fn is_connected(&self, _p: &str) -> bool {
            false
        }
        async fn is_strict(&self, _p: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_route_filtered_when_vpn_down_without_killswitch() {
        let (engine, mgr, _) = engine_with(Arc::new(DeadVpn));
        let mut route = Policy::new(TargetType::Internet, "vpn-profile-1");
        route.action = Action::Route;
        created(&mgr, route).await;

        assert!(engine
            .check_route(&AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "8.8.8.8"))
            .await
            .is_none());
    }

    struct StrictVpn;

    #[async_trait]
    impl VpnClientStatus for StrictVpn {
        async fn is_enabled(&self, _p: &str) -> bool {
            true
        }
        async fn is_connected(&self, _p: &str) -> bool {
            false
        }
        async fn is_strict(&self, _p: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_hard_route_with_killswitch_stays_viable() {
        let (engine, mgr, _) = engine_with(Arc::new(StrictVpn));
        let mut route = Policy::new(TargetType::Internet, "vpn-profile-1");
        route.action = Action::Route;
        created(&mgr, route).await;

        assert!(engine
            .check_route(&AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "8.8.8.8"))
            .await
            .is_some());

        // but a soft route falls through
        let mut soft = Policy::new(TargetType::Internet, "vpn-profile-2");
        soft.action = Action::Route;
        soft.route_type = Some("soft".to_string());
        soft.seq = policy_engine::SeqTier::High;
        created(&mgr, soft).await;
        let hit = engine
            .check_route(&AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "8.8.8.8"))
            .await
            .unwrap();
        assert_eq!(hit.target, "vpn-profile-1");
    }

    #[tokio::test]
    async fn test_disabled_and_expired_rules_are_not_candidates() {
        let (engine, mgr, _) = engine();
        let pid = created(&mgr, Policy::new(TargetType::Ip, "1.2.3.4")).await;
        let mut p = mgr.get_policy(&pid).unwrap();
        p.disabled = true;
        mgr.update_policy(p).await.unwrap();

        assert!(engine
            .check_acl(&AclQuery::outbound_to_ip("AA:BB:CC:DD:EE:FF", "1.2.3.4"))
            .await
            .is_none());
    }
}
