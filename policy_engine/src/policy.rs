// Policy (rule) value object.
//
// A policy is a persistent, rankable instruction against the packet filter.
// Matching a policy against an alarm answers "is this event already handled
// by an existing rule"; rank ordering picks the single winning rule among
// candidates during live ACL/route resolution. Rank is derived, never stored.

use crate::alarm::{Alarm, AlarmType};
use crate::category::CategoryMatcher;
use crate::types::{now_ts, Action, Direction, PolicyId, SeqTier, TargetType};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Placeholder targets meaning "any device" for mac-typed rules.
const ANY_DEVICE: &[&str] = &["*", "any", "TAG"];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy target for type {0}: {1}")]
    InvalidTarget(TargetType, String),

    #[error("policy has no id assigned")]
    MissingId,
}

// ============================================================================
// POLICY
// ============================================================================

/// A traffic rule. Exactly one of `expire`, `cron_time`, `app_time_usage`
/// governs temporal behavior; `idle_ts` pauses are orthogonal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub pid: Option<PolicyId>,
    #[serde(rename = "type")]
    pub ptype: TargetType,
    pub target: String,
    /// Multi-target rules (batch domain blocks) carry the full list here.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub direction: Direction,

    /// Device scope, MAC addresses. Empty means unscoped.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Tag scope, `tag:`-prefixed group ids.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Identity scope, device GUIDs.
    #[serde(default)]
    pub guids: Vec<String>,
    /// Interface scope, `intf:`-prefixed network ids.
    #[serde(default)]
    pub intfs: Vec<String>,

    #[serde(default)]
    pub seq: SeqTier,

    /// Relative expiry in seconds from activation.
    pub expire: Option<f64>,
    /// Recurrence spec, handled by the external cron scheduler.
    pub cron_time: Option<String>,
    /// Window length in seconds for cron-activated rules.
    pub duration: Option<f64>,
    /// Pause-until timestamp; the rule is dormant before it.
    pub idle_ts: Option<f64>,
    /// Usage-quota spec, handled by the external quota manager.
    pub app_time_usage: Option<serde_json::Value>,

    #[serde(default)]
    pub disabled: bool,
    /// Set when enforcement programs the rule; cleared on unenforce.
    pub activated_time: Option<f64>,
    /// Creation timestamp.
    pub timestamp: f64,

    /// Rule was generated from a security alarm; block rules get a rank
    /// discount for it.
    #[serde(default)]
    pub security: bool,
    #[serde(default)]
    pub auto_delete_when_expires: bool,
    /// Domain rules: resolve-and-observe only, no IP-level blocking.
    #[serde(default)]
    pub dnsmasq_only: bool,

    pub protocol: Option<String>,
    pub local_port: Option<String>,
    pub remote_port: Option<String>,

    /// Route rules: "hard" drops traffic when the VPN is down with the kill
    /// switch on, "soft" falls through to the next candidate.
    pub route_type: Option<String>,

    /// Present on sub-rules referenced through a match_group rule.
    pub parent_rg_id: Option<String>,
}

impl Policy {
    pub fn new(ptype: TargetType, target: impl Into<String>) -> Self {
        let mut p = Policy {
            pid: None,
            ptype,
            target: target.into(),
            targets: Vec::new(),
            action: Action::default(),
            direction: Direction::default(),
            scope: Vec::new(),
            tags: Vec::new(),
            guids: Vec::new(),
            intfs: Vec::new(),
            seq: SeqTier::default(),
            expire: None,
            cron_time: None,
            duration: None,
            idle_ts: None,
            app_time_usage: None,
            disabled: false,
            activated_time: None,
            timestamp: now_ts(),
            security: false,
            auto_delete_when_expires: false,
            dnsmasq_only: false,
            protocol: None,
            local_port: None,
            remote_port: None,
            route_type: None,
            parent_rg_id: None,
        };
        p.normalize();
        p
    }

    /// Canonicalize raw attribute input: MACs uppercase, domains lowercase,
    /// scope lists deduplicated. Applied at construction, never later.
    pub fn normalize(&mut self) {
        match self.ptype {
            TargetType::Mac | TargetType::DevicePort => {
                if !ANY_DEVICE.contains(&self.target.as_str()) {
                    self.target = self.target.trim().to_uppercase();
                }
            }
            t if t.is_domain() => {
                self.target = self.target.trim().to_lowercase();
            }
            TargetType::Category | TargetType::Country => {
                self.target = self.target.trim().to_lowercase();
            }
            _ => {
                self.target = self.target.trim().to_string();
            }
        }
        for mac in &mut self.scope {
            *mac = mac.trim().to_uppercase();
        }
        self.scope.sort();
        self.scope.dedup();
        self.tags.sort();
        self.tags.dedup();
        self.guids.sort();
        self.guids.dedup();
        self.intfs.sort();
        self.intfs.dedup();
    }

    /// Whether this rule constrains any local scope at all.
    pub fn is_scoped(&self) -> bool {
        !self.scope.is_empty()
            || !self.tags.is_empty()
            || !self.guids.is_empty()
            || !self.intfs.is_empty()
    }

    // ------------------------------------------------------------------------
    // Rank
    // ------------------------------------------------------------------------

    /// Derived priority; lower wins. Specificity band, then an action offset
    /// (block beats allow at equal specificity), then the operator's sequence
    /// tier, then a discount for security-generated block rules.
    pub fn rank(&self) -> i32 {
        let base = self.specificity_base();
        let action = match self.action {
            Action::Block => 0,
            Action::Allow | Action::Route => 1,
        };
        let security = if self.security && self.action == Action::Block {
            1
        } else {
            0
        };
        base + action + self.seq.rank_offset() - security
    }

    fn specificity_base(&self) -> i32 {
        if !self.scope.is_empty() || !self.guids.is_empty() || self.ptype == TargetType::Device {
            0
        } else if !self.tags.is_empty() || self.ptype == TargetType::Tag {
            2
        } else if !self.intfs.is_empty() || self.ptype == TargetType::Network {
            4
        } else {
            match self.ptype {
                TargetType::Category | TargetType::Country => 4,
                TargetType::Intranet => 6,
                _ => 5,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Temporal predicates
    // ------------------------------------------------------------------------

    /// Past its relative expiry, measured from activation (or creation when
    /// never activated).
    pub fn is_expired_at(&self, now: f64) -> bool {
        match self.expire {
            Some(expire) => {
                let start = self.activated_time.unwrap_or(self.timestamp);
                start + expire < now
            }
            None => false,
        }
    }

    pub fn expiry_ts(&self) -> Option<f64> {
        self.expire
            .map(|e| self.activated_time.unwrap_or(self.timestamp) + e)
    }

    /// Paused until `idle_ts`.
    pub fn is_idle_at(&self, now: f64) -> bool {
        self.idle_ts.map(|t| now < t).unwrap_or(false)
    }

    /// Cron-scheduled rules are only live inside an activated window. The
    /// scheduler sets `activated_time` when the window opens; `duration`
    /// bounds it.
    pub fn in_schedule_at(&self, now: f64) -> bool {
        if self.cron_time.is_none() {
            return true;
        }
        match (self.activated_time, self.duration) {
            (Some(at), Some(d)) => now >= at && now < at + d,
            (Some(_), None) => true,
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Alarm matching
    // ------------------------------------------------------------------------

    /// Whether this rule already handles the event described by `alarm`.
    /// Only enabled, in-window block rules participate. Total: malformed
    /// values degrade to non-match.
    pub fn match_alarm(&self, alarm: &Alarm, categories: &dyn CategoryMatcher) -> bool {
        let now = now_ts();

        if self.disabled {
            return false;
        }
        if !alarm.atype.participates_in_policy_match() {
            return false;
        }
        if self.action != Action::Block {
            return false;
        }
        if self.is_expired_at(now) || self.is_idle_at(now) || !self.in_schedule_at(now) {
            return false;
        }
        if !self.direction_covers(alarm) {
            return false;
        }
        if !self.scope_matches(alarm) {
            return false;
        }
        if brute_force_guess_on_self(alarm) {
            return false;
        }

        self.target_matches(alarm, categories)
    }

    fn direction_covers(&self, alarm: &Alarm) -> bool {
        let flow = match alarm.get_text("p.local_is_client").as_deref() {
            Some("1") => Direction::Outbound,
            Some(_) => Direction::Inbound,
            None => return true,
        };
        self.direction.covers(flow)
    }

    /// AND across present scope categories, OR within each.
    fn scope_matches(&self, alarm: &Alarm) -> bool {
        if !self.scope.is_empty() {
            let mac = alarm.get_text("p.device.mac").unwrap_or_default();
            if !self.scope.iter().any(|m| *m == mac) {
                return false;
            }
        }
        if !self.guids.is_empty() {
            let guid = alarm.get_text("p.device.guid").unwrap_or_default();
            if !self.guids.iter().any(|g| *g == guid) {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let alarm_tags = id_list(alarm, "p.tag.ids");
            let hit = self
                .tags
                .iter()
                .map(|t| t.strip_prefix("tag:").unwrap_or(t))
                .any(|t| alarm_tags.iter().any(|a| a == t));
            if !hit {
                return false;
            }
        }
        if !self.intfs.is_empty() {
            let alarm_intfs = id_list(alarm, "p.intf.ids");
            let single = alarm.get_text("p.intf.id");
            let hit = self
                .intfs
                .iter()
                .map(|i| i.strip_prefix("intf:").unwrap_or(i))
                .any(|i| {
                    alarm_intfs.iter().any(|a| a == i) || single.as_deref() == Some(i)
                });
            if !hit {
                return false;
            }
        }
        true
    }

    fn target_matches(&self, alarm: &Alarm, categories: &dyn CategoryMatcher) -> bool {
        let dest_ip = alarm.get_text("p.dest.ip");
        let dest_name = alarm.get_text("p.dest.name").map(|s| s.to_lowercase());

        match self.ptype {
            TargetType::Ip => dest_ip.as_deref() == Some(self.target.as_str()),
            TargetType::Net => {
                let Some(ip) = dest_ip.as_deref().and_then(|s| s.parse::<Ipv4Addr>().ok())
                else {
                    return false;
                };
                self.target
                    .parse::<Ipv4Network>()
                    .map(|net| net.contains(ip))
                    .unwrap_or(false)
            }
            TargetType::Domain | TargetType::Dns => dest_name
                .as_deref()
                .map(|d| domain_covers(&self.target, d))
                .unwrap_or(false),
            TargetType::Mac => {
                if ANY_DEVICE.contains(&self.target.as_str()) {
                    return true;
                }
                alarm.get_text("p.device.mac").as_deref() == Some(self.target.as_str())
            }
            TargetType::Category => {
                categories.matches(&self.target, dest_name.as_deref(), dest_ip.as_deref())
            }
            TargetType::Country => {
                alarm
                    .get_text("p.dest.country")
                    .map(|c| c.to_lowercase() == self.target)
                    .unwrap_or(false)
            }
            TargetType::RemotePort => alarm
                .get_text("p.dest.port")
                .map(|p| port_range_covers(&self.target, &p))
                .unwrap_or(false),
            TargetType::DevicePort => self.device_port_matches(alarm),
            TargetType::Internet => dest_ip
                .as_deref()
                .and_then(|s| s.parse::<Ipv4Addr>().ok())
                .map(|ip| !is_private_ipv4(ip))
                .unwrap_or(dest_name.is_some()),
            TargetType::Intranet => dest_ip
                .as_deref()
                .and_then(|s| s.parse::<Ipv4Addr>().ok())
                .map(is_private_ipv4)
                .unwrap_or(false),
            TargetType::Tag => {
                let t = self.target.strip_prefix("tag:").unwrap_or(&self.target);
                id_list(alarm, "p.tag.ids").iter().any(|a| a == t)
            }
            TargetType::Network => {
                let t = self.target.strip_prefix("intf:").unwrap_or(&self.target);
                alarm.get_text("p.intf.id").as_deref() == Some(t)
            }
            TargetType::Device => {
                alarm.get_text("p.device.guid").as_deref() == Some(self.target.as_str())
                    || alarm.get_text("p.device.mac").as_deref() == Some(self.target.as_str())
            }
            // indirection rules are resolved through their sub-rules, never
            // matched against alarms directly
            TargetType::MatchGroup => false,
        }
    }

    /// devicePort targets encode `<MAC>:<port>:<protocol>`; the MAC itself
    /// contains colons, so fields are split from the right.
    fn device_port_matches(&self, alarm: &Alarm) -> bool {
        let Some((rest, protocol)) = self.target.rsplit_once(':') else {
            return false;
        };
        let Some((mac, port)) = rest.rsplit_once(':') else {
            return false;
        };
        alarm.get_text("p.device.mac").as_deref() == Some(mac)
            && alarm.get_text("p.device.port").as_deref() == Some(port)
            && alarm
                .get_text("p.protocol")
                .map(|p| p.eq_ignore_ascii_case(protocol))
                .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Equality for duplicate detection on save
    // ------------------------------------------------------------------------

    /// Two rules are the same instruction when everything that affects
    /// enforcement is equal. Lists were normalized to sorted form, so slice
    /// equality is set equality.
    pub fn is_same_rule(&self, other: &Policy) -> bool {
        self.ptype == other.ptype
            && self.target == other.target
            && self.targets == other.targets
            && self.action == other.action
            && self.direction == other.direction
            && self.expire == other.expire
            && self.cron_time == other.cron_time
            && self.duration == other.duration
            && self.scope == other.scope
            && self.tags == other.tags
            && self.guids == other.guids
            && self.intfs == other.intfs
            && self.local_port == other.local_port
            && self.remote_port == other.remote_port
            && self.protocol == other.protocol
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Domain rule coverage: exact or dot-boundary suffix.
pub fn domain_covers(rule_domain: &str, domain: &str) -> bool {
    let rule = rule_domain.strip_prefix("*.").unwrap_or(rule_domain);
    domain == rule || domain.ends_with(&format!(".{}", rule))
}

/// Port spec coverage: a single port or an inclusive `lo-hi` range.
pub fn port_range_covers(spec: &str, port: &str) -> bool {
    let Ok(port) = port.trim().parse::<u32>() else {
        return false;
    };
    if let Some((lo, hi)) = spec.split_once('-') {
        match (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
            (Ok(lo), Ok(hi)) => lo <= port && port <= hi,
            _ => false,
        }
    } else {
        spec.trim().parse::<u32>().map(|p| p == port).unwrap_or(false)
    }
}

pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn id_list(alarm: &Alarm, key: &str) -> Vec<String> {
    use serde_json::Value;
    match alarm.get(key) {
        Some(Value::Array(a)) => a
            .iter()
            .filter_map(crate::value_match::value_to_text)
            .collect(),
        Some(Value::String(s)) => serde_json::from_str::<Vec<serde_json::Value>>(s)
            .map(|a| a.iter().filter_map(crate::value_match::value_to_text).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// SSH password-guessing notices aimed at the box itself are never treated
/// as policy-handled; they must surface as alarms.
fn brute_force_guess_on_self(alarm: &Alarm) -> bool {
    alarm.atype == AlarmType::BroNotice
        && alarm.get_text("p.noticeType").as_deref() == Some("SSH::Password_Guessing")
        && alarm.get_text("p.dest.ip").is_some()
        && alarm.get_text("p.dest.ip") == alarm.get_text("p.device.ip")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{NullCategoryMatcher, SetCategoryMatcher};
    use serde_json::json;

    fn intel_alarm(dest_ip: &str) -> Alarm {
        Alarm::new(AlarmType::Intel, now_ts(), "AA:BB:CC:DD:EE:FF").with_payload(vec![
            ("p.device.name", json!("laptop")),
            ("p.device.id", json!("AA:BB:CC:DD:EE:FF")),
            ("p.device.mac", json!("AA:BB:CC:DD:EE:FF")),
            ("p.dest.id", json!(dest_ip)),
            ("p.dest.ip", json!(dest_ip)),
        ])
    }

    fn block(ptype: TargetType, target: &str) -> Policy {
        Policy::new(ptype, target)
    }

    #[test]
    fn test_ip_target_match() {
        let p = block(TargetType::Ip, "1.2.3.4");
        assert!(p.match_alarm(&intel_alarm("1.2.3.4"), &NullCategoryMatcher));
        assert!(!p.match_alarm(&intel_alarm("1.2.3.5"), &NullCategoryMatcher));
    }

    #[test]
    fn test_net_target_match() {
        let p = block(TargetType::Net, "10.0.0.0/8");
        assert!(p.match_alarm(&intel_alarm("10.9.8.7"), &NullCategoryMatcher));
        assert!(!p.match_alarm(&intel_alarm("11.0.0.1"), &NullCategoryMatcher));
    }

    #[test]
    fn test_domain_target_match() {
        let p = block(TargetType::Domain, "Evil.COM");
        let mut a = intel_alarm("5.6.7.8");
        a.set("p.dest.name", json!("tracker.evil.com"));
        assert!(p.match_alarm(&a, &NullCategoryMatcher));

        a.set("p.dest.name", json!("evil.com"));
        assert!(p.match_alarm(&a, &NullCategoryMatcher));

        a.set("p.dest.name", json!("notevil.com"));
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
    }

    #[test]
    fn test_category_target_match() {
        let mut m = SetCategoryMatcher::new();
        m.load_domains("games", vec!["battle.net".to_string()]);
        let p = block(TargetType::Category, "games");
        let mut a = intel_alarm("5.6.7.8");
        a.set("p.dest.name", json!("us.battle.net"));
        assert!(p.match_alarm(&a, &m));
        assert!(!p.match_alarm(&intel_alarm("5.6.7.8"), &m));
    }

    #[test]
    fn test_gates() {
        let mut p = block(TargetType::Ip, "1.2.3.4");
        let a = intel_alarm("1.2.3.4");

        p.disabled = true;
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
        p.disabled = false;

        p.action = Action::Allow;
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
        p.action = Action::Block;

        // expired relative to activation
        p.expire = Some(10.0);
        p.activated_time = Some(now_ts() - 100.0);
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
        p.expire = None;
        p.activated_time = None;

        // cron rule outside its window
        p.cron_time = Some("0 22 * * *".to_string());
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
        p.activated_time = Some(now_ts() - 5.0);
        p.duration = Some(3600.0);
        assert!(p.match_alarm(&a, &NullCategoryMatcher));
    }

    #[test]
    fn test_scope_gate() {
        let mut p = block(TargetType::Ip, "1.2.3.4");
        p.scope = vec!["11:22:33:44:55:66".to_string()];
        p.normalize();
        assert!(!p.match_alarm(&intel_alarm("1.2.3.4"), &NullCategoryMatcher));

        p.scope = vec!["aa:bb:cc:dd:ee:ff".to_string()];
        p.normalize();
        // normalization uppercased the scope entry
        assert!(p.match_alarm(&intel_alarm("1.2.3.4"), &NullCategoryMatcher));
    }

    #[test]
    fn test_nonparticipating_variant() {
        let p = block(TargetType::Mac, "*");
        let a = Alarm::new(AlarmType::Customized, now_ts(), "d");
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
    }

    #[test]
    fn test_direction_gate() {
        let mut p = block(TargetType::Ip, "1.2.3.4");
        p.direction = Direction::Inbound;
        let mut a = intel_alarm("1.2.3.4");
        a.set("p.local_is_client", json!("1")); // outbound flow
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));

        a.set("p.local_is_client", json!("0"));
        assert!(p.match_alarm(&a, &NullCategoryMatcher));
    }

    #[test]
    fn test_brute_force_guess_carve_out() {
        let p = block(TargetType::Mac, "*");
        let a = Alarm::new(AlarmType::BroNotice, now_ts(), "box").with_payload(vec![
            ("p.noticeType", json!("SSH::Password_Guessing")),
            ("p.dest.ip", json!("192.168.1.1")),
            ("p.device.ip", json!("192.168.1.1")),
        ]);
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
    }

    #[test]
    fn test_rank_scoped_beats_unscoped() {
        let unscoped = block(TargetType::Ip, "1.2.3.4");
        let mut scoped = block(TargetType::Ip, "1.2.3.4");
        scoped.scope = vec!["AA:BB:CC:DD:EE:FF".to_string()];
        assert_eq!(scoped.rank(), 0);
        assert!(scoped.rank() < unscoped.rank());
    }

    #[test]
    fn test_rank_bands() {
        let mut tag = block(TargetType::Ip, "1.2.3.4");
        tag.tags = vec!["tag:7".to_string()];
        let mut net = block(TargetType::Ip, "1.2.3.4");
        net.intfs = vec!["intf:uuid1".to_string()];
        let global = block(TargetType::Ip, "1.2.3.4");
        assert!(tag.rank() < net.rank());
        assert!(net.rank() < global.rank());
    }

    #[test]
    fn test_rank_block_beats_allow_and_seq_overrides() {
        let b = block(TargetType::Ip, "1.2.3.4");
        let mut a = block(TargetType::Ip, "1.2.3.4");
        a.action = Action::Allow;
        assert!(b.rank() < a.rank());

        let mut pinned = block(TargetType::Ip, "1.2.3.4");
        pinned.action = Action::Allow;
        pinned.seq = SeqTier::High;
        // a high-tier allow outranks a regular device-scoped block
        let mut scoped = block(TargetType::Ip, "1.2.3.4");
        scoped.scope = vec!["AA:BB:CC:DD:EE:FF".to_string()];
        assert!(pinned.rank() < scoped.rank());
    }

    #[test]
    fn test_rank_security_discount() {
        let plain = block(TargetType::Ip, "1.2.3.4");
        let mut sec = block(TargetType::Ip, "1.2.3.4");
        sec.security = true;
        assert_eq!(sec.rank(), plain.rank() - 1);
    }

    #[test]
    fn test_port_range_covers() {
        assert!(port_range_covers("5000-6000", "5500"));
        assert!(port_range_covers("5000-6000", "5000"));
        assert!(!port_range_covers("5000-6000", "6001"));
        assert!(port_range_covers("443", "443"));
        assert!(!port_range_covers("443", "80"));
        assert!(!port_range_covers("443", "junk"));
    }

    #[test]
    fn test_device_port_target() {
        let p = block(TargetType::DevicePort, "AA:BB:CC:DD:EE:FF:8080:tcp");
        let mut a = intel_alarm("1.2.3.4");
        a.set("p.device.port", json!("8080"));
        a.set("p.protocol", json!("TCP"));
        assert!(p.match_alarm(&a, &NullCategoryMatcher));

        a.set("p.device.port", json!("8081"));
        assert!(!p.match_alarm(&a, &NullCategoryMatcher));
    }

    #[test]
    fn test_same_rule_equality() {
        let mut a = block(TargetType::Ip, "1.2.3.4");
        a.scope = vec!["bb:bb:bb:bb:bb:bb".to_string(), "aa:aa:aa:aa:aa:aa".to_string()];
        a.normalize();
        let mut b = block(TargetType::Ip, "1.2.3.4");
        b.scope = vec!["AA:AA:AA:AA:AA:AA".to_string(), "BB:BB:BB:BB:BB:BB".to_string()];
        b.normalize();
        assert!(a.is_same_rule(&b));

        b.expire = Some(600.0);
        assert!(!a.is_same_rule(&b));
    }

    #[test]
    fn test_normalization() {
        let p = Policy::new(TargetType::Domain, "  EVIL.Com ");
        assert_eq!(p.target, "evil.com");
        let p = Policy::new(TargetType::Mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(p.target, "AA:BB:CC:DD:EE:FF");
    }
}
