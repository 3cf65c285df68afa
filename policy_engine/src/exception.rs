// Exception value object.
//
// An exception is a predicate, not an action: matching one against an alarm
// suppresses the alarm's creation and increments a counter, nothing else.
// Matching is total and side-effect free; expiry/idle/schedule filtering is
// the manager's job so the match itself stays a pure function.

use crate::alarm::Alarm;
use crate::category::CategoryMatcher;
use crate::types::ExceptionId;
use crate::value_match::value_match;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wildcard exception type covering every security-classed alarm variant.
const SECURITY_WILDCARD: &str = "ALARM_INTEL";

/// An alarm-suppression predicate. The predicate itself lives in
/// `attributes`: the `type` key plus any number of `p.*` keys, each of which
/// must match the alarm (AND). `if.*` keys describe the rule an operator
/// could promote this exception into and are ignored by matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exception {
    pub eid: Option<ExceptionId>,
    pub timestamp: f64,
    /// Recurrence spec; the manager only applies this exception inside an
    /// active window.
    pub cron_time: Option<String>,
    pub duration: Option<f64>,
    pub activated_time: Option<f64>,
    /// Absolute expiry timestamp; swept periodically.
    pub expire_ts: Option<f64>,
    /// Pause-until timestamp.
    pub idle_ts: Option<f64>,
    /// How many alarms this exception has suppressed. Incremented
    /// asynchronously, so always approximate.
    #[serde(default)]
    pub match_count: u64,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl Exception {
    pub fn new(attributes: Vec<(&str, Value)>) -> Self {
        Exception {
            eid: None,
            timestamp: crate::types::now_ts(),
            cron_time: None,
            duration: None,
            activated_time: None,
            expire_ts: None,
            idle_ts: None,
            match_count: 0,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn alarm_type(&self) -> Option<&str> {
        self.attributes.get("type").and_then(|v| v.as_str())
    }

    pub fn is_expired_at(&self, now: f64) -> bool {
        self.expire_ts.map(|t| t < now).unwrap_or(false)
    }

    pub fn is_idle_at(&self, now: f64) -> bool {
        self.idle_ts.map(|t| now < t).unwrap_or(false)
    }

    /// Cron-gated exceptions apply only inside an activated window.
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

    /// Whether this exception suppresses `alarm`. Every present, non-empty
    /// predicate attribute must match; the first mismatch wins. Never errors.
    pub fn match_alarm(&self, alarm: &Alarm, categories: &dyn CategoryMatcher) -> bool {
        for (key, rule_value) in &self.attributes {
            if is_empty_value(rule_value) {
                continue;
            }
            let hit = match key.as_str() {
                "type" => self.type_matches(alarm, rule_value),
                "category" => {
                    let name = alarm.get_text("p.dest.name");
                    let ip = alarm.get_text("p.dest.ip");
                    rule_value
                        .as_str()
                        .map(|c| categories.matches(c, name.as_deref(), ip.as_deref()))
                        .unwrap_or(false)
                }
                k if k.starts_with("p.") || k.starts_with("e.") => match alarm.get(k) {
                    Some(alarm_value) => value_match(k, rule_value, alarm_value),
                    None => false,
                },
                // if.* and anything else is not a predicate attribute
                _ => true,
            };
            if !hit {
                return false;
            }
        }
        true
    }

    fn type_matches(&self, alarm: &Alarm, rule_value: &Value) -> bool {
        let Some(t) = rule_value.as_str() else {
            return false;
        };
        if t == SECURITY_WILDCARD && alarm.atype.is_security() {
            return true;
        }
        t == alarm.atype.as_str()
    }

    /// Equality of the predicate itself, used for dedup on save.
    pub fn is_same_predicate(&self, other: &Exception) -> bool {
        self.attributes == other.attributes
            && self.cron_time == other.cron_time
            && self.expire_ts == other.expire_ts
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmType;
    use crate::category::{NullCategoryMatcher, SetCategoryMatcher};
    use serde_json::json;

    fn game_alarm(dest: &str) -> Alarm {
        Alarm::new(AlarmType::Game, 1000.0, "AA:BB:CC:DD:EE:FF").with_payload(vec![
            ("p.device.mac", json!("AA:BB:CC:DD:EE:FF")),
            ("p.dest.name", json!(dest)),
            ("p.dest.ip", json!("5.6.7.8")),
        ])
    }

    #[test]
    fn test_suffix_exception_matches_bare_apex() {
        let e = Exception::new(vec![
            ("type", json!("ALARM_GAME")),
            ("p.dest.name", json!("*.battle.net")),
        ]);
        assert!(e.match_alarm(&game_alarm("battle.net"), &NullCategoryMatcher));
        assert!(e.match_alarm(&game_alarm("us.battle.net"), &NullCategoryMatcher));
        assert!(!e.match_alarm(&game_alarm("steam.com"), &NullCategoryMatcher));
    }

    #[test]
    fn test_type_mismatch() {
        let e = Exception::new(vec![("type", json!("ALARM_PORN"))]);
        assert!(!e.match_alarm(&game_alarm("battle.net"), &NullCategoryMatcher));
    }

    #[test]
    fn test_security_wildcard_type() {
        let e = Exception::new(vec![("type", json!("ALARM_INTEL"))]);
        let vuln = Alarm::new(AlarmType::Vulnerability, 0.0, "d");
        let bro = Alarm::new(AlarmType::BroNotice, 0.0, "d");
        assert!(e.match_alarm(&vuln, &NullCategoryMatcher));
        assert!(e.match_alarm(&bro, &NullCategoryMatcher));
        assert!(!e.match_alarm(&game_alarm("x.com"), &NullCategoryMatcher));
    }

    #[test]
    fn test_and_across_attributes() {
        let e = Exception::new(vec![
            ("type", json!("ALARM_GAME")),
            ("p.dest.name", json!("*.battle.net")),
            ("p.device.mac", json!("11:22:33:44:55:66")),
        ]);
        // dest matches, mac does not
        assert!(!e.match_alarm(&game_alarm("battle.net"), &NullCategoryMatcher));
    }

    #[test]
    fn test_empty_attribute_is_skipped() {
        let e = Exception::new(vec![
            ("type", json!("ALARM_GAME")),
            ("p.dest.name", json!("")),
        ]);
        assert!(e.match_alarm(&game_alarm("anything.com"), &NullCategoryMatcher));
    }

    #[test]
    fn test_missing_alarm_key_is_mismatch() {
        let e = Exception::new(vec![("p.dest.port", json!("443"))]);
        assert!(!e.match_alarm(&game_alarm("battle.net"), &NullCategoryMatcher));
    }

    #[test]
    fn test_extended_keys_are_predicates() {
        let e = Exception::new(vec![
            ("type", json!("ALARM_GAME")),
            ("e.device.mac", json!("AA:BB:CC:DD:EE:FF")),
        ]);
        // the alarm carries no e.device.mac, so the predicate cannot hold
        assert!(!e.match_alarm(&game_alarm("battle.net"), &NullCategoryMatcher));

        let with_detail = game_alarm("battle.net")
            .with_payload(vec![("e.device.mac", json!("AA:BB:CC:DD:EE:FF"))]);
        assert!(e.match_alarm(&with_detail, &NullCategoryMatcher));
    }

    #[test]
    fn test_if_keys_are_not_predicates() {
        let e = Exception::new(vec![
            ("type", json!("ALARM_GAME")),
            ("if.type", json!("domain")),
            ("if.target", json!("battle.net")),
        ]);
        assert!(e.match_alarm(&game_alarm("whatever.net"), &NullCategoryMatcher));
    }

    #[test]
    fn test_category_attribute() {
        let mut m = SetCategoryMatcher::new();
        m.load_domains("games", vec!["battle.net".to_string()]);
        let e = Exception::new(vec![("category", json!("games"))]);
        assert!(e.match_alarm(&game_alarm("us.battle.net"), &m));
        assert!(!e.match_alarm(&game_alarm("example.com"), &m));
    }

    #[test]
    fn test_totality_on_garbage_values() {
        let e = Exception::new(vec![("p.dest.name", json!({"weird": [1, 2]}))]);
        // malformed predicate value degrades to non-match, never panics
        assert!(!e.match_alarm(&game_alarm("battle.net"), &NullCategoryMatcher));
    }

    #[test]
    fn test_temporal_predicates() {
        let mut e = Exception::new(vec![("type", json!("ALARM_GAME"))]);
        assert!(!e.is_expired_at(1000.0));
        e.expire_ts = Some(900.0);
        assert!(e.is_expired_at(1000.0));

        e.idle_ts = Some(2000.0);
        assert!(e.is_idle_at(1000.0));
        assert!(!e.is_idle_at(3000.0));

        e.cron_time = Some("0 22 * * *".to_string());
        assert!(!e.in_schedule_at(1000.0));
        e.activated_time = Some(900.0);
        e.duration = Some(200.0);
        assert!(e.in_schedule_at(1000.0));
        assert!(!e.in_schedule_at(1200.0));
    }

    #[test]
    fn test_same_predicate() {
        let a = Exception::new(vec![("type", json!("ALARM_GAME")), ("p.dest.name", json!("x"))]);
        let b = Exception::new(vec![("p.dest.name", json!("x")), ("type", json!("ALARM_GAME"))]);
        assert!(a.is_same_predicate(&b));

        let c = Exception::new(vec![("type", json!("ALARM_PORN"))]);
        assert!(!a.is_same_predicate(&c));
    }
}
