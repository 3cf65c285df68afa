// Shared value-matching semantics used by both Exception-vs-Alarm and
// Policy-vs-Alarm matching. Evaluation is layered from cheapest to most
// expensive and must be total: malformed patterns, bad CIDRs and unparsable
// JSON all degrade to a non-match, never an error.
//
// 1. Strict string equality
// 2. Glob (leading/trailing `*`, with `*.suffix` also matching the bare apex)
// 3. CIDR containment (IPv4, prefix length <= 32)
// 4. Numeric coercion equality (`0` equals `"0"`)
// 5. JSON comparison objects ({"$gt": n} and friends)
// 6. Array semantics (OR across rule elements, set intersection for tag keys)

use ipnetwork::Ipv4Network;
use serde_json::Value;
use std::net::Ipv4Addr;

/// Payload keys whose values are JSON-encoded id arrays. For these, matching
/// is non-empty set intersection rather than scalar comparison.
const TAG_VALUE_KEYS: &[&str] = &["p.tag.ids", "p.intf.ids"];

/// Render a scalar JSON value the way the persisted (flattened) form does.
pub fn value_to_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Core scalar matcher. `rule` is the pattern side, `alarm` the observed side.
pub fn string_value_match(rule: &str, alarm: &str) -> bool {
    if rule == alarm {
        return true;
    }

    if rule.starts_with('*') || rule.ends_with('*') {
        return glob_match(rule, alarm);
    }

    if let Some(hit) = cidr_match(rule, alarm) {
        return hit;
    }

    if let Some(hit) = numeric_match(rule, alarm) {
        return hit;
    }

    false
}

/// Glob with stars meaningful only at the pattern ends: `*x` is a suffix
/// test, `x*` a prefix test, `*x*` a contains test. `*.example.com`
/// additionally matches the bare apex `example.com` so a domain rule covers
/// the domain itself. Interior stars are literal.
fn glob_match(pattern: &str, s: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return s == suffix || s.ends_with(&format!(".{}", suffix));
    }
    if let Some(inner) = pattern.strip_prefix('*').and_then(|p| p.strip_suffix('*')) {
        return s.contains(inner);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return s.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return s.starts_with(prefix);
    }
    false
}

/// CIDR containment. Returns None when the rule value is not `ip/prefixlen`
/// or the alarm value is not a dotted IPv4 address.
fn cidr_match(rule: &str, alarm: &str) -> Option<bool> {
    if !rule.contains('/') {
        return None;
    }
    let net: Ipv4Network = rule.parse().ok()?;
    let ip: Ipv4Addr = alarm.parse().ok()?;
    Some(net.contains(ip))
}

/// Numeric coercion equality: both sides must parse to finite numbers.
/// `0` and `"0"` compare equal; NaN equals nothing.
fn numeric_match(rule: &str, alarm: &str) -> Option<bool> {
    let a: f64 = rule.trim().parse().ok()?;
    let b: f64 = alarm.trim().parse().ok()?;
    if !a.is_finite() || !b.is_finite() {
        return None;
    }
    Some(a == b)
}

/// JSON comparison objects: a rule value of the form `{"$gt": 100}` compares
/// the alarm's numeric value. Exactly one operator key must be present;
/// anything else is not a comparison object.
pub fn json_comparison_match(rule: &Value, alarm: &Value) -> Option<bool> {
    let obj = rule.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let (op, bound) = obj.iter().next()?;
    let bound = bound.as_f64()?;
    let actual = match alarm {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    match op.as_str() {
        "$gt" => Some(actual > bound),
        "$lt" => Some(actual < bound),
        "$gte" => Some(actual >= bound),
        "$lte" => Some(actual <= bound),
        _ => None,
    }
}

fn is_tag_value_key(key: &str) -> bool {
    TAG_VALUE_KEYS.contains(&key)
}

/// Parse an alarm value that may itself be a JSON-encoded array of ids.
fn parse_id_array(v: &Value) -> Option<Vec<String>> {
    let arr = match v {
        Value::Array(a) => a.clone(),
        Value::String(s) => serde_json::from_str::<Value>(s).ok()?.as_array()?.clone(),
        _ => return None,
    };
    Some(arr.iter().filter_map(value_to_text).collect())
}

/// Full attribute matcher for one rule attribute against one alarm attribute.
///
/// Array rule values OR across their elements. For tag-id-like keys, an alarm
/// value that decodes to an array matches on non-empty intersection.
pub fn value_match(key: &str, rule: &Value, alarm: &Value) -> bool {
    // Rule-side arrays: any element matching is a match.
    if let Value::Array(elems) = rule {
        if is_tag_value_key(key) {
            if let Some(alarm_ids) = parse_id_array(alarm) {
                let rule_ids: Vec<String> =
                    elems.iter().filter_map(value_to_text).collect();
                return rule_ids.iter().any(|r| alarm_ids.iter().any(|a| a == r));
            }
        }
        return elems.iter().any(|e| value_match(key, e, alarm));
    }

    if let Some(hit) = json_comparison_match(rule, alarm) {
        return hit;
    }

    // Alarm-side id arrays against a scalar rule value.
    if is_tag_value_key(key) {
        if let Some(alarm_ids) = parse_id_array(alarm) {
            if let Some(r) = value_to_text(rule) {
                return alarm_ids.iter().any(|a| *a == r);
            }
            return false;
        }
    }

    match (value_to_text(rule), value_to_text(alarm)) {
        (Some(r), Some(a)) => string_value_match(&r, &a),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_match() {
        assert!(string_value_match("1.2.3.4", "1.2.3.4"));
        assert!(!string_value_match("1.2.3.4", "1.2.3.5"));
    }

    #[test]
    fn test_glob_suffix_law() {
        // *.s matches d iff d == s or d ends with "." + s
        assert!(string_value_match("*.battle.net", "battle.net"));
        assert!(string_value_match("*.battle.net", "us.battle.net"));
        assert!(string_value_match("*.battle.net", "a.b.battle.net"));
        assert!(!string_value_match("*.battle.net", "notbattle.net"));
        assert!(!string_value_match("*.battle.net", "battle.net.evil.com"));
    }

    #[test]
    fn test_glob_prefix_and_bare_star() {
        assert!(string_value_match("porn*", "pornhub.com"));
        assert!(!string_value_match("porn*", "xpornhub.com"));
        assert!(string_value_match("*hub.com", "pornhub.com"));
    }

    #[test]
    fn test_glob_double_star_is_contains() {
        assert!(string_value_match("*casino*", "bigcasino.net"));
        assert!(string_value_match("*casino*", "casino.net"));
        assert!(string_value_match("*casino*", "my.casino"));
        assert!(!string_value_match("*casino*", "poker.net"));
    }

    #[test]
    fn test_cidr_law() {
        assert!(string_value_match("10.0.0.0/8", "10.250.1.1"));
        assert!(!string_value_match("10.0.0.0/8", "11.0.0.1"));
        assert!(string_value_match("192.168.1.0/24", "192.168.1.200"));
        assert!(!string_value_match("192.168.1.0/24", "192.168.2.1"));
        // /32 is exact containment
        assert!(string_value_match("1.2.3.4/32", "1.2.3.4"));
    }

    #[test]
    fn test_malformed_cidr_is_not_a_match() {
        assert!(!string_value_match("10.0.0.0/33", "10.0.0.1"));
        assert!(!string_value_match("999.0.0.0/8", "10.0.0.1"));
    }

    #[test]
    fn test_numeric_coercion() {
        assert!(string_value_match("0", "0"));
        assert!(string_value_match("0", "0.0"));
        assert!(string_value_match("443", " 443"));
        assert!(!string_value_match("443", "444"));
        assert!(!string_value_match("NaN", "NaN"));
    }

    #[test]
    fn test_json_comparison() {
        assert_eq!(
            json_comparison_match(&json!({"$gt": 100}), &json!(150)),
            Some(true)
        );
        assert_eq!(
            json_comparison_match(&json!({"$gt": 100}), &json!("99")),
            Some(false)
        );
        assert_eq!(
            json_comparison_match(&json!({"$lte": 10}), &json!(10)),
            Some(true)
        );
        // two operators is not a comparison object
        assert_eq!(
            json_comparison_match(&json!({"$gt": 1, "$lt": 2}), &json!(1.5)),
            None
        );
        // unknown operator
        assert_eq!(json_comparison_match(&json!({"$eq": 1}), &json!(1)), None);
    }

    #[test]
    fn test_rule_array_is_or() {
        let rule = json!(["a.com", "b.com"]);
        assert!(value_match("p.dest.name", &rule, &json!("b.com")));
        assert!(!value_match("p.dest.name", &rule, &json!("c.com")));
    }

    #[test]
    fn test_tag_id_intersection() {
        let rule = json!(["1", "2"]);
        assert!(value_match("p.tag.ids", &rule, &json!("[\"2\",\"9\"]")));
        assert!(!value_match("p.tag.ids", &rule, &json!("[\"8\",\"9\"]")));
        // scalar rule against alarm-side array
        assert!(value_match("p.tag.ids", &json!("9"), &json!("[\"8\",\"9\"]")));
    }

    #[test]
    fn test_totality_on_garbage() {
        // unparsable tag array payload never matches and never panics
        assert!(!value_match("p.tag.ids", &json!(["1"]), &json!("{broken")));
        assert!(!value_match("x", &json!({"weird": {"nested": 1}}), &json!("v")));
    }
}
