// Core identifier and classification types shared by the alarm and policy
// value objects. Identifiers are monotonically assigned by the bridge's
// store counters and kept as strings to match the persisted form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic alarm identifier, immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmId(String);

impl AlarmId {
    pub fn new(id: impl Into<String>) -> Self {
        AlarmId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for AlarmId {
    fn from(n: u64) -> Self {
        AlarmId(n.to_string())
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Policy (rule) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(String);

impl PolicyId {
    pub fn new(id: impl Into<String>) -> Self {
        PolicyId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for PolicyId {
    fn from(n: u64) -> Self {
        PolicyId(n.to_string())
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exception identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExceptionId(String);

impl ExceptionId {
    pub fn new(id: impl Into<String>) -> Self {
        ExceptionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ExceptionId {
    fn from(n: u64) -> Self {
        ExceptionId(n.to_string())
    }
}

impl fmt::Display for ExceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// RULE CLASSIFICATION
// ============================================================================

/// What a rule does with matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Block,
    Allow,
    Route,
}

impl Default for Action {
    fn default() -> Self {
        Action::Block
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Block => write!(f, "block"),
            Action::Allow => write!(f, "allow"),
            Action::Route => write!(f, "route"),
        }
    }
}

/// Traffic direction a rule constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    Bidirection,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Bidirection
    }
}

impl Direction {
    /// Whether traffic flowing in `flow` can be constrained by this rule direction.
    pub fn covers(&self, flow: Direction) -> bool {
        match self {
            Direction::Bidirection => true,
            d => *d == flow || flow == Direction::Bidirection,
        }
    }
}

/// The target grammar of a rule. Each variant selects its own matching
/// semantics and its own packet-filter backend mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Ip,
    Net,
    Domain,
    Dns,
    Mac,
    Category,
    Country,
    Intranet,
    Internet,
    Network,
    Tag,
    Device,
    RemotePort,
    DevicePort,
    MatchGroup,
}

impl TargetType {
    /// Domain and dns rules share semantics everywhere.
    pub fn is_domain(&self) -> bool {
        matches!(self, TargetType::Domain | TargetType::Dns)
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Ip => "ip",
            TargetType::Net => "net",
            TargetType::Domain => "domain",
            TargetType::Dns => "dns",
            TargetType::Mac => "mac",
            TargetType::Category => "category",
            TargetType::Country => "country",
            TargetType::Intranet => "intranet",
            TargetType::Internet => "internet",
            TargetType::Network => "network",
            TargetType::Tag => "tag",
            TargetType::Device => "device",
            TargetType::RemotePort => "remote_port",
            TargetType::DevicePort => "device_port",
            TargetType::MatchGroup => "match_group",
        };
        write!(f, "{}", s)
    }
}

/// Sequence tier: lets the operator pin a rule above or below its natural
/// specificity band. Lower resulting rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeqTier {
    High,
    Regular,
    Low,
}

impl Default for SeqTier {
    fn default() -> Self {
        SeqTier::Regular
    }
}

impl SeqTier {
    pub fn rank_offset(&self) -> i32 {
        match self {
            SeqTier::High => -10,
            SeqTier::Regular => 0,
            SeqTier::Low => 10,
        }
    }
}

// ============================================================================
// UTILITY
// ============================================================================

/// Current wall clock as fractional epoch seconds, the unit used by every
/// persisted timestamp and sorted-set score.
pub fn now_ts() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_covers() {
        assert!(Direction::Bidirection.covers(Direction::Inbound));
        assert!(Direction::Inbound.covers(Direction::Inbound));
        assert!(!Direction::Inbound.covers(Direction::Outbound));
        assert!(Direction::Outbound.covers(Direction::Bidirection));
    }

    #[test]
    fn test_seq_tier_offsets() {
        assert!(SeqTier::High.rank_offset() < SeqTier::Regular.rank_offset());
        assert!(SeqTier::Regular.rank_offset() < SeqTier::Low.rank_offset());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(AlarmId::from(42).as_str(), "42");
        assert_eq!(PolicyId::new("7").to_string(), "7");
    }
}
