// Alarm value object.
//
// An alarm carries a variant tag, a timestamp, a related device and a
// payload of namespaced attributes:
//   p.*  primary    required to render the alarm list
//   e.*  extended   required only for the detail view, stored separately
//   r.*  reserved   internal bookkeeping, never rendered
//
// Variant behavior (required keys, dedup keys, cooldown, localization key
// derivation) lives on a closed enum rather than an open class hierarchy:
// adding a variant means adding an arm here, nowhere else.

use crate::types::AlarmId;
use crate::value_match::value_to_text;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

const DEFAULT_COOLDOWN_SECS: f64 = 15.0 * 60.0;
const FOUR_HOURS: f64 = 4.0 * 60.0 * 60.0;
const THIRTY_DAYS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Errors raised while constructing or validating an alarm.
#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("invalid alarm payload: missing required key {0}")]
    MissingRequiredKey(String),

    #[error("invalid alarm timestamp")]
    InvalidTimestamp,

    #[error("unknown alarm type: {0}")]
    UnknownType(String),
}

// ============================================================================
// VARIANT TABLE
// ============================================================================

/// Closed set of alarm variants. Each variant defines its own schema and
/// dedup behavior through the methods below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmType {
    NewDevice,
    DeviceBackOnline,
    DeviceOffline,
    SpoofingDevice,
    VpnClientConnection,
    Vulnerability,
    BroNotice,
    Intel,
    IntelReport,
    LargeUpload,
    Video,
    Game,
    Porn,
    Subnet,
    Upnp,
    OpenPort,
    Customized,
}

impl AlarmType {
    pub fn all() -> &'static [AlarmType] {
        &[
            AlarmType::NewDevice,
            AlarmType::DeviceBackOnline,
            AlarmType::DeviceOffline,
            AlarmType::SpoofingDevice,
            AlarmType::VpnClientConnection,
            AlarmType::Vulnerability,
            AlarmType::BroNotice,
            AlarmType::Intel,
            AlarmType::IntelReport,
            AlarmType::LargeUpload,
            AlarmType::Video,
            AlarmType::Game,
            AlarmType::Porn,
            AlarmType::Subnet,
            AlarmType::Upnp,
            AlarmType::OpenPort,
            AlarmType::Customized,
        ]
    }

    /// Persisted variant tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmType::NewDevice => "ALARM_NEW_DEVICE",
            AlarmType::DeviceBackOnline => "ALARM_DEVICE_BACK_ONLINE",
            AlarmType::DeviceOffline => "ALARM_DEVICE_OFFLINE",
            AlarmType::SpoofingDevice => "ALARM_SPOOFING_DEVICE",
            AlarmType::VpnClientConnection => "ALARM_VPN_CLIENT_CONNECTION",
            AlarmType::Vulnerability => "ALARM_VULNERABILITY",
            AlarmType::BroNotice => "ALARM_BRO_NOTICE",
            AlarmType::Intel => "ALARM_INTEL",
            AlarmType::IntelReport => "ALARM_INTEL_REPORT",
            AlarmType::LargeUpload => "ALARM_LARGE_UPLOAD",
            AlarmType::Video => "ALARM_VIDEO",
            AlarmType::Game => "ALARM_GAME",
            AlarmType::Porn => "ALARM_PORN",
            AlarmType::Subnet => "ALARM_SUBNET",
            AlarmType::Upnp => "ALARM_UPNP",
            AlarmType::OpenPort => "ALARM_OPENPORT",
            AlarmType::Customized => "ALARM_CUSTOMIZED",
        }
    }

    pub fn parse(s: &str) -> Result<AlarmType, AlarmError> {
        AlarmType::all()
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| AlarmError::UnknownType(s.to_string()))
    }

    /// Payload keys that must be present and non-empty for this variant.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            AlarmType::VpnClientConnection => &["p.dest.ip"],
            AlarmType::BroNotice | AlarmType::IntelReport | AlarmType::Customized => &[],
            AlarmType::Upnp => &[
                "p.device.mac",
                "p.upnp.protocol",
                "p.upnp.public.port",
                "p.upnp.private.host",
                "p.upnp.private.port",
            ],
            AlarmType::OpenPort => &["p.device.ip", "p.open.protocol", "p.open.port"],
            AlarmType::LargeUpload
            | AlarmType::Video
            | AlarmType::Game
            | AlarmType::Porn
            | AlarmType::Intel => &["p.device.name", "p.device.id", "p.dest.id"],
            _ => &["p.device.name", "p.device.id"],
        }
    }

    /// The attribute tuple compared to detect a repeat occurrence within the
    /// cooldown window.
    pub fn dedup_keys(&self) -> &'static [&'static str] {
        match self {
            AlarmType::NewDevice | AlarmType::DeviceBackOnline | AlarmType::DeviceOffline => {
                &["p.device.mac"]
            }
            AlarmType::SpoofingDevice => &["p.device.mac", "p.device.name", "p.device.ip"],
            AlarmType::VpnClientConnection => &["p.dest.ip"],
            AlarmType::Vulnerability => &["p.device.name", "p.device.id", "p.vid"],
            AlarmType::BroNotice => &["p.message", "p.device.name"],
            AlarmType::Intel => &["p.device.mac", "p.dest.name", "p.dest.port"],
            AlarmType::LargeUpload
            | AlarmType::Video
            | AlarmType::Game
            | AlarmType::Porn => &["p.device.mac", "p.dest.id"],
            AlarmType::Subnet => &["p.device.mac", "p.device.ip", "p.subnet.length"],
            AlarmType::Upnp => &[
                "p.device.mac",
                "p.upnp.protocol",
                "p.upnp.public.port",
                "p.upnp.private.host",
                "p.upnp.private.port",
            ],
            AlarmType::OpenPort => &["p.device.ip", "p.open.protocol", "p.open.port"],
            AlarmType::IntelReport | AlarmType::Customized => &[],
        }
    }

    /// Dedup window in seconds. New occurrences inside the window are dropped
    /// as duplicates.
    pub fn cooldown_secs(&self) -> f64 {
        match self {
            AlarmType::VpnClientConnection | AlarmType::LargeUpload => FOUR_HOURS,
            AlarmType::Subnet => THIRTY_DAYS,
            _ => DEFAULT_COOLDOWN_SECS,
        }
    }

    /// Security-classed variants; an `ALARM_INTEL` exception covers all of
    /// them, and security block rules receive a rank discount.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            AlarmType::Intel
                | AlarmType::BroNotice
                | AlarmType::Vulnerability
                | AlarmType::SpoofingDevice
        )
    }

    /// Emergency and customized alarms bypass the policy-match stage of the
    /// creation pipeline.
    pub fn participates_in_policy_match(&self) -> bool {
        !matches!(self, AlarmType::Customized | AlarmType::SpoofingDevice)
    }

    /// Whether this variant describes outbound flow activity; these share the
    /// destination-domain dedup equivalence.
    fn is_outbound(&self) -> bool {
        matches!(
            self,
            AlarmType::LargeUpload | AlarmType::Video | AlarmType::Game | AlarmType::Porn
        )
    }
}

impl fmt::Display for AlarmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// LIFECYCLE STATE
// ============================================================================

/// Lifecycle: init -> pending -> ready -> activated -> ignored.
/// `pending` only occurs when cloud arbitration sync is enabled. Archive
/// membership is a side table, not a state value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    Init,
    Pending,
    Ready,
    Activated,
    Ignored,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Init => "init",
            AlarmState::Pending => "pending",
            AlarmState::Ready => "ready",
            AlarmState::Activated => "activated",
            AlarmState::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<AlarmState> {
        match s {
            "init" => Some(AlarmState::Init),
            "pending" => Some(AlarmState::Pending),
            "ready" => Some(AlarmState::Ready),
            "activated" => Some(AlarmState::Activated),
            "ignored" => Some(AlarmState::Ignored),
            _ => None,
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ALARM
// ============================================================================

/// A generated security/event notification with typed payload and lifecycle
/// state. `aid` is assigned by the lifecycle manager on persist and is
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub aid: Option<AlarmId>,
    pub atype: AlarmType,
    /// When the event occurred (epoch seconds).
    pub timestamp: f64,
    /// When the alarm object was generated.
    pub alarm_timestamp: f64,
    /// Related device identifier (MAC or GUID).
    pub device: String,
    pub state: AlarmState,
    /// Namespaced p./e./r. attributes.
    pub payload: BTreeMap<String, Value>,
}

impl Alarm {
    pub fn new(atype: AlarmType, timestamp: f64, device: impl Into<String>) -> Self {
        Alarm {
            aid: None,
            atype,
            timestamp,
            alarm_timestamp: crate::types::now_ts(),
            device: device.into(),
            state: AlarmState::Init,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_payload(mut self, entries: Vec<(&str, Value)>) -> Self {
        for (k, v) in entries {
            self.payload.insert(k.to_string(), v);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Payload attribute rendered as text, the way the flattened persisted
    /// form stores it. Empty strings count as absent.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.payload
            .get(key)
            .and_then(value_to_text)
            .filter(|s| !s.is_empty())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.payload.insert(key.to_string(), value);
    }

    /// Primary + reserved attributes, persisted in the basic hash.
    pub fn basic_payload(&self) -> BTreeMap<String, Value> {
        self.payload
            .iter()
            .filter(|(k, _)| !k.starts_with("e."))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Extended attributes, persisted separately with their own TTL.
    pub fn extended_payload(&self) -> BTreeMap<String, Value> {
        self.payload
            .iter()
            .filter(|(k, _)| k.starts_with("e."))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Schema check: every required key must be present and non-empty.
    pub fn validate(&self) -> Result<(), AlarmError> {
        for key in self.atype.required_keys() {
            if self.get_text(key).is_none() {
                return Err(AlarmError::MissingRequiredKey(key.to_string()));
            }
        }
        if !self.timestamp.is_finite() || !self.alarm_timestamp.is_finite() {
            return Err(AlarmError::InvalidTimestamp);
        }
        Ok(())
    }

    pub fn cooldown_secs(&self) -> f64 {
        self.atype.cooldown_secs()
    }

    // ------------------------------------------------------------------------
    // Deduplication
    // ------------------------------------------------------------------------

    /// Whether `other` is a repeat occurrence of this alarm.
    ///
    /// Same variant with an equal dedup-key tuple is a duplicate. Two
    /// cross-variant carve-outs exist: outbound variants treat an equal
    /// destination domain as equivalent to an equal destination id, and an
    /// open-port alarm duplicates a UPnP alarm describing the same
    /// {device ip, protocol, port} exposure.
    pub fn is_dup(&self, other: &Alarm) -> bool {
        if self.open_port_upnp_dup(other) {
            return true;
        }

        if self.atype != other.atype {
            return false;
        }

        if self.atype.is_outbound() {
            return self.outbound_dup(other);
        }

        self.keys_all_equal(other, self.atype.dedup_keys())
    }

    fn keys_all_equal(&self, other: &Alarm, keys: &[&str]) -> bool {
        keys.iter().all(|k| {
            match (self.get_text(k), other.get_text(k)) {
                // absent or empty on either side is never a duplicate
                (Some(a), Some(b)) => loose_eq(&a, &b),
                _ => false,
            }
        })
    }

    fn outbound_dup(&self, other: &Alarm) -> bool {
        let mac = "p.device.mac";
        match (self.get_text(mac), other.get_text(mac)) {
            (Some(a), Some(b)) if a == b => {}
            _ => return false,
        }

        // same device; an equal destination domain short-circuits
        if let (Some(a), Some(b)) = (
            self.get_text("p.dest.domain"),
            other.get_text("p.dest.domain"),
        ) {
            if a == b {
                return true;
            }
        }

        match (self.get_text("p.dest.id"), other.get_text("p.dest.id")) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// An open port reported by the scanner and the same port mapped via UPnP
    /// describe one exposure.
    fn open_port_upnp_dup(&self, other: &Alarm) -> bool {
        let (open, upnp) = match (self.atype, other.atype) {
            (AlarmType::OpenPort, AlarmType::Upnp) => (self, other),
            (AlarmType::Upnp, AlarmType::OpenPort) => (other, self),
            _ => return false,
        };

        let pairs = [
            ("p.device.ip", "p.device.ip"),
            ("p.open.protocol", "p.upnp.protocol"),
            ("p.open.port", "p.upnp.public.port"),
        ];
        pairs.iter().all(|(ok, uk)| {
            match (open.get_text(ok), upnp.get_text(uk)) {
                (Some(a), Some(b)) => loose_eq(&a, &b),
                _ => false,
            }
        })
    }

    /// Stable digest of the variant tag plus dedup tuple, used as a cache key.
    pub fn dedup_signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.atype.as_str().as_bytes());
        for k in self.atype.dedup_keys() {
            hasher.update(b"|");
            if let Some(v) = self.get_text(k) {
                hasher.update(v.as_bytes());
            }
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    // ------------------------------------------------------------------------
    // Localization key derivation
    // ------------------------------------------------------------------------

    /// Localization category key for this alarm. Rendering itself is out of
    /// scope; only the key derivation lives here.
    pub fn i18n_category(&self) -> String {
        let mut category = match self.atype {
            AlarmType::Vulnerability => match self.get_text("p.vid") {
                Some(vid) => format!("{}_{}", self.atype.as_str(), vid),
                None => self.atype.as_str().to_string(),
            },
            AlarmType::BroNotice => match self.get_text("p.noticeType") {
                Some(n) => format!("{}_{}", self.atype.as_str(), n),
                None => self.atype.as_str().to_string(),
            },
            AlarmType::Intel => {
                if self.get("p.dest.url").is_some() {
                    "ALARM_URL_INTEL".to_string()
                } else {
                    self.atype.as_str().to_string()
                }
            }
            t => t.as_str().to_string(),
        };

        category = self.suffix_direction(category);
        self.suffix_auto_block(category)
    }

    pub fn notif_category(&self) -> String {
        format!("NOTIF_{}", self.i18n_category())
    }

    fn suffix_direction(&self, category: String) -> String {
        match self.get_text("p.local_is_client").as_deref() {
            Some("1") => format!("{}_OUTBOUND", category),
            Some(_) => format!("{}_INBOUND", category),
            None => category,
        }
    }

    fn suffix_auto_block(&self, category: String) -> String {
        let blocked = self.get_text("r.result").as_deref() == Some("block")
            && self.get_text("r.result_method").as_deref() == Some("auto");
        if blocked {
            format!("{}_AUTOBLOCK", category)
        } else {
            category
        }
    }
}

/// Loose scalar equality used by dedup comparison: numeric when both sides
/// coerce to finite numbers (`0` equals `"0"`), string equality otherwise.
fn loose_eq(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.is_finite() && y.is_finite() && x == y,
        _ => false,
    }
}
