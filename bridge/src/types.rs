//! Shared key names, pub/sub channels and event types used across the bridge.

use policy_engine::{AlarmId, Policy};
use serde::{Deserialize, Serialize};

// ============================================================================
// PERSISTED KEY LAYOUT
// ============================================================================

/// Monotonic counter keys.
pub const KEY_ALARM_ID: &str = "alarm:id";
pub const KEY_POLICY_ID: &str = "policy:id";
pub const KEY_EXCEPTION_ID: &str = "exception:id";

/// Hash key prefixes.
pub const PREFIX_ALARM: &str = "_alarm:";
pub const PREFIX_ALARM_DETAIL: &str = "_alarmDetail:";
pub const PREFIX_POLICY: &str = "policy:";
pub const PREFIX_EXCEPTION: &str = "exception:";

/// Ordered sets for alarm lifecycle membership.
pub const ZSET_ALARM_PENDING: &str = "alarm_pending";
pub const ZSET_ALARM_ACTIVE: &str = "alarm_active";
pub const ZSET_ALARM_ARCHIVE: &str = "alarm_archive";

/// Ordered set of live rules scored by creation timestamp.
pub const ZSET_POLICY_ACTIVE: &str = "policy_active";

/// Plain set of live exception ids.
pub const SET_EXCEPTION_QUEUE: &str = "exception_queue";

/// Default TTL for alarm basic and extended payload hashes.
pub const ALARM_TTL_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Policy id counter wraps here, skipping ids still holding a hash.
pub const POLICY_ID_WRAP: u64 = 65535;

// ============================================================================
// PUB/SUB CHANNELS
// ============================================================================

pub const CHANNEL_ALARM_CREATE: &str = "alarm:create";
pub const CHANNEL_ALARM_UPDATE_CACHE: &str = "alarm:updateCache";
pub const CHANNEL_ALARM_REMOVE_CACHE: &str = "alarm:removeCache";
pub const CHANNEL_ALARM_MSP_SYNC: &str = "alarm:mspsync";
pub const CHANNEL_FEATURE_DISABLE: &str = "config:feature:dynamic:disable";

/// Payload for the cache-coherence channels: one or more alarm ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheNotice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aids: Option<Vec<String>>,
}

impl CacheNotice {
    pub fn one(aid: &AlarmId) -> Self {
        CacheNotice {
            aid: Some(aid.as_str().to_string()),
            aids: None,
        }
    }

    pub fn many(aids: &[AlarmId]) -> Self {
        CacheNotice {
            aid: None,
            aids: Some(aids.iter().map(|a| a.as_str().to_string()).collect()),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(a) = &self.aid {
            out.push(a.clone());
        }
        if let Some(aids) = &self.aids {
            out.extend(aids.clone());
        }
        out
    }
}

// ============================================================================
// PRODUCED EVENTS
// ============================================================================

/// Events emitted by the managers for other subsystems to consume.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    NewAlarm { alarm_id: AlarmId },
    PolicyActivated { policy: Box<Policy> },
    PolicyDeactivated { policy: Box<Policy> },
}
