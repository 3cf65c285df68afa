//! Contracts for the external collaborators the managers depend on.
//!
//! Everything here is out of scope as an implementation: device/identity
//! resolution, DNS enrichment, cloud arbitration, trust lists, VPN client
//! status, cron scheduling and usage quotas are consumed through these traits
//! and stubbed in tests.

use async_trait::async_trait;
use policy_engine::{Alarm, Policy, PolicyId};
use serde::{Deserialize, Serialize};

// ============================================================================
// DEVICE / DNS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub mac: String,
    pub ip: Option<String>,
    pub vendor: Option<String>,
    pub name: Option<String>,
    /// Devices with ACL matching disabled skip the policy-match stage of
    /// alarm creation.
    pub acl_enabled: bool,
}

#[async_trait]
pub trait DeviceResolver: Send + Sync {
    /// Resolve a MAC address or GUID to device identity, or None if unknown.
    async fn resolve(&self, id: &str) -> Option<DeviceInfo>;
}

#[async_trait]
pub trait DnsEnrichment: Send + Sync {
    async fn resolve_domain(&self, domain: &str) -> Vec<String>;

    async fn reverse_lookup(&self, ip: &str) -> Option<String>;
}

// ============================================================================
// CLOUD ARBITRATION / TRUST
// ============================================================================

/// Outcome of the external cloud arbitration call during alarm creation.
#[derive(Debug, Clone)]
pub enum ArbitrationVerdict {
    /// Proceed, possibly with a rewritten alarm.
    Approved(Box<Alarm>),
    /// Drop the alarm silently; creation succeeds with nothing persisted.
    Ignore,
    /// The verdict payload was unusable.
    Invalid(String),
}

#[async_trait]
pub trait CloudArbiter: Send + Sync {
    /// Whether arbitration sync is enabled at all; when false, alarms skip
    /// the pending state entirely.
    fn enabled(&self) -> bool;

    async fn verdict(&self, alarm: &Alarm) -> ArbitrationVerdict;
}

#[async_trait]
pub trait TrustMatcher: Send + Sync {
    async fn match_alarm(&self, alarm: &Alarm) -> bool;
}

// ============================================================================
// CATEGORY / VPN
// ============================================================================

/// Handles to backend named sets maintained for a category by the data feed.
#[derive(Debug, Clone)]
pub struct CategorySetHandles {
    pub block_set: String,
    pub allow_set: String,
}

#[async_trait]
pub trait CategoryProvider: Send + Sync {
    /// Ensure the aggregate sets for `category` exist and return their names.
    async fn activate(&self, category: &str) -> CategorySetHandles;
}

#[async_trait]
pub trait VpnClientStatus: Send + Sync {
    async fn is_enabled(&self, profile_id: &str) -> bool;

    async fn is_connected(&self, profile_id: &str) -> bool;

    /// Kill-switch: traffic is dropped rather than leaked when the client is
    /// down.
    async fn is_strict(&self, profile_id: &str) -> bool;
}

// ============================================================================
// SCHEDULING / QUOTA
// ============================================================================

/// External recurring scheduler. Registered policies get their enforce and
/// unenforce callbacks invoked at cron-window boundaries with the cron field
/// stripped, so the callback cannot re-enter scheduling.
#[async_trait]
pub trait CronScheduler: Send + Sync {
    async fn register_policy(&self, policy: &Policy);

    async fn deregister_policy(&self, pid: &PolicyId);
}

#[async_trait]
pub trait QuotaManager: Send + Sync {
    async fn register_policy(&self, policy: &Policy);

    async fn deregister_policy(&self, pid: &PolicyId);
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

/// Inert collaborator set for tests and partial deployments.
pub struct NullCollaborators;

#[async_trait]
impl DeviceResolver for NullCollaborators {
    async fn resolve(&self, id: &str) -> Option<DeviceInfo> {
        Some(DeviceInfo {
            mac: id.to_string(),
            ip: None,
            vendor: None,
            name: None,
            acl_enabled: true,
        })
    }
}

#[async_trait]
impl DnsEnrichment for NullCollaborators {
    async fn resolve_domain(&self, _domain: &str) -> Vec<String> {
        Vec::new()
    }

    async fn reverse_lookup(&self, _ip: &str) -> Option<String> {
        None
    }
}

#[async_trait]
impl CloudArbiter for NullCollaborators {
    fn enabled(&self) -> bool {
        false
    }

    async fn verdict(&self, alarm: &Alarm) -> ArbitrationVerdict {
        ArbitrationVerdict::Approved(Box::new(alarm.clone()))
    }
}

#[async_trait]
impl TrustMatcher for NullCollaborators {
    async fn match_alarm(&self, _alarm: &Alarm) -> bool {
        false
    }
}

#[async_trait]
impl CategoryProvider for NullCollaborators {
    async fn activate(&self, category: &str) -> CategorySetHandles {
        CategorySetHandles {
            block_set: format!("category_{}_block", category),
            allow_set: format!("category_{}_allow", category),
        }
    }
}

#[async_trait]
impl VpnClientStatus for NullCollaborators {
    async fn is_enabled(&self, _profile_id: &str) -> bool {
        true
    }

    async fn is_connected(&self, _profile_id: &str) -> bool {
        true
    }

    async fn is_strict(&self, _profile_id: &str) -> bool {
        false
    }
}

#[async_trait]
impl CronScheduler for NullCollaborators {
    async fn register_policy(&self, _policy: &Policy) {}

    async fn deregister_policy(&self, _pid: &PolicyId) {}
}

#[async_trait]
impl QuotaManager for NullCollaborators {
    async fn register_policy(&self, _policy: &Policy) {}

    async fn deregister_policy(&self, _pid: &PolicyId) {}
}
