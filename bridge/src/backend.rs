//! Packet-filter backend abstraction.
//!
//! The kernel packet filter and its named-set primitives live outside this
//! crate; enforcement talks to them through this trait. `MemoryBackend` is a
//! faithful in-memory model used in tests to verify enforcement symmetry:
//! whatever enforce creates, unenforce must tear down.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("named set not found: {0}")]
    SetNotFound(String),

    #[error("named set already exists: {0}")]
    SetExists(String),

    #[error("backend command failed: {0}")]
    CommandFailed(String),
}

/// Element kind a named set holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    Ip,
    Net,
    Port,
    MacIpPort,
}

/// One installed filter rule referencing named sets.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRule {
    /// Owning policy id; rules are removed by this handle.
    pub owner: String,
    pub action: String,
    pub match_set: Option<String>,
    pub direction: String,
    pub protocol: Option<String>,
    pub ports: Option<String>,
}

#[async_trait]
pub trait PacketFilterBackend: Send + Sync {
    async fn create_set(&self, name: &str, kind: SetKind) -> Result<(), BackendError>;

    async fn destroy_set(&self, name: &str) -> Result<(), BackendError>;

    async fn set_exists(&self, name: &str) -> bool;

    async fn add_to_set(&self, name: &str, entries: &[String]) -> Result<(), BackendError>;

    async fn remove_from_set(&self, name: &str, entries: &[String]) -> Result<(), BackendError>;

    /// Snapshot of a set's members, used by the 60-second ACL lookup cache.
    async fn set_members(&self, name: &str) -> Result<Vec<String>, BackendError>;

    async fn install_rule(&self, rule: FilterRule) -> Result<(), BackendError>;

    /// Remove every rule installed under `owner`.
    async fn remove_rules(&self, owner: &str) -> Result<(), BackendError>;

    /// DNS-filter-layer entry (domain blocking before any connection).
    async fn add_dns_entry(&self, owner: &str, domain: &str) -> Result<(), BackendError>;

    async fn remove_dns_entries(&self, owner: &str) -> Result<(), BackendError>;
}

// ============================================================================
// IN-MEMORY MODEL
// ============================================================================

#[derive(Default)]
struct BackendState {
    sets: HashMap<String, (SetKind, HashSet<String>)>,
    rules: Vec<FilterRule>,
    dns_entries: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<BackendState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    pub fn set_names(&self) -> Vec<String> {
        self.state.read().sets.keys().cloned().collect()
    }

    pub fn rule_count(&self) -> usize {
        self.state.read().rules.len()
    }

    pub fn rules_for(&self, owner: &str) -> Vec<FilterRule> {
        self.state
            .read()
            .rules
            .iter()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect()
    }

    pub fn dns_entries_for(&self, owner: &str) -> Vec<String> {
        self.state
            .read()
            .dns_entries
            .get(owner)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PacketFilterBackend for MemoryBackend {
    async fn create_set(&self, name: &str, kind: SetKind) -> Result<(), BackendError> {
        let mut state = self.state.write();
        if state.sets.contains_key(name) {
            return Err(BackendError::SetExists(name.to_string()));
        }
        state.sets.insert(name.to_string(), (kind, HashSet::new()));
        Ok(())
    }

    async fn destroy_set(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.write();
        state
            .sets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::SetNotFound(name.to_string()))
    }

    async fn set_exists(&self, name: &str) -> bool {
        self.state.read().sets.contains_key(name)
    }

    async fn add_to_set(&self, name: &str, entries: &[String]) -> Result<(), BackendError> {
        let mut state = self.state.write();
        let set = state
            .sets
            .get_mut(name)
            .ok_or_else(|| BackendError::SetNotFound(name.to_string()))?;
        set.1.extend(entries.iter().cloned());
        Ok(())
    }

    async fn remove_from_set(&self, name: &str, entries: &[String]) -> Result<(), BackendError> {
        let mut state = self.state.write();
        let set = state
            .sets
            .get_mut(name)
            .ok_or_else(|| BackendError::SetNotFound(name.to_string()))?;
        for e in entries {
            set.1.remove(e);
        }
        Ok(())
    }

    async fn set_members(&self, name: &str) -> Result<Vec<String>, BackendError> {
        self.state
            .read()
            .sets
            .get(name)
            .map(|(_, members)| members.iter().cloned().collect())
            .ok_or_else(|| BackendError::SetNotFound(name.to_string()))
    }

    async fn install_rule(&self, rule: FilterRule) -> Result<(), BackendError> {
        self.state.write().rules.push(rule);
        Ok(())
    }

    async fn remove_rules(&self, owner: &str) -> Result<(), BackendError> {
        self.state.write().rules.retain(|r| r.owner != owner);
        Ok(())
    }

    async fn add_dns_entry(&self, owner: &str, domain: &str) -> Result<(), BackendError> {
        self.state
            .write()
            .dns_entries
            .entry(owner.to_string())
            .or_default()
            .insert(domain.to_string());
        Ok(())
    }

    async fn remove_dns_entries(&self, owner: &str) -> Result<(), BackendError> {
        self.state.write().dns_entries.remove(owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_lifecycle() {
        let b = MemoryBackend::new();
        b.create_set("s1", SetKind::Ip).await.unwrap();
        assert!(b.set_exists("s1").await);
        assert!(matches!(
            b.create_set("s1", SetKind::Ip).await,
            Err(BackendError::SetExists(_))
        ));
        b.add_to_set("s1", &["1.2.3.4".to_string()]).await.unwrap();
        assert_eq!(b.set_members("s1").await.unwrap(), vec!["1.2.3.4"]);
        b.destroy_set("s1").await.unwrap();
        assert!(!b.set_exists("s1").await);
    }

    #[tokio::test]
    async fn test_rules_keyed_by_owner() {
        let b = MemoryBackend::new();
        let rule = FilterRule {
            owner: "7".to_string(),
            action: "block".to_string(),
            match_set: Some("s1".to_string()),
            direction: "bidirection".to_string(),
            protocol: None,
            ports: None,
        };
        b.install_rule(rule.clone()).await.unwrap();
        b.install_rule(FilterRule {
            owner: "8".to_string(),
            ..rule.clone()
        })
        .await
        .unwrap();
        assert_eq!(b.rule_count(), 2);
        b.remove_rules("7").await.unwrap();
        assert_eq!(b.rule_count(), 1);
        assert!(b.rules_for("7").is_empty());
    }

    #[tokio::test]
    async fn test_dns_entries() {
        let b = MemoryBackend::new();
        b.add_dns_entry("7", "evil.com").await.unwrap();
        b.add_dns_entry("7", "bad.com").await.unwrap();
        assert_eq!(b.dns_entries_for("7").len(), 2);
        b.remove_dns_entries("7").await.unwrap();
        assert!(b.dns_entries_for("7").is_empty());
    }
}
