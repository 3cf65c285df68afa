//! Opaque key-value + sorted-set store.
//!
//! The persistence engine is out of scope; this is an in-memory stand-in
//! behind the narrow API the managers actually use: hashes with TTL,
//! ordered sets, plain sets, monotonic counters, and atomic multi-command
//! batches. All state sits behind one mutex so a batch is atomic by
//! construction.

use parking_lot::Mutex;
use policy_engine::now_ts;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use crate::types::{POLICY_ID_WRAP, PREFIX_POLICY};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store key not found: {0}")]
    NotFound(String),

    #[error("policy id space exhausted")]
    IdSpaceExhausted,
}

/// One command inside an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    HashSet {
        key: String,
        fields: BTreeMap<String, String>,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl_secs: f64,
    },
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    /// Add only when the member is not already present (idempotent add).
    ZAddNx {
        key: String,
        score: f64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
}

#[derive(Default)]
struct StoreInner {
    hashes: HashMap<String, BTreeMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, u64>,
    /// Absolute expiry timestamps, purged lazily on access.
    expiries: HashMap<String, f64>,
}

impl StoreInner {
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(at) = self.expiries.get(key) {
            if *at <= now_ts() {
                self.expiries.remove(key);
                self.hashes.remove(key);
            }
        }
    }

    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::HashSet { key, fields } => {
                self.hashes.entry(key).or_default().extend(fields);
            }
            StoreOp::Del { key } => {
                self.hashes.remove(&key);
                self.zsets.remove(&key);
                self.sets.remove(&key);
                self.expiries.remove(&key);
            }
            StoreOp::Expire { key, ttl_secs } => {
                self.expiries.insert(key, now_ts() + ttl_secs);
            }
            StoreOp::ZAdd { key, score, member } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            StoreOp::ZAddNx { key, score, member } => {
                self.zsets.entry(key).or_default().entry(member).or_insert(score);
            }
            StoreOp::ZRem { key, member } => {
                if let Some(z) = self.zsets.get_mut(&key) {
                    z.remove(&member);
                }
            }
            StoreOp::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            StoreOp::SRem { key, member } => {
                if let Some(s) = self.sets.get_mut(&key) {
                    s.remove(&member);
                }
            }
        }
    }
}

/// In-memory store handle, cheap to clone through an `Arc`.
#[derive(Default)]
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    // ------------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------------

    /// Increment-and-get a monotonic counter.
    pub fn incr(&self, key: &str) -> u64 {
        let mut inner = self.inner.lock();
        let c = inner.counters.entry(key.to_string()).or_insert(0);
        *c += 1;
        *c
    }

    /// Next policy id: wraps at the id-space boundary, skipping ids whose
    /// hash still exists.
    pub fn next_policy_id(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let start = *inner.counters.get(crate::types::KEY_POLICY_ID).unwrap_or(&0);
        let mut candidate = start;
        for _ in 0..POLICY_ID_WRAP {
            candidate = candidate % POLICY_ID_WRAP + 1;
            let key = format!("{}{}", PREFIX_POLICY, candidate);
            if !inner.hashes.contains_key(&key) {
                inner
                    .counters
                    .insert(crate::types::KEY_POLICY_ID.to_string(), candidate);
                return Ok(candidate);
            }
        }
        Err(StoreError::IdSpaceExhausted)
    }

    // ------------------------------------------------------------------------
    // Hashes
    // ------------------------------------------------------------------------

    pub fn hash_set(&self, key: &str, fields: BTreeMap<String, String>) {
        self.inner.lock().apply(StoreOp::HashSet {
            key: key.to_string(),
            fields,
        });
    }

    pub fn hash_get_all(&self, key: &str) -> Option<BTreeMap<String, String>> {
        let mut inner = self.inner.lock();
        inner.purge_if_expired(key);
        inner.hashes.get(key).cloned()
    }

    pub fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.purge_if_expired(key);
        inner.hashes.get(key).and_then(|h| h.get(field).cloned())
    }

    pub fn exists(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.purge_if_expired(key);
        inner.hashes.contains_key(key)
    }

    pub fn del(&self, key: &str) {
        self.inner.lock().apply(StoreOp::Del {
            key: key.to_string(),
        });
    }

    pub fn expire(&self, key: &str, ttl_secs: f64) {
        self.inner.lock().apply(StoreOp::Expire {
            key: key.to_string(),
            ttl_secs,
        });
    }

    // ------------------------------------------------------------------------
    // Ordered sets
    // ------------------------------------------------------------------------

    pub fn zadd(&self, key: &str, score: f64, member: &str) {
        self.inner.lock().apply(StoreOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        });
    }

    pub fn zadd_nx(&self, key: &str, score: f64, member: &str) {
        self.inner.lock().apply(StoreOp::ZAddNx {
            key: key.to_string(),
            score,
            member: member.to_string(),
        });
    }

    pub fn zrem(&self, key: &str, member: &str) {
        self.inner.lock().apply(StoreOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    pub fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        self.inner.lock().zsets.get(key).and_then(|z| z.get(member).copied())
    }

    /// Members with `min <= score <= max`, ascending by score.
    pub fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Vec<String> {
        let inner = self.inner.lock();
        let Some(z) = inner.zsets.get(key) else {
            return Vec::new();
        };
        let mut members: Vec<(&String, f64)> = z
            .iter()
            .filter(|(_, s)| **s >= min && **s <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        members.into_iter().map(|(m, _)| m.clone()).collect()
    }

    /// All members, descending by score (newest first).
    pub fn zrevrange(&self, key: &str) -> Vec<String> {
        let mut members = self.zrange_by_score(key, f64::MIN, f64::MAX);
        members.reverse();
        members
    }

    pub fn zmembers(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .zsets
            .get(key)
            .map(|z| z.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn zcard(&self, key: &str) -> usize {
        self.inner.lock().zsets.get(key).map(|z| z.len()).unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Plain sets
    // ------------------------------------------------------------------------

    pub fn sadd(&self, key: &str, member: &str) {
        self.inner.lock().apply(StoreOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    pub fn srem(&self, key: &str, member: &str) {
        self.inner.lock().apply(StoreOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    pub fn smembers(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sismember(&self, key: &str, member: &str) -> bool {
        self.inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Atomic batches
    // ------------------------------------------------------------------------

    /// Apply every command under one lock acquisition; no partial state is
    /// ever visible to other callers.
    pub fn batch(&self, ops: Vec<StoreOp>) {
        let mut inner = self.inner.lock();
        for op in ops {
            inner.apply(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_counter_monotonic() {
        let s = Store::new();
        assert_eq!(s.incr("alarm:id"), 1);
        assert_eq!(s.incr("alarm:id"), 2);
        assert_eq!(s.incr("other"), 1);
    }

    #[test]
    fn test_policy_id_skips_occupied() {
        let s = Store::new();
        assert_eq!(s.next_policy_id().unwrap(), 1);
        // simulate a survivor at id 2
        s.hash_set("policy:2", fields(&[("type", "ip")]));
        assert_eq!(s.next_policy_id().unwrap(), 3);
    }

    #[test]
    fn test_policy_id_wraps() {
        let s = Store::new();
        s.inner
            .lock()
            .counters
            .insert("policy:id".to_string(), POLICY_ID_WRAP);
        assert_eq!(s.next_policy_id().unwrap(), 1);
    }

    #[test]
    fn test_hash_ttl_expiry() {
        let s = Store::new();
        s.hash_set("_alarm:1", fields(&[("type", "ALARM_GAME")]));
        s.expire("_alarm:1", -1.0); // already past
        assert!(s.hash_get_all("_alarm:1").is_none());
    }

    #[test]
    fn test_zset_score_ordering() {
        let s = Store::new();
        s.zadd("z", 3.0, "c");
        s.zadd("z", 1.0, "a");
        s.zadd("z", 2.0, "b");
        assert_eq!(s.zrange_by_score("z", 1.5, 3.5), vec!["b", "c"]);
        assert_eq!(s.zrevrange("z"), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_zadd_nx_is_idempotent() {
        let s = Store::new();
        s.zadd("z", 5.0, "m");
        s.zadd_nx("z", 9.0, "m");
        assert_eq!(s.zscore("z", "m"), Some(5.0));
    }

    #[test]
    fn test_batch_atomicity_shape() {
        let s = Store::new();
        s.batch(vec![
            StoreOp::ZAdd {
                key: "alarm_active".into(),
                score: 10.0,
                member: "1".into(),
            },
            StoreOp::ZRem {
                key: "alarm_pending".into(),
                member: "1".into(),
            },
        ]);
        assert_eq!(s.zscore("alarm_active", "1"), Some(10.0));
        assert_eq!(s.zcard("alarm_pending"), 0);
    }
}
