//! Bounded in-memory alarm index cache.
//!
//! Maps alarm type -> {aid -> lightweight record} so type-membership checks
//! during dedup do not re-read every alarm hash. Bounded by entry count and
//! age; a monotonic size estimator only feeds a high-memory warning, it never
//! evicts by itself. All mutations go through one mutex. A `reset` disables
//! cache-backed answers until the next backfill.

use log::warn;
use parking_lot::Mutex;
use policy_engine::{now_ts, AlarmState, AlarmType};
use serde_json::Value;
use std::collections::HashMap;

const SIZE_WARN_BYTES: usize = 5 * 1024 * 1024;

/// Lightweight per-alarm record; everything dedup needs, nothing more.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub atype: AlarmType,
    pub state: AlarmState,
    pub ts: f64,
    pub archived: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Per-type entry cap; oldest entries are dropped past it.
    pub max_entries_per_type: usize,
    /// Entries older than this are dropped on insert sweeps.
    pub max_age_secs: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_type: 10_000,
            max_age_secs: 30.0 * 24.0 * 60.0 * 60.0,
        }
    }
}

#[derive(Default)]
struct CacheInner {
    by_type: HashMap<AlarmType, HashMap<String, IndexRecord>>,
    /// False after `reset` until the next backfill.
    enabled: bool,
    estimated_bytes: usize,
    warned: bool,
}

/// Answer to a cache query: a definite membership answer, or a signal that
/// the requested type was never loaded and the caller must backfill.
#[derive(Debug, PartialEq, Eq)]
pub enum CacheAnswer {
    Hit(bool),
    NeedsBackfill,
}

pub struct AlarmIndexCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl AlarmIndexCache {
    pub fn new(config: CacheConfig) -> Self {
        AlarmIndexCache {
            config,
            inner: Mutex::new(CacheInner {
                enabled: true,
                ..CacheInner::default()
            }),
        }
    }

    pub fn add(&self, aid: &str, record: IndexRecord) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        let delta = record_size(aid, &record);
        let now = now_ts();
        let max_age = self.config.max_age_secs;
        let bucket = inner.by_type.entry(record.atype).or_default();
        bucket.retain(|_, r| now - r.ts <= max_age);
        if bucket.len() >= self.config.max_entries_per_type {
            // drop the oldest entry to make room
            if let Some(oldest) = bucket
                .iter()
                .min_by(|a, b| a.1.ts.partial_cmp(&b.1.ts).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(k, _)| k.clone())
            {
                bucket.remove(&oldest);
            }
        }
        bucket.insert(aid.to_string(), record);
        inner.estimated_bytes += delta;
        if inner.estimated_bytes > SIZE_WARN_BYTES && !inner.warned {
            inner.warned = true;
            warn!(
                "alarm index cache estimated at {} bytes, past the {} byte watermark",
                inner.estimated_bytes, SIZE_WARN_BYTES
            );
        }
    }

    pub fn remove(&self, aids: &[String]) {
        let mut inner = self.inner.lock();
        for bucket in inner.by_type.values_mut() {
            for aid in aids {
                bucket.remove(aid);
            }
        }
    }

    /// Update an existing record's state in place; a miss is ignored.
    pub fn set_state(&self, aid: &str, state: AlarmState, archived: bool) {
        let mut inner = self.inner.lock();
        for bucket in inner.by_type.values_mut() {
            if let Some(r) = bucket.get_mut(aid) {
                r.state = state;
                r.archived = archived;
            }
        }
    }

    /// Membership check used by dedup: is there a cached alarm of this type
    /// passing `pred`? Types never loaded report `NeedsBackfill`.
    pub fn query<F>(&self, atype: AlarmType, pred: F) -> CacheAnswer
    where
        F: Fn(&str, &IndexRecord) -> bool,
    {
        let inner = self.inner.lock();
        if !inner.enabled {
            return CacheAnswer::NeedsBackfill;
        }
        match inner.by_type.get(&atype) {
            Some(bucket) => CacheAnswer::Hit(bucket.iter().any(|(aid, r)| pred(aid, r))),
            None => CacheAnswer::NeedsBackfill,
        }
    }

    /// Ids of a type already cached, for backfill diffing.
    pub fn cached_ids(&self, atype: AlarmType) -> Vec<String> {
        self.inner
            .lock()
            .by_type
            .get(&atype)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Load a full batch of records, marking their types as known and
    /// re-enabling cache-backed answers.
    pub fn backfill(&self, entries: Vec<(String, IndexRecord)>, types_seen: &[AlarmType]) {
        let mut inner = self.inner.lock();
        for t in types_seen {
            inner.by_type.entry(*t).or_default();
        }
        for (aid, record) in entries {
            let delta = record_size(&aid, &record);
            inner.by_type.entry(record.atype).or_default().insert(aid, record);
            inner.estimated_bytes += delta;
        }
        inner.enabled = true;
    }

    /// Drop everything and stop answering until the next backfill.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.by_type.clear();
        inner.estimated_bytes = 0;
        inner.warned = false;
        inner.enabled = false;
    }

    pub fn estimated_bytes(&self) -> usize {
        self.inner.lock().estimated_bytes
    }
}

impl Default for AlarmIndexCache {
    fn default() -> Self {
        AlarmIndexCache::new(CacheConfig::default())
    }
}

// ============================================================================
// SIZE ESTIMATION
// ============================================================================

/// Rough heap-size estimate of a JSON value: 12 + 4*ceil(len/4) per string,
/// 8 per number, 4 per boolean, recursive over containers.
pub fn estimated_value_size(v: &Value) -> usize {
    match v {
        Value::Null => 4,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => 12 + 4 * s.len().div_ceil(4),
        Value::Array(a) => a.iter().map(estimated_value_size).sum(),
        Value::Object(o) => o
            .iter()
            .map(|(k, v)| 12 + 4 * k.len().div_ceil(4) + estimated_value_size(v))
            .sum(),
    }
}

fn record_size(aid: &str, r: &IndexRecord) -> usize {
    let as_value = serde_json::json!({
        "aid": aid,
        "type": r.atype.as_str(),
        "state": r.state.as_str(),
        "ts": r.ts,
        "archived": r.archived,
    });
    estimated_value_size(&as_value)
}
