//! Exception persistence and alarm-suppression matching.
//!
//! Exceptions live in `exception:<eid>` hashes with membership in the
//! `exception_queue` set. Matching filters out expired, paused and
//! out-of-schedule exceptions first so the predicate itself stays pure.
//! Match counts are incremented fire-and-forget.

use log::{debug, info, warn};
use policy_engine::{Alarm, CategoryMatcher, Exception, ExceptionId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::store::Store;
use crate::types::{KEY_EXCEPTION_ID, PREFIX_EXCEPTION, SET_EXCEPTION_QUEUE};

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum ExceptionError {
    #[error("exception {0} not found")]
    NotFound(String),

    #[error("exception serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Outcome of a save: either a fresh exception or the already-existing twin.
#[derive(Debug)]
pub enum SaveOutcome {
    Created(ExceptionId),
    AlreadyExists(ExceptionId),
}

pub struct ExceptionManager {
    store: Arc<Store>,
    categories: Arc<dyn CategoryMatcher>,
    /// The appliance's own cloud domains are always treated as covered.
    cloud_domains: Vec<String>,
}

impl ExceptionManager {
    pub fn new(store: Arc<Store>, categories: Arc<dyn CategoryMatcher>) -> Self {
        ExceptionManager {
            store,
            categories,
            cloud_domains: Vec::new(),
        }
    }

    pub fn with_cloud_domains(mut self, domains: Vec<String>) -> Self {
        self.cloud_domains = domains;
        self
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    /// Persist an exception. Saving a predicate identical to an existing one
    /// returns the existing id instead of writing a twin.
    pub fn save(&self, mut exception: Exception) -> Result<SaveOutcome, ExceptionError> {
        for existing in self.load_all() {
            if existing.is_same_predicate(&exception) {
                let eid = existing.eid.clone().unwrap_or_else(|| ExceptionId::new(""));
                debug!("exception save deduplicated onto {}", eid);
                return Ok(SaveOutcome::AlreadyExists(eid));
            }
        }

        let eid = ExceptionId::from(self.store.incr(KEY_EXCEPTION_ID));
        exception.eid = Some(eid.clone());
        self.write(&exception)?;
        self.store.sadd(SET_EXCEPTION_QUEUE, eid.as_str());
        info!("exception {} saved", eid);
        Ok(SaveOutcome::Created(eid))
    }

    pub fn update(&self, exception: &Exception) -> Result<(), ExceptionError> {
        let eid = exception
            .eid
            .as_ref()
            .ok_or_else(|| ExceptionError::NotFound("<unassigned>".to_string()))?;
        if !self.store.sismember(SET_EXCEPTION_QUEUE, eid.as_str()) {
            return Err(ExceptionError::NotFound(eid.as_str().to_string()));
        }
        self.write(exception)
    }

    pub fn delete(&self, eid: &ExceptionId) {
        self.store.del(&format!("{}{}", PREFIX_EXCEPTION, eid.as_str()));
        self.store.srem(SET_EXCEPTION_QUEUE, eid.as_str());
    }

    pub fn get(&self, eid: &ExceptionId) -> Option<Exception> {
        let key = format!("{}{}", PREFIX_EXCEPTION, eid.as_str());
        let raw = self.store.hash_get(&key, "json")?;
        serde_json::from_str(&raw).ok()
    }

    pub fn load_all(&self) -> Vec<Exception> {
        self.store
            .smembers(SET_EXCEPTION_QUEUE)
            .into_iter()
            .filter_map(|eid| self.get(&ExceptionId::new(eid)))
            .collect()
    }

    fn write(&self, exception: &Exception) -> Result<(), ExceptionError> {
        let Some(eid) = exception.eid.as_ref() else {
            return Err(ExceptionError::NotFound("<unassigned>".to_string()));
        };
        let key = format!("{}{}", PREFIX_EXCEPTION, eid.as_str());
        let json = serde_json::to_string(exception)?;
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("json".to_string(), json);
        self.store.hash_set(&key, fields);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------------

    /// Exceptions currently suppressing `alarm`: live (non-expired,
    /// non-paused, in-schedule) exceptions whose predicate matches.
    pub fn match_alarm(&self, alarm: &Alarm) -> Vec<ExceptionId> {
        let now = policy_engine::now_ts();
        self.load_all()
            .into_iter()
            .filter(|e| !e.is_expired_at(now) && !e.is_idle_at(now) && e.in_schedule_at(now))
            .filter(|e| e.match_alarm(alarm, self.categories.as_ref()))
            .filter_map(|e| e.eid)
            .collect()
    }

    /// The appliance's own cloud endpoints never raise alarms.
    pub fn covers_cloud_endpoint(&self, alarm: &Alarm) -> bool {
        let Some(dest) = alarm.get_text("p.dest.name") else {
            return false;
        };
        let dest = dest.to_lowercase();
        self.cloud_domains
            .iter()
            .any(|d| policy_engine::domain_covers(d, &dest))
    }

    /// Fire-and-forget match-count bump for each matched exception.
    pub fn increment_match_counts(self: &Arc<Self>, eids: Vec<ExceptionId>) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            for eid in eids {
                if let Some(mut e) = mgr.get(&eid) {
                    e.match_count += 1;
                    if let Err(err) = mgr.write(&e) {
                        warn!("match count update for {} failed: {}", eid, err);
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Expiry sweep
    // ------------------------------------------------------------------------

    /// Drop every exception past its absolute expiry. Returns the pruned ids.
    pub fn sweep_expired(&self) -> Vec<ExceptionId> {
        let now = policy_engine::now_ts();
        let mut pruned = Vec::new();
        for e in self.load_all() {
            if e.is_expired_at(now) {
                if let Some(eid) = e.eid {
                    info!("exception {} expired, pruning", eid);
                    self.delete(&eid);
                    pruned.push(eid);
                }
            }
        }
        pruned
    }

    /// Periodic sweep task; spawn once at startup.
    pub async fn run_expiry_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep_expired();
        }
    }
}
