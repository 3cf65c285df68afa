//! Alarm lifecycle manager.
//!
//! Owns the creation pipeline (enrich, validate, dedup, exception match,
//! policy match, trust match, cloud arbitration, persist + activate), the
//! state transitions afterwards, the pending-set sweep and the bounded index
//! cache with its pub/sub coherence. Pipeline aborts are expected outcomes,
//! logged at info and surfaced as typed errors.

use log::{debug, info, warn};
use parking_lot::Mutex;
use policy_engine::{
    now_ts, Action, Alarm, AlarmError, AlarmId, AlarmState, AlarmType, CategoryMatcher,
    ExceptionId, Policy, PolicyId, TargetType,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::cache::{AlarmIndexCache, CacheAnswer, IndexRecord};
use crate::collaborators::{ArbitrationVerdict, CloudArbiter, DeviceResolver, TrustMatcher};
use crate::exception_manager::ExceptionManager;
use crate::policy_manager::PolicyManager;
use crate::pubsub::PubSub;
use crate::store::{Store, StoreOp};
use crate::types::{
    BridgeEvent, CacheNotice, ALARM_TTL_SECS, CHANNEL_ALARM_CREATE, CHANNEL_ALARM_REMOVE_CACHE,
    CHANNEL_ALARM_UPDATE_CACHE, KEY_ALARM_ID, PREFIX_ALARM, PREFIX_ALARM_DETAIL,
    ZSET_ALARM_ACTIVE, ZSET_ALARM_ARCHIVE, ZSET_ALARM_PENDING,
};

const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Typed pipeline aborts; all expected control flow, never defects.
#[derive(Debug, Error)]
pub enum AlarmCreateAbort {
    #[error("duplicate of alarm {0}")]
    Duplicate(AlarmId),

    #[error("covered by exception(s) {0:?}")]
    CoveredByException(Vec<ExceptionId>),

    #[error("already blocked by policy {0}")]
    BlockedByPolicy(PolicyId),

    #[error("already covered by trust list")]
    BlockedByTrust,

    #[error(transparent)]
    InvalidPayload(#[from] AlarmError),

    #[error("cloud arbitration verdict unusable: {0}")]
    InvalidCloudVerdict(String),
}

#[derive(Debug)]
pub enum AlarmCreateOutcome {
    Created(AlarmId),
    /// Cloud arbitration said to drop it; success with nothing persisted.
    CloudIgnored,
}

pub type PostCreateHook = Box<dyn Fn(&Alarm) + Send + Sync>;

#[derive(Clone)]
pub struct AlarmManagerConfig {
    /// Auto-block the destination of security alarms.
    pub auto_block: bool,
    /// Destinations never auto-blocked.
    pub unblock_allowlist: Vec<String>,
    /// Pending entries older than this are promoted or pruned by the sweep.
    pub pending_timeout_secs: f64,
}

impl Default for AlarmManagerConfig {
    fn default() -> Self {
        Self {
            auto_block: false,
            unblock_allowlist: Vec::new(),
            pending_timeout_secs: 15.0 * 60.0,
        }
    }
}

pub struct AlarmManagerDeps {
    pub store: Arc<Store>,
    pub pubsub: Arc<PubSub>,
    pub cache: Arc<AlarmIndexCache>,
    pub policies: Arc<PolicyManager>,
    pub exceptions: Arc<ExceptionManager>,
    pub categories: Arc<dyn CategoryMatcher>,
    pub devices: Arc<dyn DeviceResolver>,
    pub trust: Arc<dyn TrustMatcher>,
    pub arbiter: Arc<dyn CloudArbiter>,
    pub config: AlarmManagerConfig,
}

pub struct AlarmManager {
    store: Arc<Store>,
    pubsub: Arc<PubSub>,
    cache: Arc<AlarmIndexCache>,
    policies: Arc<PolicyManager>,
    exceptions: Arc<ExceptionManager>,
    categories: Arc<dyn CategoryMatcher>,
    devices: Arc<dyn DeviceResolver>,
    trust: Arc<dyn TrustMatcher>,
    arbiter: Arc<dyn CloudArbiter>,
    config: AlarmManagerConfig,
    events: broadcast::Sender<BridgeEvent>,
    post_hook: Mutex<Option<PostCreateHook>>,
}

impl AlarmManager {
    pub fn new(deps: AlarmManagerDeps) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(AlarmManager {
            store: deps.store,
            pubsub: deps.pubsub,
            cache: deps.cache,
            policies: deps.policies,
            exceptions: deps.exceptions,
            categories: deps.categories,
            devices: deps.devices,
            trust: deps.trust,
            arbiter: deps.arbiter,
            config: deps.config,
            events,
            post_hook: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn set_post_create_hook(&self, hook: PostCreateHook) {
        *self.post_hook.lock() = Some(hook);
    }

    // ------------------------------------------------------------------------
    // Creation pipeline
    // ------------------------------------------------------------------------

    /// The whole creation pipeline as one logical transaction: each stage
    /// either aborts with a typed error or proceeds; there is no rollback.
    pub async fn create_alarm(
        &self,
        mut alarm: Alarm,
    ) -> Result<AlarmCreateOutcome, AlarmCreateAbort> {
        // 1. enrich device identity
        let acl_enabled = self.enrich(&mut alarm).await;

        // 2. schema validation
        alarm.validate()?;

        // 3. dedup against live alarms inside the cooldown window
        if let Some(existing) = self.find_duplicate(&alarm) {
            info!("alarm creation aborted: duplicate of {}", existing);
            return Err(AlarmCreateAbort::Duplicate(existing));
        }

        // 4. exception coverage
        if self.exceptions.covers_cloud_endpoint(&alarm) {
            info!("alarm creation aborted: appliance cloud endpoint");
            return Err(AlarmCreateAbort::CoveredByException(Vec::new()));
        }
        let matched = self.exceptions.match_alarm(&alarm);
        if !matched.is_empty() {
            info!("alarm creation aborted: covered by exceptions {:?}", matched);
            self.exceptions.increment_match_counts(matched.clone());
            return Err(AlarmCreateAbort::CoveredByException(matched));
        }

        // 5. already handled by a block rule
        if acl_enabled && alarm.atype.participates_in_policy_match() {
            if let Some(policy) = self
                .policies
                .find_policy_match(&alarm, self.categories.as_ref())
            {
                if let Some(pid) = policy.pid {
                    info!("alarm creation aborted: blocked by policy {}", pid);
                    return Err(AlarmCreateAbort::BlockedByPolicy(pid));
                }
            }
        }

        // 6. trust list
        if self.trust.match_alarm(&alarm).await {
            info!("alarm creation aborted: covered by trust list");
            return Err(AlarmCreateAbort::BlockedByTrust);
        }

        // 7. cloud arbitration
        let pending = self.arbiter.enabled();
        if pending {
            match self.arbiter.verdict(&alarm).await {
                ArbitrationVerdict::Approved(rewritten) => alarm = *rewritten,
                ArbitrationVerdict::Ignore => {
                    info!("alarm creation short-circuited: cloud verdict is ignore");
                    return Ok(AlarmCreateOutcome::CloudIgnored);
                }
                ArbitrationVerdict::Invalid(reason) => {
                    return Err(AlarmCreateAbort::InvalidCloudVerdict(reason));
                }
            }
        }

        // 8. persist, activate, auto-block, notify, hook
        let aid = self.persist(&mut alarm, pending);
        if !pending {
            self.activate_alarm(&aid);
        }
        self.auto_block(&mut alarm).await;

        self.pubsub.publish(
            CHANNEL_ALARM_CREATE,
            &serde_json::to_string(&CacheNotice::one(&aid)).unwrap_or_default(),
        );
        let _ = self.events.send(BridgeEvent::NewAlarm {
            alarm_id: aid.clone(),
        });
        if let Some(hook) = self.post_hook.lock().as_ref() {
            hook(&alarm);
        }

        info!("alarm {} created ({})", aid, alarm.atype);
        Ok(AlarmCreateOutcome::Created(aid))
    }

    /// Fill device identity from the resolver; returns whether the device
    /// still participates in ACL matching.
    async fn enrich(&self, alarm: &mut Alarm) -> bool {
        let Some(device) = self.devices.resolve(&alarm.device).await else {
            return true;
        };
        if alarm.get_text("p.device.mac").is_none() {
            alarm.set("p.device.mac", Value::String(device.mac.clone()));
        }
        if alarm.get_text("p.device.id").is_none() {
            alarm.set("p.device.id", Value::String(device.mac.clone()));
        }
        if let (None, Some(ip)) = (alarm.get_text("p.device.ip"), &device.ip) {
            alarm.set("p.device.ip", Value::String(ip.clone()));
        }
        if let (None, Some(name)) = (alarm.get_text("p.device.name"), &device.name) {
            alarm.set("p.device.name", Value::String(name.clone()));
        }
        if let (None, Some(vendor)) = (alarm.get_text("p.device.macVendor"), &device.vendor) {
            alarm.set("p.device.macVendor", Value::String(vendor.clone()));
        }
        device.acl_enabled
    }

    // ------------------------------------------------------------------------
    // Dedup
    // ------------------------------------------------------------------------

    /// Variants whose live alarms need comparing against `t`.
    fn dedup_types(t: AlarmType) -> Vec<AlarmType> {
        match t {
            AlarmType::OpenPort => vec![AlarmType::OpenPort, AlarmType::Upnp],
            AlarmType::Upnp => vec![AlarmType::Upnp, AlarmType::OpenPort],
            other => vec![other],
        }
    }

    fn find_duplicate(&self, alarm: &Alarm) -> Option<AlarmId> {
        let cutoff = now_ts() - alarm.cooldown_secs();
        let types = Self::dedup_types(alarm.atype);

        // fast path: a warm cache proving no live alarm of these types
        // exists inside the window lets us skip loading anything
        let all_cold = types.iter().all(|t| {
            self.cache.query(*t, |_, r| r.ts >= cutoff && !r.archived)
                == CacheAnswer::Hit(false)
        });
        if all_cold {
            return None;
        }

        let mut ids = self
            .store
            .zrange_by_score(ZSET_ALARM_PENDING, cutoff, f64::MAX);
        ids.extend(self.store.zrange_by_score(ZSET_ALARM_ACTIVE, cutoff, f64::MAX));

        let mut backfill = Vec::new();
        let mut hit = None;
        for aid in ids {
            let Some(candidate) = self.load_alarm(&AlarmId::new(aid.clone())) else {
                continue;
            };
            backfill.push((
                aid,
                IndexRecord {
                    atype: candidate.atype,
                    state: candidate.state,
                    ts: candidate.timestamp,
                    archived: self.store.zscore(ZSET_ALARM_ARCHIVE,
                        candidate.aid.as_ref().map(|a| a.as_str()).unwrap_or("")).is_some(),
                },
            ));
            if hit.is_none()
                && types.contains(&candidate.atype)
                && candidate.is_dup(alarm)
            {
                hit = candidate.aid.clone();
            }
        }
        self.cache.backfill(backfill, &types);
        hit
    }

    // ------------------------------------------------------------------------
    // Auto-block
    // ------------------------------------------------------------------------

    /// Block the destination of security alarms when the feature is on and
    /// the destination is not allowlisted.
    async fn auto_block(&self, alarm: &mut Alarm) {
        if !self.config.auto_block || !alarm.atype.is_security() {
            return;
        }
        let Some(dest_ip) = alarm.get_text("p.dest.ip") else {
            return;
        };
        let dest_name = alarm.get_text("p.dest.name").unwrap_or_default();
        let allowlisted = self
            .config
            .unblock_allowlist
            .iter()
            .any(|a| *a == dest_ip || policy_engine::domain_covers(a, &dest_name));
        if allowlisted {
            debug!("auto-block skipped for allowlisted destination {}", dest_ip);
            return;
        }

        let mut policy = Policy::new(TargetType::Ip, dest_ip.as_str());
        policy.action = Action::Block;
        policy.security = true;
        match self.policies.create_policy(policy).await {
            Ok(_) => {
                alarm.set("r.result", Value::String("block".to_string()));
                alarm.set("r.result_method", Value::String("auto".to_string()));
                if let Some(aid) = alarm.aid.clone() {
                    self.persist_fields(&aid, alarm);
                }
            }
            Err(e) => warn!("auto-block of {} failed: {}", dest_ip, e),
        }
    }

    // ------------------------------------------------------------------------
    // Persistence and state transitions
    // ------------------------------------------------------------------------

    fn persist(&self, alarm: &mut Alarm, pending: bool) -> AlarmId {
        let aid = AlarmId::from(self.store.incr(KEY_ALARM_ID));
        alarm.aid = Some(aid.clone());
        alarm.state = if pending {
            AlarmState::Pending
        } else {
            AlarmState::Ready
        };

        self.persist_fields(&aid, alarm);

        // staged through pending either way; activation moves it
        self.store
            .zadd(ZSET_ALARM_PENDING, alarm.timestamp, aid.as_str());

        self.cache.add(
            aid.as_str(),
            IndexRecord {
                atype: alarm.atype,
                state: alarm.state,
                ts: alarm.timestamp,
                archived: false,
            },
        );
        self.publish_cache_notice(CHANNEL_ALARM_UPDATE_CACHE, &[aid.clone()]);
        aid
    }

    fn persist_fields(&self, aid: &AlarmId, alarm: &Alarm) {
        let basic_key = format!("{}{}", PREFIX_ALARM, aid.as_str());
        let detail_key = format!("{}{}", PREFIX_ALARM_DETAIL, aid.as_str());
        self.store.batch(vec![
            StoreOp::HashSet {
                key: basic_key.clone(),
                fields: encode_basic(alarm),
            },
            StoreOp::Expire {
                key: basic_key,
                ttl_secs: ALARM_TTL_SECS,
            },
            StoreOp::HashSet {
                key: detail_key.clone(),
                fields: encode_extended(alarm),
            },
            StoreOp::Expire {
                key: detail_key,
                ttl_secs: ALARM_TTL_SECS,
            },
        ]);
    }

    /// ready -> activated. Idempotent; never resurrects archived alarms.
    pub fn activate_alarm(&self, aid: &AlarmId) {
        let Some(mut alarm) = self.load_alarm(aid) else {
            warn!("activate of unknown alarm {}", aid);
            return;
        };
        match alarm.state {
            AlarmState::Ignored => {
                debug!("alarm {} is ignored, not activating", aid);
                return;
            }
            AlarmState::Activated => {}
            _ => {
                alarm.state = AlarmState::Activated;
            }
        }
        self.store.batch(vec![
            StoreOp::ZAddNx {
                key: ZSET_ALARM_ACTIVE.to_string(),
                score: alarm.timestamp,
                member: aid.as_str().to_string(),
            },
            StoreOp::ZRem {
                key: ZSET_ALARM_PENDING.to_string(),
                member: aid.as_str().to_string(),
            },
        ]);
        self.persist_fields(aid, &alarm);
        self.cache.set_state(aid.as_str(), AlarmState::Activated, false);
        self.publish_cache_notice(CHANNEL_ALARM_UPDATE_CACHE, &[aid.clone()]);
    }

    /// activated -> ignored: out of the active set, into the archive.
    pub fn ignore_alarm(&self, aid: &AlarmId) {
        let Some(mut alarm) = self.load_alarm(aid) else {
            return;
        };
        alarm.state = AlarmState::Ignored;
        self.store.batch(vec![
            StoreOp::ZRem {
                key: ZSET_ALARM_ACTIVE.to_string(),
                member: aid.as_str().to_string(),
            },
            StoreOp::ZAdd {
                key: ZSET_ALARM_ARCHIVE.to_string(),
                score: now_ts(),
                member: aid.as_str().to_string(),
            },
        ]);
        self.persist_fields(aid, &alarm);
        self.cache.set_state(aid.as_str(), AlarmState::Ignored, true);
        self.publish_cache_notice(CHANNEL_ALARM_UPDATE_CACHE, &[aid.clone()]);
    }

    /// Archive membership only; the state value is untouched.
    pub fn archive_alarm(&self, aid: &AlarmId) {
        self.store.batch(vec![
            StoreOp::ZRem {
                key: ZSET_ALARM_ACTIVE.to_string(),
                member: aid.as_str().to_string(),
            },
            StoreOp::ZAdd {
                key: ZSET_ALARM_ARCHIVE.to_string(),
                score: now_ts(),
                member: aid.as_str().to_string(),
            },
        ]);
        if let Some(alarm) = self.load_alarm(aid) {
            self.cache.set_state(aid.as_str(), alarm.state, true);
        }
        self.publish_cache_notice(CHANNEL_ALARM_UPDATE_CACHE, &[aid.clone()]);
    }

    pub fn delete_alarms(&self, aids: &[AlarmId]) {
        let mut ops = Vec::new();
        for aid in aids {
            ops.push(StoreOp::Del {
                key: format!("{}{}", PREFIX_ALARM, aid.as_str()),
            });
            ops.push(StoreOp::Del {
                key: format!("{}{}", PREFIX_ALARM_DETAIL, aid.as_str()),
            });
            for zset in [ZSET_ALARM_PENDING, ZSET_ALARM_ACTIVE, ZSET_ALARM_ARCHIVE] {
                ops.push(StoreOp::ZRem {
                    key: zset.to_string(),
                    member: aid.as_str().to_string(),
                });
            }
        }
        self.store.batch(ops);
        self.cache
            .remove(&aids.iter().map(|a| a.as_str().to_string()).collect::<Vec<_>>());
        self.publish_cache_notice(CHANNEL_ALARM_REMOVE_CACHE, aids);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn load_alarm(&self, aid: &AlarmId) -> Option<Alarm> {
        let basic = self
            .store
            .hash_get_all(&format!("{}{}", PREFIX_ALARM, aid.as_str()))?;
        let detail = self
            .store
            .hash_get_all(&format!("{}{}", PREFIX_ALARM_DETAIL, aid.as_str()))
            .unwrap_or_default();
        decode_alarm(aid, basic, detail)
    }

    /// Active alarm ids, newest first.
    pub fn active_alarm_ids(&self) -> Vec<AlarmId> {
        self.store
            .zrevrange(ZSET_ALARM_ACTIVE)
            .into_iter()
            .map(AlarmId::new)
            .collect()
    }

    pub fn is_archived(&self, aid: &AlarmId) -> bool {
        self.store.zscore(ZSET_ALARM_ARCHIVE, aid.as_str()).is_some()
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    /// Promote or prune pending entries older than the configured timeout.
    /// Legacy states fall back to active; already-settled states are stale
    /// pending members and get pruned.
    pub fn sweep_pending(&self) {
        let cutoff = now_ts() - self.config.pending_timeout_secs;
        for aid_str in self.store.zrange_by_score(ZSET_ALARM_PENDING, f64::MIN, cutoff) {
            let aid = AlarmId::new(aid_str.clone());
            let Some(alarm) = self.load_alarm(&aid) else {
                self.store.zrem(ZSET_ALARM_PENDING, &aid_str);
                continue;
            };
            match alarm.state {
                AlarmState::Init | AlarmState::Pending | AlarmState::Ready => {
                    info!("pending sweep force-activating alarm {}", aid);
                    self.activate_alarm(&aid);
                }
                AlarmState::Activated | AlarmState::Ignored => {
                    debug!("pending sweep pruning stale entry {}", aid);
                    self.store.zrem(ZSET_ALARM_PENDING, &aid_str);
                }
            }
        }
    }

    pub async fn run_pending_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PENDING_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep_pending();
        }
    }

    /// Apply cross-process cache notices published by peer processes. A
    /// single ordered subscription covers both notice kinds, so a remove is
    /// never overtaken by an update that was published before it.
    pub async fn run_cache_coherence(self: Arc<Self>) {
        let mut notices = self.pubsub.subscribe_all();
        loop {
            let (channel, payload) = match notices.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("cache coherence lagged, {} notices dropped", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match channel.as_str() {
                CHANNEL_ALARM_UPDATE_CACHE => {
                    for id in notice_ids(&payload) {
                        let aid = AlarmId::new(id.clone());
                        if let Some(alarm) = self.load_alarm(&aid) {
                            self.cache.add(&id, IndexRecord {
                                atype: alarm.atype,
                                state: alarm.state,
                                ts: alarm.timestamp,
                                archived: self.is_archived(&aid),
                            });
                        }
                    }
                }
                CHANNEL_ALARM_REMOVE_CACHE => {
                    self.cache.remove(&notice_ids(&payload));
                }
                _ => {}
            }
        }
    }

    fn publish_cache_notice(&self, channel: &str, aids: &[AlarmId]) {
        let notice = if aids.len() == 1 {
            CacheNotice::one(&aids[0])
        } else {
            CacheNotice::many(aids)
        };
        if let Ok(json) = serde_json::to_string(&notice) {
            self.pubsub.publish(channel, &json);
        }
    }
}

fn notice_ids(payload: &str) -> Vec<String> {
    serde_json::from_str::<CacheNotice>(payload)
        .map(|n| n.ids())
        .unwrap_or_default()
}

// ============================================================================
// FLATTENED HASH CODEC
// ============================================================================

fn encode_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn decode_value(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
}

fn encode_basic(alarm: &Alarm) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("type".to_string(), alarm.atype.as_str().to_string());
    fields.insert("state".to_string(), alarm.state.as_str().to_string());
    fields.insert("timestamp".to_string(), alarm.timestamp.to_string());
    fields.insert(
        "alarm_timestamp".to_string(),
        alarm.alarm_timestamp.to_string(),
    );
    fields.insert("device".to_string(), alarm.device.clone());
    for (k, v) in alarm.basic_payload() {
        fields.insert(k, encode_value(&v));
    }
    fields
}

fn encode_extended(alarm: &Alarm) -> BTreeMap<String, String> {
    alarm
        .extended_payload()
        .into_iter()
        .map(|(k, v)| (k, encode_value(&v)))
        .collect()
}

fn decode_alarm(
    aid: &AlarmId,
    basic: BTreeMap<String, String>,
    detail: BTreeMap<String, String>,
) -> Option<Alarm> {
    let atype = AlarmType::parse(basic.get("type")?).ok()?;
    let timestamp: f64 = basic.get("timestamp")?.parse().ok()?;
    let device = basic.get("device").cloned().unwrap_or_default();
    let mut alarm = Alarm::new(atype, timestamp, device);
    alarm.aid = Some(aid.clone());
    alarm.state = basic
        .get("state")
        .and_then(|s| AlarmState::parse(s))
        .unwrap_or(AlarmState::Ready);
    if let Some(ts) = basic.get("alarm_timestamp").and_then(|s| s.parse().ok()) {
        alarm.alarm_timestamp = ts;
    }
    for (k, v) in basic {
        if k.starts_with("p.") || k.starts_with("r.") {
            alarm.set(&k, decode_value(&v));
        }
    }
    for (k, v) in detail {
        if k.starts_with("e.") {
            alarm.set(&k, decode_value(&v));
        }
    }
    Some(alarm)
}
