//! Policy enforcement orchestrator.
//!
//! Owns rule persistence, the per-rule enforcement state machine and the
//! rule-type to packet-filter mapping. Every externally observable mutation
//! (enforce, unenforce, reenforce, incremental update) travels through the
//! single-consumer job queue; timers and cron callbacks re-enter through the
//! same queue rather than touching the backend directly.

use log::{error, info, warn};
use parking_lot::Mutex;
use policy_engine::{
    now_ts, Action, Alarm, CategoryMatcher, Direction, Policy, PolicyId, TargetType,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::backend::{BackendError, FilterRule, PacketFilterBackend, SetKind};
use crate::collaborators::{CronScheduler, DnsEnrichment, QuotaManager};
use crate::collaborators::CategoryProvider;
use crate::queue::{Job, JobHandler, JobKind, JobQueue, QueueError};
use crate::store::Store;
use crate::timers::TimerService;
use crate::types::{BridgeEvent, PREFIX_POLICY, ZSET_POLICY_ACTIVE};

/// Shared sets for unscoped address rules.
pub const GLOBAL_BLOCK_SET: &str = "global_block_set";
pub const GLOBAL_ALLOW_SET: &str = "global_allow_set";

/// Relaxed category rules are upgraded to full enforcement after this long.
const CATEGORY_UPGRADE_DELAY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum PolicyManagerError {
    #[error("policy {0} not found")]
    NotFound(String),

    #[error("unsupported rule: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("policy serialization failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// Outcome of `create_policy`.
#[derive(Debug)]
pub enum PolicyCreateOutcome {
    Created(PolicyId),
    /// An identical enabled rule already exists; nothing was written.
    Duplicated(PolicyId),
    /// An identical rule existed but was disabled; it was re-enabled.
    DuplicatedAndEnabled(PolicyId),
}

#[derive(Debug, Default)]
pub struct BatchOps {
    pub create: Vec<Policy>,
    pub update: Vec<Policy>,
    pub delete: Vec<PolicyId>,
}

/// Per-rule backend artifacts, recorded on enforce for symmetric teardown.
#[derive(Debug, Default, Clone)]
struct RuleArtifacts {
    /// Per-rule named sets this rule created and owns.
    owned_sets: Vec<String>,
    /// Entries this rule contributed to shared sets.
    shared_entries: Vec<(String, String)>,
    /// Rule is in relaxed (resolution-only) category mode.
    relaxed: bool,
}

// ============================================================================
// CORE (queue job handler)
// ============================================================================

/// The enforcement core. Only reachable through the job queue, which makes
/// it the single writer of backend state.
pub struct PolicyCore {
    store: Arc<Store>,
    backend: Arc<dyn PacketFilterBackend>,
    timers: TimerService,
    cron: Arc<dyn CronScheduler>,
    quota: Arc<dyn QuotaManager>,
    dns: Arc<dyn DnsEnrichment>,
    categories: Arc<dyn CategoryProvider>,
    events: broadcast::Sender<BridgeEvent>,

    artifacts: Mutex<HashMap<String, RuleArtifacts>>,
    shared_refs: Mutex<HashMap<String, usize>>,
    /// Category rules whose relaxed window has elapsed. Shared with the
    /// upgrade timer callbacks.
    upgraded: Arc<Mutex<HashSet<String>>>,
    /// Set once the queue exists; timer callbacks re-enter through it.
    queue: Mutex<Option<JobQueue>>,
}

#[async_trait::async_trait]
impl JobHandler for PolicyCore {
    async fn handle(&self, job: &Job) -> Result<(), QueueError> {
        let result = match &job.kind {
            JobKind::Enforce => self.enforce_impl(&job.policy).await,
            JobKind::Unenforce => self.unenforce_impl(&job.policy).await,
            JobKind::Reenforce { updated } => match self.unenforce_impl(&job.policy).await {
                Ok(()) => self.enforce_impl(updated).await,
                Err(e) => Err(e),
            },
            JobKind::IncrementalUpdate { add, remove } => {
                self.incremental_update_impl(&job.policy, add, remove).await
            }
        };
        result.map_err(|e| QueueError::JobFailed(e.to_string()))
    }
}

impl PolicyCore {
    fn pid_of(policy: &Policy) -> Result<String, PolicyManagerError> {
        policy
            .pid
            .as_ref()
            .map(|p| p.as_str().to_string())
            .ok_or_else(|| PolicyManagerError::NotFound("<unassigned>".to_string()))
    }

    fn queue_handle(&self) -> Option<JobQueue> {
        self.queue.lock().clone()
    }

    fn timer_owner(pid: &str) -> String {
        format!("policy:{}", pid)
    }

    fn upgrade_timer_owner(pid: &str) -> String {
        format!("policy-upgrade:{}", pid)
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    async fn enforce_impl(&self, policy: &Policy) -> Result<(), PolicyManagerError> {
        let pid = Self::pid_of(policy)?;
        let now = now_ts();

        if policy.disabled {
            // no programming; a paused rule only gets its reawaken timer
            if let Some(idle_ts) = policy.idle_ts {
                if idle_ts > now {
                    self.arm_idle_timer(&pid, policy, idle_ts - now);
                }
            }
            return Ok(());
        }

        if let Some(expiry) = policy.expiry_ts() {
            if expiry <= now {
                info!("rule {} already expired, disabling instead of enforcing", pid);
                self.retire_rule(policy).await?;
                return Ok(());
            }
        }

        // recurrence and quota rules are driven by their external schedulers;
        // the callbacks come back in with the governing field stripped
        if policy.cron_time.is_some() {
            self.cron.register_policy(policy).await;
            return Ok(());
        }
        if policy.app_time_usage.is_some() {
            self.quota.register_policy(policy).await;
            return Ok(());
        }

        self.program_rule(policy, &pid).await?;
        self.persist_activated_time(&pid, Some(now));

        if let Some(expiry) = policy.expiry_ts() {
            self.arm_expiry_timer(&pid, policy, (expiry - now).max(0.0));
        }

        let relaxed = self
            .artifacts
            .lock()
            .get(&pid)
            .map(|a| a.relaxed)
            .unwrap_or(false);
        if relaxed {
            let upgrade_delay = match policy.expiry_ts() {
                Some(expiry) if expiry - now < CATEGORY_UPGRADE_DELAY.as_secs_f64() => None,
                _ => Some(CATEGORY_UPGRADE_DELAY),
            };
            if let Some(delay) = upgrade_delay {
                self.arm_upgrade_timer(&pid, policy, delay);
            }
        }

        info!("rule {} enforced ({} {})", pid, policy.ptype, policy.target);
        let _ = self.events.send(BridgeEvent::PolicyActivated {
            policy: Box::new(policy.clone()),
        });
        Ok(())
    }

    async fn unenforce_impl(&self, policy: &Policy) -> Result<(), PolicyManagerError> {
        let pid = Self::pid_of(policy)?;

        self.timers.cancel(&Self::timer_owner(&pid));
        self.timers.cancel(&Self::upgrade_timer_owner(&pid));
        if policy.cron_time.is_some() {
            if let Some(p) = &policy.pid {
                self.cron.deregister_policy(p).await;
            }
        }
        if policy.app_time_usage.is_some() {
            if let Some(p) = &policy.pid {
                self.quota.deregister_policy(p).await;
            }
        }

        // rules first, then sets: reverse of the enforce ordering
        self.backend.remove_rules(&pid).await?;
        self.backend.remove_dns_entries(&pid).await?;

        let artifacts = self.artifacts.lock().remove(&pid).unwrap_or_default();
        for (set, entry) in &artifacts.shared_entries {
            self.backend.remove_from_set(set, &[entry.clone()]).await?;
            let mut refs = self.shared_refs.lock();
            if let Some(n) = refs.get_mut(set) {
                *n = n.saturating_sub(1);
            }
        }
        for set in artifacts.owned_sets.iter().rev() {
            if self.backend.set_exists(set).await {
                self.backend.destroy_set(set).await?;
            }
        }

        // the upgraded flag survives unenforce: a reenforce must come back
        // in full mode, not restart the relaxed window
        self.persist_activated_time(&pid, None);

        info!("rule {} unenforced", pid);
        let _ = self.events.send(BridgeEvent::PolicyDeactivated {
            policy: Box::new(policy.clone()),
        });
        Ok(())
    }

    async fn incremental_update_impl(
        &self,
        policy: &Policy,
        add: &[String],
        remove: &[String],
    ) -> Result<(), PolicyManagerError> {
        let pid = Self::pid_of(policy)?;
        let set = per_rule_set(&pid);
        if !self.backend.set_exists(&set).await {
            return Err(PolicyManagerError::Unsupported(format!(
                "rule {} has no per-rule set to update",
                pid
            )));
        }
        if !add.is_empty() {
            self.backend.add_to_set(&set, add).await?;
        }
        if !remove.is_empty() {
            self.backend.remove_from_set(&set, remove).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Rule-type -> backend mapping
    // ------------------------------------------------------------------------

    async fn program_rule(&self, policy: &Policy, pid: &str) -> Result<(), PolicyManagerError> {
        let mut artifacts = RuleArtifacts::default();

        match policy.ptype {
            TargetType::Ip | TargetType::Net => {
                let kind = if policy.ptype == TargetType::Ip {
                    SetKind::Ip
                } else {
                    SetKind::Net
                };
                if policy.is_scoped() {
                    let set = per_rule_set(pid);
                    self.backend.create_set(&set, kind).await?;
                    artifacts.owned_sets.push(set.clone());
                    self.backend.add_to_set(&set, &[policy.target.clone()]).await?;
                    self.install(policy, pid, Some(set)).await?;
                } else {
                    let shared = match policy.action {
                        Action::Allow => GLOBAL_ALLOW_SET,
                        _ => GLOBAL_BLOCK_SET,
                    };
                    self.ensure_shared_set(shared, kind).await?;
                    self.backend.add_to_set(shared, &[policy.target.clone()]).await?;
                    *self.shared_refs.lock().entry(shared.to_string()).or_insert(0) += 1;
                    artifacts
                        .shared_entries
                        .push((shared.to_string(), policy.target.clone()));
                    self.install(policy, pid, Some(shared.to_string())).await?;
                }
            }
            TargetType::Domain | TargetType::Dns => {
                for domain in targets_of(policy) {
                    self.backend.add_dns_entry(pid, &domain).await?;
                }
                if policy.dnsmasq_only {
                    // resolution-only: no IP-level artifacts yet
                } else {
                    let set = per_rule_set(pid);
                    self.backend.create_set(&set, SetKind::Ip).await?;
                    artifacts.owned_sets.push(set.clone());
                    for domain in targets_of(policy) {
                        let ips = self.dns.resolve_domain(&domain).await;
                        if !ips.is_empty() {
                            self.backend.add_to_set(&set, &ips).await?;
                        }
                    }
                    self.install(policy, pid, Some(set)).await?;
                }
            }
            TargetType::Category => {
                let handles = self.categories.activate(&policy.target).await;
                let set = match policy.action {
                    Action::Allow => handles.allow_set,
                    _ => handles.block_set,
                };
                if policy.dnsmasq_only && !self.upgraded.lock().contains(pid) {
                    artifacts.relaxed = true;
                    self.backend.add_dns_entry(pid, &policy.target).await?;
                } else {
                    // aggregate sets are owned by the data feed, never destroyed here
                    self.install(policy, pid, Some(set)).await?;
                }
            }
            TargetType::Country => {
                let handles = self.categories.activate(&policy.target).await;
                let set = match policy.action {
                    Action::Allow => handles.allow_set,
                    _ => handles.block_set,
                };
                self.install(policy, pid, Some(set)).await?;
            }
            TargetType::Mac | TargetType::Internet => {
                // full-internet block lands at the DNS layer with an IP-level
                // fallback rule
                self.backend.add_dns_entry(pid, "*").await?;
                self.install(policy, pid, None).await?;
            }
            TargetType::Intranet => {
                let set = per_rule_set(pid);
                self.backend.create_set(&set, SetKind::Net).await?;
                artifacts.owned_sets.push(set.clone());
                self.backend
                    .add_to_set(
                        &set,
                        &[
                            "10.0.0.0/8".to_string(),
                            "172.16.0.0/12".to_string(),
                            "192.168.0.0/16".to_string(),
                        ],
                    )
                    .await?;
                self.install(policy, pid, Some(set)).await?;
            }
            TargetType::Tag | TargetType::Network | TargetType::Device => {
                // per-entity enforcement environment set
                let set = per_rule_set(pid);
                self.backend.create_set(&set, SetKind::MacIpPort).await?;
                artifacts.owned_sets.push(set.clone());
                self.backend.add_to_set(&set, &[policy.target.clone()]).await?;
                self.install(policy, pid, Some(set)).await?;
            }
            TargetType::RemotePort | TargetType::DevicePort => {
                self.install(policy, pid, None).await?;
            }
            TargetType::MatchGroup => {
                // pure indirection: sub-rules carrying this group id are
                // evaluated at decision time, nothing to program
            }
        }

        self.artifacts.lock().insert(pid.to_string(), artifacts);
        Ok(())
    }

    async fn install(
        &self,
        policy: &Policy,
        pid: &str,
        match_set: Option<String>,
    ) -> Result<(), PolicyManagerError> {
        self.backend
            .install_rule(FilterRule {
                owner: pid.to_string(),
                action: policy.action.to_string(),
                match_set,
                direction: match policy.direction {
                    Direction::Inbound => "inbound".to_string(),
                    Direction::Outbound => "outbound".to_string(),
                    Direction::Bidirection => "bidirection".to_string(),
                },
                protocol: policy.protocol.clone(),
                ports: policy.remote_port.clone(),
            })
            .await?;
        Ok(())
    }

    async fn ensure_shared_set(&self, name: &str, kind: SetKind) -> Result<(), BackendError> {
        if !self.backend.set_exists(name).await {
            self.backend.create_set(name, kind).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn arm_expiry_timer(&self, pid: &str, policy: &Policy, delay_secs: f64) {
        let Some(queue) = self.queue_handle() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let upgraded = Arc::clone(&self.upgraded);
        let policy = policy.clone();
        let pid = pid.to_string();
        self.timers.arm(
            &Self::timer_owner(&pid),
            Duration::from_secs_f64(delay_secs),
            Box::new(move || {
                Box::pin(async move {
                    info!("rule {} expired, unenforcing", pid);
                    if let Err(e) = queue.run(Job::new(JobKind::Unenforce, policy.clone())).await {
                        error!("expiry unenforce of rule {} failed: {}", pid, e);
                        return;
                    }
                    upgraded.lock().remove(&pid);
                    finalize_expiry(&store, &pid, policy.auto_delete_when_expires);
                })
            }),
        );
    }

    fn arm_idle_timer(&self, pid: &str, policy: &Policy, delay_secs: f64) {
        let Some(queue) = self.queue_handle() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let mut reawakened = policy.clone();
        reawakened.disabled = false;
        reawakened.idle_ts = None;
        let pid = pid.to_string();
        self.timers.arm(
            &Self::timer_owner(&pid),
            Duration::from_secs_f64(delay_secs),
            Box::new(move || {
                Box::pin(async move {
                    info!("rule {} idle window over, re-enabling", pid);
                    persist_policy(&store, &reawakened);
                    if let Err(e) = queue.run(Job::new(JobKind::Enforce, reawakened.clone())).await
                    {
                        error!("idle reawaken of rule {} failed: {}", pid, e);
                    }
                })
            }),
        );
    }

    fn arm_upgrade_timer(&self, pid: &str, policy: &Policy, delay: Duration) {
        let Some(queue) = self.queue_handle() else {
            return;
        };
        let policy = policy.clone();
        let pid_owned = pid.to_string();
        let upgraded = Arc::clone(&self.upgraded);
        // upgrade uses a distinct owner key so it cannot clobber the expiry timer
        let owner = Self::upgrade_timer_owner(pid);
        self.timers.arm(
            &owner,
            delay,
            Box::new(move || {
                Box::pin(async move {
                    info!("rule {} leaving relaxed category mode", pid_owned);
                    upgraded.lock().insert(pid_owned.clone());
                    let job = Job::new(
                        JobKind::Reenforce {
                            updated: Box::new(policy.clone()),
                        },
                        policy.clone(),
                    );
                    if let Err(e) = queue.run(job).await {
                        error!("category upgrade of rule {} failed: {}", pid_owned, e);
                    }
                })
            }),
        );
    }

    /// Mark a rule as past its relaxed window; the next enforce is full.
    fn mark_upgraded(&self, pid: &str) {
        self.upgraded.lock().insert(pid.to_string());
    }

    /// Drop per-rule bookkeeping that outlives unenforce. Only called when
    /// the rule itself goes away.
    fn forget_upgrade(&self, pid: &str) {
        self.upgraded.lock().remove(pid);
    }

    /// Stamp (or clear) the persisted activation time for a rule.
    fn persist_activated_time(&self, pid: &str, value: Option<f64>) {
        let key = format!("{}{}", PREFIX_POLICY, pid);
        if let Some(raw) = self.store.hash_get(&key, "json") {
            if let Ok(mut p) = serde_json::from_str::<Policy>(&raw) {
                p.activated_time = value;
                persist_policy(&self.store, &p);
            }
        }
    }

    async fn retire_rule(&self, policy: &Policy) -> Result<(), PolicyManagerError> {
        let pid = Self::pid_of(policy)?;
        self.unenforce_impl(policy).await?;
        self.forget_upgrade(&pid);
        finalize_expiry(&self.store, &pid, policy.auto_delete_when_expires);
        Ok(())
    }
}

fn per_rule_set(pid: &str) -> String {
    format!("rule_{}_set", pid)
}

fn targets_of(policy: &Policy) -> Vec<String> {
    if policy.targets.is_empty() {
        vec![policy.target.clone()]
    } else {
        policy.targets.clone()
    }
}

fn persist_policy(store: &Store, policy: &Policy) {
    let Some(pid) = &policy.pid else {
        return;
    };
    match serde_json::to_string(policy) {
        Ok(json) => {
            let mut fields = std::collections::BTreeMap::new();
            fields.insert("json".to_string(), json);
            store.hash_set(&format!("{}{}", PREFIX_POLICY, pid.as_str()), fields);
        }
        Err(e) => warn!("policy {} serialization failed: {}", pid, e),
    }
}

/// Disable (or delete) a rule whose expiry just fired.
fn finalize_expiry(store: &Store, pid: &str, auto_delete: bool) {
    let key = format!("{}{}", PREFIX_POLICY, pid);
    if auto_delete {
        store.del(&key);
        store.zrem(ZSET_POLICY_ACTIVE, pid);
        info!("rule {} auto-deleted after expiry", pid);
        return;
    }
    if let Some(raw) = store.hash_get(&key, "json") {
        if let Ok(mut p) = serde_json::from_str::<Policy>(&raw) {
            p.disabled = true;
            p.activated_time = None;
            persist_policy(store, &p);
        }
    }
}

// ============================================================================
// MANAGER (public surface)
// ============================================================================

pub struct PolicyManager {
    store: Arc<Store>,
    core: Arc<PolicyCore>,
    queue: JobQueue,
    events: broadcast::Sender<BridgeEvent>,
    /// Targets covering the appliance's own cloud endpoints; never blockable.
    cloud_domains: Vec<String>,
}

pub struct PolicyManagerDeps {
    pub store: Arc<Store>,
    pub backend: Arc<dyn PacketFilterBackend>,
    pub timers: TimerService,
    pub cron: Arc<dyn CronScheduler>,
    pub quota: Arc<dyn QuotaManager>,
    pub dns: Arc<dyn DnsEnrichment>,
    pub categories: Arc<dyn CategoryProvider>,
    pub cloud_domains: Vec<String>,
}

impl PolicyManager {
    pub fn start(deps: PolicyManagerDeps) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let core = Arc::new(PolicyCore {
            store: Arc::clone(&deps.store),
            backend: deps.backend,
            timers: deps.timers,
            cron: deps.cron,
            quota: deps.quota,
            dns: deps.dns,
            categories: deps.categories,
            events: events.clone(),
            artifacts: Mutex::new(HashMap::new()),
            shared_refs: Mutex::new(HashMap::new()),
            upgraded: Arc::new(Mutex::new(HashSet::new())),
            queue: Mutex::new(None),
        });
        let queue = JobQueue::start(core.clone() as Arc<dyn JobHandler>);
        *core.queue.lock() = Some(queue.clone());
        Arc::new(PolicyManager {
            store: deps.store,
            core,
            queue,
            events,
            cloud_domains: deps.cloud_domains,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------------

    /// Persist and enforce a new rule. An identical existing rule is never
    /// duplicated: enabled twins are reported as such, disabled twins are
    /// re-enabled instead.
    pub async fn create_policy(
        &self,
        mut policy: Policy,
    ) -> Result<PolicyCreateOutcome, PolicyManagerError> {
        policy.normalize();

        for existing in self.get_same_policies(&policy) {
            let Some(pid) = existing.pid.clone() else {
                continue;
            };
            if existing.disabled {
                let mut enabled = existing.clone();
                enabled.disabled = false;
                persist_policy(&self.store, &enabled);
                self.queue.run(Job::new(JobKind::Enforce, enabled)).await?;
                info!("duplicate of disabled rule {}, re-enabled", pid);
                return Ok(PolicyCreateOutcome::DuplicatedAndEnabled(pid));
            }
            info!("duplicate of rule {}, nothing written", pid);
            return Ok(PolicyCreateOutcome::Duplicated(pid));
        }

        let pid = PolicyId::from(self.store.next_policy_id()?);
        policy.pid = Some(pid.clone());
        persist_policy(&self.store, &policy);
        self.store
            .zadd(ZSET_POLICY_ACTIVE, policy.timestamp, pid.as_str());
        self.queue.run(Job::new(JobKind::Enforce, policy)).await?;
        Ok(PolicyCreateOutcome::Created(pid))
    }

    /// Persist an updated shape and reenforce it (tear down the old shape
    /// first).
    pub async fn update_policy(&self, updated: Policy) -> Result<(), PolicyManagerError> {
        let pid = updated
            .pid
            .clone()
            .ok_or_else(|| PolicyManagerError::NotFound("<unassigned>".to_string()))?;
        let old = self
            .get_policy(&pid)
            .ok_or_else(|| PolicyManagerError::NotFound(pid.as_str().to_string()))?;
        persist_policy(&self.store, &updated);
        self.queue
            .run(Job::new(
                JobKind::Reenforce {
                    updated: Box::new(updated),
                },
                old,
            ))
            .await?;
        Ok(())
    }

    pub async fn delete_policy(&self, pid: &PolicyId) -> Result<(), PolicyManagerError> {
        let policy = self
            .get_policy(pid)
            .ok_or_else(|| PolicyManagerError::NotFound(pid.as_str().to_string()))?;
        self.queue.run(Job::new(JobKind::Unenforce, policy)).await?;
        self.core.forget_upgrade(pid.as_str());
        self.store.del(&format!("{}{}", PREFIX_POLICY, pid.as_str()));
        self.store.zrem(ZSET_POLICY_ACTIVE, pid.as_str());
        Ok(())
    }

    pub async fn batch_policy(&self, ops: BatchOps) -> Result<(), PolicyManagerError> {
        for p in ops.create {
            self.create_policy(p).await?;
        }
        for p in ops.update {
            self.update_policy(p).await?;
        }
        for pid in ops.delete {
            self.delete_policy(&pid).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queue passthroughs
    // ------------------------------------------------------------------------

    pub async fn enforce(&self, policy: &Policy) -> Result<(), PolicyManagerError> {
        self.queue
            .run(Job::new(JobKind::Enforce, policy.clone()))
            .await?;
        Ok(())
    }

    pub async fn unenforce(&self, policy: &Policy) -> Result<(), PolicyManagerError> {
        self.queue
            .run(Job::new(JobKind::Unenforce, policy.clone()))
            .await?;
        Ok(())
    }

    pub async fn incremental_update(
        &self,
        policy: &Policy,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<(), PolicyManagerError> {
        self.queue
            .run(Job::new(
                JobKind::IncrementalUpdate { add, remove },
                policy.clone(),
            ))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub fn get_policy(&self, pid: &PolicyId) -> Option<Policy> {
        let raw = self
            .store
            .hash_get(&format!("{}{}", PREFIX_POLICY, pid.as_str()), "json")?;
        serde_json::from_str(&raw).ok()
    }

    /// All persisted rules, newest first.
    pub fn load_active_policies(&self) -> Vec<Policy> {
        self.store
            .zrevrange(ZSET_POLICY_ACTIVE)
            .into_iter()
            .filter_map(|pid| self.get_policy(&PolicyId::new(pid)))
            .collect()
    }

    /// Rules equal to `policy` as an instruction (duplicate-detection scan).
    pub fn get_same_policies(&self, policy: &Policy) -> Vec<Policy> {
        self.load_active_policies()
            .into_iter()
            .filter(|p| p.is_same_rule(policy))
            .collect()
    }

    pub fn find_policy(&self, ptype: TargetType, target: &str) -> Option<Policy> {
        self.load_active_policies()
            .into_iter()
            .find(|p| p.ptype == ptype && p.target == target)
    }

    /// Best-ranked rule already handling `alarm`, if any. Rules targeting
    /// the appliance's own cloud endpoints are skipped outright.
    pub fn find_policy_match(
        &self,
        alarm: &Alarm,
        categories: &dyn CategoryMatcher,
    ) -> Option<Policy> {
        let mut rules = self.load_active_policies();
        rules.retain(|p| !self.targets_cloud_endpoint(p));
        rules.sort_by_key(|p| p.rank());
        rules.into_iter().find(|p| p.match_alarm(alarm, categories))
    }

    fn targets_cloud_endpoint(&self, policy: &Policy) -> bool {
        policy.ptype.is_domain()
            && self
                .cloud_domains
                .iter()
                .any(|d| policy_engine::domain_covers(d, &policy.target))
    }

    // ------------------------------------------------------------------------
    // Boot-time bulk enforcement
    // ------------------------------------------------------------------------

    /// Enforce every rule in priority buckets, finishing each bucket before
    /// the next. Inbound blocks must land before any allow rule opens a
    /// window of exposure.
    pub async fn enforce_all_policies(&self) -> Result<(), PolicyManagerError> {
        let mut buckets: Vec<Vec<Policy>> = vec![Vec::new(); 9];
        for p in self.load_active_policies() {
            buckets[boot_bucket(&p) as usize].push(p);
        }
        for (i, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let receivers: Vec<_> = bucket
                .into_iter()
                .map(|p| self.queue.submit(Job::new(JobKind::Enforce, p)))
                .collect();
            for rx in receivers {
                match rx.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("boot enforcement failure in bucket {}: {}", i, e),
                    Err(_) => error!("boot enforcement job dropped in bucket {}", i),
                }
            }
            info!("boot enforcement bucket {} complete", i);
        }
        Ok(())
    }

    /// Exposed for the upgrade path: the relaxed window of a category rule
    /// has elapsed.
    pub fn mark_category_upgraded(&self, pid: &PolicyId) {
        self.core.mark_upgraded(pid.as_str());
    }
}

/// Boot-time bucket ordering; lower enforces first.
fn boot_bucket(p: &Policy) -> u8 {
    let intranet = p.ptype == TargetType::Intranet
        || p.target
            .split('/')
            .next()
            .and_then(|s| s.parse::<std::net::Ipv4Addr>().ok())
            .map(policy_engine::is_private_ipv4)
            .unwrap_or(false);
    match (p.action, p.direction, intranet) {
        (Action::Route, _, _) => 0,
        (Action::Block, Direction::Inbound, false) => 1,
        (Action::Allow, Direction::Inbound, false) => 2,
        (Action::Block, Direction::Inbound, true) => 3,
        (Action::Allow, Direction::Inbound, true) => 4,
        (Action::Block, _, false) => 5,
        (Action::Block, _, true) => 6,
        (Action::Allow, Direction::Outbound, _) => 7,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::collaborators::NullCollaborators;

    fn manager_with_backend() -> (Arc<PolicyManager>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let nulls = Arc::new(NullCollaborators);
        let mgr = PolicyManager::start(PolicyManagerDeps {
            store: Arc::new(Store::new()),
            backend: backend.clone(),
            timers: TimerService::start(),
            cron: nulls.clone(),
            quota: nulls.clone(),
            dns: nulls.clone(),
            categories: nulls.clone(),
            cloud_domains: vec!["cloud.example.net".to_string()],
        });
        (mgr, backend)
    }

    fn ip_block(target: &str) -> Policy {
        Policy::new(TargetType::Ip, target)
    }

    #[tokio::test]
    async fn test_create_enforces_and_persists() {
        let (mgr, backend) = manager_with_backend();
        let outcome = mgr.create_policy(ip_block("1.2.3.4")).await.unwrap();
        let PolicyCreateOutcome::Created(pid) = outcome else {
            panic!("expected creation");
        };
        assert!(mgr.get_policy(&pid).is_some());
        // unscoped ip rule lands in the shared block set
        assert!(backend.set_members(GLOBAL_BLOCK_SET).await.unwrap().contains(&"1.2.3.4".to_string()));
        assert_eq!(backend.rules_for(pid.as_str()).len(), 1);
        // enforcement stamped activated_time
        assert!(mgr.get_policy(&pid).unwrap().activated_time.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_detection() {
        let (mgr, _) = manager_with_backend();
        let PolicyCreateOutcome::Created(first) =
            mgr.create_policy(ip_block("1.2.3.4")).await.unwrap()
        else {
            panic!();
        };
        let outcome = mgr.create_policy(ip_block("1.2.3.4")).await.unwrap();
        let PolicyCreateOutcome::Duplicated(pid) = outcome else {
            panic!("expected duplicate");
        };
        assert_eq!(pid, first);
        assert_eq!(mgr.load_active_policies().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_of_disabled_rule_re_enables() {
        let (mgr, _) = manager_with_backend();
        let PolicyCreateOutcome::Created(pid) =
            mgr.create_policy(ip_block("1.2.3.4")).await.unwrap()
        else {
            panic!();
        };
        let mut p = mgr.get_policy(&pid).unwrap();
        p.disabled = true;
        persist_policy(&mgr.store, &p);

        let outcome = mgr.create_policy(ip_block("1.2.3.4")).await.unwrap();
        assert!(matches!(outcome, PolicyCreateOutcome::DuplicatedAndEnabled(p) if p == pid));
        assert!(!mgr.get_policy(&pid).unwrap().disabled);
    }

    #[tokio::test]
    async fn test_enforcement_symmetry_scoped_ip() {
        let (mgr, backend) = manager_with_backend();
        let mut p = ip_block("1.2.3.4");
        p.scope = vec!["AA:BB:CC:DD:EE:FF".to_string()];
        let PolicyCreateOutcome::Created(pid) = mgr.create_policy(p).await.unwrap() else {
            panic!();
        };
        let set = per_rule_set(pid.as_str());
        assert!(backend.set_exists(&set).await);

        mgr.delete_policy(&pid).await.unwrap();
        assert!(!backend.set_exists(&set).await);
        assert_eq!(backend.rule_count(), 0);
        assert!(mgr.get_policy(&pid).is_none());
    }

    #[tokio::test]
    async fn test_enforcement_symmetry_domain() {
        let (mgr, backend) = manager_with_backend();
        let PolicyCreateOutcome::Created(pid) = mgr
            .create_policy(Policy::new(TargetType::Domain, "evil.com"))
            .await
            .unwrap()
        else {
            panic!();
        };
        assert_eq!(backend.dns_entries_for(pid.as_str()), vec!["evil.com"]);
        let p = mgr.get_policy(&pid).unwrap();
        mgr.unenforce(&p).await.unwrap();
        assert!(backend.dns_entries_for(pid.as_str()).is_empty());
        assert!(backend.set_names().is_empty());
        // unenforce cleared the activation stamp
        assert!(mgr.get_policy(&pid).unwrap().activated_time.is_none());
    }

    #[tokio::test]
    async fn test_shared_set_survives_other_rules() {
        let (mgr, backend) = manager_with_backend();
        let PolicyCreateOutcome::Created(a) =
            mgr.create_policy(ip_block("1.1.1.1")).await.unwrap()
        else {
            panic!();
        };
        let PolicyCreateOutcome::Created(_b) =
            mgr.create_policy(ip_block("2.2.2.2")).await.unwrap()
        else {
            panic!();
        };
        mgr.delete_policy(&a).await.unwrap();
        // the shared set still exists and still holds the other rule's entry
        assert!(backend.set_exists(GLOBAL_BLOCK_SET).await);
        let members = backend.set_members(GLOBAL_BLOCK_SET).await.unwrap();
        assert!(!members.contains(&"1.1.1.1".to_string()));
        assert!(members.contains(&"2.2.2.2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_unenforces_and_disables() {
        let (mgr, backend) = manager_with_backend();
        let mut p = ip_block("9.9.9.9");
        p.expire = Some(5.0);
        let PolicyCreateOutcome::Created(pid) = mgr.create_policy(p).await.unwrap() else {
            panic!();
        };
        assert_eq!(backend.rules_for(pid.as_str()).len(), 1);

        tokio::time::advance(Duration::from_secs(7)).await;
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }

        assert_eq!(backend.rules_for(pid.as_str()).len(), 0);
        let after = mgr.get_policy(&pid).unwrap();
        assert!(after.disabled);
        assert!(after.activated_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_auto_delete() {
        let (mgr, _) = manager_with_backend();
        let mut p = ip_block("9.9.9.9");
        p.expire = Some(5.0);
        p.auto_delete_when_expires = true;
        let PolicyCreateOutcome::Created(pid) = mgr.create_policy(p).await.unwrap() else {
            panic!();
        };

        tokio::time::advance(Duration::from_secs(7)).await;
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        assert!(mgr.get_policy(&pid).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaxed_category_rule_upgrades_to_full_enforcement() {
        let (mgr, backend) = manager_with_backend();
        let mut p = Policy::new(TargetType::Category, "games");
        p.dnsmasq_only = true;
        let PolicyCreateOutcome::Created(pid) = mgr.create_policy(p).await.unwrap() else {
            panic!();
        };
        // relaxed mode: resolution entry only, nothing at the packet filter
        assert_eq!(backend.dns_entries_for(pid.as_str()), vec!["games"]);
        assert_eq!(backend.rules_for(pid.as_str()).len(), 0);

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }

        // past the relaxed window the rule is fully enforced
        assert_eq!(backend.rules_for(pid.as_str()).len(), 1);
        assert!(backend.dns_entries_for(pid.as_str()).is_empty());

        // and it does not fall back into relaxed mode later
        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.rules_for(pid.as_str()).len(), 1);
    }

    #[tokio::test]
    async fn test_already_expired_rule_is_retired_not_enforced() {
        let (mgr, backend) = manager_with_backend();
        let mut p = ip_block("9.9.9.9");
        p.expire = Some(10.0);
        p.timestamp = now_ts() - 100.0;
        let PolicyCreateOutcome::Created(pid) = mgr.create_policy(p).await.unwrap() else {
            panic!();
        };
        assert_eq!(backend.rules_for(pid.as_str()).len(), 0);
        assert!(mgr.get_policy(&pid).unwrap().disabled);
    }

    #[tokio::test]
    async fn test_cron_rule_delegates_without_programming() {
        let (mgr, backend) = manager_with_backend();
        let mut p = ip_block("9.9.9.9");
        p.cron_time = Some("0 22 * * *".to_string());
        let PolicyCreateOutcome::Created(pid) = mgr.create_policy(p).await.unwrap() else {
            panic!();
        };
        // nothing programmed until the scheduler calls back
        assert_eq!(backend.rules_for(pid.as_str()).len(), 0);
    }

    #[tokio::test]
    async fn test_find_policy_match_prefers_lower_rank() {
        let (mgr, _) = manager_with_backend();
        mgr.create_policy(ip_block("1.2.3.4")).await.unwrap();
        let mut scoped = ip_block("1.2.3.4");
        scoped.scope = vec!["AA:BB:CC:DD:EE:FF".to_string()];
        let PolicyCreateOutcome::Created(scoped_pid) =
            mgr.create_policy(scoped).await.unwrap()
        else {
            panic!();
        };

        let alarm = policy_engine::Alarm::new(
            policy_engine::AlarmType::Intel,
            now_ts(),
            "AA:BB:CC:DD:EE:FF",
        )
        .with_payload(vec![
            ("p.device.mac", serde_json::json!("AA:BB:CC:DD:EE:FF")),
            ("p.dest.ip", serde_json::json!("1.2.3.4")),
        ]);
        let hit = mgr
            .find_policy_match(&alarm, &policy_engine::NullCategoryMatcher)
            .unwrap();
        assert_eq!(hit.pid, Some(scoped_pid));
    }

    #[tokio::test]
    async fn test_cloud_endpoint_rules_never_match() {
        let (mgr, _) = manager_with_backend();
        mgr.create_policy(Policy::new(TargetType::Domain, "ota.cloud.example.net"))
            .await
            .unwrap();
        let alarm = policy_engine::Alarm::new(
            policy_engine::AlarmType::Intel,
            now_ts(),
            "AA:BB:CC:DD:EE:FF",
        )
        .with_payload(vec![(
            "p.dest.name",
            serde_json::json!("ota.cloud.example.net"),
        )]);
        assert!(mgr
            .find_policy_match(&alarm, &policy_engine::NullCategoryMatcher)
            .is_none());
    }

    #[tokio::test]
    async fn test_incremental_update() {
        let (mgr, backend) = manager_with_backend();
        let mut p = ip_block("1.2.3.4");
        p.scope = vec!["AA:BB:CC:DD:EE:FF".to_string()];
        let PolicyCreateOutcome::Created(pid) = mgr.create_policy(p).await.unwrap() else {
            panic!();
        };
        let policy = mgr.get_policy(&pid).unwrap();
        mgr.incremental_update(&policy, vec!["5.6.7.8".to_string()], vec![])
            .await
            .unwrap();
        let members = backend.set_members(&per_rule_set(pid.as_str())).await.unwrap();
        assert!(members.contains(&"5.6.7.8".to_string()));
    }

    #[test]
    fn test_boot_bucket_ordering() {
        let mut route = ip_block("1.2.3.4");
        route.action = Action::Route;
        let mut in_block = ip_block("8.8.8.8");
        in_block.direction = Direction::Inbound;
        let mut in_allow = ip_block("8.8.8.8");
        in_allow.direction = Direction::Inbound;
        in_allow.action = Action::Allow;
        let mut intranet_block = ip_block("192.168.1.10");
        intranet_block.direction = Direction::Inbound;
        let out_block = ip_block("8.8.8.8");
        let mut out_allow = ip_block("8.8.8.8");
        out_allow.action = Action::Allow;
        out_allow.direction = Direction::Outbound;

        assert!(boot_bucket(&route) < boot_bucket(&in_block));
        assert!(boot_bucket(&in_block) < boot_bucket(&in_allow));
        assert!(boot_bucket(&in_allow) < boot_bucket(&intranet_block));
        assert!(boot_bucket(&intranet_block) < boot_bucket(&out_block));
        assert!(boot_bucket(&out_block) < boot_bucket(&out_allow));
    }

    #[tokio::test]
    async fn test_enforce_all_policies_runs_every_bucket() {
        let (mgr, backend) = manager_with_backend();
        // persist without enforcing by writing directly
        for (i, target) in ["1.1.1.1", "2.2.2.2", "3.3.3.3"].iter().enumerate() {
            let mut p = ip_block(target);
            p.pid = Some(PolicyId::from(i as u64 + 100));
            if i == 1 {
                p.direction = Direction::Inbound;
            }
            persist_policy(&mgr.store, &p);
            mgr.store
                .zadd(ZSET_POLICY_ACTIVE, p.timestamp, p.pid.as_ref().unwrap().as_str());
        }
        mgr.enforce_all_policies().await.unwrap();
        assert_eq!(backend.rule_count(), 3);
    }
}
