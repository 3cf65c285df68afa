//! # Arbitration Bridge
//!
//! Runtime orchestration around the pure rule/alarm matching core: keyed
//! storage, job queue, timers, the alarm lifecycle pipeline, policy
//! enforcement against a packet-filter backend and live ACL resolution.

// Core modules
pub mod acl;
pub mod alarm_manager;
pub mod backend;
pub mod cache;
pub mod collaborators;
pub mod exception_manager;
pub mod policy_manager;
pub mod pubsub;
pub mod queue;
pub mod store;
pub mod timers;
pub mod types;

// Re-export commonly used types
pub use acl::{AclQuery, DecisionEngine};
pub use alarm_manager::{
    AlarmCreateAbort, AlarmCreateOutcome, AlarmManager, AlarmManagerConfig, AlarmManagerDeps,
};
pub use backend::{FilterRule, MemoryBackend, PacketFilterBackend, SetKind};
pub use cache::{AlarmIndexCache, CacheAnswer, CacheConfig};
pub use collaborators::NullCollaborators;
pub use exception_manager::ExceptionManager;
pub use policy_manager::{PolicyCreateOutcome, PolicyManager, PolicyManagerDeps};
pub use pubsub::PubSub;
pub use queue::{JobHandler, JobKind, JobQueue};
pub use store::{Store, StoreOp};
pub use timers::TimerService;
pub use types::BridgeEvent;
