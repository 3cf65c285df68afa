//! Single-consumer enforcement job queue.
//!
//! Every externally observable policy mutation travels through this queue,
//! making it the de-facto mutex for packet-filter programming. Jobs carry a
//! 60 second timeout; a handler failure reporting lost queue state triggers
//! one recreate-and-retry, nothing else is retried.

use async_trait::async_trait;
use log::{error, info, warn};
use policy_engine::Policy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub const JOB_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backing state was lost")]
    StateLost,

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("queue is shut down")]
    Closed,

    #[error("job failed: {0}")]
    JobFailed(String),
}

/// What a job asks the orchestrator to do with its policy.
#[derive(Debug, Clone)]
pub enum JobKind {
    Enforce,
    Unenforce,
    /// Unenforce the old shape, then enforce the updated one.
    Reenforce { updated: Box<Policy> },
    /// Add/remove targets on an already-enforced multi-target rule.
    IncrementalUpdate {
        add: Vec<String>,
        remove: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub policy: Policy,
}

impl Job {
    pub fn new(kind: JobKind, policy: Policy) -> Self {
        Job {
            id: Uuid::new_v4(),
            kind,
            policy,
        }
    }
}

/// Executes jobs pulled off the queue. `recreate` rebuilds whatever backing
/// state the handler keeps, after a `StateLost` failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), QueueError>;

    async fn recreate(&self) {}
}

struct QueuedJob {
    job: Job,
    done: oneshot::Sender<Result<(), QueueError>>,
}

/// Handle for submitting jobs. The consumer task owns the receiving end and
/// processes strictly one job at a time.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
}

impl JobQueue {
    pub fn start(handler: Arc<dyn JobHandler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(consume(rx, handler));
        JobQueue { tx }
    }

    /// Enqueue a job; the returned receiver resolves when the job finishes.
    pub fn submit(&self, job: Job) -> oneshot::Receiver<Result<(), QueueError>> {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedJob {
            job,
            done: done_tx,
        };
        if let Err(e) = self.tx.send(queued) {
            let _ = e.0.done.send(Err(QueueError::Closed));
        }
        done_rx
    }

    /// Enqueue and wait for completion.
    pub async fn run(&self, job: Job) -> Result<(), QueueError> {
        self.submit(job).await.unwrap_or(Err(QueueError::Closed))
    }
}

async fn consume(mut rx: mpsc::UnboundedReceiver<QueuedJob>, handler: Arc<dyn JobHandler>) {
    info!("enforcement queue consumer started");
    while let Some(queued) = rx.recv().await {
        let result = run_one(&handler, &queued.job).await;
        if let Err(e) = &result {
            error!("enforcement job {} failed: {}", queued.job.id, e);
        }
        let _ = queued.done.send(result);
    }
    info!("enforcement queue consumer stopped");
}

async fn run_one(handler: &Arc<dyn JobHandler>, job: &Job) -> Result<(), QueueError> {
    match attempt(handler, job).await {
        Err(QueueError::StateLost) => {
            // one recreate-and-retry, then surface the failure
            warn!("queue state lost on job {}, recreating and retrying once", job.id);
            handler.recreate().await;
            attempt(handler, job).await
        }
        other => other,
    }
}

async fn attempt(handler: &Arc<dyn JobHandler>, job: &Job) -> Result<(), QueueError> {
    match tokio::time::timeout(JOB_TIMEOUT, handler.handle(job)).await {
        Ok(result) => result,
        Err(_) => Err(QueueError::Timeout(JOB_TIMEOUT)),
    }
}
