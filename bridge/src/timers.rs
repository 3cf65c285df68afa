//! Owner-keyed one-shot timer service.
//!
//! One background task owns a priority queue of pending timers; arming a
//! timer under an owner key invalidates any timer previously armed under the
//! same key, so missed-invalidation duplicate firings cannot happen. Used for
//! rule expiry, idle reawaken and the domain-block upgrade.

use log::debug;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

pub type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TimerCallback = Box<dyn FnOnce() -> TimerFuture + Send>;

enum TimerCmd {
    Arm {
        owner: String,
        fire_at: Instant,
        callback: TimerCallback,
    },
    Cancel {
        owner: String,
    },
}

struct PendingTimer {
    fire_at: Instant,
    seq: u64,
    owner: String,
    generation: u64,
    callback: TimerCallback,
}

impl PartialEq for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for PendingTimer {}

impl PartialOrd for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTimer {
    // reversed: BinaryHeap is a max-heap, we want the soonest timer on top
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Handle to the timer task. Cloneable; dropping every handle stops the task.
#[derive(Clone)]
pub struct TimerService {
    tx: mpsc::UnboundedSender<TimerCmd>,
}

impl TimerService {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        TimerService { tx }
    }

    /// Arm a one-shot timer under `owner`, replacing any previous timer with
    /// the same owner. The deadline is fixed here, not when the timer task
    /// drains the command.
    pub fn arm(&self, owner: &str, delay: Duration, callback: TimerCallback) {
        let _ = self.tx.send(TimerCmd::Arm {
            owner: owner.to_string(),
            fire_at: Instant::now() + delay,
            callback,
        });
    }

    pub fn cancel(&self, owner: &str) {
        let _ = self.tx.send(TimerCmd::Cancel {
            owner: owner.to_string(),
        });
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<TimerCmd>) {
    let mut heap: BinaryHeap<PendingTimer> = BinaryHeap::new();
    // current generation per owner; stale heap entries are skipped on pop
    let mut generations: HashMap<String, u64> = HashMap::new();
    let mut next_gen: u64 = 0;
    let mut next_seq: u64 = 0;

    loop {
        let next_deadline = heap.peek().map(|t| t.fire_at);

        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(TimerCmd::Arm { owner, fire_at, callback }) => {
                        next_gen += 1;
                        next_seq += 1;
                        generations.insert(owner.clone(), next_gen);
                        heap.push(PendingTimer {
                            fire_at,
                            seq: next_seq,
                            owner,
                            generation: next_gen,
                            callback,
                        });
                    }
                    Some(TimerCmd::Cancel { owner }) => {
                        generations.remove(&owner);
                    }
                    None => break,
                }
            }
            _ = wait_until(next_deadline) => {
                let now = Instant::now();
                loop {
                    match heap.peek() {
                        Some(t) if t.fire_at <= now => {}
                        _ => break,
                    }
                    let Some(timer) = heap.pop() else { break };
                    let live = generations.get(&timer.owner) == Some(&timer.generation);
                    if live {
                        generations.remove(&timer.owner);
                        debug!("timer fired for {}", timer.owner);
                        tokio::spawn((timer.callback)());
                    }
                }
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(t) => sleep_until(t).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use tokio::time::{advance, Duration};

    fn counting_callback(counter: Arc<AtomicU32>) -> TimerCallback {
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            })
        })
    }

    // let the timer task and any spawned callbacks run to quiescence
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let svc = TimerService::start();
        let fired = Arc::new(AtomicU32::new(0));
        svc.arm("policy:1", Duration::from_secs(5), counting_callback(fired.clone()));

        advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);

        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);

        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_previous_timer() {
        let svc = TimerService::start();
        let fired = Arc::new(AtomicU32::new(0));
        svc.arm("policy:1", Duration::from_secs(5), counting_callback(fired.clone()));
        settle().await;
        svc.arm("policy:1", Duration::from_secs(20), counting_callback(fired.clone()));

        advance(Duration::from_secs(10)).await;
        settle().await;
        // the first timer's deadline has passed but it was superseded
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);

        advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fixed_at_arm_time() {
        let svc = TimerService::start();
        let fired = Arc::new(AtomicU32::new(0));
        // the command sits undrained in the channel while time advances;
        // the deadline must not shift with it
        svc.arm("policy:1", Duration::from_secs(5), counting_callback(fired.clone()));
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let svc = TimerService::start();
        let fired = Arc::new(AtomicU32::new(0));
        svc.arm("policy:1", Duration::from_secs(5), counting_callback(fired.clone()));
        settle().await;
        svc.cancel("policy:1");

        advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_owners() {
        let svc = TimerService::start();
        let a = Arc::new(AtomicU32::new(0));
        let b = Arc::new(AtomicU32::new(0));
        svc.arm("policy:1", Duration::from_secs(5), counting_callback(a.clone()));
        svc.arm("policy:2", Duration::from_secs(10), counting_callback(b.clone()));

        advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(a.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(b.load(AtomicOrdering::SeqCst), 0);

        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(b.load(AtomicOrdering::SeqCst), 1);
    }
}
