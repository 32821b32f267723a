// satchel-core/src/index/persist.rs
//! Per-index persist scheduler.
//!
//! A bounded worker pool drains a FIFO set of dirty value keys. Invariants:
//! - `enqueue` is idempotent while a key waits in the ready set
//! - at most one persist per key is in flight; a key enqueued while its
//!   persist runs stays in the ready set for a later dispatch
//! - `flush` resolves only when the ready set, the in-flight set and the
//!   backoff-scheduled retries are all empty
//!
//! The queue does not know how to persist anything; it calls back into its
//! [`PersistTarget`] (the owning index) for every attempt.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Worker pool size per index
pub const DEFAULT_PERSIST_WORKERS: usize = 4;

/// Immediate merge-retry attempts on an ETag conflict before the key is
/// rescheduled with backoff
pub const IMMEDIATE_RETRY_LIMIT: u32 = 3;

const BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Exponential backoff for rescheduled keys
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    BACKOFF_INITIAL
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_MAX)
}

/// Terminal state of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Entry persisted (or nothing left to do)
    Success,
    /// Retry later with backoff: conflict retries exhausted or the store
    /// was unreachable
    RetryScheduled,
    /// Non-transient failure; the key is dropped
    Failed,
}

/// The owning index's persist hook
#[async_trait]
pub trait PersistTarget: Send + Sync + 'static {
    async fn persist_key(&self, key: &str) -> PersistOutcome;
}

/// Queue introspection
#[derive(Debug, Clone, Copy)]
pub struct PersistStatus {
    pub pending: usize,
    pub running: usize,
    /// Rolling average of one persist dispatch, in milliseconds
    pub avg_persist_ms: f64,
    /// `pending × avg / workers`
    pub estimated_drain_ms: f64,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    ready_set: HashSet<String>,
    running: HashSet<String>,
    /// Keys sleeping in a backoff timer before re-enqueue
    scheduled: usize,
    active_workers: usize,
    reschedule_attempts: HashMap<String, u32>,
    avg_ms: f64,
    completed: u64,
}

impl QueueState {
    fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.running.is_empty() && self.scheduled == 0
    }
}

pub struct PersistQueue {
    target: Mutex<Option<Weak<dyn PersistTarget>>>,
    state: Mutex<QueueState>,
    drained: Notify,
    workers: usize,
    cancelled: AtomicBool,
}

impl PersistQueue {
    pub fn new(workers: usize) -> Arc<Self> {
        Arc::new(PersistQueue {
            target: Mutex::new(None),
            state: Mutex::new(QueueState::default()),
            drained: Notify::new(),
            workers: workers.max(1),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Attach the index this queue persists for. Held weakly so dropping
    /// the index stops the workers.
    pub fn bind(&self, target: Weak<dyn PersistTarget>) {
        *self.target.lock() = Some(target);
    }

    fn target(&self) -> Option<Arc<dyn PersistTarget>> {
        self.target.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Queue a dirty key. Idempotent; spawns a worker when capacity allows.
    pub fn enqueue(self: &Arc<Self>, key: &str) {
        if self.is_cancelled() {
            return;
        }
        let spawn_worker = {
            let mut state = self.state.lock();
            if state.ready_set.insert(key.to_string()) {
                state.ready.push_back(key.to_string());
            }
            if state.active_workers < self.workers {
                state.active_workers += 1;
                true
            } else {
                false
            }
        };
        if spawn_worker {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.worker_loop().await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let key = {
                let mut state = self.state.lock();
                let mut found = None;
                // Skip keys with an in-flight persist; they stay queued
                for _ in 0..state.ready.len() {
                    let candidate = state.ready.pop_front().expect("ready set underflow");
                    if state.running.contains(&candidate) {
                        state.ready.push_back(candidate);
                    } else {
                        state.ready_set.remove(&candidate);
                        state.running.insert(candidate.clone());
                        found = Some(candidate);
                        break;
                    }
                }
                match found {
                    Some(key) => key,
                    None => {
                        state.active_workers -= 1;
                        drop(state);
                        self.drained.notify_waiters();
                        return;
                    }
                }
            };

            // Cancellation is honored at the start of each attempt; the
            // dequeued task is simply dropped.
            if self.is_cancelled() {
                let mut state = self.state.lock();
                state.running.remove(&key);
                state.active_workers -= 1;
                drop(state);
                self.drained.notify_waiters();
                return;
            }

            let Some(target) = self.target() else {
                let mut state = self.state.lock();
                state.running.remove(&key);
                state.active_workers -= 1;
                drop(state);
                self.drained.notify_waiters();
                return;
            };

            let started = Instant::now();
            let outcome = target.persist_key(&key).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let retry_delay = {
                let mut state = self.state.lock();
                state.running.remove(&key);
                state.completed += 1;
                state.avg_ms = if state.completed == 1 {
                    elapsed_ms
                } else {
                    state.avg_ms * 0.8 + elapsed_ms * 0.2
                };
                match outcome {
                    PersistOutcome::Success | PersistOutcome::Failed => {
                        state.reschedule_attempts.remove(&key);
                        None
                    }
                    PersistOutcome::RetryScheduled => {
                        let attempt = state.reschedule_attempts.entry(key.clone()).or_insert(0);
                        *attempt += 1;
                        let delay = backoff_delay(*attempt);
                        state.scheduled += 1;
                        Some(delay)
                    }
                }
            };

            if let Some(delay) = retry_delay {
                let queue = Arc::clone(&self);
                let retry_key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut state = queue.state.lock();
                        state.scheduled -= 1;
                    }
                    if !queue.is_cancelled() {
                        queue.enqueue(&retry_key);
                    }
                    queue.drained.notify_waiters();
                });
            }

            self.drained.notify_waiters();
        }
    }

    /// Wait until nothing is queued, running or sleeping in a backoff.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a completion between the check
            // and the await cannot be missed
            notified.as_mut().enable();
            if self.state.lock().is_drained() {
                return;
            }
            notified.await;
        }
    }

    pub fn status(&self) -> PersistStatus {
        let state = self.state.lock();
        let pending = state.ready.len() + state.scheduled;
        PersistStatus {
            pending,
            running: state.running.len(),
            avg_persist_ms: state.avg_ms,
            estimated_drain_ms: pending as f64 * state.avg_ms / self.workers as f64,
        }
    }

    /// Stop accepting and dispatching work. Tasks not yet dispatched are
    /// dropped; in-flight persists run to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            state.ready.clear();
            state.ready_set.clear();
        }
        self.drained.notify_waiters();
    }
}
