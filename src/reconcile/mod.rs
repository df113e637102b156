//! Reconcile core: scheduled action -> handler -> next-action/error ->
//! reschedule
//!
//! [`Core`] couples the job queue, the timeout queue, a per-key backoff
//! strategy and a previous/latest snapshot cache into a small state
//! machine. Callers register a [`Handle`] implementation; the core owns
//! retry policy so handlers only report what happened.

pub mod cache;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::queue::{Action, Job, JobQueue, QueueError, Strategy, TimeoutQueue};
pub use cache::Cache;

/// What a handler wants to happen next.
///
/// All fields default to "nothing": no follow-up action, no delay, no
/// error.
#[derive(Default)]
pub struct ReconcileResult {
    /// Follow-up action to schedule for the same key
    pub next: Action,
    /// Delay before the follow-up (or before the retry on error)
    pub delay: Duration,
    /// Handler failure; the core retries the same action with backoff
    pub err: Option<Error>,
}

impl ReconcileResult {
    /// A result that only schedules a follow-up action.
    pub fn then(next: Action) -> Self {
        Self {
            next,
            ..Default::default()
        }
    }

    /// A failed result; the core will retry the current action.
    pub fn fail(err: Error) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }
}

/// Per-action reconcile callbacks.
///
/// `previous`/`latest` come from the core's cache; with
/// `require_cache` set the core guarantees both are present before
/// dispatching.
#[async_trait]
pub trait Handle<V: Send + 'static>: Send + Sync {
    /// Resource was first observed.
    async fn on_added(&self, _latest: Option<V>) -> ReconcileResult {
        ReconcileResult::default()
    }

    /// Resource content changed.
    async fn on_updated(&self, _previous: Option<V>, _latest: Option<V>) -> ReconcileResult {
        ReconcileResult::default()
    }

    /// Resource is being deleted.
    async fn on_deleting(&self, _latest: Option<V>) -> ReconcileResult {
        ReconcileResult::default()
    }

    /// Final cleanup after deletion.
    async fn on_deleted(&self, _latest: Option<V>) -> ReconcileResult {
        ReconcileResult::default()
    }
}

/// Construction options for [`Core`].
pub struct Options<K, V> {
    /// Reconciler name, used as the `reconciler` tracing field
    pub name: &'static str,
    /// Refuse to dispatch when the cache has no snapshot for the key
    pub require_cache: bool,
    /// Retry delay strategy
    pub backoff: Strategy<K>,
    /// The registered handlers
    pub handle: Arc<dyn Handle<V>>,
}

impl<K, V> Options<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Options with the controller's default backoff (1s..1m, factor 2).
    pub fn new(name: &'static str, handle: Arc<dyn Handle<V>>) -> Self {
        Self {
            name,
            require_cache: false,
            backoff: Strategy::default(),
            handle,
        }
    }

    /// Require cache snapshots before dispatching.
    pub fn require_cache(mut self) -> Self {
        self.require_cache = true;
        self
    }
}

/// The reconcile state machine for one watched type or scheduler.
pub struct Core<K, V> {
    name: &'static str,
    job_q: Arc<JobQueue<K>>,
    schedule_q: Arc<TimeoutQueue<Job<K>>>,
    schedule_rx: Mutex<Option<mpsc::UnboundedReceiver<Job<K>>>>,
    cache: Cache<K, V>,
    backoff: Strategy<K>,
    require_cache: bool,
    handle: Arc<dyn Handle<V>>,
    started: AtomicBool,
}

impl<K, V> Core<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a core from options. Call [`Core::start`] before use.
    pub fn new(opts: Options<K, V>) -> Arc<Self> {
        let (schedule_q, schedule_rx) = TimeoutQueue::new();
        Arc::new(Self {
            name: opts.name,
            job_q: Arc::new(JobQueue::new()),
            schedule_q,
            schedule_rx: Mutex::new(Some(schedule_rx)),
            cache: Cache::new(),
            backoff: opts.backoff,
            require_cache: opts.require_cache,
            handle: opts.handle,
            started: AtomicBool::new(false),
        })
    }

    /// The snapshot cache backing this core.
    pub fn cache(&self) -> &Cache<K, V> {
        &self.cache
    }

    /// Start the background scheduling plumbing. Idempotent.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.schedule_q.start(cancel.clone());

        let mut rx = self
            .schedule_rx
            .lock()
            .expect("core poisoned")
            .take()
            .expect("schedule receiver taken once");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        this.job_q.close();
                        return;
                    }
                    due = rx.recv() => {
                        let Some(job) = due else {
                            this.job_q.close();
                            return;
                        };
                        match this.job_q.offer(job) {
                            Ok(()) | Err(QueueError::Duplicate) => {}
                            Err(err) => {
                                warn!(reconciler = this.name, error = %err, "failed to move due job");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Schedule a job, replacing any pending schedule for the same job.
    pub fn schedule(&self, job: Job<K>, delay: Duration) -> Result<(), QueueError> {
        // keep ongoing jobs unique
        self.cancel_schedule(&job);

        if delay.is_zero() {
            match self.job_q.offer(job) {
                Ok(()) | Err(QueueError::Duplicate) => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            self.schedule_q.offer_with_delay(job, delay)
        }
    }

    /// Remove a job from both queues. Returns whether anything was
    /// pending.
    pub fn cancel_schedule(&self, job: &Job<K>) -> bool {
        let in_jobs = self.job_q.remove(job);
        let in_schedule = self.schedule_q.remove(job);
        in_jobs || in_schedule
    }

    /// Run the acquire loop until `stop` fires.
    pub async fn reconcile_until(&self, stop: CancellationToken) {
        self.job_q.resume();
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    self.job_q.pause();
                    return;
                }
                job = self.job_q.acquire() => {
                    let Some(job) = job else { return };
                    self.handle_job(job).await;
                }
            }
        }
    }

    async fn handle_job(&self, job: Job<K>) {
        if job.action == Action::Invalid {
            return;
        }

        let (previous, latest) = self.cache.get(&job.key);

        if self.require_cache && (previous.is_none() || latest.is_none()) {
            // The informer fills the cache before offering, so a miss
            // means the key was already cleaned up; drop the job.
            debug!(reconciler = self.name, job = %job, "cache not found, dropping job");
            return;
        }

        let result = match job.action {
            Action::Invalid => return,
            Action::Add => self.handle.on_added(latest).await,
            Action::Update => {
                let result = self.handle.on_updated(previous, latest).await;
                if result.err.is_none() {
                    // updated successfully, the old snapshot is obsolete
                    self.cache.freeze(&job.key, false);
                }
                result
            }
            Action::Delete => self.handle.on_deleting(latest).await,
            Action::Cleanup => {
                let result = self.handle.on_deleted(latest).await;
                if result.next == Action::Invalid && self.job_q.find(&job.key).is_none() {
                    debug!(reconciler = self.name, job = %job, "deleting cache entry");
                    self.cache.delete(&job.key);
                }
                result
            }
        };

        let mut next = result.next;
        let mut delay = result.delay;

        if let Some(err) = result.err {
            next = job.action;
            if delay.is_zero() {
                delay = self.backoff.next(&job.key);
            }
            warn!(
                reconciler = self.name,
                job = %job,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "reconcile failed, backing off"
            );
        } else if self.backoff.reset(&job.key) {
            debug!(reconciler = self.name, job = %job, "backoff reset");
        }

        if next == Action::Invalid {
            return;
        }

        let next_job = Job {
            action: next,
            key: job.key,
        };
        let offered = if delay.is_zero() {
            match self.job_q.offer(next_job) {
                Ok(()) | Err(QueueError::Duplicate) => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            match self.schedule_q.offer_with_delay(next_job, delay) {
                Ok(()) | Err(QueueError::Duplicate) => Ok(()),
                Err(err) => Err(err),
            }
        };
        if let Err(err) = offered {
            warn!(reconciler = self.name, error = %err, "failed to schedule next job");
        }
    }
}
