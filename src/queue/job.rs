//! FIFO job queue with same-job deduplication
//!
//! Jobs are `(action, key)` pairs. Offering a job that is already pending
//! with the same action fails with [`QueueError::Duplicate`]; acquire
//! blocks while the queue is paused and returns `None` once the queue is
//! closed. The queue is designed for a single consumer (each reconciler
//! owns one acquire loop).

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::Notify;

/// What a job asks the reconciler to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    /// No-op; jobs with this action are dropped on dispatch
    #[default]
    Invalid,
    /// Resource was first observed
    Add,
    /// Resource content changed
    Update,
    /// Resource is being deleted
    Delete,
    /// Final cleanup after deletion
    Cleanup,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Invalid => "invalid",
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// A unit of reconcile work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Job<K> {
    /// The action to take
    pub action: Action,
    /// Opaque identity the action applies to
    pub key: K,
}

impl<K: fmt::Debug> fmt::Display for Job<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.action, self.key)
    }
}

/// Errors returned by queue operations.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A pending job with the same key and action already exists
    #[error("job duplicated")]
    Duplicate,
    /// The queue (or its background worker) has shut down
    #[error("queue closed")]
    Closed,
}

struct State<K> {
    queue: VecDeque<Job<K>>,
    pending: HashSet<Job<K>>,
    paused: bool,
    closed: bool,
}

/// Unbounded FIFO queue of jobs, deduplicated by `(key, action)`.
pub struct JobQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K> Default for JobQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> JobQueue<K>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty, paused queue. Call [`JobQueue::resume`] before
    /// acquiring.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                pending: HashSet::new(),
                paused: true,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append a job, failing if an identical job is already pending.
    pub fn offer(&self, job: Job<K>) -> Result<(), QueueError> {
        let mut st = self.state.lock().expect("job queue poisoned");
        if st.closed {
            return Err(QueueError::Closed);
        }
        if !st.pending.insert(job.clone()) {
            return Err(QueueError::Duplicate);
        }
        st.queue.push_back(job);
        drop(st);

        self.notify.notify_one();
        Ok(())
    }

    /// Take the next job in FIFO order.
    ///
    /// Blocks while the queue is paused or empty; returns `None` once the
    /// queue has been closed.
    pub async fn acquire(&self) -> Option<Job<K>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.state.lock().expect("job queue poisoned");
                if st.closed {
                    return None;
                }
                if !st.paused {
                    if let Some(job) = st.queue.pop_front() {
                        st.pending.remove(&job);
                        return Some(job);
                    }
                }
            }
            notified.await;
        }
    }

    /// Remove a pending job. Returns whether it was present.
    pub fn remove(&self, job: &Job<K>) -> bool {
        let mut st = self.state.lock().expect("job queue poisoned");
        if !st.pending.remove(job) {
            return false;
        }
        st.queue.retain(|j| j != job);
        true
    }

    /// Find any pending job for `key`, regardless of action.
    pub fn find(&self, key: &K) -> Option<Job<K>> {
        let st = self.state.lock().expect("job queue poisoned");
        st.queue.iter().find(|j| &j.key == key).cloned()
    }

    /// Stop handing out jobs; already-queued jobs survive.
    pub fn pause(&self) {
        self.state.lock().expect("job queue poisoned").paused = true;
    }

    /// Resume handing out jobs.
    pub fn resume(&self) {
        self.state.lock().expect("job queue poisoned").paused = false;
        self.notify.notify_one();
    }

    /// Close the queue; pending acquires return `None` and further offers
    /// fail.
    pub fn close(&self) {
        self.state.lock().expect("job queue poisoned").closed = true;
        self.notify.notify_one();
    }
}
