//! Delayed-delivery queue
//!
//! A min-heap of `(due, key)` entries drained by a background task onto a
//! take channel. Entries fire in due-time order, ties broken by insertion
//! order. A key can only be scheduled once at a time; [`TimeoutQueue::remove`]
//! cancels a pending delivery.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::job::QueueError;

struct Entry<K> {
    due: Instant,
    seq: u64,
    key: K,
}

// Heap entries order by due time, then insertion sequence; the key never
// participates. BinaryHeap is a max-heap, so comparisons are reversed.
impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl<K> Eq for Entry<K> {}
impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

struct State<K> {
    heap: BinaryHeap<Entry<K>>,
    // key -> live sequence number; heap entries with a stale sequence are
    // cancellations and get skipped on pop
    active: HashMap<K, u64>,
    next_seq: u64,
}

/// Min-heap of delayed keys, drained onto a take channel at their due time.
pub struct TimeoutQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    tx: mpsc::UnboundedSender<K>,
    started: AtomicBool,
}

impl<K> TimeoutQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue and its take channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let q = Arc::new(Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                active: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            tx,
            started: AtomicBool::new(false),
        });
        (q, rx)
    }

    /// Start the background drain task. Idempotent; the task exits when
    /// `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        if self.started.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let q = self.clone();
        tokio::spawn(async move { q.drain(cancel).await });
    }

    /// Schedule `key` for delivery after `delay`.
    ///
    /// Fails with [`QueueError::Duplicate`] if the key is already
    /// scheduled and not yet delivered or removed.
    pub fn offer_with_delay(&self, key: K, delay: Duration) -> Result<(), QueueError> {
        let mut st = self.state.lock().expect("timeout queue poisoned");
        if st.active.contains_key(&key) {
            return Err(QueueError::Duplicate);
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        st.active.insert(key.clone(), seq);
        st.heap.push(Entry {
            due: Instant::now() + delay,
            seq,
            key,
        });
        drop(st);

        self.notify.notify_one();
        Ok(())
    }

    /// Cancel a pending delivery. Returns whether one was pending.
    pub fn remove(&self, key: &K) -> bool {
        let mut st = self.state.lock().expect("timeout queue poisoned");
        st.active.remove(key).is_some()
    }

    async fn drain(&self, cancel: CancellationToken) {
        loop {
            let notified = self.notify.notified();
            let next_due = self.pop_due();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = notified => {}
                _ = async {
                    match next_due {
                        Some(due) => tokio::time::sleep_until(due).await,
                        None => std::future::pending().await,
                    }
                } => {}
            }
        }
    }

    // Deliver everything that is due; returns the due time of the next
    // pending entry, if any.
    fn pop_due(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut st = self.state.lock().expect("timeout queue poisoned");

        loop {
            let head_due = st.heap.peek()?.due;

            // skip cancelled entries regardless of due time
            let stale = {
                let head = st.heap.peek().expect("peeked above");
                st.active.get(&head.key) != Some(&head.seq)
            };
            if stale {
                st.heap.pop();
                continue;
            }

            if head_due > now {
                return Some(head_due);
            }

            let entry = st.heap.pop().expect("peeked above");
            st.active.remove(&entry.key);
            // receiver dropped means the owner is shutting down
            if self.tx.send(entry.key).is_err() {
                return None;
            }
        }
    }
}
