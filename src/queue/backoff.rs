//! Per-key exponential backoff
//!
//! Tracks a miss count per key and yields `min(cap, base * factor^n)`
//! delays. Unlike a retry wrapper, the strategy holds no operation: the
//! reconcile core asks it for the next delay when a handler fails and
//! resets it on success.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// Per-key exponential-with-cap delay generator.
pub struct Strategy<K> {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    misses: Mutex<HashMap<K, u32>>,
}

impl<K> Strategy<K>
where
    K: Clone + Eq + Hash,
{
    /// Create a strategy yielding `initial_delay * factor^n` capped at
    /// `max_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
            misses: Mutex::new(HashMap::new()),
        }
    }

    /// The next delay for `key`, growing the per-key miss count.
    pub fn next(&self, key: &K) -> Duration {
        let mut misses = self.misses.lock().expect("backoff poisoned");
        let n = misses.entry(key.clone()).or_insert(0);
        let delay = Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * self.factor.powi(*n as i32))
                .min(self.max_delay.as_secs_f64()),
        );
        *n += 1;
        delay
    }

    /// Clear state for `key`; returns whether any misses were recorded.
    pub fn reset(&self, key: &K) -> bool {
        self.misses
            .lock()
            .expect("backoff poisoned")
            .remove(key)
            .is_some()
    }
}

impl<K> Default for Strategy<K>
where
    K: Clone + Eq + Hash,
{
    /// The controller defaults: 1s initial delay, 1m cap, factor 2.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_until_cap() {
        let s: Strategy<&str> = Strategy::default();
        assert_eq!(s.next(&"k"), Duration::from_secs(1));
        assert_eq!(s.next(&"k"), Duration::from_secs(2));
        assert_eq!(s.next(&"k"), Duration::from_secs(4));
        assert_eq!(s.next(&"k"), Duration::from_secs(8));
        assert_eq!(s.next(&"k"), Duration::from_secs(16));
        assert_eq!(s.next(&"k"), Duration::from_secs(32));
        assert_eq!(s.next(&"k"), Duration::from_secs(60));
        assert_eq!(s.next(&"k"), Duration::from_secs(60));
    }

    #[test]
    fn keys_are_independent() {
        let s: Strategy<&str> = Strategy::default();
        assert_eq!(s.next(&"a"), Duration::from_secs(1));
        assert_eq!(s.next(&"a"), Duration::from_secs(2));
        assert_eq!(s.next(&"b"), Duration::from_secs(1));
    }

    #[test]
    fn reset_reports_whether_state_existed() {
        let s: Strategy<&str> = Strategy::default();
        assert!(!s.reset(&"k"), "reset of untouched key reports initial");
        s.next(&"k");
        assert!(s.reset(&"k"));
        assert_eq!(s.next(&"k"), Duration::from_secs(1), "reset restarts");
    }
}
