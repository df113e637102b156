//! Previous/latest snapshot cache for reconcilers
//!
//! Every key holds the pair `(previous, latest)`. A key can be frozen to
//! keep `previous` pinned at the pre-update snapshot across retries; the
//! core clears the freeze once an update handler succeeds.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::RwLock;

struct Inner<K, V> {
    frozen: HashSet<K>,
    previous: HashMap<K, V>,
    latest: HashMap<K, V>,
}

/// Snapshot cache of `key -> (previous, latest)` with per-key freeze.
pub struct Cache<K, V> {
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> Default for Cache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                frozen: HashSet::new(),
                previous: HashMap::new(),
                latest: HashMap::new(),
            }),
        }
    }

    /// Pin (or unpin) the `previous` snapshot for `key`.
    pub fn freeze(&self, key: &K, freeze: bool) {
        let mut inner = self.inner.write().expect("cache poisoned");
        if freeze {
            inner.frozen.insert(key.clone());
        } else {
            inner.frozen.remove(key);
        }
    }

    /// Record a new observation.
    ///
    /// Unless frozen, `previous` takes the explicitly provided old value,
    /// or the previously-latest value when none is given. A first-ever
    /// `latest` also seeds `previous` so both sides are always populated
    /// together.
    pub fn update(&self, key: &K, previous: Option<V>, latest: Option<V>) {
        let mut inner = self.inner.write().expect("cache poisoned");

        if !inner.frozen.contains(key) {
            if let Some(old) = previous {
                inner.previous.insert(key.clone(), old);
            } else if let Some(cur) = inner.latest.get(key).cloned() {
                inner.previous.insert(key.clone(), cur);
            }
        }

        if let Some(new) = latest {
            if !inner.previous.contains_key(key) {
                inner.previous.insert(key.clone(), new.clone());
            }
            inner.latest.insert(key.clone(), new);
        }
    }

    /// Drop both snapshots for `key`.
    pub fn delete(&self, key: &K) {
        let mut inner = self.inner.write().expect("cache poisoned");
        inner.previous.remove(key);
        inner.latest.remove(key);
        inner.frozen.remove(key);
    }

    /// Fetch `(previous, latest)` for `key`.
    pub fn get(&self, key: &K) -> (Option<V>, Option<V>) {
        let inner = self.inner.read().expect("cache poisoned");
        (
            inner.previous.get(key).cloned(),
            inner.latest.get(key).cloned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_seeds_both_sides() {
        let cache: Cache<&str, i32> = Cache::new();
        cache.update(&"k", None, Some(1));
        assert_eq!(cache.get(&"k"), (Some(1), Some(1)));
    }

    #[test]
    fn second_observation_moves_latest_to_previous() {
        let cache: Cache<&str, i32> = Cache::new();
        cache.update(&"k", None, Some(1));
        cache.update(&"k", None, Some(2));
        assert_eq!(cache.get(&"k"), (Some(1), Some(2)));
    }

    #[test]
    fn explicit_previous_wins() {
        let cache: Cache<&str, i32> = Cache::new();
        cache.update(&"k", Some(7), Some(8));
        assert_eq!(cache.get(&"k"), (Some(7), Some(8)));
    }

    #[test]
    fn freeze_pins_previous_across_updates() {
        let cache: Cache<&str, i32> = Cache::new();
        cache.update(&"k", None, Some(1));
        cache.freeze(&"k", true);
        cache.update(&"k", None, Some(2));
        cache.update(&"k", None, Some(3));
        assert_eq!(cache.get(&"k"), (Some(1), Some(3)));

        cache.freeze(&"k", false);
        cache.update(&"k", None, Some(4));
        assert_eq!(cache.get(&"k"), (Some(3), Some(4)));
    }

    #[test]
    fn delete_clears_everything() {
        let cache: Cache<&str, i32> = Cache::new();
        cache.update(&"k", None, Some(1));
        cache.freeze(&"k", true);
        cache.delete(&"k");
        assert_eq!(cache.get(&"k"), (None, None));

        // freeze state must not survive deletion
        cache.update(&"k", None, Some(5));
        cache.update(&"k", None, Some(6));
        assert_eq!(cache.get(&"k"), (Some(5), Some(6)));
    }
}
