//! Reload index: which config keys roll which workloads
//!
//! The bipartite index maps each [`ConfigRef`] trigger to the set of
//! [`ReloadTarget`]s that must react to it, alongside the last observed
//! content hash per reference. Both maps live under one read/write lock so
//! delta notification reads a consistent snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use md5::Md5;
use sha2::{Digest, Sha256};

/// Kind of a config artifact that can trigger reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigKind {
    /// A ConfigMap
    ConfigMap,
    /// A Secret
    Secret,
}

impl ConfigKind {
    /// Stable identity string, also the first segment of the canonical
    /// reference path hashed into reload annotations.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::ConfigMap => "conf:cm",
            ConfigKind::Secret => "conf:secret",
        }
    }
}

/// Kind of a workload that can be rolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    /// A bare pod; reloaded by deletion
    Pod,
    /// A DaemonSet
    DaemonSet,
    /// A Deployment
    Deployment,
    /// A StatefulSet
    StatefulSet,
}

impl TargetKind {
    /// Stable identity string.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Pod => "reload:pod",
            TargetKind::DaemonSet => "reload:ds",
            TargetKind::Deployment => "reload:deploy",
            TargetKind::StatefulSet => "reload:sts",
        }
    }
}

/// Identity of a content source: one key of a ConfigMap/Secret, or the
/// whole object when `key` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigRef {
    /// ConfigMap or Secret
    pub kind: ConfigKind,
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
    /// Data key; empty means the whole object
    pub key: String,
}

impl ConfigRef {
    /// Build a reference; an empty `key` denotes the whole object.
    pub fn new(
        kind: ConfigKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            key: key.into(),
        }
    }

    /// The whole-object reference for the same object.
    pub fn whole_object(&self) -> Self {
        Self {
            key: String::new(),
            ..self.clone()
        }
    }

    /// Canonical slash-joined path (`conf:cm/ns/name/key`), empty
    /// segments omitted. This is the input of the annotation-key
    /// stability hash.
    pub fn canonical_path(&self) -> String {
        let mut path = format!("{}/{}/{}", self.kind.as_str(), self.namespace, self.name);
        if !self.key.is_empty() {
            path.push('/');
            path.push_str(&self.key);
        }
        path
    }
}

impl fmt::Display for ConfigRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/ns:{}/name:{}",
            self.kind.as_str(),
            self.namespace,
            self.name
        )?;
        if !self.key.is_empty() {
            write!(f, "/key:{}", self.key)?;
        }
        Ok(())
    }
}

/// Identity of a workload to be rolled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReloadTarget {
    /// Workload kind
    pub kind: TargetKind,
    /// Namespace of the workload
    pub namespace: String,
    /// Name of the workload
    pub name: String,
}

impl ReloadTarget {
    /// Build a target identity.
    pub fn new(kind: TargetKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/ns:{}/name:{}",
            self.kind.as_str(),
            self.namespace,
            self.name
        )
    }
}

/// Hex-encoded SHA-256 of a config value.
pub type ContentHash = String;

/// Compute per-key and whole-object content hashes for one config
/// artifact.
///
/// The whole-object hash (key `""`) is the SHA-256 of the per-key values
/// concatenated in lexicographic key order, so it is deterministic across
/// platforms.
pub fn content_hashes(
    kind: ConfigKind,
    namespace: &str,
    name: &str,
    data: &BTreeMap<String, Vec<u8>>,
) -> HashMap<ConfigRef, ContentHash> {
    let mut result = HashMap::with_capacity(data.len() + 1);
    let mut all = Sha256::new();

    for (key, value) in data {
        result.insert(
            ConfigRef::new(kind, namespace, name, key.clone()),
            hex::encode(Sha256::digest(value)),
        );
        all.update(value);
    }

    result.insert(
        ConfigRef::new(kind, namespace, name, ""),
        hex::encode(all.finalize()),
    );
    result
}

/// Annotation key for a trigger's content-hash fingerprint.
///
/// The md5 keeps the key within annotation length limits; it is a
/// stability hash over the canonical reference path, not a security hash.
pub fn fingerprint_key(prefix: &str, trigger: &ConfigRef) -> String {
    let digest = Md5::digest(trigger.canonical_path().as_bytes());
    format!("{}/{}", prefix, hex::encode(digest))
}

struct IndexState {
    triggers: HashMap<ConfigRef, HashSet<ReloadTarget>>,
    hashes: HashMap<ConfigRef, ContentHash>,
}

/// The bipartite trigger index plus content-hash table.
pub struct ReloadIndex {
    state: RwLock<IndexState>,
}

impl Default for ReloadIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState {
                triggers: HashMap::new(),
                hashes: HashMap::new(),
            }),
        }
    }

    /// Record hashes without firing anything (first observation path).
    pub fn update_hashes(&self, hashes: HashMap<ConfigRef, ContentHash>) {
        let mut st = self.state.write().expect("reload index poisoned");
        st.hashes.extend(hashes);
    }

    /// Forget hashes for deleted artifacts.
    pub fn remove_hashes<'a>(&self, refs: impl IntoIterator<Item = &'a ConfigRef>) {
        let mut st = self.state.write().expect("reload index poisoned");
        for r in refs {
            st.hashes.remove(r);
        }
    }

    /// The last recorded hash for a reference.
    pub fn hash_of(&self, r: &ConfigRef) -> Option<ContentHash> {
        let st = self.state.read().expect("reload index poisoned");
        st.hashes.get(r).cloned()
    }

    /// Apply hash updates and return the *fireable* references: those that
    /// had a different hash recorded before. A first observation never
    /// fires.
    pub fn apply_hash_deltas(
        &self,
        hashes: HashMap<ConfigRef, ContentHash>,
    ) -> HashSet<ConfigRef> {
        let mut st = self.state.write().expect("reload index poisoned");
        let mut fireable = HashSet::new();

        for (r, hash) in hashes {
            match st.hashes.get(&r) {
                Some(old) if *old != hash => {
                    fireable.insert(r.clone());
                }
                _ => {}
            }
            st.hashes.insert(r, hash);
        }

        fireable
    }

    /// Rewrite the trigger set of `target`.
    ///
    /// The target is first removed from every trigger's value set (pruning
    /// now-empty keys), then inserted under each of `triggers`. An empty
    /// set removes the target entirely (observed delete or no remaining
    /// triggers).
    pub fn ensure_target(&self, target: &ReloadTarget, triggers: HashSet<ConfigRef>) {
        let mut st = self.state.write().expect("reload index poisoned");

        // decrement all reverse edges first; diffing alone would leave
        // orphaned entries when triggers are renamed
        st.triggers.retain(|_, targets| {
            targets.remove(target);
            !targets.is_empty()
        });

        for t in triggers {
            st.triggers.entry(t).or_default().insert(target.clone());
        }
    }

    /// Union of the targets wired to any of `refs`.
    pub fn targets_for<'a>(
        &self,
        refs: impl IntoIterator<Item = &'a ConfigRef>,
    ) -> HashSet<ReloadTarget> {
        let st = self.state.read().expect("reload index poisoned");
        let mut targets = HashSet::new();
        for r in refs {
            if let Some(set) = st.triggers.get(r) {
                targets.extend(set.iter().cloned());
            }
        }
        targets
    }

    /// The triggers currently registered for `target` (test and debug
    /// introspection).
    pub fn triggers_of(&self, target: &ReloadTarget) -> HashSet<ConfigRef> {
        let st = self.state.read().expect("reload index poisoned");
        st.triggers
            .iter()
            .filter(|(_, targets)| targets.contains(target))
            .map(|(r, _)| r.clone())
            .collect()
    }

    /// Fingerprint annotations (`<prefix>/<md5> -> sha256:<hex>`) for the
    /// subset of `triggers` with a known hash.
    pub fn fingerprint_annotations(
        &self,
        prefix: &str,
        triggers: &HashSet<ConfigRef>,
    ) -> BTreeMap<String, String> {
        let st = self.state.read().expect("reload index poisoned");
        let mut annotations = BTreeMap::new();
        for t in triggers {
            let Some(hash) = st.hashes.get(t) else {
                continue;
            };
            annotations.insert(fingerprint_key(prefix, t), format!("sha256:{hash}"));
        }
        annotations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm_ref(name: &str, key: &str) -> ConfigRef {
        ConfigRef::new(ConfigKind::ConfigMap, "a", name, key)
    }

    fn deploy(name: &str) -> ReloadTarget {
        ReloadTarget::new(TargetKind::Deployment, "a", name)
    }

    fn hashes_for(data: &[(&str, &str)]) -> HashMap<ConfigRef, ContentHash> {
        let map: BTreeMap<String, Vec<u8>> = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        content_hashes(ConfigKind::ConfigMap, "a", "c1", &map)
    }

    #[test]
    fn per_key_hash_is_sha256_of_value() {
        let hashes = hashes_for(&[("k", "v1")]);
        assert_eq!(
            hashes[&cm_ref("c1", "k")],
            hex::encode(Sha256::digest(b"v1"))
        );
    }

    #[test]
    fn whole_object_hash_concatenates_in_sorted_key_order() {
        let hashes = hashes_for(&[("b", "2"), ("a", "1")]);
        assert_eq!(
            hashes[&cm_ref("c1", "")],
            hex::encode(Sha256::digest(b"12")),
            "values must concatenate in lexicographic key order"
        );
    }

    #[test]
    fn whole_object_and_per_key_hashes_coexist() {
        let index = ReloadIndex::new();
        index.update_hashes(hashes_for(&[("k", "v1")]));
        assert!(index.hash_of(&cm_ref("c1", "k")).is_some());
        assert!(index.hash_of(&cm_ref("c1", "")).is_some());
    }

    #[test]
    fn first_observation_never_fires() {
        let index = ReloadIndex::new();
        let fireable = index.apply_hash_deltas(hashes_for(&[("k", "v1")]));
        assert!(fireable.is_empty());
    }

    #[test]
    fn changed_hash_fires() {
        let index = ReloadIndex::new();
        index.update_hashes(hashes_for(&[("k", "v1")]));

        let fireable = index.apply_hash_deltas(hashes_for(&[("k", "v2")]));
        assert!(fireable.contains(&cm_ref("c1", "k")));
        assert!(fireable.contains(&cm_ref("c1", "")), "whole-object fires too");
    }

    #[test]
    fn unchanged_hash_does_not_fire() {
        let index = ReloadIndex::new();
        index.update_hashes(hashes_for(&[("k", "v1")]));
        let fireable = index.apply_hash_deltas(hashes_for(&[("k", "v1")]));
        assert!(fireable.is_empty());
    }

    #[test]
    fn ensure_target_is_exact() {
        let index = ReloadIndex::new();
        let t = deploy("d");
        index.ensure_target(
            &t,
            HashSet::from([cm_ref("c1", "k"), cm_ref("c2", "")]),
        );

        // every listed trigger maps to the target, nothing else does
        assert!(index.targets_for([&cm_ref("c1", "k")].into_iter()).contains(&t));
        assert!(index.targets_for([&cm_ref("c2", "")].into_iter()).contains(&t));
        assert!(index.targets_for([&cm_ref("c3", "")].into_iter()).is_empty());

        // renaming a trigger prunes the stale edge entirely
        index.ensure_target(&t, HashSet::from([cm_ref("c3", "")]));
        assert!(index.targets_for([&cm_ref("c1", "k")].into_iter()).is_empty());
        assert!(index.targets_for([&cm_ref("c2", "")].into_iter()).is_empty());
        assert!(index.targets_for([&cm_ref("c3", "")].into_iter()).contains(&t));
        assert_eq!(index.triggers_of(&t), HashSet::from([cm_ref("c3", "")]));
    }

    #[test]
    fn deleted_target_appears_in_no_set() {
        let index = ReloadIndex::new();
        let t1 = deploy("d1");
        let t2 = deploy("d2");
        index.ensure_target(&t1, HashSet::from([cm_ref("c1", "")]));
        index.ensure_target(&t2, HashSet::from([cm_ref("c1", "")]));

        index.ensure_target(&t1, HashSet::new());
        let targets = index.targets_for([&cm_ref("c1", "")].into_iter());
        assert_eq!(targets, HashSet::from([t2]));
    }

    #[test]
    fn trigger_without_hash_never_fires_but_indexes() {
        let index = ReloadIndex::new();
        let t = deploy("d");
        index.ensure_target(&t, HashSet::from([cm_ref("c9", "")]));

        // the trigger is indexed even though no hash is known
        assert!(index.targets_for([&cm_ref("c9", "")].into_iter()).contains(&t));
        // and its fingerprint annotation is simply absent
        let annotations =
            index.fingerprint_annotations("hash.resync.dev", &HashSet::from([cm_ref("c9", "")]));
        assert!(annotations.is_empty());
    }

    #[test]
    fn fingerprint_annotation_matches_canonical_md5() {
        let index = ReloadIndex::new();
        index.update_hashes(HashMap::from([(
            cm_ref("c1", "k"),
            hex::encode(Sha256::digest(b"v2")),
        )]));

        let annotations =
            index.fingerprint_annotations("hash.resync.dev", &HashSet::from([cm_ref("c1", "k")]));

        let expected_key = format!(
            "hash.resync.dev/{}",
            hex::encode(Md5::digest(b"conf:cm/a/c1/k"))
        );
        let expected_value = format!("sha256:{}", hex::encode(Sha256::digest(b"v2")));
        assert_eq!(
            annotations,
            BTreeMap::from([(expected_key, expected_value)])
        );
    }

    #[test]
    fn canonical_path_omits_empty_key() {
        assert_eq!(cm_ref("c1", "").canonical_path(), "conf:cm/a/c1");
        assert_eq!(cm_ref("c1", "k").canonical_path(), "conf:cm/a/c1/k");
    }

    #[test]
    fn remove_hashes_forgets_state() {
        let index = ReloadIndex::new();
        let hashes = hashes_for(&[("k", "v1")]);
        let refs: Vec<ConfigRef> = hashes.keys().cloned().collect();
        index.update_hashes(hashes);

        index.remove_hashes(refs.iter());
        assert!(index.hash_of(&cm_ref("c1", "k")).is_none());

        // after removal, re-observation is a first sight again
        let fireable = index.apply_hash_deltas(hashes_for(&[("k", "v2")]));
        assert!(fireable.is_empty());
    }
}
