//! Domain views of the watched cluster objects
//!
//! The informer layer maps typed Kubernetes objects into these snapshots
//! before caching, so the reconcilers operate on exactly the state they
//! need: merged config data for hashing, workload metadata plus pod spec
//! for trigger extraction.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PodSpec, Secret};
use kube::ResourceExt;

use crate::index::{ConfigKind, ConfigRef, ReloadTarget, TargetKind};

/// `<namespace>/<name>` identity of a watched object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ResourceKey {
    /// Key of any namespaced resource.
    pub fn of(resource: &impl ResourceExt) -> Self {
        Self {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of a ConfigMap or Secret with its data merged into one
/// byte-valued map (string entries win over binary on key collisions).
#[derive(Debug, Clone)]
pub struct ConfigArtifact {
    /// ConfigMap or Secret
    pub kind: ConfigKind,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Object annotations
    pub annotations: BTreeMap<String, String>,
    /// Merged per-key data
    pub data: BTreeMap<String, Vec<u8>>,
}

impl ConfigArtifact {
    /// The whole-object reference for this artifact.
    pub fn whole_ref(&self) -> ConfigRef {
        ConfigRef::new(self.kind, self.namespace.clone(), self.name.clone(), "")
    }

    /// All references this artifact owns: one per data key plus the
    /// whole-object reference.
    pub fn all_refs(&self) -> Vec<ConfigRef> {
        let mut refs: Vec<ConfigRef> = self
            .data
            .keys()
            .map(|k| ConfigRef::new(self.kind, self.namespace.clone(), self.name.clone(), k.clone()))
            .collect();
        refs.push(self.whole_ref());
        refs
    }
}

impl From<&ConfigMap> for ConfigArtifact {
    fn from(cm: &ConfigMap) -> Self {
        let mut data: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if let Some(binary) = &cm.binary_data {
            for (k, v) in binary {
                data.insert(k.clone(), v.0.clone());
            }
        }
        if let Some(plain) = &cm.data {
            for (k, v) in plain {
                data.insert(k.clone(), v.as_bytes().to_vec());
            }
        }
        Self {
            kind: ConfigKind::ConfigMap,
            namespace: cm.namespace().unwrap_or_default(),
            name: cm.name_any(),
            labels: cm.labels().clone(),
            annotations: cm.annotations().clone(),
            data,
        }
    }
}

impl From<&Secret> for ConfigArtifact {
    fn from(secret: &Secret) -> Self {
        let mut data: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        if let Some(binary) = &secret.data {
            for (k, v) in binary {
                data.insert(k.clone(), v.0.clone());
            }
        }
        if let Some(plain) = &secret.string_data {
            for (k, v) in plain {
                data.insert(k.clone(), v.as_bytes().to_vec());
            }
        }
        Self {
            kind: ConfigKind::Secret,
            namespace: secret.namespace().unwrap_or_default(),
            name: secret.name_any(),
            labels: secret.labels().clone(),
            annotations: secret.annotations().clone(),
            data,
        }
    }
}

/// Snapshot of a replicated workload: its own metadata annotations and
/// the pod spec of its template.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Workload kind (never `Pod`)
    pub kind: TargetKind,
    /// Workload namespace
    pub namespace: String,
    /// Workload name
    pub name: String,
    /// The workload's own metadata annotations
    pub annotations: BTreeMap<String, String>,
    /// The pod template's spec
    pub pod_spec: PodSpec,
}

impl Workload {
    /// The reload-target identity of this workload.
    pub fn target(&self) -> ReloadTarget {
        ReloadTarget::new(self.kind, self.namespace.clone(), self.name.clone())
    }
}

impl From<&Deployment> for Workload {
    fn from(deploy: &Deployment) -> Self {
        Self {
            kind: TargetKind::Deployment,
            namespace: deploy.namespace().unwrap_or_default(),
            name: deploy.name_any(),
            annotations: deploy.annotations().clone(),
            pod_spec: deploy
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.clone())
                .unwrap_or_default(),
        }
    }
}

impl From<&DaemonSet> for Workload {
    fn from(ds: &DaemonSet) -> Self {
        Self {
            kind: TargetKind::DaemonSet,
            namespace: ds.namespace().unwrap_or_default(),
            name: ds.name_any(),
            annotations: ds.annotations().clone(),
            pod_spec: ds
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.clone())
                .unwrap_or_default(),
        }
    }
}

impl From<&StatefulSet> for Workload {
    fn from(sts: &StatefulSet) -> Self {
        Self {
            kind: TargetKind::StatefulSet,
            namespace: sts.namespace().unwrap_or_default(),
            name: sts.name_any(),
            annotations: sts.annotations().clone(),
            pod_spec: sts
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.clone())
                .unwrap_or_default(),
        }
    }
}

/// A scheduled reload: the target and the fireable triggers that caused
/// it. Cached in the reload scheduler's core under the target key.
#[derive(Debug, Clone)]
pub struct ReloadJob {
    /// The workload to roll
    pub target: ReloadTarget,
    /// The triggers whose fingerprints go into the pod template
    pub triggers: std::collections::HashSet<ConfigRef>,
}

/// A scheduled syncer rebuild: which config hosts the pipeline definition
/// and which config receives the synced data.
#[derive(Debug, Clone)]
pub struct SyncerAssignment {
    /// The config the synced data is written into
    pub target_config: ConfigRef,
    /// The config key holding the pipeline definition
    pub syncer_config: ConfigRef,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    #[test]
    fn configmap_string_data_wins_over_binary() {
        let cm = ConfigMap {
            metadata: kube::core::ObjectMeta {
                name: Some("c1".to_string()),
                namespace: Some("a".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "string".to_string())])),
            binary_data: Some(BTreeMap::from([
                ("k".to_string(), ByteString(b"binary".to_vec())),
                ("b".to_string(), ByteString(b"only-binary".to_vec())),
            ])),
            ..Default::default()
        };

        let artifact = ConfigArtifact::from(&cm);
        assert_eq!(artifact.kind, ConfigKind::ConfigMap);
        assert_eq!(artifact.data["k"], b"string".to_vec());
        assert_eq!(artifact.data["b"], b"only-binary".to_vec());
    }

    #[test]
    fn secret_maps_to_secret_kind() {
        let secret = Secret {
            metadata: kube::core::ObjectMeta {
                name: Some("s1".to_string()),
                namespace: Some("a".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(b"xyz".to_vec()),
            )])),
            ..Default::default()
        };

        let artifact = ConfigArtifact::from(&secret);
        assert_eq!(artifact.kind, ConfigKind::Secret);
        assert_eq!(artifact.data["token"], b"xyz".to_vec());
    }

    #[test]
    fn all_refs_cover_keys_and_whole_object() {
        let artifact = ConfigArtifact {
            kind: ConfigKind::ConfigMap,
            namespace: "a".to_string(),
            name: "c1".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            data: BTreeMap::from([
                ("x".to_string(), vec![1]),
                ("y".to_string(), vec![2]),
            ]),
        };

        let refs = artifact.all_refs();
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&ConfigRef::new(ConfigKind::ConfigMap, "a", "c1", "")));
        assert!(refs.contains(&ConfigRef::new(ConfigKind::ConfigMap, "a", "c1", "x")));
    }
}
