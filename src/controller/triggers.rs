//! Trigger extraction: which config references should roll a workload
//!
//! Two passes exist. The template-level pass works from a workload's own
//! annotations and pod template and ignores `$(VAR)` expressions; the
//! pod-specific pass resolves those expressions against a live pod's
//! container environment.

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodSpec, Secret};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use tracing::debug;

use super::env::container_env;
use crate::error::Error;
use crate::expand;
use crate::index::{ConfigKind, ConfigRef};
use crate::{
    ANNOTATION_CONFIGMAPS, ANNOTATION_FORCE_CONFIGMAPS, ANNOTATION_FORCE_SECRETS,
    ANNOTATION_SECRETS,
};

/// One `name[/key]` entry of a restriction annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameKey {
    /// Object name
    pub name: String,
    /// Data key; empty means the whole object
    pub key: String,
}

/// Parse a comma-separated `name[/key]` list. A trailing empty key
/// (`name/`) is normalized to the whole-object form.
pub fn parse_name_key_list(list: &str) -> Vec<NameKey> {
    list.split(',')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('/') {
            Some((name, key)) => NameKey {
                name: name.to_string(),
                key: key.to_string(),
            },
            None => NameKey {
                name: entry.to_string(),
                key: String::new(),
            },
        })
        .collect()
}

// name -> explicit keys (None means whole object / default keys)
type EntryMap = HashMap<String, Option<HashSet<String>>>;

#[derive(Default)]
struct AnnotationSpec {
    present: bool,
    disabled: bool,
    entries: EntryMap,
}

fn parse_annotation(annotations: &BTreeMap<String, String>, key: &str) -> AnnotationSpec {
    let mut spec = AnnotationSpec::default();
    let Some(value) = annotations.get(key) else {
        return spec;
    };
    spec.present = true;

    if value.is_empty() {
        // annotation with no value disables this kind of trigger
        spec.disabled = true;
        return spec;
    }

    for pair in parse_name_key_list(value) {
        if pair.name.contains('$') || pair.key.contains('$') {
            // pod specific values, not evaluated at template level
            continue;
        }

        if pair.key.is_empty() {
            spec.entries.insert(pair.name, None);
        } else {
            match spec.entries.entry(pair.name) {
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    e.get_mut().get_or_insert_with(HashSet::new).insert(pair.key);
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(Some(HashSet::from([pair.key])));
                }
            }
        }
    }

    spec
}

/// Template-level trigger extraction from a workload's metadata and pod
/// spec.
///
/// Returns the empty set when the workload opts out of everything, which
/// callers treat as "remove the target".
pub fn template_triggers(
    annotations: &BTreeMap<String, String>,
    namespace: &str,
    pod_spec: &PodSpec,
) -> HashSet<ConfigRef> {
    let cms = parse_annotation(annotations, ANNOTATION_CONFIGMAPS);
    let secrets = parse_annotation(annotations, ANNOTATION_SECRETS);
    let force_cms = parse_annotation(annotations, ANNOTATION_FORCE_CONFIGMAPS);
    let force_secrets = parse_annotation(annotations, ANNOTATION_FORCE_SECRETS);

    if cms.disabled
        && secrets.disabled
        && force_cms.entries.is_empty()
        && force_secrets.entries.is_empty()
    {
        return HashSet::new();
    }

    let mut triggers = HashSet::new();
    let mut cm_entries = cms.entries;
    let mut secret_entries = secrets.entries;

    for vol in pod_spec.volumes.as_deref().unwrap_or_default() {
        if let Some(cm_vol) = &vol.config_map {
            if cms.disabled {
                continue;
            }
            if cms.present {
                match cm_entries.get(&cm_vol.name) {
                    // this volume is not intended for reload triggering
                    None => continue,
                    // explicit keys are authoritative; handled below
                    Some(Some(_)) => continue,
                    Some(None) => {}
                }
            }

            scan_volume(
                &mut triggers,
                ConfigKind::ConfigMap,
                namespace,
                &cm_vol.name,
                &vol.name,
                cm_vol
                    .items
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|i| i.key.as_str()),
                pod_spec,
            );
            cm_entries.remove(&cm_vol.name);
        } else if let Some(secret_vol) = &vol.secret {
            if secrets.disabled {
                continue;
            }
            let Some(secret_name) = secret_vol.secret_name.as_deref() else {
                continue;
            };
            if secrets.present {
                match secret_entries.get(secret_name) {
                    None => continue,
                    Some(Some(_)) => continue,
                    Some(None) => {}
                }
            }

            scan_volume(
                &mut triggers,
                ConfigKind::Secret,
                namespace,
                secret_name,
                &vol.name,
                secret_vol
                    .items
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|i| i.key.as_str()),
                pod_spec,
            );
            secret_entries.remove(secret_name);
        }
    }

    // annotation-only refs (no volume consumed them) and force refs
    for (kind, entries) in [
        (ConfigKind::ConfigMap, cm_entries),
        (ConfigKind::ConfigMap, force_cms.entries),
        (ConfigKind::Secret, secret_entries),
        (ConfigKind::Secret, force_secrets.entries),
    ] {
        for (name, keys) in entries {
            match keys {
                None => {
                    triggers.insert(ConfigRef::new(kind, namespace, name.as_str(), ""));
                }
                Some(keys) => {
                    for key in keys {
                        triggers.insert(ConfigRef::new(kind, namespace, name.as_str(), key));
                    }
                }
            }
        }
    }

    triggers
}

// Volume scan: any mount of this volume without a subPath requires the
// whole object; literal subPath mounts add per-key refs independently.
// A volume nothing mounts still gets a whole-object ref (init containers
// may load it out-of-band).
#[allow(clippy::too_many_arguments)]
fn scan_volume<'a>(
    triggers: &mut HashSet<ConfigRef>,
    kind: ConfigKind,
    namespace: &str,
    source_name: &str,
    volume_name: &str,
    items: impl Iterator<Item = &'a str>,
    pod_spec: &PodSpec,
) {
    let mut require_whole = false;
    let mut added = false;

    'containers: for container in pod_spec.containers.iter() {
        for mount in container.volume_mounts.as_deref().unwrap_or_default() {
            if mount.name != volume_name {
                continue;
            }
            let sub_path = mount.sub_path.as_deref().unwrap_or_default();
            let sub_path_expr = mount.sub_path_expr.as_deref().unwrap_or_default();

            if sub_path.is_empty() && sub_path_expr.is_empty() {
                require_whole = true;
                break 'containers;
            }
            if !sub_path.is_empty() {
                added = true;
                triggers.insert(ConfigRef::new(kind, namespace, source_name, sub_path));
            }
            // subPathExpr mounts are resolved per pod, not here
        }
    }

    if require_whole {
        let mut any_item = false;
        for item in items {
            any_item = true;
            added = true;
            triggers.insert(ConfigRef::new(kind, namespace, source_name, item));
        }
        if !any_item {
            added = true;
            triggers.insert(ConfigRef::new(kind, namespace, source_name, ""));
        }
    }

    if !added {
        triggers.insert(ConfigRef::new(kind, namespace, source_name, ""));
    }
}

/// Pod-specific trigger extraction: resolves `$(VAR)` expressions in the
/// owner's annotations and in `subPathExpr` mounts against this pod's
/// container environment.
pub fn pod_triggers(
    owner_annotations: &BTreeMap<String, String>,
    pod: &Pod,
    cm_store: &Store<ConfigMap>,
    secret_store: &Store<Secret>,
) -> Result<HashSet<ConfigRef>, Error> {
    let namespace = pod.namespace().unwrap_or_default();
    let Some(pod_spec) = pod.spec.as_ref() else {
        return Ok(HashSet::new());
    };

    // volume name -> (kind, source object name)
    let mut volume_sources: HashMap<&str, (ConfigKind, &str)> = HashMap::new();
    for vol in pod_spec.volumes.as_deref().unwrap_or_default() {
        if let Some(cm_vol) = &vol.config_map {
            volume_sources.insert(&vol.name, (ConfigKind::ConfigMap, &cm_vol.name));
        } else if let Some(secret_vol) = &vol.secret {
            if let Some(secret_name) = secret_vol.secret_name.as_deref() {
                volume_sources.insert(&vol.name, (ConfigKind::Secret, secret_name));
            }
        }
    }

    let annotation_kinds = [
        (ANNOTATION_CONFIGMAPS, ConfigKind::ConfigMap),
        (ANNOTATION_FORCE_CONFIGMAPS, ConfigKind::ConfigMap),
        (ANNOTATION_SECRETS, ConfigKind::Secret),
        (ANNOTATION_FORCE_SECRETS, ConfigKind::Secret),
    ];
    let eval_annotations = annotation_kinds.iter().any(|(key, _)| {
        owner_annotations
            .get(*key)
            .is_some_and(|v| v.contains('$'))
    });
    let eval_pod = !volume_sources.is_empty();

    if !eval_annotations && !eval_pod {
        return Ok(HashSet::new());
    }

    let mut triggers = HashSet::new();
    let mut merged_env: HashMap<String, String> = HashMap::new();

    if eval_annotations {
        debug!("resolving init container envs");
        for container in pod_spec.init_containers.as_deref().unwrap_or_default() {
            merged_env.extend(container_env(pod, container, cm_store, secret_store)?);
        }
    }

    debug!("resolving work container envs");
    for container in pod_spec.containers.iter() {
        let env = container_env(pod, container, cm_store, secret_store)?;

        if eval_pod {
            for mount in container.volume_mounts.as_deref().unwrap_or_default() {
                let Some((kind, source_name)) = volume_sources.get(mount.name.as_str()) else {
                    continue;
                };
                let Some(expr) = mount.sub_path_expr.as_deref() else {
                    continue;
                };
                if !expr.contains('$') {
                    continue;
                }

                let key = expand::expand_strict(expr, |name| env.get(name).cloned())
                    .map_err(|e| {
                        Error::internal(
                            "triggers",
                            format!(
                                "failed to expand subPathExpr for container {:?}: {e}",
                                container.name
                            ),
                        )
                    })?;
                triggers.insert(ConfigRef::new(*kind, namespace.as_str(), *source_name, key));
            }
        }

        merged_env.extend(env);
    }

    if eval_annotations {
        debug!("resolving annotated triggers");
        for (annotation, kind) in annotation_kinds {
            let Some(value) = owner_annotations.get(annotation) else {
                continue;
            };
            if !value.contains('$') {
                continue;
            }

            for pair in parse_name_key_list(value) {
                let name_is_expr = pair.name.contains('$');
                let key_is_expr = pair.key.contains('$');
                if !name_is_expr && !key_is_expr {
                    continue;
                }

                let name = if name_is_expr {
                    expand::expand_strict(&pair.name, |n| merged_env.get(n).cloned())?
                } else {
                    pair.name.clone()
                };
                let key = if key_is_expr {
                    expand::expand_strict(&pair.key, |n| merged_env.get(n).cloned())?
                } else {
                    pair.key.clone()
                };

                triggers.insert(ConfigRef::new(kind, namespace.as_str(), name, key));
            }
        }
    }

    Ok(triggers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMapVolumeSource, Container, EnvVar, KeyToPath, SecretVolumeSource, Volume,
        VolumeMount,
    };
    use kube::core::ObjectMeta;
    use kube::runtime::reflector::store;

    fn cm_ref(name: &str, key: &str) -> ConfigRef {
        ConfigRef::new(ConfigKind::ConfigMap, "a", name, key)
    }

    fn secret_ref(name: &str, key: &str) -> ConfigRef {
        ConfigRef::new(ConfigKind::Secret, "a", name, key)
    }

    fn cm_volume(vol_name: &str, cm_name: &str, items: &[&str]) -> Volume {
        Volume {
            name: vol_name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: cm_name.to_string(),
                items: if items.is_empty() {
                    None
                } else {
                    Some(
                        items
                            .iter()
                            .map(|k| KeyToPath {
                                key: k.to_string(),
                                path: k.to_string(),
                                mode: None,
                            })
                            .collect(),
                    )
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn secret_volume(vol_name: &str, secret_name: &str) -> Volume {
        Volume {
            name: vol_name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mount(vol_name: &str, sub_path: Option<&str>, sub_path_expr: Option<&str>) -> VolumeMount {
        VolumeMount {
            name: vol_name.to_string(),
            mount_path: format!("/mnt/{vol_name}"),
            sub_path: sub_path.map(str::to_string),
            sub_path_expr: sub_path_expr.map(str::to_string),
            ..Default::default()
        }
    }

    fn spec_with(volumes: Vec<Volume>, mounts: Vec<VolumeMount>) -> PodSpec {
        PodSpec {
            volumes: Some(volumes),
            containers: vec![Container {
                name: "main".to_string(),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn name_key_list_parses_and_normalizes() {
        assert_eq!(
            parse_name_key_list("c1,c2/k,c3/"),
            vec![
                NameKey {
                    name: "c1".into(),
                    key: "".into()
                },
                NameKey {
                    name: "c2".into(),
                    key: "k".into()
                },
                NameKey {
                    name: "c3".into(),
                    key: "".into()
                },
            ]
        );
        assert!(parse_name_key_list("").is_empty());
    }

    #[test]
    fn whole_mount_emits_whole_object_ref() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[])],
            vec![mount("v1", None, None)],
        );
        let triggers = template_triggers(&annotations(&[]), "a", &spec);
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "")]));
    }

    #[test]
    fn whole_mount_with_items_emits_per_item_refs() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &["x", "y"])],
            vec![mount("v1", None, None)],
        );
        let triggers = template_triggers(&annotations(&[]), "a", &spec);
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "x"), cm_ref("c1", "y")]));
    }

    #[test]
    fn subpath_mounts_emit_per_key_refs() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[])],
            vec![
                mount("v1", Some("app.yaml"), None),
                mount("v1", Some("logging.yaml"), None),
            ],
        );
        let triggers = template_triggers(&annotations(&[]), "a", &spec);
        assert_eq!(
            triggers,
            HashSet::from([cm_ref("c1", "app.yaml"), cm_ref("c1", "logging.yaml")])
        );
    }

    #[test]
    fn unmounted_volume_still_emits_whole_ref() {
        // no container consumed the volume; init containers may load it
        let spec = spec_with(vec![cm_volume("v1", "c1", &[])], vec![]);
        let triggers = template_triggers(&annotations(&[]), "a", &spec);
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "")]));
    }

    #[test]
    fn mounts_of_other_volumes_do_not_count() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[]), cm_volume("v2", "c2", &[])],
            vec![mount("v1", Some("k"), None), mount("v2", None, None)],
        );
        let triggers = template_triggers(&annotations(&[]), "a", &spec);
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "k"), cm_ref("c2", "")]));
    }

    #[test]
    fn restriction_annotation_limits_volumes() {
        // spec scenario: annotation restricts to c1/k, both c1 and c2
        // are mounted; only the explicit c1/k ref survives
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[]), cm_volume("v2", "c2", &[])],
            vec![mount("v1", None, None), mount("v2", None, None)],
        );
        let triggers = template_triggers(
            &annotations(&[(ANNOTATION_CONFIGMAPS, "c1/k")]),
            "a",
            &spec,
        );
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "k")]));
    }

    #[test]
    fn restriction_without_keys_keeps_default_volume_handling() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[]), cm_volume("v2", "c2", &[])],
            vec![mount("v1", None, None), mount("v2", None, None)],
        );
        let triggers =
            template_triggers(&annotations(&[(ANNOTATION_CONFIGMAPS, "c1")]), "a", &spec);
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "")]));
    }

    #[test]
    fn empty_annotation_disables_kind() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[]), secret_volume("v2", "s1")],
            vec![mount("v1", None, None), mount("v2", None, None)],
        );
        let triggers =
            template_triggers(&annotations(&[(ANNOTATION_CONFIGMAPS, "")]), "a", &spec);
        assert_eq!(triggers, HashSet::from([secret_ref("s1", "")]));
    }

    #[test]
    fn everything_disabled_returns_empty() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[])],
            vec![mount("v1", None, None)],
        );
        let triggers = template_triggers(
            &annotations(&[(ANNOTATION_CONFIGMAPS, ""), (ANNOTATION_SECRETS, "")]),
            "a",
            &spec,
        );
        assert!(triggers.is_empty());
    }

    #[test]
    fn force_refs_do_not_need_volumes() {
        // spec scenario: force-secrets names s1, no s1 volume exists
        let spec = spec_with(vec![], vec![]);
        let triggers = template_triggers(
            &annotations(&[(ANNOTATION_FORCE_SECRETS, "s1")]),
            "a",
            &spec,
        );
        assert_eq!(triggers, HashSet::from([secret_ref("s1", "")]));
    }

    #[test]
    fn force_refs_survive_disabled_kinds() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[])],
            vec![mount("v1", None, None)],
        );
        let triggers = template_triggers(
            &annotations(&[
                (ANNOTATION_CONFIGMAPS, ""),
                (ANNOTATION_SECRETS, ""),
                (ANNOTATION_FORCE_CONFIGMAPS, "forced/key"),
            ]),
            "a",
            &spec,
        );
        assert_eq!(triggers, HashSet::from([cm_ref("forced", "key")]));
    }

    #[test]
    fn annotation_only_refs_are_added_verbatim() {
        let spec = spec_with(vec![], vec![]);
        let triggers = template_triggers(
            &annotations(&[(ANNOTATION_CONFIGMAPS, "unmounted,keyed/x")]),
            "a",
            &spec,
        );
        assert_eq!(
            triggers,
            HashSet::from([cm_ref("unmounted", ""), cm_ref("keyed", "x")])
        );
    }

    #[test]
    fn dollar_entries_are_skipped_at_template_level() {
        let spec = spec_with(vec![], vec![]);
        let triggers = template_triggers(
            &annotations(&[(ANNOTATION_CONFIGMAPS, "conf-$(NODE_NAME),static")]),
            "a",
            &spec,
        );
        assert_eq!(triggers, HashSet::from([cm_ref("static", "")]));
    }

    #[test]
    fn subpath_expr_is_ignored_at_template_level() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[])],
            vec![mount("v1", None, Some("$(NODE_NAME).yaml"))],
        );
        let triggers = template_triggers(&annotations(&[]), "a", &spec);
        // the expr mount neither requires the whole object nor adds a
        // key, so the volume falls back to the whole-object ref
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "")]));
    }

    // ----- pod-specific pass -----

    fn empty_stores() -> (Store<ConfigMap>, Store<Secret>) {
        let (cm_reader, _cm_writer) = store();
        let (secret_reader, _secret_writer) = store();
        (cm_reader, secret_reader)
    }

    fn pod_with(spec: PodSpec) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some("a".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    #[test]
    fn subpath_expr_resolves_against_container_env() {
        let mut spec = spec_with(
            vec![cm_volume("v1", "c1", &[])],
            vec![mount("v1", None, Some("$(SHARD).yaml"))],
        );
        spec.containers[0].env = Some(vec![EnvVar {
            name: "SHARD".to_string(),
            value: Some("shard-3".to_string()),
            value_from: None,
        }]);

        let (cms, secrets) = empty_stores();
        let triggers =
            pod_triggers(&annotations(&[]), &pod_with(spec), &cms, &secrets).unwrap();
        assert_eq!(triggers, HashSet::from([cm_ref("c1", "shard-3.yaml")]));
    }

    #[test]
    fn unresolvable_subpath_expr_is_an_error() {
        let spec = spec_with(
            vec![cm_volume("v1", "c1", &[])],
            vec![mount("v1", None, Some("$(MISSING).yaml"))],
        );
        let (cms, secrets) = empty_stores();
        assert!(pod_triggers(&annotations(&[]), &pod_with(spec), &cms, &secrets).is_err());
    }

    #[test]
    fn dollar_annotations_resolve_per_pod() {
        let mut spec = spec_with(vec![], vec![]);
        spec.containers[0].env = Some(vec![EnvVar {
            name: "NODE_NAME".to_string(),
            value: Some("node-1".to_string()),
            value_from: None,
        }]);

        let owner = annotations(&[(ANNOTATION_CONFIGMAPS, "conf-$(NODE_NAME)/main.yaml,static")]);
        let (cms, secrets) = empty_stores();
        let triggers = pod_triggers(&owner, &pod_with(spec), &cms, &secrets).unwrap();

        // only the expression entry is pod-specific; "static" was already
        // handled at template level
        assert_eq!(triggers, HashSet::from([cm_ref("conf-node-1", "main.yaml")]));
    }

    #[test]
    fn pod_without_config_volumes_or_exprs_yields_nothing() {
        let spec = spec_with(vec![], vec![]);
        let (cms, secrets) = empty_stores();
        let triggers = pod_triggers(&annotations(&[]), &pod_with(spec), &cms, &secrets).unwrap();
        assert!(triggers.is_empty());
    }
}
