//! Downward-API environment resolution for a single pod
//!
//! Rebuilds the environment a container would observe so that `$(VAR)`
//! references in annotations and subPath expressions can be evaluated
//! per pod: `envFrom` sources first, then `env` entries in declaration
//! order. `resourceFieldRef` is explicitly unresolved.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{ConfigMap, Container, ObjectFieldSelector, Pod, Secret};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::error::Error;
use crate::expand;

/// Resolve the full environment map of one container.
pub fn container_env(
    pod: &Pod,
    container: &Container,
    cm_store: &Store<ConfigMap>,
    secret_store: &Store<Secret>,
) -> Result<HashMap<String, String>, Error> {
    let namespace = pod.namespace().unwrap_or_default();
    let mut env: HashMap<String, String> = HashMap::new();

    // envFrom first; explicit env entries may override these below
    for env_from in container.env_from.as_deref().unwrap_or_default() {
        if let Some(cm_ref) = &env_from.config_map_ref {
            let optional = cm_ref.optional.unwrap_or(false);
            let Some(cm) = lookup(cm_store, &namespace, &cm_ref.name, optional)? else {
                continue;
            };
            for (k, v) in cm.data.clone().unwrap_or_default() {
                insert_prefixed(&mut env, env_from.prefix.as_deref(), k, v);
            }
        } else if let Some(secret_ref) = &env_from.secret_ref {
            let optional = secret_ref.optional.unwrap_or(false);
            let Some(secret) = lookup(secret_store, &namespace, &secret_ref.name, optional)?
            else {
                continue;
            };
            for (k, v) in secret.data.clone().unwrap_or_default() {
                let value = String::from_utf8_lossy(&v.0).into_owned();
                insert_prefixed(&mut env, env_from.prefix.as_deref(), k, value);
            }
        }
    }

    for env_var in container.env.as_deref().unwrap_or_default() {
        let value = if let Some(value) = env_var.value.as_deref().filter(|v| !v.is_empty()) {
            expand::expand(value, |name| env.get(name).cloned())
        } else if let Some(source) = &env_var.value_from {
            if let Some(field_ref) = &source.field_ref {
                pod_field_value(pod, field_ref)?
            } else if source.resource_field_ref.is_some() {
                // container resource values are not resolved here
                String::new()
            } else if let Some(cm_key) = &source.config_map_key_ref {
                let optional = cm_key.optional.unwrap_or(false);
                let Some(cm) = lookup(cm_store, &namespace, &cm_key.name, optional)? else {
                    continue;
                };
                match cm.data.as_ref().and_then(|d| d.get(&cm_key.key)) {
                    Some(v) => v.clone(),
                    None if optional => continue,
                    None => {
                        return Err(Error::internal(
                            "env",
                            format!(
                                "couldn't find key {} in ConfigMap {}/{}",
                                cm_key.key, namespace, cm_key.name
                            ),
                        ))
                    }
                }
            } else if let Some(secret_key) = &source.secret_key_ref {
                let optional = secret_key.optional.unwrap_or(false);
                let Some(secret) = lookup(secret_store, &namespace, &secret_key.name, optional)?
                else {
                    continue;
                };
                match secret.data.as_ref().and_then(|d| d.get(&secret_key.key)) {
                    Some(v) => String::from_utf8_lossy(&v.0).into_owned(),
                    None if optional => continue,
                    None => {
                        return Err(Error::internal(
                            "env",
                            format!(
                                "couldn't find key {} in Secret {}/{}",
                                secret_key.key, namespace, secret_key.name
                            ),
                        ))
                    }
                }
            } else {
                String::new()
            }
        } else {
            String::new()
        };

        env.insert(env_var.name.clone(), value);
    }

    Ok(env)
}

fn lookup<R>(
    store: &Store<R>,
    namespace: &str,
    name: &str,
    optional: bool,
) -> Result<Option<std::sync::Arc<R>>, Error>
where
    R: kube::Resource<DynamicType = ()>
        + kube::runtime::reflector::Lookup<DynamicType = ()>
        + Clone
        + 'static,
{
    match store.get(&ObjectRef::new(name).within(namespace)) {
        Some(obj) => Ok(Some(obj)),
        None if optional => Ok(None),
        None => Err(Error::cache_miss(format!("{namespace}/{name}"))),
    }
}

fn insert_prefixed(
    env: &mut HashMap<String, String>,
    prefix: Option<&str>,
    key: String,
    value: String,
) {
    let name = match prefix {
        Some(p) if !p.is_empty() => format!("{p}{key}"),
        _ => key,
    };
    if !is_valid_env_var_name(&name) {
        return;
    }
    env.insert(name, value);
}

// names must match [-._a-zA-Z][-._a-zA-Z0-9]*
fn is_valid_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || matches!(first, '-' | '.' | '_')) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Resolve a downward-API field reference against the pod itself.
fn pod_field_value(pod: &Pod, field_ref: &ObjectFieldSelector) -> Result<String, Error> {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    match field_ref.field_path.as_str() {
        "metadata.name" => Ok(pod.name_any()),
        "metadata.namespace" => Ok(pod.namespace().unwrap_or_default()),
        "metadata.uid" => Ok(pod.uid().unwrap_or_default()),
        "spec.nodeName" => Ok(spec.and_then(|s| s.node_name.clone()).unwrap_or_default()),
        "spec.serviceAccountName" => Ok(spec
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_default()),
        "status.hostIP" => Ok(status.and_then(|s| s.host_ip.clone()).unwrap_or_default()),
        "status.podIP" => Ok(status.and_then(|s| s.pod_ip.clone()).unwrap_or_default()),
        "status.podIPs" => Ok(status
            .and_then(|s| s.pod_ips.as_ref())
            .map(|ips| {
                ips.iter()
                    .map(|ip| ip.ip.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default()),
        path => {
            // map-style extraction: metadata.labels['x'] and
            // metadata.annotations['x']
            if let Some(key) = subscript(path, "metadata.labels") {
                return Ok(pod.labels().get(key).cloned().unwrap_or_default());
            }
            if let Some(key) = subscript(path, "metadata.annotations") {
                return Ok(pod.annotations().get(key).cloned().unwrap_or_default());
            }
            Err(Error::internal(
                "env",
                format!("unsupported fieldRef path {path:?}"),
            ))
        }
    }
}

fn subscript<'a>(path: &'a str, map: &str) -> Option<&'a str> {
    path.strip_prefix(map)?
        .strip_prefix("['")?
        .strip_suffix("']")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMapEnvSource, ConfigMapKeySelector, EnvFromSource, EnvVar, EnvVarSource, PodSpec,
        PodStatus, SecretKeySelector,
    };
    use kube::core::ObjectMeta;
    use kube::runtime::reflector::store;
    use kube::runtime::watcher::Event;
    use std::collections::BTreeMap;

    fn stores(
        cms: Vec<ConfigMap>,
        secrets: Vec<Secret>,
    ) -> (Store<ConfigMap>, Store<Secret>) {
        let (cm_reader, mut cm_writer) = store();
        let (secret_reader, mut secret_writer) = store();
        for cm in cms {
            cm_writer.apply_watcher_event(&Event::Apply(cm));
        }
        for secret in secrets {
            secret_writer.apply_watcher_event(&Event::Apply(secret));
        }
        (cm_reader, secret_reader)
    }

    fn configmap(name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| {
                        (
                            k.to_string(),
                            k8s_openapi::ByteString(v.as_bytes().to_vec()),
                        )
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "demo".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.7".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn env_value(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    #[tokio::test]
    async fn env_from_applies_prefix_and_skips_invalid_names() {
        let (cms, secrets) = stores(
            vec![configmap(
                "c1",
                &[("GOOD", "1"), ("9BAD", "2"), ("ALSO_GOOD", "3")],
            )],
            vec![],
        );

        let container = Container {
            name: "main".to_string(),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: "c1".to_string(),
                    optional: None,
                }),
                prefix: Some("P_".to_string()),
                secret_ref: None,
            }]),
            ..Default::default()
        };

        let env = container_env(&pod(), &container, &cms, &secrets).unwrap();
        assert_eq!(env["P_GOOD"], "1");
        assert_eq!(env["P_ALSO_GOOD"], "3");
        assert!(!env.contains_key("P_9BAD"));
    }

    #[tokio::test]
    async fn env_entries_expand_earlier_entries() {
        let (cms, secrets) = stores(vec![], vec![]);
        let container = Container {
            name: "main".to_string(),
            env: Some(vec![
                env_value("BASE", "/opt"),
                env_value("FULL", "$(BASE)/conf"),
                env_value("UNRESOLVED", "$(NOPE)/x"),
            ]),
            ..Default::default()
        };

        let env = container_env(&pod(), &container, &cms, &secrets).unwrap();
        assert_eq!(env["FULL"], "/opt/conf");
        assert_eq!(env["UNRESOLVED"], "$(NOPE)/x");
    }

    #[tokio::test]
    async fn field_refs_resolve_pod_fields() {
        let (cms, secrets) = stores(vec![], vec![]);
        let field = |path: &str| EnvVar {
            name: path.replace('.', "_"),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: path.to_string(),
                    api_version: None,
                }),
                ..Default::default()
            }),
        };
        let container = Container {
            name: "main".to_string(),
            env: Some(vec![
                field("spec.nodeName"),
                field("status.podIP"),
                field("metadata.labels['app']"),
            ]),
            ..Default::default()
        };

        let env = container_env(&pod(), &container, &cms, &secrets).unwrap();
        assert_eq!(env["spec_nodeName"], "node-1");
        assert_eq!(env["status_podIP"], "10.0.0.7");
        assert_eq!(env["metadata_labels['app']"], "demo");
    }

    #[tokio::test]
    async fn key_refs_respect_optional() {
        let (cms, secrets) = stores(
            vec![configmap("c1", &[("k", "from-cm")])],
            vec![secret("s1", &[("t", "from-secret")])],
        );

        let cm_key = |name: &str, key: &str, optional: bool| EnvVar {
            name: format!("CM_{key}"),
            value: None,
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: name.to_string(),
                    key: key.to_string(),
                    optional: Some(optional),
                }),
                ..Default::default()
            }),
        };

        let container = Container {
            name: "main".to_string(),
            env: Some(vec![
                cm_key("c1", "k", false),
                cm_key("c1", "missing", true),
                EnvVar {
                    name: "TOKEN".to_string(),
                    value: None,
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: "s1".to_string(),
                            key: "t".to_string(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                },
            ]),
            ..Default::default()
        };

        let env = container_env(&pod(), &container, &cms, &secrets).unwrap();
        assert_eq!(env["CM_k"], "from-cm");
        assert!(!env.contains_key("CM_missing"));
        assert_eq!(env["TOKEN"], "from-secret");
    }

    #[tokio::test]
    async fn missing_required_key_is_an_error() {
        let (cms, secrets) = stores(vec![configmap("c1", &[])], vec![]);
        let container = Container {
            name: "main".to_string(),
            env: Some(vec![EnvVar {
                name: "X".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    config_map_key_ref: Some(ConfigMapKeySelector {
                        name: "c1".to_string(),
                        key: "missing".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            }]),
            ..Default::default()
        };

        assert!(container_env(&pod(), &container, &cms, &secrets).is_err());
    }

    #[tokio::test]
    async fn missing_required_envfrom_source_is_an_error() {
        let (cms, secrets) = stores(vec![], vec![]);
        let container = Container {
            name: "main".to_string(),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: "absent".to_string(),
                    optional: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let err = container_env(&pod(), &container, &cms, &secrets).unwrap_err();
        assert!(matches!(err, Error::CacheMiss { .. }));
    }

    #[test]
    fn env_var_name_validation() {
        assert!(is_valid_env_var_name("FOO"));
        assert!(is_valid_env_var_name("_foo.bar-baz"));
        assert!(!is_valid_env_var_name("9FOO"));
        assert!(!is_valid_env_var_name(""));
        assert!(!is_valid_env_var_name("FOO=BAR"));
    }
}
