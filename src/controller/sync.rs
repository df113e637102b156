//! Sync lifecycle: syncers for externally-sourced configs
//!
//! A config labeled `resync.dev/action=sync` carries a
//! `resync.dev/sync-config-ref` annotation pointing at the config key
//! that defines its fetch/validate pipeline. This module owns the second
//! index (`syncer config ref -> running syncer`), the annotation URL
//! parsing, and the write-back path that lands published data in the
//! target ConfigMap/Secret.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Secret};
use kube::api::{Api, PostParams};
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::objects::SyncerAssignment;
use super::Shared;
use crate::error::Error;
use crate::events::{actions, reasons};
use crate::fetcher::DataMap;
use crate::index::{ConfigKind, ConfigRef};
use crate::reconcile::{Handle, ReconcileResult};
use crate::syncer::{Syncer, SyncerConfig};
use crate::ANNOTATION_SYNC_CONFIG;

/// A registered syncer and the configs it connects.
pub(crate) struct SyncerEntry {
    pub assignment: SyncerAssignment,
    syncer: Mutex<Syncer>,
}

/// Index of running syncers keyed by their pipeline-definition reference.
#[derive(Default)]
pub(crate) struct SyncerIndex {
    inner: RwLock<HashMap<ConfigRef, Arc<SyncerEntry>>>,
}

impl SyncerIndex {
    pub fn contains(&self, syncer_ref: &ConfigRef) -> bool {
        self.inner
            .read()
            .expect("syncer index poisoned")
            .contains_key(syncer_ref)
    }

    fn insert(&self, entry: Arc<SyncerEntry>) {
        self.inner
            .write()
            .expect("syncer index poisoned")
            .insert(entry.assignment.syncer_config.clone(), entry);
    }

    fn remove(&self, syncer_ref: &ConfigRef) -> Option<Arc<SyncerEntry>> {
        self.inner
            .write()
            .expect("syncer index poisoned")
            .remove(syncer_ref)
    }

    /// Entries whose pipeline definition is among the fireable refs.
    pub fn matching<'a>(
        &self,
        refs: impl IntoIterator<Item = &'a ConfigRef>,
    ) -> Vec<SyncerAssignment> {
        let inner = self.inner.read().expect("syncer index poisoned");
        refs.into_iter()
            .filter_map(|r| inner.get(r))
            .map(|entry| entry.assignment.clone())
            .collect()
    }
}

/// Parse a `cm://[ns/]name/key` or `secret://[ns/]name/key` sync
/// reference; a two-segment path inherits the host object's namespace.
pub fn parse_sync_ref(host_namespace: &str, link: &str) -> Result<ConfigRef, Error> {
    let (scheme, rest) = link
        .split_once("://")
        .ok_or_else(|| Error::config(format!("invalid sync config link {link:?}")))?;

    let kind = match scheme {
        "cm" => ConfigKind::ConfigMap,
        "secret" => ConfigKind::Secret,
        other => {
            return Err(Error::config(format!(
                "unsupported sync config link scheme {other:?}"
            )))
        }
    };

    // normalized path split into at most 3 components; the key keeps any
    // remaining slashes
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [name, key] => Ok(ConfigRef::new(kind, host_namespace, *name, *key)),
        [namespace, name, key @ ..] => Ok(ConfigRef::new(
            kind,
            *namespace,
            *name,
            key.join("/"),
        )),
        _ => Err(Error::config(format!(
            "invalid sync config reference {rest:?}"
        ))),
    }
}

/// Read the sync reference off a host object's annotations.
pub fn sync_ref_from_annotations(
    host_namespace: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<ConfigRef, Error> {
    let link = annotations
        .get(ANNOTATION_SYNC_CONFIG)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config("no sync config annotation found"))?;
    parse_sync_ref(host_namespace, link)
}

/// Create, start and register a syncer for `target` unless one already
/// runs for the same pipeline definition. Returns whether one was
/// created.
pub(crate) async fn ensure_syncer(
    shared: &Arc<Shared>,
    target: ConfigRef,
    syncer_ref: ConfigRef,
) -> Result<bool, Error> {
    if shared.syncers.contains(&syncer_ref) {
        return Ok(false);
    }

    info!(config = %syncer_ref, target = %target, "creating syncer");
    let raw = fetch_config_document(shared, &syncer_ref).await?;
    let config = SyncerConfig::parse(&raw)?;

    let mut syncer = Syncer::new(&config, &shared.fetchers, &shared.validators)?;
    let rx = match syncer.start(&shared.cancel).await {
        Ok(rx) => rx,
        Err(e) => {
            syncer.stop().await;
            return Err(Error::sync(format!("failed to start syncer: {e}")));
        }
    };

    let entry = Arc::new(SyncerEntry {
        assignment: SyncerAssignment {
            target_config: target.clone(),
            syncer_config: syncer_ref,
        },
        syncer: Mutex::new(syncer),
    });
    shared.syncers.insert(entry);

    let pump_shared = shared.clone();
    tokio::spawn(async move {
        info!(target = %target, "starting config syncing routine");
        let mut rx = rx;
        while let Some(update) = rx.recv().await {
            debug!(target = %target, keys = update.len(), "got a synced update");
            if let Err(e) = write_back(&pump_shared, &target, update).await {
                warn!(target = %target, error = %e, "failed to update target config");
            }
        }
    });

    Ok(true)
}

/// Stop and unregister the syncer for `syncer_ref`, if any.
pub(crate) async fn remove_syncer(shared: &Shared, syncer_ref: &ConfigRef) {
    let Some(entry) = shared.syncers.remove(syncer_ref) else {
        return;
    };
    debug!(config = %syncer_ref, "stopping syncer");
    entry.syncer.lock().await.stop().await;
}

// The pipeline definition document: the referenced key of the referenced
// ConfigMap/Secret, binary data first, string data as fallback.
async fn fetch_config_document(
    shared: &Shared,
    syncer_ref: &ConfigRef,
) -> Result<Vec<u8>, Error> {
    match syncer_ref.kind {
        ConfigKind::ConfigMap => {
            let api: Api<ConfigMap> =
                Api::namespaced(shared.client.clone(), &syncer_ref.namespace);
            let cm = api.get(&syncer_ref.name).await?;
            if let Some(bytes) = cm
                .binary_data
                .as_ref()
                .and_then(|d| d.get(&syncer_ref.key))
            {
                return Ok(bytes.0.clone());
            }
            cm.data
                .as_ref()
                .and_then(|d| d.get(&syncer_ref.key))
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| {
                    Error::config(format!("config not found for key {:?}", syncer_ref.key))
                })
        }
        ConfigKind::Secret => {
            let api: Api<Secret> =
                Api::namespaced(shared.client.clone(), &syncer_ref.namespace);
            let secret = api.get(&syncer_ref.name).await?;
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(&syncer_ref.key))
                .map(|b| b.0.clone())
                .ok_or_else(|| {
                    Error::config(format!("config not found for key {:?}", syncer_ref.key))
                })
        }
    }
}

// Write published data through to the target config artifact. The
// resulting update event is what fires the ordinary reload path.
async fn write_back(shared: &Arc<Shared>, target: &ConfigRef, update: DataMap) -> Result<(), Error> {
    match target.kind {
        ConfigKind::ConfigMap => {
            let key: ObjectRef<ConfigMap> =
                ObjectRef::new(&target.name).within(&target.namespace);
            let Some(current) = shared.stores.config_maps.get(&key) else {
                return Ok(());
            };
            let mut cm = (*current).clone();
            cm.metadata.managed_fields = None;
            let data = cm.data.get_or_insert_with(BTreeMap::new);
            for (k, v) in update {
                data.insert(k, String::from_utf8_lossy(&v).into_owned());
            }

            let api: Api<ConfigMap> =
                Api::namespaced(shared.client.clone(), &target.namespace);
            match api.replace(&target.name, &PostParams::default(), &cm).await {
                Ok(_) => {}
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_not_found() {
                        return Err(err);
                    }
                    return Ok(());
                }
            }
        }
        ConfigKind::Secret => {
            let key: ObjectRef<Secret> =
                ObjectRef::new(&target.name).within(&target.namespace);
            let Some(current) = shared.stores.secrets.get(&key) else {
                return Ok(());
            };
            let mut secret = (*current).clone();
            secret.metadata.managed_fields = None;
            let data = secret.data.get_or_insert_with(BTreeMap::new);
            for (k, v) in update {
                data.insert(k, k8s_openapi::ByteString(v));
            }

            let api: Api<Secret> = Api::namespaced(shared.client.clone(), &target.namespace);
            match api
                .replace(&target.name, &PostParams::default(), &secret)
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_not_found() {
                        return Err(err);
                    }
                    return Ok(());
                }
            }
        }
    }

    shared
        .events
        .publish(
            &config_reference(target),
            EventType::Normal,
            reasons::CONFIG_SYNCED,
            actions::SYNC,
            Some("wrote synced data".to_string()),
        )
        .await;

    Ok(())
}

fn config_reference(target: &ConfigRef) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some(
            match target.kind {
                ConfigKind::ConfigMap => "ConfigMap",
                ConfigKind::Secret => "Secret",
            }
            .to_string(),
        ),
        namespace: Some(target.namespace.clone()),
        name: Some(target.name.clone()),
        ..Default::default()
    }
}

/// Scheduler handler rebuilding a syncer after its pipeline definition
/// changed: stop the old instance, then ensure a fresh one.
pub(crate) struct SyncHandler {
    pub shared: Arc<Shared>,
}

#[async_trait]
impl Handle<Arc<SyncerAssignment>> for SyncHandler {
    async fn on_added(&self, latest: Option<Arc<SyncerAssignment>>) -> ReconcileResult {
        let Some(assignment) = latest else {
            return ReconcileResult::default();
        };

        remove_syncer(&self.shared, &assignment.syncer_config).await;

        match ensure_syncer(
            &self.shared,
            assignment.target_config.clone(),
            assignment.syncer_config.clone(),
        )
        .await
        {
            Ok(_) => ReconcileResult::default(),
            Err(e) => {
                warn!(config = %assignment.syncer_config, error = %e, "failed to ensure syncer");
                ReconcileResult::fail(e)
            }
        }
    }
}
