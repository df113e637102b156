//! ConfigMap/Secret reconciliation: hashes, delta firing, syncer
//! lifecycle
//!
//! The first observation of a config only records its hashes; updates
//! with changed hashes fire the reload index and wake matching syncers.
//! Configs labeled `resync.dev/action=sync` additionally keep a syncer
//! registered for their pipeline definition.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::objects::{ConfigArtifact, ReloadJob, SyncerAssignment};
use super::sync::{ensure_syncer, remove_syncer, sync_ref_from_annotations};
use super::Shared;
use crate::index::{content_hashes, ConfigRef, ContentHash};
use crate::queue::{Action, Job};
use crate::reconcile::{Handle, ReconcileResult};
use crate::{ANNOTATION_SYNC_CONFIG, LABEL_ACTION, LABEL_ACTION_SYNC};

/// Whether this config opted into syncing.
fn requires_sync(labels: &BTreeMap<String, String>) -> bool {
    labels.get(LABEL_ACTION).map(String::as_str) == Some(LABEL_ACTION_SYNC)
}

fn artifact_hashes(artifact: &ConfigArtifact) -> HashMap<ConfigRef, ContentHash> {
    content_hashes(
        artifact.kind,
        &artifact.namespace,
        &artifact.name,
        &artifact.data,
    )
}

/// Apply hash deltas and schedule the fallout: one debounced reload job
/// per affected target, plus zero-delay sync jobs for pipelines whose
/// definition changed.
pub(crate) fn notify_update(shared: &Arc<Shared>, hashes: HashMap<ConfigRef, ContentHash>) {
    let fireable = shared.index.apply_hash_deltas(hashes);
    if fireable.is_empty() {
        debug!("no reload trigger will be fired");
        return;
    }
    debug!(triggers = fireable.len(), "will fire reload trigger(s)");

    if let Some(reload_core) = shared.reload_core.get() {
        let targets = shared.index.targets_for(fireable.iter());
        for target in targets {
            debug!(target = %target, "scheduling reload");
            reload_core.cache().update(
                &target,
                None,
                Some(Arc::new(ReloadJob {
                    target: target.clone(),
                    triggers: fireable.clone(),
                })),
            );
            if let Err(e) = reload_core.schedule(
                Job {
                    action: Action::Add,
                    key: target.clone(),
                },
                shared.config.reload_delay(),
            ) {
                warn!(target = %target, error = %e, "failed to schedule reload");
            }
        }
    }

    if let Some(sync_core) = shared.sync_core.get() {
        for assignment in shared.syncers.matching(fireable.iter()) {
            let key = assignment.syncer_config.clone();
            debug!(config = %key, "scheduling syncer rebuild");
            sync_core
                .cache()
                .update(&key, None, Some(Arc::new(assignment)));
            if let Err(e) = sync_core.schedule(
                Job {
                    action: Action::Add,
                    key: key.clone(),
                },
                Duration::ZERO,
            ) {
                warn!(config = %key, error = %e, "failed to schedule syncer rebuild");
            }
        }
    }
}

/// Reconcile handler for ConfigMaps and Secrets.
pub(crate) struct ConfigHandler {
    pub shared: Arc<Shared>,
}

impl ConfigHandler {
    async fn ensure_syncer_for(&self, artifact: &ConfigArtifact) -> Result<bool, crate::Error> {
        let syncer_ref = sync_ref_from_annotations(&artifact.namespace, &artifact.annotations)?;
        ensure_syncer(&self.shared, artifact.whole_ref(), syncer_ref).await
    }

    async fn remove_syncer_for(&self, artifact: &ConfigArtifact) {
        match sync_ref_from_annotations(&artifact.namespace, &artifact.annotations) {
            Ok(syncer_ref) => remove_syncer(&self.shared, &syncer_ref).await,
            Err(e) => debug!(error = %e, "no syncer to remove"),
        }
    }

    async fn handle_removal(&self, latest: Option<Arc<ConfigArtifact>>) {
        let Some(artifact) = latest else { return };
        debug!(
            kind = artifact.kind.as_str(),
            namespace = %artifact.namespace,
            name = %artifact.name,
            "config removed"
        );

        self.shared.index.remove_hashes(artifact.all_refs().iter());

        if requires_sync(&artifact.labels) {
            self.remove_syncer_for(&artifact).await;
        }
    }
}

#[async_trait]
impl Handle<Arc<ConfigArtifact>> for ConfigHandler {
    async fn on_added(&self, latest: Option<Arc<ConfigArtifact>>) -> ReconcileResult {
        let Some(artifact) = latest else {
            return ReconcileResult::default();
        };
        debug!(
            kind = artifact.kind.as_str(),
            namespace = %artifact.namespace,
            name = %artifact.name,
            "watching config"
        );

        // first sight: record hashes without firing anything
        self.shared.index.update_hashes(artifact_hashes(&artifact));

        if requires_sync(&artifact.labels) {
            return ReconcileResult::then(Action::Update);
        }
        ReconcileResult::default()
    }

    async fn on_updated(
        &self,
        previous: Option<Arc<ConfigArtifact>>,
        latest: Option<Arc<ConfigArtifact>>,
    ) -> ReconcileResult {
        let Some(artifact) = latest else {
            return ReconcileResult::default();
        };
        debug!(
            kind = artifact.kind.as_str(),
            namespace = %artifact.namespace,
            name = %artifact.name,
            "updated config"
        );

        notify_update(&self.shared, artifact_hashes(&artifact));

        if !requires_sync(&artifact.labels) {
            return ReconcileResult::default();
        }

        let created = match self.ensure_syncer_for(&artifact).await {
            Ok(created) => created,
            Err(e) => {
                warn!(
                    namespace = %artifact.namespace,
                    name = %artifact.name,
                    error = %e,
                    "failed to ensure syncer"
                );
                return ReconcileResult::fail(e);
            }
        };

        if created {
            // the sync reference may have moved; drop the previous syncer
            if let Some(old) = previous.filter(|old| requires_sync(&old.labels)) {
                let old_link = old.annotations.get(ANNOTATION_SYNC_CONFIG);
                let new_link = artifact.annotations.get(ANNOTATION_SYNC_CONFIG);
                if old_link.is_some() && old_link != new_link {
                    debug!("removing old syncer due to config ref change");
                    self.remove_syncer_for(&old).await;
                }
            }
        }

        ReconcileResult::default()
    }

    async fn on_deleting(&self, latest: Option<Arc<ConfigArtifact>>) -> ReconcileResult {
        self.handle_removal(latest).await;
        ReconcileResult::then(Action::Cleanup)
    }

    async fn on_deleted(&self, latest: Option<Arc<ConfigArtifact>>) -> ReconcileResult {
        self.handle_removal(latest).await;
        ReconcileResult::default()
    }
}
