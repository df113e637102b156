//! Reload executor: materialize a due reload job
//!
//! Bare pods are rolled by deletion with their own termination grace
//! period. Replicated workloads get a strategic merge patch that touches
//! only `spec.template.metadata.annotations`, stamping a content-hash
//! fingerprint per trigger; the rollout itself is the workload
//! controller's reaction to the template change.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::objects::ReloadJob;
use super::Shared;
use crate::error::Error;
use crate::events::{actions, reasons};
use crate::index::TargetKind;
use crate::reconcile::{Handle, ReconcileResult};
use crate::ANNOTATION_HASH_PREFIX;

/// The strategic merge patch body stamping fingerprint annotations into a
/// workload's pod template. Nothing but the template annotations is
/// touched.
pub fn build_reload_patch(annotations: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": annotations
                }
            }
        }
    })
}

/// Scheduler handler executing due reload jobs.
pub(crate) struct ReloadHandler {
    pub shared: Arc<Shared>,
}

#[async_trait]
impl Handle<Arc<ReloadJob>> for ReloadHandler {
    async fn on_added(&self, latest: Option<Arc<ReloadJob>>) -> ReconcileResult {
        let Some(job) = latest else {
            return ReconcileResult::default();
        };
        execute(&self.shared, &job).await
    }
}

async fn execute(shared: &Shared, job: &ReloadJob) -> ReconcileResult {
    let target = &job.target;
    info!(target = %target, "executing reload");

    match target.kind {
        TargetKind::Pod => delete_pod(shared, job).await,
        TargetKind::Deployment => {
            let api: Api<Deployment> =
                Api::namespaced(shared.client.clone(), &target.namespace);
            if shared
                .stores
                .deployments
                .get(&ObjectRef::new(&target.name).within(&target.namespace))
                .is_none()
            {
                debug!(target = %target, "cache not found, dropping reload");
                return ReconcileResult::default();
            }
            patch_workload(shared, job, "Deployment", |body| async move {
                api.patch(&target.name, &PatchParams::default(), &Patch::Strategic(body))
                    .await
                    .map(|_| ())
            })
            .await
        }
        TargetKind::DaemonSet => {
            let api: Api<DaemonSet> = Api::namespaced(shared.client.clone(), &target.namespace);
            if shared
                .stores
                .daemon_sets
                .get(&ObjectRef::new(&target.name).within(&target.namespace))
                .is_none()
            {
                debug!(target = %target, "cache not found, dropping reload");
                return ReconcileResult::default();
            }
            patch_workload(shared, job, "DaemonSet", |body| async move {
                api.patch(&target.name, &PatchParams::default(), &Patch::Strategic(body))
                    .await
                    .map(|_| ())
            })
            .await
        }
        TargetKind::StatefulSet => {
            let api: Api<StatefulSet> =
                Api::namespaced(shared.client.clone(), &target.namespace);
            if shared
                .stores
                .stateful_sets
                .get(&ObjectRef::new(&target.name).within(&target.namespace))
                .is_none()
            {
                debug!(target = %target, "cache not found, dropping reload");
                return ReconcileResult::default();
            }
            patch_workload(shared, job, "StatefulSet", |body| async move {
                api.patch(&target.name, &PatchParams::default(), &Patch::Strategic(body))
                    .await
                    .map(|_| ())
            })
            .await
        }
    }
}

async fn delete_pod(shared: &Shared, job: &ReloadJob) -> ReconcileResult {
    let target = &job.target;
    let Some(pod) = shared
        .stores
        .pods
        .get(&ObjectRef::new(&target.name).within(&target.namespace))
    else {
        debug!(target = %target, "cache not found, dropping reload");
        return ReconcileResult::default();
    };

    let grace = pod
        .spec
        .as_ref()
        .and_then(|s| s.termination_grace_period_seconds)
        .and_then(|g| u32::try_from(g).ok());
    let params = DeleteParams {
        grace_period_seconds: grace,
        ..Default::default()
    };

    let api: Api<Pod> = Api::namespaced(shared.client.clone(), &target.namespace);
    match api.delete(&target.name, &params).await {
        Ok(_) => {}
        Err(e) => {
            let err = Error::from(e);
            if !err.is_not_found() {
                warn!(target = %target, error = %err, "failed to kill pod");
                return ReconcileResult::fail(err);
            }
        }
    }

    shared
        .events
        .publish(
            &pod_reference(&pod),
            EventType::Normal,
            reasons::POD_RESTARTED,
            actions::RELOAD,
            Some("deleted to pick up new config content".to_string()),
        )
        .await;

    ReconcileResult::default()
}

async fn patch_workload<F, Fut>(
    shared: &Shared,
    job: &ReloadJob,
    kind: &str,
    do_patch: F,
) -> ReconcileResult
where
    F: FnOnce(serde_json::Value) -> Fut,
    Fut: std::future::Future<Output = Result<(), kube::Error>>,
{
    let target = &job.target;

    let annotations = shared
        .index
        .fingerprint_annotations(ANNOTATION_HASH_PREFIX, &job.triggers);
    if annotations.is_empty() {
        debug!(target = %target, "no known hashes for triggers, nothing to stamp");
        return ReconcileResult::default();
    }

    info!(target = %target, "patching to roll out new config");
    if let Err(e) = do_patch(build_reload_patch(&annotations)).await {
        let err = Error::from(e);
        if err.is_not_found() {
            // target vanished mid-reconcile
            return ReconcileResult::default();
        }
        warn!(target = %target, error = %err, "failed to patch workload");
        shared
            .events
            .publish(
                &workload_reference(kind, &target.namespace, &target.name),
                EventType::Warning,
                reasons::RELOAD_FAILED,
                actions::RELOAD,
                Some(err.to_string()),
            )
            .await;
        return ReconcileResult::fail(err);
    }

    shared
        .events
        .publish(
            &workload_reference(kind, &target.namespace, &target.name),
            EventType::Normal,
            reasons::RELOAD_PATCHED,
            actions::RELOAD,
            Some(format!("stamped {} config fingerprint(s)", annotations.len())),
        )
        .await;

    ReconcileResult::default()
}

fn workload_reference(kind: &str, namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("apps/v1".to_string()),
        kind: Some(kind.to_string()),
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn pod_reference(pod: &Pod) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        namespace: pod.namespace(),
        name: Some(pod.name_any()),
        uid: pod.uid(),
        ..Default::default()
    }
}
