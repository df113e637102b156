//! Workload and pod reconciliation: keeping the reload index current
//!
//! Replicated workloads register the triggers extracted from their own
//! template; live pods additionally register pod-specific triggers for
//! `$(VAR)` expressions resolved against their container environment. A
//! pod's owner may be a ReplicaSet owned by a Deployment; one level of
//! indirection is dereferenced through a direct API get.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::objects::Workload;
use super::triggers::{pod_triggers, template_triggers};
use super::Shared;
use crate::index::{ReloadTarget, TargetKind};
use crate::queue::Action;
use crate::reconcile::{Handle, ReconcileResult};

/// Reconcile handler for Deployments, DaemonSets and StatefulSets.
pub(crate) struct WorkloadHandler {
    pub shared: Arc<Shared>,
}

impl WorkloadHandler {
    fn ensure(&self, workload: &Workload) {
        let target = workload.target();
        let triggers =
            template_triggers(&workload.annotations, &workload.namespace, &workload.pod_spec);

        if triggers.is_empty() {
            debug!(target = %target, "ignored due to no reload triggers");
        }
        self.shared.index.ensure_target(&target, triggers);
    }

    fn remove(&self, workload: &Workload) {
        self.shared
            .index
            .ensure_target(&workload.target(), Default::default());
    }
}

#[async_trait]
impl Handle<Arc<Workload>> for WorkloadHandler {
    async fn on_added(&self, _latest: Option<Arc<Workload>>) -> ReconcileResult {
        ReconcileResult::then(Action::Update)
    }

    async fn on_updated(
        &self,
        _previous: Option<Arc<Workload>>,
        latest: Option<Arc<Workload>>,
    ) -> ReconcileResult {
        if let Some(workload) = latest {
            self.ensure(&workload);
        }
        ReconcileResult::default()
    }

    async fn on_deleting(&self, latest: Option<Arc<Workload>>) -> ReconcileResult {
        if let Some(workload) = latest {
            self.remove(&workload);
        }
        ReconcileResult::then(Action::Cleanup)
    }

    async fn on_deleted(&self, latest: Option<Arc<Workload>>) -> ReconcileResult {
        if let Some(workload) = latest {
            self.remove(&workload);
        }
        ReconcileResult::default()
    }
}

/// Reconcile handler for pods of managed workloads.
pub(crate) struct PodHandler {
    pub shared: Arc<Shared>,
}

impl PodHandler {
    // The annotations of the pod's managing workload, or None when the
    // pod is not owned by a workload this controller watches.
    async fn owner_annotations(
        &self,
        pod: &Pod,
    ) -> Result<Option<BTreeMap<String, String>>, crate::Error> {
        let namespace = pod.namespace().unwrap_or_default();

        let Some(owner) = controller_owner(pod.owner_references()) else {
            // not able to be reloaded
            return Ok(None);
        };

        match owner.kind.as_str() {
            "DaemonSet" => {
                let key = ObjectRef::new(&owner.name).within(&namespace);
                Ok(self
                    .shared
                    .stores
                    .daemon_sets
                    .get(&key)
                    .map(|ds| ds.annotations().clone()))
            }
            "StatefulSet" => {
                let key = ObjectRef::new(&owner.name).within(&namespace);
                Ok(self
                    .shared
                    .stores
                    .stateful_sets
                    .get(&key)
                    .map(|sts| sts.annotations().clone()))
            }
            "ReplicaSet" => {
                // dereference the ReplicaSet to its owning Deployment;
                // replica sets are fetched directly, there is no informer
                let api: Api<ReplicaSet> =
                    Api::namespaced(self.shared.client.clone(), &namespace);
                let rs = api.get(&owner.name).await?;

                let Some(rs_owner) = controller_owner(rs.owner_references()) else {
                    return Ok(None);
                };
                let key = ObjectRef::new(&rs_owner.name).within(&namespace);
                Ok(self
                    .shared
                    .stores
                    .deployments
                    .get(&key)
                    .map(|deploy| deploy.annotations().clone()))
            }
            other => {
                debug!(controller = %other, "unknown pod controller");
                Ok(None)
            }
        }
    }
}

fn controller_owner(owners: &[OwnerReference]) -> Option<&OwnerReference> {
    owners
        .iter()
        .filter(|o| o.controller.unwrap_or(false))
        .next_back()
}

#[async_trait]
impl Handle<Arc<Pod>> for PodHandler {
    async fn on_added(&self, _latest: Option<Arc<Pod>>) -> ReconcileResult {
        ReconcileResult::then(Action::Update)
    }

    async fn on_updated(
        &self,
        _previous: Option<Arc<Pod>>,
        latest: Option<Arc<Pod>>,
    ) -> ReconcileResult {
        let Some(pod) = latest else {
            return ReconcileResult::default();
        };
        let target = ReloadTarget::new(
            TargetKind::Pod,
            pod.namespace().unwrap_or_default(),
            pod.name_any(),
        );

        let owner_annotations = match self.owner_annotations(&pod).await {
            Ok(Some(annotations)) => annotations,
            Ok(None) => {
                debug!(target = %target, "not managed by us");
                return ReconcileResult::default();
            }
            Err(e) => {
                warn!(target = %target, error = %e, "failed to resolve pod owner");
                return ReconcileResult::fail(e);
            }
        };

        debug!(target = %target, "creating pod specific triggers");
        let triggers = match pod_triggers(
            &owner_annotations,
            &pod,
            &self.shared.stores.config_maps,
            &self.shared.stores.secrets,
        ) {
            Ok(triggers) => triggers,
            Err(e) => {
                warn!(target = %target, error = %e, "failed to create pod specific triggers");
                return ReconcileResult::fail(e);
            }
        };

        if triggers.is_empty() {
            debug!(target = %target, "ignored due to no reload triggers");
        }
        self.shared.index.ensure_target(&target, triggers);
        ReconcileResult::default()
    }

    async fn on_deleting(&self, latest: Option<Arc<Pod>>) -> ReconcileResult {
        if let Some(pod) = latest {
            let target = ReloadTarget::new(
                TargetKind::Pod,
                pod.namespace().unwrap_or_default(),
                pod.name_any(),
            );
            self.shared.index.ensure_target(&target, Default::default());
        }
        ReconcileResult::then(Action::Cleanup)
    }

    async fn on_deleted(&self, latest: Option<Arc<Pod>>) -> ReconcileResult {
        if let Some(pod) = latest {
            let target = ReloadTarget::new(
                TargetKind::Pod,
                pod.namespace().unwrap_or_default(),
                pod.name_any(),
            );
            self.shared.index.ensure_target(&target, Default::default());
        }
        ReconcileResult::default()
    }
}
