//! Kubernetes Event recording for the resync controller
//!
//! Events are **fire-and-forget**: failures are logged as warnings and
//! never propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::CONTROLLER_NAME;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the resync controller.
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Reload fingerprints patched into a workload's pod template
    pub const RELOAD_PATCHED: &str = "ReloadPatched";
    /// A bare pod was deleted to pick up new config
    pub const POD_RESTARTED: &str = "PodRestarted";
    /// Reload attempt failed and will be retried
    pub const RELOAD_FAILED: &str = "ReloadFailed";
    /// Synced data written back into the config artifact
    pub const CONFIG_SYNCED: &str = "ConfigSynced";
    /// Syncer pipeline could not be built or started
    pub const SYNC_FAILED: &str = "SyncFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Rolling a workload
    pub const RELOAD: &str = "Reload";
    /// Syncing an externally-sourced config
    pub const SYNC: &str = "Sync";
}
