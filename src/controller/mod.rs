//! The resync controller: informers, reconcilers, indexes and schedulers
//!
//! Construction wires six typed watches (ConfigMaps, Secrets,
//! Deployments, DaemonSets, StatefulSets, Pods) to reconcile cores, plus
//! two scheduler cores executing debounced reload jobs and syncer
//! rebuilds. [`Controller::run`] drives everything until the parent
//! cancellation token fires.

pub mod informer;
pub mod objects;
pub mod triggers;

mod configs;
mod env;
mod reload;
mod sync;
mod workloads;

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::{Client, Config, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResyncConfig;
use crate::error::Error;
use crate::events::EventPublisher;
use crate::fetcher::FetcherRegistry;
use crate::index::{ConfigRef, ReloadIndex, ReloadTarget};
use crate::reconcile::{Core, Options};
use crate::validator::ValidatorRegistry;
use crate::{
    LABEL_ACTION, LABEL_ACTION_RELOAD, LABEL_NAMESPACE_DISABLED, LABEL_NAMESPACE_ENABLED,
    POD_NAMESPACE_ENV,
};

use configs::ConfigHandler;
use informer::{spawn_watch, SyncedFlag};
use objects::{ConfigArtifact, ReloadJob, ResourceKey, SyncerAssignment, Workload};
use reload::ReloadHandler;
use sync::{SyncHandler, SyncerIndex};
use workloads::{PodHandler, WorkloadHandler};

const NAMESPACE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a kube client from an optional kubeconfig path.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal("client", format!("failed to read kubeconfig: {e}"))
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal("client", format!("failed to load kubeconfig: {e}"))
                })?;
            Client::try_from(config)
                .map_err(|e| Error::internal("client", format!("failed to create client: {e}")))
        }
        None => Client::try_default()
            .await
            .map_err(|e| Error::internal("client", format!("failed to create client: {e}"))),
    }
}

/// The pluggable syncer pieces, injected at controller construction.
pub struct Plugins {
    /// Fetcher factories by name
    pub fetchers: FetcherRegistry,
    /// Validator factories by name
    pub validators: ValidatorRegistry,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            fetchers: FetcherRegistry::default(),
            validators: ValidatorRegistry::default(),
        }
    }
}

/// Reflector-backed lookup caches for every watched type.
pub(crate) struct Stores {
    pub config_maps: Store<ConfigMap>,
    pub secrets: Store<Secret>,
    pub deployments: Store<Deployment>,
    pub daemon_sets: Store<DaemonSet>,
    pub stateful_sets: Store<StatefulSet>,
    pub pods: Store<Pod>,
}

/// State shared by every handler.
pub(crate) struct Shared {
    pub client: Client,
    pub config: ResyncConfig,
    pub cancel: CancellationToken,
    pub index: ReloadIndex,
    pub syncers: SyncerIndex,
    pub fetchers: FetcherRegistry,
    pub validators: ValidatorRegistry,
    pub events: Arc<dyn EventPublisher>,
    pub stores: Stores,
    // the scheduler cores are wired after the handlers that reference
    // them exist; set exactly once during construction
    pub reload_core: OnceLock<Arc<Core<ReloadTarget, Arc<ReloadJob>>>>,
    pub sync_core: OnceLock<Arc<Core<ConfigRef, Arc<SyncerAssignment>>>>,
}

struct Writers {
    config_maps: reflector::store::Writer<ConfigMap>,
    secrets: reflector::store::Writer<Secret>,
    deployments: reflector::store::Writer<Deployment>,
    daemon_sets: reflector::store::Writer<DaemonSet>,
    stateful_sets: reflector::store::Writer<StatefulSet>,
    pods: reflector::store::Writer<Pod>,
}

/// The controller owning all watches, indexes and reconcilers.
pub struct Controller {
    shared: Arc<Shared>,
    writers: Writers,

    cm_core: Arc<Core<ResourceKey, Arc<ConfigArtifact>>>,
    secret_core: Arc<Core<ResourceKey, Arc<ConfigArtifact>>>,
    deploy_core: Arc<Core<ResourceKey, Arc<Workload>>>,
    ds_core: Arc<Core<ResourceKey, Arc<Workload>>>,
    sts_core: Arc<Core<ResourceKey, Arc<Workload>>>,
    pod_core: Arc<Core<ResourceKey, Arc<Pod>>>,
}

impl Controller {
    /// Wire up the controller. Watches start in [`Controller::run`].
    pub fn new(
        client: Client,
        config: ResyncConfig,
        plugins: Plugins,
        events: Arc<dyn EventPublisher>,
        cancel: CancellationToken,
    ) -> Self {
        let (cm_reader, cm_writer) = reflector::store();
        let (secret_reader, secret_writer) = reflector::store();
        let (deploy_reader, deploy_writer) = reflector::store();
        let (ds_reader, ds_writer) = reflector::store();
        let (sts_reader, sts_writer) = reflector::store();
        let (pod_reader, pod_writer) = reflector::store();

        let shared = Arc::new(Shared {
            client,
            config,
            cancel,
            index: ReloadIndex::new(),
            syncers: SyncerIndex::default(),
            fetchers: plugins.fetchers,
            validators: plugins.validators,
            events,
            stores: Stores {
                config_maps: cm_reader,
                secrets: secret_reader,
                deployments: deploy_reader,
                daemon_sets: ds_reader,
                stateful_sets: sts_reader,
                pods: pod_reader,
            },
            reload_core: OnceLock::new(),
            sync_core: OnceLock::new(),
        });

        let reload_handler: Arc<dyn crate::reconcile::Handle<Arc<ReloadJob>>> =
            Arc::new(ReloadHandler {
                shared: shared.clone(),
            });
        let reload_core = Core::new(Options::new("sched:reload", reload_handler).require_cache());
        let _ = shared.reload_core.set(reload_core);

        let sync_handler: Arc<dyn crate::reconcile::Handle<Arc<SyncerAssignment>>> =
            Arc::new(SyncHandler {
                shared: shared.clone(),
            });
        let sync_core = Core::new(Options::new("sched:sync", sync_handler).require_cache());
        let _ = shared.sync_core.set(sync_core);

        let config_handler = |shared: &Arc<Shared>| -> Arc<dyn crate::reconcile::Handle<Arc<ConfigArtifact>>> {
            Arc::new(ConfigHandler {
                shared: shared.clone(),
            })
        };
        let cm_core = Core::new(Options::new("conf:cm", config_handler(&shared)).require_cache());
        let secret_core =
            Core::new(Options::new("conf:secrets", config_handler(&shared)).require_cache());

        let workload_core = |name: &'static str| {
            let handler: Arc<dyn crate::reconcile::Handle<Arc<Workload>>> =
                Arc::new(WorkloadHandler {
                    shared: shared.clone(),
                });
            Core::new(Options::new(name, handler).require_cache())
        };
        let deploy_core = workload_core("reload:deploy");
        let ds_core = workload_core("reload:ds");
        let sts_core = workload_core("reload:sts");

        let pod_handler: Arc<dyn crate::reconcile::Handle<Arc<Pod>>> = Arc::new(PodHandler {
            shared: shared.clone(),
        });
        let pod_core = Core::new(Options::new("reload:pod", pod_handler).require_cache());

        Self {
            shared,
            writers: Writers {
                config_maps: cm_writer,
                secrets: secret_writer,
                deployments: deploy_writer,
                daemon_sets: ds_writer,
                stateful_sets: sts_writer,
                pods: pod_writer,
            },
            cm_core,
            secret_core,
            deploy_core,
            ds_core,
            sts_core,
            pod_core,
        }
    }

    /// Start watches and reconcilers and run until cancelled.
    pub async fn run(self) -> Result<(), Error> {
        let shared = self.shared.clone();
        let cancel = shared.cancel.clone();

        let scope = WatchScope::compute(&shared).await?;
        info!(
            namespaced = scope.namespace.is_some(),
            excluded = scope.field_selector.as_deref().unwrap_or("<none>"),
            "computed watch scope"
        );

        // plain watch for config resources and pods, label-filtered watch
        // for workloads that opted into reloading
        let plain = scope.config(None);
        let labeled = scope.config(Some(format!("{LABEL_ACTION}={LABEL_ACTION_RELOAD}")));

        let synced = vec![
            spawn_watch(
                scope.api::<ConfigMap>(&shared.client),
                plain.clone(),
                self.writers.config_maps,
                self.cm_core.clone(),
                |cm: &ConfigMap| Arc::new(ConfigArtifact::from(cm)),
                cancel.clone(),
            ),
            spawn_watch(
                scope.api::<Secret>(&shared.client),
                plain.clone(),
                self.writers.secrets,
                self.secret_core.clone(),
                |secret: &Secret| Arc::new(ConfigArtifact::from(secret)),
                cancel.clone(),
            ),
            spawn_watch(
                scope.api::<Deployment>(&shared.client),
                labeled.clone(),
                self.writers.deployments,
                self.deploy_core.clone(),
                |deploy: &Deployment| Arc::new(Workload::from(deploy)),
                cancel.clone(),
            ),
            spawn_watch(
                scope.api::<DaemonSet>(&shared.client),
                labeled.clone(),
                self.writers.daemon_sets,
                self.ds_core.clone(),
                |ds: &DaemonSet| Arc::new(Workload::from(ds)),
                cancel.clone(),
            ),
            spawn_watch(
                scope.api::<StatefulSet>(&shared.client),
                labeled,
                self.writers.stateful_sets,
                self.sts_core.clone(),
                |sts: &StatefulSet| Arc::new(Workload::from(sts)),
                cancel.clone(),
            ),
            spawn_watch(
                scope.api::<Pod>(&shared.client),
                plain,
                self.writers.pods,
                self.pod_core.clone(),
                |pod: &Pod| Arc::new(pod.clone()),
                cancel.clone(),
            ),
        ];

        let reload_core = shared
            .reload_core
            .get()
            .ok_or_else(|| Error::internal("controller", "reload core not wired"))?
            .clone();
        let sync_core = shared
            .sync_core
            .get()
            .ok_or_else(|| Error::internal("controller", "sync core not wired"))?
            .clone();

        self.cm_core.start(cancel.clone());
        self.secret_core.start(cancel.clone());
        self.deploy_core.start(cancel.clone());
        self.ds_core.start(cancel.clone());
        self.sts_core.start(cancel.clone());
        self.pod_core.start(cancel.clone());
        reload_core.start(cancel.clone());
        sync_core.start(cancel.clone());

        info!("waiting for informer caches to sync");
        wait_for_cache_sync(&synced, &cancel).await?;
        info!("informer caches synced, starting reconcilers");

        macro_rules! spawn_worker {
            ($core:expr) => {{
                let core = $core.clone();
                let stop = cancel.clone();
                tokio::spawn(async move { core.reconcile_until(stop).await });
            }};
        }
        spawn_worker!(self.cm_core);
        spawn_worker!(self.secret_core);
        spawn_worker!(self.deploy_core);
        spawn_worker!(self.ds_core);
        spawn_worker!(self.sts_core);
        spawn_worker!(self.pod_core);
        spawn_worker!(reload_core);
        spawn_worker!(sync_core);

        cancel.cancelled().await;
        info!("controller shutting down");
        Ok(())
    }
}

async fn wait_for_cache_sync(
    synced: &[SyncedFlag],
    cancel: &CancellationToken,
) -> Result<(), Error> {
    for flag in synced {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::internal("controller", "cancelled before cache sync"));
            }
            _ = flag.wait() => {}
        }
    }
    Ok(())
}

/// The namespace scope the controller watches.
struct WatchScope {
    /// Watch a single namespace when set
    namespace: Option<String>,
    /// Field selector excluding disabled namespaces (cluster scope only)
    field_selector: Option<String>,
}

impl WatchScope {
    async fn compute(shared: &Shared) -> Result<Self, Error> {
        if shared.config.namespaced {
            let namespace = std::env::var(POD_NAMESPACE_ENV).map_err(|_| {
                Error::config(format!(
                    "--namespaced requires the {POD_NAMESPACE_ENV} environment variable"
                ))
            })?;
            return Ok(Self {
                namespace: Some(namespace),
                field_selector: None,
            });
        }

        let mut disabled = shared.config.ignored_namespaces.clone();
        match probe_labeled_namespaces(&shared.client, LABEL_NAMESPACE_DISABLED).await {
            Ok(found) => disabled.extend(found),
            Err(e) if e.is_forbidden() => {
                // degrade silently: watch everything
                debug!("namespace probe forbidden, skipping disabled-namespace scoping");
            }
            Err(e) => {
                return Err(Error::internal(
                    "controller",
                    format!("failed to determine namespaces to watch: {e}"),
                ))
            }
        }

        // enabled namespaces are advisory only: field selectors cannot
        // express a logical OR over namespaces
        if let Ok(enabled) = probe_labeled_namespaces(&shared.client, LABEL_NAMESPACE_ENABLED).await
        {
            if !enabled.is_empty() {
                warn!(
                    count = enabled.len(),
                    "enabled-namespace labels found; restriction by enablement is not \
                     supported, use disabled labels instead"
                );
            }
        }

        disabled.sort();
        disabled.dedup();
        let field_selector = if disabled.is_empty() {
            None
        } else {
            Some(
                disabled
                    .iter()
                    .map(|ns| format!("metadata.namespace!={ns}"))
                    .collect::<Vec<_>>()
                    .join(","),
            )
        };

        Ok(Self {
            namespace: None,
            field_selector,
        })
    }

    fn api<K>(&self, client: &Client) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    fn config(&self, label_selector: Option<String>) -> watcher::Config {
        let mut config = watcher::Config::default();
        if let Some(fields) = &self.field_selector {
            config = config.fields(fields);
        }
        if let Some(labels) = &label_selector {
            config = config.labels(labels);
        }
        config
    }
}

async fn probe_labeled_namespaces(client: &Client, label: &str) -> Result<Vec<String>, Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let params = ListParams::default().labels(label);

    let list = tokio::time::timeout(NAMESPACE_PROBE_TIMEOUT, api.list(&params))
        .await
        .map_err(|_| Error::internal("controller", "namespace probe timed out"))??;

    Ok(list.items.iter().map(|ns| ns.name_any()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_scope_builds_field_selectors() {
        let scope = WatchScope {
            namespace: None,
            field_selector: Some(
                "metadata.namespace!=kube-system,metadata.namespace!=dev".to_string(),
            ),
        };
        let config = scope.config(Some("resync.dev/action=reload".to_string()));
        assert_eq!(
            config.field_selector.as_deref(),
            Some("metadata.namespace!=kube-system,metadata.namespace!=dev")
        );
        assert_eq!(
            config.label_selector.as_deref(),
            Some("resync.dev/action=reload")
        );
    }

    #[test]
    fn plugins_default_carries_builtins() {
        let plugins = Plugins::default();
        // unknown names still fail, builtin names resolve to factories
        assert!(plugins
            .fetchers
            .build(&crate::fetcher::FetcherConfig {
                method: "mqtt".to_string(),
                required_data_keys: vec![],
                mqtt: None,
            })
            .is_err()); // no mqtt block provided, but the name resolved
    }
}
