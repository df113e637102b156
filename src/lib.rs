//! resync - keeps workloads in step with the configs they consume
//!
//! resync watches ConfigMaps and Secrets, hashes their content, and rolls
//! the Deployments/DaemonSets/StatefulSets/Pods wired to them when that
//! content changes. Configs labeled for syncing are additionally pulled
//! from a remote broker through a fetch -> validate -> publish pipeline
//! and written back into the cluster, which re-enters the reload path.
//!
//! # Modules
//!
//! - [`queue`] - job queue, timeout queue, and backoff primitives
//! - [`reconcile`] - the scheduled-action state machine driving handlers
//! - [`index`] - the bipartite trigger index and content hashes
//! - [`expand`] - `$(VAR)` reference expansion
//! - [`controller`] - informer wiring, trigger extraction, reload and sync
//! - [`syncer`] - the fetcher/validator pipeline for synced configs
//! - [`fetcher`] - fetcher plugins and their registry
//! - [`validator`] - validator plugins and their registry
//! - [`events`] - best-effort Kubernetes Event publishing
//! - [`config`] - the controller configuration record
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod expand;
pub mod fetcher;
pub mod index;
pub mod queue;
pub mod reconcile;
pub mod syncer;
pub mod validator;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Cluster-side contract: annotations and labels resync recognizes
// =============================================================================

/// Comma-separated `name[/key]` list restricting which ConfigMap volumes
/// trigger reload; listed refs are also added verbatim. Present-but-empty
/// disables ConfigMap-driven reload for the workload.
pub const ANNOTATION_CONFIGMAPS: &str = "resync.dev/configmaps";

/// Same as [`ANNOTATION_CONFIGMAPS`], for Secrets.
pub const ANNOTATION_SECRETS: &str = "resync.dev/secrets";

/// ConfigMaps that always trigger reload, mounted or not.
pub const ANNOTATION_FORCE_CONFIGMAPS: &str = "resync.dev/force-configmaps";

/// Secrets that always trigger reload, mounted or not.
pub const ANNOTATION_FORCE_SECRETS: &str = "resync.dev/force-secrets";

/// Marks a config as externally sourced; the value is a
/// `cm://[ns/]name/key` or `secret://[ns/]name/key` URL pointing at the
/// syncer pipeline definition.
pub const ANNOTATION_SYNC_CONFIG: &str = "resync.dev/sync-config-ref";

/// Prefix of the content-hash fingerprint annotations written into pod
/// templates.
pub const ANNOTATION_HASH_PREFIX: &str = "hash.resync.dev";

/// Label selecting what resync does with an object: workloads opt into
/// reloading, configs opt into syncing.
pub const LABEL_ACTION: &str = "resync.dev/action";

/// [`LABEL_ACTION`] value opting a workload into reloading.
pub const LABEL_ACTION_RELOAD: &str = "reload";

/// [`LABEL_ACTION`] value opting a config into syncing.
pub const LABEL_ACTION_SYNC: &str = "sync";

/// Namespace label explicitly opting into the watch scope.
pub const LABEL_NAMESPACE_ENABLED: &str = "resync.dev/enabled";

/// Namespace label excluding a namespace from the watch scope.
pub const LABEL_NAMESPACE_DISABLED: &str = "resync.dev/disabled";

/// Environment variable carrying the controller's own namespace
/// (populated via the downward API); used by `--namespaced` mode.
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Field manager / event reporter name.
pub const CONTROLLER_NAME: &str = "resync-controller";
