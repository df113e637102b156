//! Informer layer: typed watches feeding the reconcile cores
//!
//! Each watched type gets a reflector-backed [`Store`] for lookups plus a
//! background task that applies watch events to the store, snapshots the
//! object into the reconciler's cache, and offers the matching job. The
//! `synced` flag flips once the initial list completes (the `HasSynced`
//! predicate); objects that vanished while the watch was disconnected are
//! delivered as deletes after every re-list.
//!
//! Stores are created eagerly with [`reflector::store`] during controller
//! wiring so handlers can hold them before any watch starts; the writer
//! half is handed to [`spawn_watch`].

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::Lookup;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::objects::ResourceKey;
use crate::queue::{Action, Job, QueueError};
use crate::reconcile::Core;

/// The `HasSynced` predicate of one watch: flips to true once the initial
/// list has been fully applied.
#[derive(Clone)]
pub struct SyncedFlag {
    rx: watch::Receiver<bool>,
}

impl SyncedFlag {
    /// Wait until the initial list has been fully applied.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // send side lives in the watch task; if it died we are shutting down
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Whether the initial list has completed.
    pub fn has_synced(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Spawn a watch for one resource type, routing events into `core`.
///
/// `map` snapshots the typed object into the reconciler's cached view.
pub fn spawn_watch<R, V>(
    api: Api<R>,
    watch_config: watcher::Config,
    mut writer: Writer<R>,
    core: Arc<Core<ResourceKey, V>>,
    map: impl Fn(&R) -> V + Send + 'static,
    cancel: CancellationToken,
) -> SyncedFlag
where
    R: kube::Resource<DynamicType = ()>
        + Lookup<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    V: Clone + Send + Sync + 'static,
{
    let (synced_tx, synced_rx) = watch::channel(false);

    tokio::spawn(async move {
        // keys seen since the last completed list; used to synthesize
        // deletes for objects that vanished during a disconnect
        let mut known: HashSet<ResourceKey> = HashSet::new();
        let mut init_seen: HashSet<ResourceKey> = HashSet::new();

        let mut stream = watcher(api, watch_config).default_backoff().boxed();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.try_next() => event,
            };

            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!("watch stream ended");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "watch stream error");
                    continue;
                }
            };

            writer.apply_watcher_event(&event);

            match event {
                Event::Init => {
                    init_seen.clear();
                }
                Event::InitApply(obj) => {
                    let key = ResourceKey::of(&obj);
                    init_seen.insert(key.clone());
                    route_apply(&core, &map, key, &obj, &mut known);
                }
                Event::InitDone => {
                    for gone in known.difference(&init_seen) {
                        debug!(key = %gone, "object vanished during relist");
                        offer(&core, Action::Delete, gone.clone());
                    }
                    known = std::mem::take(&mut init_seen);
                    let _ = synced_tx.send(true);
                }
                Event::Apply(obj) => {
                    let key = ResourceKey::of(&obj);
                    route_apply(&core, &map, key, &obj, &mut known);
                }
                Event::Delete(obj) => {
                    let key = ResourceKey::of(&obj);
                    known.remove(&key);
                    core.cache().update(&key, None, Some(map(&obj)));
                    offer(&core, Action::Delete, key);
                }
            }
        }
    });

    SyncedFlag { rx: synced_rx }
}

fn route_apply<R, V>(
    core: &Arc<Core<ResourceKey, V>>,
    map: &impl Fn(&R) -> V,
    key: ResourceKey,
    obj: &R,
    known: &mut HashSet<ResourceKey>,
) where
    R: kube::Resource<DynamicType = ()>,
    V: Clone + Send + Sync + 'static,
{
    let action = if known.insert(key.clone()) {
        Action::Add
    } else {
        Action::Update
    };
    core.cache().update(&key, None, Some(map(obj)));
    if action == Action::Update {
        // pin the pre-update snapshot until the handler processes the
        // update; the core unfreezes on success
        core.cache().freeze(&key, true);
    }
    offer(core, action, key);
}

fn offer<V>(core: &Arc<Core<ResourceKey, V>>, action: Action, key: ResourceKey)
where
    V: Clone + Send + Sync + 'static,
{
    match core.schedule(Job { action, key }, std::time::Duration::ZERO) {
        Ok(()) | Err(QueueError::Duplicate) => {}
        Err(e) => warn!(error = %e, "failed to offer informer job"),
    }
}
