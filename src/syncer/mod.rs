//! Syncer: fetchers fanned through validators into an atomic publish
//!
//! Each fetcher's arrivals run through every validator in declaration
//! order, then merge into a shared buffer. A publish task emits the whole
//! buffer (and resets it) once every required key is present; with no
//! required keys any non-empty arrival publishes. Between publishes the
//! latest value per key wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::fetcher::{DataMap, Fetcher, FetcherConfig, FetcherRegistry};
use crate::validator::{Validator, ValidatorConfig, ValidatorRegistry};

/// The syncer pipeline definition, read from the referenced config key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncerConfig {
    /// Keys that must all be buffered before a publish
    pub required_data_keys: Vec<String>,

    /// The fetchers pulling data in
    pub fetchers: Vec<FetcherConfig>,

    /// The validators every arrival runs through, in order
    pub validators: Vec<ValidatorConfig>,
}

impl SyncerConfig {
    /// Parse a pipeline definition, trying YAML first and JSON second.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        match serde_yaml::from_slice(raw) {
            Ok(config) => Ok(config),
            Err(yaml_err) => serde_json::from_slice(raw).map_err(|json_err| {
                Error::config(format!(
                    "failed to unmarshal syncer config: {yaml_err}; {json_err}"
                ))
            }),
        }
    }
}

struct Buffer {
    data: Mutex<DataMap>,
    notify: Notify,
}

/// A running fetch -> validate -> publish pipeline for one synced config.
#[derive(Debug)]
pub struct Syncer {
    fetchers: Vec<Box<dyn Fetcher>>,
    validators: Arc<Vec<Box<dyn Validator>>>,
    required_data_keys: Arc<Vec<String>>,
    cancel: CancellationToken,
    started: bool,
}

impl Syncer {
    /// Build the pipeline from its config and the injected registries.
    pub fn new(
        config: &SyncerConfig,
        fetchers: &FetcherRegistry,
        validators: &ValidatorRegistry,
    ) -> Result<Self, Error> {
        let mut built_fetchers = Vec::with_capacity(config.fetchers.len());
        for (i, fc) in config.fetchers.iter().enumerate() {
            debug!(index = i, method = %fc.method, "creating fetcher");
            built_fetchers.push(fetchers.build(fc).map_err(|e| {
                Error::config(format!("failed to create fetcher {i}: {e}"))
            })?);
        }

        let mut built_validators = Vec::with_capacity(config.validators.len());
        for (i, vc) in config.validators.iter().enumerate() {
            debug!(index = i, method = %vc.method, "creating validator");
            built_validators.push(validators.build(vc).map_err(|e| {
                Error::config(format!("failed to create validator {i}: {e}"))
            })?);
        }

        Ok(Self {
            fetchers: built_fetchers,
            validators: Arc::new(built_validators),
            required_data_keys: Arc::new(config.required_data_keys.clone()),
            cancel: CancellationToken::new(),
            started: false,
        })
    }

    /// Start fetchers and the publish loop; returns the output channel.
    ///
    /// On failure every already-started fetcher is stopped again.
    pub async fn start(
        &mut self,
        parent: &CancellationToken,
    ) -> Result<mpsc::Receiver<DataMap>, Error> {
        if self.started {
            return Err(Error::internal("syncer", "already started"));
        }
        self.started = true;
        self.cancel = parent.child_token();

        let cancel = self.cancel.clone();
        for i in 0..self.fetchers.len() {
            debug!(index = i, "starting fetcher");
            if let Err(e) = self.fetchers[i].start(cancel.clone()).await {
                self.stop().await;
                return Err(Error::sync(format!("failed to start fetcher {i}: {e}")));
            }
        }

        let buffer = Arc::new(Buffer {
            data: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });
        let (out_tx, out_rx) = mpsc::channel(1);

        for fetcher in &mut self.fetchers {
            let Some(rx) = fetcher.retrieve() else {
                continue;
            };
            tokio::spawn(pump(
                rx,
                self.validators.clone(),
                buffer.clone(),
            ));
        }

        tokio::spawn(publish_loop(
            buffer,
            self.required_data_keys.clone(),
            out_tx,
            self.cancel.clone(),
        ));

        Ok(out_rx)
    }

    /// Stop fetchers and close the output channel. Idempotent.
    pub async fn stop(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!("stopping syncer");
        self.cancel.cancel();
        for fetcher in &mut self.fetchers {
            if let Err(e) = fetcher.stop().await {
                warn!(error = %e, "fetcher stopped with error");
            }
        }
    }
}

// one task per fetcher: validate each arrival and merge it into the buffer
async fn pump(
    mut rx: mpsc::Receiver<DataMap>,
    validators: Arc<Vec<Box<dyn Validator>>>,
    buffer: Arc<Buffer>,
) {
    while let Some(mut data) = rx.recv().await {
        for validator in validators.iter() {
            let msg = validator.validate(&data).await;
            for (key, value) in msg.data {
                data.insert(key, value);
            }
            for (key, err) in msg.errors {
                warn!(key = %key, error = %err, "data for key not valid");
                data.remove(&key);
            }
        }

        {
            let mut buf = buffer.data.lock().expect("syncer buffer poisoned");
            buf.extend(data);
        }
        buffer.notify.notify_one();
    }
}

// single consumer after fan-in: wait for the buffer to become complete,
// then swap it out onto the output channel
async fn publish_loop(
    buffer: Arc<Buffer>,
    required: Arc<Vec<String>>,
    out_tx: mpsc::Sender<DataMap>,
    cancel: CancellationToken,
) {
    loop {
        let notified = buffer.notify.notified();

        let batch = {
            let mut buf = buffer.data.lock().expect("syncer buffer poisoned");
            let complete = !buf.is_empty() && required.iter().all(|k| buf.contains_key(k));
            if complete {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            if out_tx.send(batch).await.is_err() {
                return;
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = notified => {}
        }
    }
}
