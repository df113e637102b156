//! Fetcher plugins for the syncer pipeline
//!
//! A fetcher pulls config data from a remote source and emits partial
//! updates (`data key -> bytes`) on its retrieve channel until stopped.

pub mod mqtt;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A partial data update: each message may carry any subset of keys.
pub type DataMap = HashMap<String, Vec<u8>>;

/// A remote data source feeding the syncer.
#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    /// Connect and start emitting updates until `cancel` fires.
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), Error>;

    /// Take the retrieve channel. Yields `None` after the first call.
    /// The channel closes on shutdown.
    fn retrieve(&mut self) -> Option<mpsc::Receiver<DataMap>>;

    /// Stop this fetcher. Idempotent.
    async fn stop(&mut self) -> Result<(), Error>;
}

/// Configuration for a single fetcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetcherConfig {
    /// The fetcher name (registry lookup key)
    pub method: String,

    /// Keys that must all be buffered before this fetcher emits; empty
    /// emits every arrival as-is
    #[serde(default)]
    pub required_data_keys: Vec<String>,

    /// MQTT fetcher configuration
    #[serde(default)]
    pub mqtt: Option<mqtt::MqttConfig>,
}

/// Factory signature for fetcher plugins.
pub type FetcherFactory = fn(&FetcherConfig) -> Result<Box<dyn Fetcher>, Error>;

/// Name-keyed fetcher factories, injected at controller construction.
pub struct FetcherRegistry {
    factories: HashMap<&'static str, FetcherFactory>,
}

impl FetcherRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under `name`.
    pub fn register(&mut self, name: &'static str, factory: FetcherFactory) {
        self.factories.insert(name, factory);
    }

    /// Build a fetcher, failing on unknown names.
    pub fn build(&self, config: &FetcherConfig) -> Result<Box<dyn Fetcher>, Error> {
        let factory = self
            .factories
            .get(config.method.as_str())
            .ok_or_else(|| Error::config(format!("fetcher {:?} not found", config.method)))?;
        factory(config)
    }
}

impl Default for FetcherRegistry {
    /// The built-in fetchers: `mqtt`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(mqtt::METHOD_MQTT, mqtt::new_mqtt_fetcher);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fetcher_name_fails() {
        let registry = FetcherRegistry::default();
        let config = FetcherConfig {
            method: "carrier-pigeon".to_string(),
            required_data_keys: vec![],
            mqtt: None,
        };
        let err = registry.build(&config).unwrap_err();
        assert!(err.to_string().contains("\"carrier-pigeon\" not found"));
    }

    #[test]
    fn registry_dispatches_registered_factories() {
        fn failing_factory(_: &FetcherConfig) -> Result<Box<dyn Fetcher>, Error> {
            Err(Error::config("factory ran"))
        }

        let mut registry = FetcherRegistry::empty();
        registry.register("custom", failing_factory);

        let config = FetcherConfig {
            method: "custom".to_string(),
            required_data_keys: vec![],
            mqtt: None,
        };
        let err = registry.build(&config).unwrap_err();
        assert!(err.to_string().contains("factory ran"));
    }
}
