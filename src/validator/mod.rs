//! Validator plugins for the syncer pipeline
//!
//! Every fetched data arrival is pushed through the configured validators
//! in declaration order. A validator may rewrite a key's data on success;
//! a per-key error drops the key from the arrival for this round.

pub mod http;
pub mod text;

use std::collections::HashMap;

use async_trait::async_trait;
use minijinja::{context, Environment};
use serde::Deserialize;

use crate::error::Error;
use crate::fetcher::DataMap;

/// Outcome of one validation pass.
#[derive(Default)]
pub struct DataMsg {
    /// Per-key replacement data for keys that validated
    pub data: DataMap,
    /// Per-key failures; these keys are dropped from the round
    pub errors: HashMap<String, Error>,
}

/// A validator judges (and may rewrite) fetched data per key.
#[async_trait]
pub trait Validator: Send + Sync + std::fmt::Debug {
    /// Validate the keys this validator is configured for.
    async fn validate(&self, data: &DataMap) -> DataMsg;
}

/// Configuration for a single validator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorConfig {
    /// The validator name (registry lookup key)
    pub method: String,

    /// Data keys this validator applies to; other keys pass through
    #[serde(default)]
    pub data_keys: Vec<String>,

    /// HTTP validator configuration
    #[serde(default)]
    pub http: Option<http::HttpValidatorConfig>,

    /// Text query validator configuration
    #[serde(default)]
    pub text: Option<text::TextValidatorConfig>,
}

/// Factory signature for validator plugins.
pub type ValidatorFactory = fn(&ValidatorConfig) -> Result<Box<dyn Validator>, Error>;

/// Name-keyed validator factories, injected at controller construction.
pub struct ValidatorRegistry {
    factories: HashMap<&'static str, ValidatorFactory>,
}

impl ValidatorRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under `name`.
    pub fn register(&mut self, name: &'static str, factory: ValidatorFactory) {
        self.factories.insert(name, factory);
    }

    /// Build a validator, failing on unknown names.
    pub fn build(&self, config: &ValidatorConfig) -> Result<Box<dyn Validator>, Error> {
        let factory = self
            .factories
            .get(config.method.as_str())
            .ok_or_else(|| Error::config(format!("validator {:?} not found", config.method)))?;
        factory(config)
    }
}

impl Default for ValidatorRegistry {
    /// The built-in validators: `http` and `text`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(http::METHOD_HTTP, http::new_http_validator);
        registry.register(text::METHOD_TEXT, text::new_text_validator);
        registry
    }
}

/// Variables available to validator templates.
pub(crate) struct TemplateVars<'a> {
    pub data_keys: &'a [String],
    pub data_key: &'a str,
    pub data: &'a [u8],
}

/// Render a template string against the per-key variables.
pub(crate) fn render_template(source: &str, vars: &TemplateVars<'_>) -> Result<String, Error> {
    let env = Environment::new();
    env.render_str(
        source,
        context! {
            data_keys => vars.data_keys,
            data_key => vars.data_key,
            data => String::from_utf8_lossy(vars.data),
        },
    )
    .map_err(|e| Error::config(format!("failed to render template {source:?}: {e}")))
}

/// Eagerly reject syntactically-invalid templates at build time.
pub(crate) fn check_template(source: &str) -> Result<(), Error> {
    let env = Environment::new();
    env.template_from_str(source)
        .map(|_| ())
        .map_err(|e| Error::config(format!("failed to parse template {source:?}: {e}")))
}
