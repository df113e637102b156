//! Controller configuration record
//!
//! Loaded from an optional YAML file, with CLI flags taking precedence
//! over file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

fn default_reload_delay_secs() -> u64 {
    10
}

/// The small configuration record the controller is constructed with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResyncConfig {
    /// Path to a kubeconfig file; in-cluster config when unset
    pub kubeconfig: Option<PathBuf>,

    /// Watch only the namespace this controller runs in
    pub namespaced: bool,

    /// Namespaces excluded from the watch, merged with namespaces carrying
    /// the disabled label
    pub ignored_namespaces: Vec<String>,

    /// Debounce window between a fireable config delta and the reload job
    /// executing, in seconds
    #[serde(default = "default_reload_delay_secs")]
    pub reload_delay_secs: u64,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespaced: false,
            ignored_namespaces: Vec::new(),
            reload_delay_secs: default_reload_delay_secs(),
        }
    }
}

impl ResyncConfig {
    /// Read a config file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            Error::config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }

    /// The reload debounce window.
    pub fn reload_delay(&self) -> Duration {
        Duration::from_secs(self.reload_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ResyncConfig::default();
        assert!(!cfg.namespaced);
        assert!(cfg.ignored_namespaces.is_empty());
        assert_eq!(cfg.reload_delay(), Duration::from_secs(10));
    }

    #[test]
    fn parses_yaml_document() {
        let cfg: ResyncConfig = serde_yaml::from_str(
            r#"
namespaced: true
ignoredNamespaces: [kube-system, kube-public]
reloadDelaySecs: 30
"#,
        )
        .unwrap();
        assert!(cfg.namespaced);
        assert_eq!(cfg.ignored_namespaces, vec!["kube-system", "kube-public"]);
        assert_eq!(cfg.reload_delay(), Duration::from_secs(30));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: ResyncConfig = serde_yaml::from_str("namespaced: true").unwrap();
        assert!(cfg.namespaced);
        assert_eq!(cfg.reload_delay_secs, 10);
    }
}
