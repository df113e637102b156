//! Error types for the resync controller
//!
//! Errors carry enough context to decide retry behavior: the reconcile core
//! retries retryable failures with per-key backoff, and the reload/sync
//! handlers treat cluster-side NotFound as success.

use thiserror::Error;

/// Main error type for resync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The informer cache did not hold the requested key
    #[error("cache miss for {key}")]
    CacheMiss {
        /// The `<namespace>/<name>` (or job) key that was looked up
        key: String,
    },

    /// Malformed user-supplied configuration: annotation URLs, syncer
    /// documents, unknown fetcher/validator names
    #[error("config error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Syncer pipeline error (fetcher/validator construction or runtime)
    #[error("sync error: {message}")]
    Sync {
        /// Description of what failed
        message: String,
    },

    /// `$(VAR)` expansion failed against the container environment
    #[error("expansion error: unresolved reference in {expr:?}")]
    Expand {
        /// The expression that could not be resolved
        expr: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "informer")
        context: String,
    },
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a sync error with the given message
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync {
            message: msg.into(),
        }
    }

    /// Create a cache-miss error for the given lookup key
    pub fn cache_miss(key: impl Into<String>) -> Self {
        Self::CacheMiss { key: key.into() }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Config errors require a user fix and are not retried. Kubernetes
    /// errors depend on the status code: 4xx responses (validation, not
    /// found, forbidden) will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::CacheMiss { .. } => true,
            Error::Config { .. } => false,
            Error::Sync { .. } => true,
            Error::Expand { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this is a Kubernetes NotFound response
    ///
    /// Reload patches and pod deletions treat NotFound as success: the
    /// target vanished mid-reconcile and there is nothing left to roll.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Check if this is a Kubernetes Forbidden response
    ///
    /// The startup namespace probe degrades silently on Forbidden.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 403)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "test".to_string(),
                code,
            }),
        }
    }

    #[test]
    fn not_found_is_detected() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::config("bad url").is_not_found());
    }

    #[test]
    fn forbidden_is_detected() {
        assert!(api_error(403).is_forbidden());
        assert!(!api_error(404).is_forbidden());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!api_error(404).is_retryable());
        assert!(!api_error(422).is_retryable());
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn config_errors_are_not_retryable() {
        assert!(!Error::config("unsupported scheme").is_retryable());
        assert!(!Error::Expand {
            expr: "$(MISSING)".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::cache_miss("a/b").is_retryable());
        assert!(Error::sync("fetcher died").is_retryable());
        assert!(Error::internal("reconciler", "oops").is_retryable());
    }

    #[test]
    fn messages_carry_context() {
        let err = Error::internal("informer", "stream closed");
        assert!(err.to_string().contains("[informer]"));
        assert!(err.to_string().contains("stream closed"));

        let err = Error::cache_miss("ns/name");
        assert!(err.to_string().contains("ns/name"));
    }
}
