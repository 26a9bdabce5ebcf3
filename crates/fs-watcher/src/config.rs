//! Static configuration for the watcher backends.
//!
//! Loading this from disk (and deciding which backend to use) belongs to the
//! server's config layer; this crate only consumes the resolved values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Prefix for subscription names registered with the change service, so an
/// operator inspecting the service can tell our subscriptions apart.
pub const SUBSCRIPTION_PREFIX: &str = "sift-fs-watcher";

/// How long a connect to the change service may take before init fails.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transaction scope the change service is asked to defer file events
/// through, so working-copy updates arrive as one coherent burst.
pub const UPDATE_SCOPE: &str = "update";

/// Transaction scope bracketing source-control transactions.
pub const TRANSACTION_SCOPE: &str = "transaction";

/// Resolved watcher configuration, handed in by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory roots to watch.
    pub roots: Vec<PathBuf>,
    /// Path/extension filter expressions, in the change service's syntax.
    #[serde(default)]
    pub expressions: Vec<String>,
    /// Lazy mode: track the mergebase so consumers learn when it moves.
    #[serde(default)]
    pub lazy_mode: bool,
    /// Ask the transports for verbose debug output.
    #[serde(default)]
    pub debug: bool,
    /// Binary for the external polling watcher (polling backend only).
    #[serde(default = "default_poll_program")]
    pub poll_program: PathBuf,
    /// Extra arguments passed to the poller before the watched roots.
    #[serde(default)]
    pub poll_args: Vec<String>,
}

fn default_poll_program() -> PathBuf {
    PathBuf::from("sift-poll-watcher")
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            expressions: Vec::new(),
            lazy_mode: false,
            debug: false,
            poll_program: default_poll_program(),
            poll_args: Vec::new(),
        }
    }
}

/// Immutable settings for one subscription to the change service.
///
/// Built once from [`WatcherConfig`] at `start_init` and never mutated; the
/// wire-level meaning of each field is the transport's business.
#[derive(Debug, Clone)]
pub struct SubscribeSettings {
    /// Scope names during which the service should defer change delivery.
    pub defer_states: Vec<String>,
    /// Bounded timeout for the initial connect.
    pub init_timeout: Duration,
    /// Filter expressions restricting which paths are reported.
    pub expressions: Vec<String>,
    /// Name prefix for the registered subscription.
    pub subscription_prefix: String,
    /// Directory roots the subscription covers.
    pub roots: Vec<PathBuf>,
    /// Ask the service for verbose debug logging.
    pub debug: bool,
}

impl SubscribeSettings {
    pub fn from_config(config: &WatcherConfig) -> Self {
        Self {
            defer_states: vec![UPDATE_SCOPE.to_string()],
            init_timeout: INIT_TIMEOUT,
            expressions: config.expressions.clone(),
            subscription_prefix: SUBSCRIPTION_PREFIX.to_string(),
            roots: config.roots.clone(),
            debug: config.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = WatcherConfig {
            roots: vec![PathBuf::from("/repo")],
            expressions: vec!["*.js".to_string()],
            lazy_mode: true,
            debug: true,
            ..Default::default()
        };

        let settings = SubscribeSettings::from_config(&config);
        assert_eq!(settings.defer_states, vec![UPDATE_SCOPE.to_string()]);
        assert_eq!(settings.roots, vec![PathBuf::from("/repo")]);
        assert_eq!(settings.expressions, vec!["*.js".to_string()]);
        assert!(settings.debug);
        assert!(settings.subscription_prefix.starts_with("sift"));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: WatcherConfig = serde_json::from_str(r#"{"roots": ["/repo"]}"#).unwrap();
        assert!(!config.lazy_mode);
        assert!(!config.debug);
        assert!(config.expressions.is_empty());
        assert_eq!(config.poll_program, PathBuf::from("sift-poll-watcher"));
    }
}
