//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;
use tracing::warn;

/// Cluster ID used when `CLUSTER_ID` is unset
const UNKNOWN_CLUSTER_ID: &str = "unknown-cluster";

/// Controller-level configuration
///
/// All settings have defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identifier of this cluster, sent to the remote system as a correlation key
    pub cluster_id: String,
    /// Namespace the controller is released into, also the cluster-wide
    /// fallback location of the remote credentials secret
    pub release_namespace: String,
    /// Namespace holding per-namespace override credentials (`<ns>-<secret name>`)
    pub management_namespace: String,
    /// Well-known name of the remote credentials secret
    pub credentials_secret_name: String,
    /// Fixed requeue while a remote operation is pending (seconds)
    pub poll_interval_secs: u64,
    /// Requeue while waiting on a dependency or a stale binding (seconds)
    pub long_poll_interval_secs: u64,
    /// Exponential backoff starting value (seconds)
    pub backoff_start_secs: u64,
    /// Exponential backoff maximum value (seconds)
    pub backoff_max_secs: u64,
    /// Re-read-and-retry attempts after a write conflict
    pub conflict_retries: u32,
    /// Watch stream restart delay after unknown errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Maximum concurrent reconciliations per controller
    pub max_concurrent_reconciliations: usize,
    /// HTTP server port for metrics and probes
    pub metrics_port: u16,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            cluster_id: UNKNOWN_CLUSTER_ID.to_string(),
            release_namespace: DEFAULT_RELEASE_NAMESPACE.to_string(),
            management_namespace: DEFAULT_RELEASE_NAMESPACE.to_string(),
            credentials_secret_name: DEFAULT_CREDENTIALS_SECRET_NAME.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            long_poll_interval_secs: DEFAULT_LONG_POLL_INTERVAL_SECS,
            backoff_start_secs: DEFAULT_BACKOFF_START_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            max_concurrent_reconciliations: 10,
            metrics_port: DEFAULT_METRICS_PORT,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        let cluster_id = match std::env::var("CLUSTER_ID") {
            Ok(id) if !id.trim().is_empty() => id,
            _ => UNKNOWN_CLUSTER_ID.to_string(),
        };
        let release_namespace = std::env::var("RELEASE_NAMESPACE")
            .or_else(|_| std::env::var("POD_NAMESPACE"))
            .unwrap_or_else(|_| DEFAULT_RELEASE_NAMESPACE.to_string());
        Self {
            cluster_id,
            management_namespace: env_var_or_default_str(
                "MANAGEMENT_NAMESPACE",
                &release_namespace,
            ),
            release_namespace,
            credentials_secret_name: env_var_or_default_str(
                "CREDENTIALS_SECRET_NAME",
                DEFAULT_CREDENTIALS_SECRET_NAME,
            ),
            poll_interval_secs: env_var_or_default(
                "POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            ),
            long_poll_interval_secs: env_var_or_default(
                "LONG_POLL_INTERVAL_SECS",
                DEFAULT_LONG_POLL_INTERVAL_SECS,
            ),
            backoff_start_secs: env_var_or_default(
                "BACKOFF_START_SECS",
                DEFAULT_BACKOFF_START_SECS,
            ),
            backoff_max_secs: env_var_or_default("BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS),
            conflict_retries: env_var_or_default("CONFLICT_RETRIES", DEFAULT_CONFLICT_RETRIES),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                10,
            ),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
        }
    }

    /// Log settings that fell back to a risky default
    pub fn warn_on_defaults(&self) {
        if self.cluster_id == UNKNOWN_CLUSTER_ID {
            warn!(
                "CLUSTER_ID is not set, using '{}': remote objects from different clusters may collide",
                self.cluster_id
            );
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn long_poll_interval(&self) -> Duration {
        Duration::from_secs(self.long_poll_interval_secs)
    }

    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
