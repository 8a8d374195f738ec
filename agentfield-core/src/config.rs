//! Control plane configuration.
//!
//! Configuration is read from a TOML file and then overridden by environment
//! variables. Lookup order for the file:
//!
//! 1. An explicit path (the `--config` flag)
//! 2. `$AGENTFIELD_CONFIG_PATH`
//! 3. `./agentfield.toml`
//! 4. `./config/agentfield.toml`
//!
//! If none exists the defaults are used. Every section may be omitted from
//! the file; missing fields fall back to their defaults.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [execution_queue]
//! webhook_max_attempts = 5
//! webhook_retry_backoff_ms = 500
//!
//! [execution_cleanup]
//! retention_period_secs = 172800
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ControlPlaneError, Result};

/// Environment variable names for configuration overrides
/// Longest lease a node can be granted, one day.
pub const MAX_LEASE_SECONDS: u64 = 86_400;

pub const ENV_CONFIG_PATH: &str = "AGENTFIELD_CONFIG_PATH";
pub const ENV_HOST: &str = "AGENTFIELD_HOST";
pub const ENV_PORT: &str = "AGENTFIELD_PORT";
pub const ENV_LEASE_SECONDS: &str = "AGENTFIELD_LEASE_SECONDS";
pub const ENV_AGENT_CALL_TIMEOUT_SECS: &str = "AGENTFIELD_AGENT_CALL_TIMEOUT_SECS";
pub const ENV_WEBHOOK_TIMEOUT_SECS: &str = "AGENTFIELD_WEBHOOK_TIMEOUT_SECS";
pub const ENV_WEBHOOK_MAX_ATTEMPTS: &str = "AGENTFIELD_WEBHOOK_MAX_ATTEMPTS";
pub const ENV_WEBHOOK_RETRY_BACKOFF_MS: &str = "AGENTFIELD_WEBHOOK_RETRY_BACKOFF_MS";
pub const ENV_WEBHOOK_MAX_RETRY_BACKOFF_MS: &str = "AGENTFIELD_WEBHOOK_MAX_RETRY_BACKOFF_MS";
pub const ENV_CLEANUP_ENABLED: &str = "AGENTFIELD_CLEANUP_ENABLED";
pub const ENV_CLEANUP_RETENTION_SECS: &str = "AGENTFIELD_CLEANUP_RETENTION_SECS";
pub const ENV_MAX_WORKFLOW_DEPTH: &str = "AGENTFIELD_MAX_WORKFLOW_DEPTH";

/// Default config file names, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "agentfield.toml";
pub const FALLBACK_CONFIG_FILE: &str = "config/agentfield.toml";

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub server: ServerConfig,
    pub lease: LeaseConfig,
    pub execution_queue: ExecutionQueueConfig,
    pub execution_cleanup: ExecutionCleanupConfig,
    pub workflow: WorkflowConfig,
    pub event_bus: EventBusConfig,
    pub observability: ObservabilityConfig,
}

/// REST API server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Node lease configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease granted on registration and every renewal
    pub lease_seconds: u64,
    /// How often expired leases are swept
    pub sweep_interval_secs: u64,
    /// How long a node gets to acknowledge a shutdown request
    pub shutdown_ack_timeout_secs: u64,
    /// Grace period between a termination signal and the force kill
    pub signal_grace_secs: u64,
}

/// Execution and execution-webhook settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionQueueConfig {
    pub agent_call_timeout_secs: u64,
    pub webhook_timeout_secs: u64,
    pub webhook_max_attempts: u32,
    pub webhook_retry_backoff_ms: u64,
    pub webhook_max_retry_backoff_ms: u64,
    /// Concurrent async executions
    pub async_worker_count: usize,
    /// Pending async executions before requests are rejected
    pub async_queue_capacity: usize,
}

/// Execution garbage collection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionCleanupConfig {
    pub enabled: bool,
    pub retention_period_secs: u64,
    pub cleanup_interval_secs: u64,
    pub batch_size: usize,
    pub preserve_recent_duration_secs: u64,
    pub stale_execution_timeout_secs: u64,
}

/// Workflow tracking settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Deepest allowed step; the root step has depth 0
    pub max_depth: u32,
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventBusConfig {
    /// Queue capacity for best-effort (live stream) subscribers
    pub subscriber_capacity: usize,
}

/// Observability webhook forwarder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub http_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub worker_count: usize,
    /// Events buffered ahead of the batcher; further events are dropped
    pub queue_size: usize,
    /// In-flight deliveries allowed against a single destination URL
    pub per_destination_concurrency: usize,
    /// Bytes of a webhook response body that are read before discarding
    pub response_body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 30,
            sweep_interval_secs: 10,
            shutdown_ack_timeout_secs: 10,
            signal_grace_secs: 3,
        }
    }
}

impl Default for ExecutionQueueConfig {
    fn default() -> Self {
        Self {
            agent_call_timeout_secs: 300,
            webhook_timeout_secs: 10,
            webhook_max_attempts: 3,
            webhook_retry_backoff_ms: 1_000,
            webhook_max_retry_backoff_ms: 30_000,
            async_worker_count: 8,
            async_queue_capacity: 1_000,
        }
    }
}

impl Default for ExecutionCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_period_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
            batch_size: 100,
            preserve_recent_duration_secs: 60 * 60,
            stale_execution_timeout_secs: 30 * 60,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 100,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout_ms: 1_000,
            http_timeout_secs: 10,
            max_attempts: 3,
            retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 30_000,
            worker_count: 2,
            queue_size: 1_000,
            per_destination_concurrency: 4,
            response_body_limit: 16 * 1024,
        }
    }
}

impl LeaseConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_ack_timeout_secs)
    }

    pub fn signal_grace(&self) -> Duration {
        Duration::from_secs(self.signal_grace_secs)
    }
}

impl ExecutionQueueConfig {
    pub fn agent_call_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_call_timeout_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn webhook_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.webhook_retry_backoff_ms)
    }

    pub fn webhook_max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.webhook_max_retry_backoff_ms)
    }
}

impl ExecutionCleanupConfig {
    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn preserve_recent_duration(&self) -> Duration {
        Duration::from_secs(self.preserve_recent_duration_secs)
    }

    pub fn stale_execution_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_execution_timeout_secs)
    }
}

impl ObservabilityConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }
}

impl ControlPlaneConfig {
    /// Load configuration, searching the default locations when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read, parsed or
    /// validated, or if an environment override holds an invalid value.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::discover_path(),
        };

        match resolved {
            Some(p) => Self::load_from_path(&p),
            None => {
                debug!("No configuration file found, using defaults");
                let mut config = Self::default();
                config.merge_env_vars()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            ControlPlaneError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text without applying overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ControlPlaneError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Serialize to pretty TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ControlPlaneError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Write the configuration atomically (temp file, then rename)
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ControlPlaneError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = self.to_toml_string()?;
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, content)
            .map_err(|e| ControlPlaneError::config(format!("Failed to write config file: {}", e)))?;
        std::fs::rename(&temp_path, path)
            .map_err(|e| ControlPlaneError::config(format!("Failed to rename config file: {}", e)))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    fn discover_path() -> Option<PathBuf> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            return Some(PathBuf::from(p));
        }

        [DEFAULT_CONFIG_FILE, FALLBACK_CONFIG_FILE]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Merge environment variable overrides into the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, used by `merge_env_vars`.
    pub fn merge_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            debug!("Overriding server host from environment: {}", host);
            self.server.host = host;
        }
        if let Some(v) = lookup(ENV_PORT) {
            self.server.port = parse_env(ENV_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_LEASE_SECONDS) {
            self.lease.lease_seconds = parse_env(ENV_LEASE_SECONDS, &v)?;
        }
        if let Some(v) = lookup(ENV_AGENT_CALL_TIMEOUT_SECS) {
            self.execution_queue.agent_call_timeout_secs =
                parse_env(ENV_AGENT_CALL_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_WEBHOOK_TIMEOUT_SECS) {
            self.execution_queue.webhook_timeout_secs = parse_env(ENV_WEBHOOK_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_WEBHOOK_MAX_ATTEMPTS) {
            self.execution_queue.webhook_max_attempts = parse_env(ENV_WEBHOOK_MAX_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(ENV_WEBHOOK_RETRY_BACKOFF_MS) {
            self.execution_queue.webhook_retry_backoff_ms =
                parse_env(ENV_WEBHOOK_RETRY_BACKOFF_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_WEBHOOK_MAX_RETRY_BACKOFF_MS) {
            self.execution_queue.webhook_max_retry_backoff_ms =
                parse_env(ENV_WEBHOOK_MAX_RETRY_BACKOFF_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_CLEANUP_ENABLED) {
            self.execution_cleanup.enabled = parse_env(ENV_CLEANUP_ENABLED, &v)?;
        }
        if let Some(v) = lookup(ENV_CLEANUP_RETENTION_SECS) {
            self.execution_cleanup.retention_period_secs =
                parse_env(ENV_CLEANUP_RETENTION_SECS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_WORKFLOW_DEPTH) {
            self.workflow.max_depth = parse_env(ENV_MAX_WORKFLOW_DEPTH, &v)?;
        }

        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid
    pub fn validate(&self) -> Result<()> {
        if self.lease.lease_seconds == 0 {
            return Err(ControlPlaneError::config("lease.lease_seconds must be positive"));
        }
        if self.lease.lease_seconds > MAX_LEASE_SECONDS {
            return Err(ControlPlaneError::config(format!(
                "lease.lease_seconds must not exceed {}",
                MAX_LEASE_SECONDS
            )));
        }
        if self.execution_queue.agent_call_timeout_secs == 0 {
            return Err(ControlPlaneError::config(
                "execution_queue.agent_call_timeout_secs must be positive",
            ));
        }
        if self.execution_queue.webhook_timeout_secs == 0 {
            return Err(ControlPlaneError::config(
                "execution_queue.webhook_timeout_secs must be positive",
            ));
        }
        if self.execution_queue.webhook_max_attempts == 0 {
            return Err(ControlPlaneError::config(
                "execution_queue.webhook_max_attempts must be at least 1",
            ));
        }
        if self.execution_queue.webhook_max_retry_backoff_ms
            < self.execution_queue.webhook_retry_backoff_ms
        {
            return Err(ControlPlaneError::config(
                "execution_queue.webhook_max_retry_backoff_ms must not be below webhook_retry_backoff_ms",
            ));
        }
        if self.execution_queue.async_worker_count == 0 {
            return Err(ControlPlaneError::config(
                "execution_queue.async_worker_count must be at least 1",
            ));
        }

        let cleanup = &self.execution_cleanup;
        if cleanup.batch_size == 0 {
            return Err(ControlPlaneError::config("execution_cleanup.batch_size must be at least 1"));
        }
        if cleanup.enabled && cleanup.cleanup_interval_secs == 0 {
            return Err(ControlPlaneError::config(
                "execution_cleanup.cleanup_interval_secs must be positive",
            ));
        }
        if cleanup.preserve_recent_duration_secs > cleanup.retention_period_secs {
            return Err(ControlPlaneError::config(format!(
                "execution_cleanup.preserve_recent_duration_secs ({}) exceeds retention_period_secs ({})",
                cleanup.preserve_recent_duration_secs, cleanup.retention_period_secs
            )));
        }

        if self.event_bus.subscriber_capacity == 0 {
            return Err(ControlPlaneError::config("event_bus.subscriber_capacity must be at least 1"));
        }

        let obs = &self.observability;
        if obs.batch_size == 0 || obs.worker_count == 0 || obs.max_attempts == 0 {
            return Err(ControlPlaneError::config(
                "observability.batch_size, worker_count and max_attempts must be at least 1",
            ));
        }
        if obs.queue_size == 0 {
            return Err(ControlPlaneError::config("observability.queue_size must be at least 1"));
        }
        if obs.per_destination_concurrency == 0 {
            return Err(ControlPlaneError::config(
                "observability.per_destination_concurrency must be at least 1",
            ));
        }
        if obs.max_retry_backoff_ms < obs.retry_backoff_ms {
            return Err(ControlPlaneError::config(
                "observability.max_retry_backoff_ms must not be below retry_backoff_ms",
            ));
        }

        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    debug!("Overriding {} from environment", key);
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ControlPlaneError::config(format!("Invalid value for {}: {}", key, e)))
}
