//! Operator configuration

use anyhow::{Context, Result};
use operator_lib::reconciler::{ReconcilerConfig, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;

/// Operator configuration, read from `INJECTOR_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Namespace to watch; empty means cluster-wide
    #[serde(default = "default_watch_namespace")]
    pub watch_namespace: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Upper bound for one remote execution in seconds
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    /// How long shutdown waits for running injections
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Annotate pods after a successful injection
    #[serde(default = "default_mark_injected_pods")]
    pub mark_injected_pods: bool,

    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
}

fn default_watch_namespace() -> String {
    std::env::var("OPERATOR_NAMESPACE").unwrap_or_default()
}

fn default_api_port() -> u16 {
    8080
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_max_concurrent_executions() -> usize {
    8
}

fn default_retry_initial_backoff() -> u64 {
    5_000
}

fn default_retry_max_backoff() -> u64 {
    300_000
}

fn default_max_transient_retries() -> u32 {
    5
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_mark_injected_pods() -> bool {
    true
}

fn default_event_queue_size() -> usize {
    1024
}

impl OperatorConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(None)
    }

    /// Load from an explicit variable map instead of the process environment.
    pub fn from_source(source: Option<::config::Map<String, String>>) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix("INJECTOR")
                    .try_parsing(true)
                    .source(source),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("Invalid INJECTOR_* configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.exec_timeout_secs > 0, "exec_timeout_secs must be positive");
        anyhow::ensure!(
            self.max_concurrent_executions > 0,
            "max_concurrent_executions must be positive"
        );
        anyhow::ensure!(
            self.retry_initial_backoff_ms <= self.retry_max_backoff_ms,
            "retry_initial_backoff_ms must not exceed retry_max_backoff_ms"
        );
        Ok(())
    }

    /// Watched namespace, `None` for cluster-wide.
    pub fn namespace(&self) -> Option<&str> {
        Some(self.watch_namespace.trim()).filter(|ns| !ns.is_empty())
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_concurrent_executions: self.max_concurrent_executions,
            event_queue_size: self.event_queue_size,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            mark_injected_pods: self.mark_injected_pods,
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                max_transient_retries: self.max_transient_retries,
            },
        }
    }
}
