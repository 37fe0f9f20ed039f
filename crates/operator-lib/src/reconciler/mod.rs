//! Reconciliation of monitoring configs against observed pods
//!
//! Config and pod events are funneled through one queue into the
//! [`Correlator`], which keeps a small state machine per pod identity and
//! decides when an agent has to be injected. [`ReconcileLoop`] owns that
//! queue, runs executions on a bounded worker pool and feeds their outcome
//! back in as events.

mod decision;
mod runner;
mod state;

#[cfg(test)]
mod tests;

pub use decision::{classify, decide, select_config, FailureClass, InjectionDecision, SkipReason};
pub use runner::ReconcileLoop;
pub use state::{Correlator, NotApplicableReason, PodState};

use crate::crd::MonitoringConfig;
use crate::error::ExecError;
use crate::models::{ConfigKey, ExecutionRequest, PodKey, PodObservation};
use std::sync::Arc;
use std::time::Duration;

/// Backoff applied between failed injection attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failure (default: 5 seconds)
    pub initial_backoff: Duration,
    /// Upper bound for the delay (default: 5 minutes)
    pub max_backoff: Duration,
    /// Automatic retries scheduled after transport failures before
    /// waiting for the next observation (default: 5)
    pub max_transient_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            max_transient_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after `failures` consecutive failures, doubling each time.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        std::cmp::min(
            self.initial_backoff.saturating_mul(1u32 << exponent),
            self.max_backoff,
        )
    }
}

/// Configuration for the reconcile loop
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Executions allowed to run at the same time across all pods
    pub max_concurrent_executions: usize,
    /// Capacity of the event queue
    pub event_queue_size: usize,
    /// How long shutdown waits for in-flight executions
    pub shutdown_grace: Duration,
    /// Annotate pods after a successful injection
    pub mark_injected_pods: bool,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 8,
            event_queue_size: 1024,
            shutdown_grace: Duration::from_secs(30),
            mark_injected_pods: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Input to the correlator
#[derive(Debug)]
pub enum Event {
    ConfigApplied(MonitoringConfig),
    ConfigDeleted(ConfigKey),
    /// Full relist of configs after a watch restart
    ConfigsRestarted(Vec<MonitoringConfig>),
    PodObserved(PodObservation),
    PodDeleted { key: PodKey, uid: String },
    ExecutionFinished(ExecutionReport),
    RetryDue { key: PodKey, uid: String },
}

impl Event {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ConfigApplied(_) => "config_applied",
            Event::ConfigDeleted(_) => "config_deleted",
            Event::ConfigsRestarted(_) => "configs_restarted",
            Event::PodObserved(_) => "pod_observed",
            Event::PodDeleted { .. } => "pod_deleted",
            Event::ExecutionFinished(_) => "execution_finished",
            Event::RetryDue { .. } => "retry_due",
        }
    }
}

/// Outcome of one execution, reported back to the correlator
#[derive(Debug)]
pub struct ExecutionReport {
    pub key: PodKey,
    pub uid: String,
    pub config: Arc<MonitoringConfig>,
    pub attempt: u32,
    pub elapsed: Duration,
    pub result: Result<(), ExecError>,
}

/// One injection attempt handed to a worker
#[derive(Debug, Clone)]
pub struct InjectionJob {
    pub key: PodKey,
    pub uid: String,
    pub config: Arc<MonitoringConfig>,
    pub attempt: u32,
    pub request: ExecutionRequest,
}

/// Side effects requested by the correlator
#[derive(Debug, Clone)]
pub enum Action {
    Execute(InjectionJob),
    ScheduleRetry {
        key: PodKey,
        uid: String,
        delay: Duration,
    },
    MarkInjected {
        key: PodKey,
        config_name: String,
    },
}
