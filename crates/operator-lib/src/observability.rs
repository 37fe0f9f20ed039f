//! Observability infrastructure for the injection operator
//!
//! Provides:
//! - Prometheus metrics (execution latency, injection outcomes, tracked pods, queue events)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for remote execution latency (in seconds)
const EXEC_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<InjectorMetricsInner> = OnceLock::new();

struct InjectorMetricsInner {
    exec_latency_seconds: Histogram,
    injections_total: IntCounterVec,
    events_total: IntCounterVec,
    stale_observations_total: IntCounter,
    pods_tracked: IntGauge,
    executions_in_flight: IntGauge,
}

impl InjectorMetricsInner {
    fn new() -> Self {
        Self {
            exec_latency_seconds: register_histogram!(
                "agent_injector_exec_latency_seconds",
                "Time spent running injection commands inside containers",
                EXEC_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register exec_latency_seconds"),

            injections_total: register_int_counter_vec!(
                "agent_injector_injections_total",
                "Injection attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register injections_total"),

            events_total: register_int_counter_vec!(
                "agent_injector_events_total",
                "Events processed by the reconciler by kind",
                &["kind"]
            )
            .expect("Failed to register events_total"),

            stale_observations_total: register_int_counter!(
                "agent_injector_stale_observations_total",
                "Pod observations discarded because a newer one was already processed"
            )
            .expect("Failed to register stale_observations_total"),

            pods_tracked: register_int_gauge!(
                "agent_injector_pods_tracked",
                "Number of pod identities currently tracked"
            )
            .expect("Failed to register pods_tracked"),

            executions_in_flight: register_int_gauge!(
                "agent_injector_executions_in_flight",
                "Number of injection commands currently running"
            )
            .expect("Failed to register executions_in_flight"),
        }
    }
}

/// Handle to the process-wide injector metrics.
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct InjectorMetrics {
    _private: (),
}

impl Default for InjectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InjectorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(InjectorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &InjectorMetricsInner {
        GLOBAL_METRICS.get_or_init(InjectorMetricsInner::new)
    }

    pub fn observe_exec_latency(&self, duration_secs: f64) {
        self.inner().exec_latency_seconds.observe(duration_secs);
    }

    /// Count an injection attempt outcome (`succeeded`, `already_present`,
    /// `transient`, `permanent` or `retryable`)
    pub fn inc_injection(&self, outcome: &str) {
        self.inner()
            .injections_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_event(&self, kind: &str) {
        self.inner().events_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_stale_observations(&self) {
        self.inner().stale_observations_total.inc();
    }

    pub fn set_pods_tracked(&self, count: i64) {
        self.inner().pods_tracked.set(count);
    }

    pub fn set_executions_in_flight(&self, count: i64) {
        self.inner().executions_in_flight.set(count);
    }
}

/// Structured logger for operator events
///
/// Emits consistent, event-tagged records for injections and lifecycle.
#[derive(Clone)]
pub struct StructuredLogger {
    scope: String,
}

impl StructuredLogger {
    /// `scope` is the watched namespace, or `*` for cluster-wide.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "operator_started",
            scope = %self.scope,
            operator_version = %version,
            rust_version = option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown"),
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            "Agent injector started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "operator_shutdown",
            scope = %self.scope,
            reason = %reason,
            "Agent injector shutting down"
        );
    }

    pub fn log_injection_started(&self, pod: &str, container: &str, config: &str, attempt: u32) {
        info!(
            event = "injection_started",
            scope = %self.scope,
            pod = %pod,
            container = %container,
            config = %config,
            attempt = attempt,
            "Injecting agent"
        );
    }

    pub fn log_injection_succeeded(&self, pod: &str, config: &str, elapsed_ms: u128) {
        info!(
            event = "injection_succeeded",
            scope = %self.scope,
            pod = %pod,
            config = %config,
            elapsed_ms = elapsed_ms,
            "Agent injected"
        );
    }

    pub fn log_injection_failed(&self, pod: &str, config: &str, kind: &str, error: &str) {
        warn!(
            event = "injection_failed",
            scope = %self.scope,
            pod = %pod,
            config = %config,
            error_kind = %kind,
            error = %error,
            "Agent injection failed"
        );
    }

    pub fn log_stale_observation(&self, pod: &str) {
        debug!(
            event = "stale_observation",
            scope = %self.scope,
            pod = %pod,
            "Out-of-order pod observation discarded"
        );
    }
}
