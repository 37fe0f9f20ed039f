//! Event loop driving the correlator
//!
//! Receives watch events and execution reports from one queue, applies
//! them to the [`Correlator`] and carries out the resulting actions.
//! Executions run on spawned workers bounded by a semaphore.

use super::decision::{classify, FailureClass};
use super::state::Correlator;
use super::{Action, Event, ExecutionReport, InjectionJob, ReconcilerConfig};
use crate::cluster::InjectionMarker;
use crate::error::ExecError;
use crate::exec::CommandExecutor;
use crate::health::{components, HealthRegistry};
use crate::observability::{InjectorMetrics, StructuredLogger};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Owns the event queue and the correlator state
pub struct ReconcileLoop {
    correlator: Correlator,
    executor: Arc<dyn CommandExecutor>,
    marker: Option<Arc<dyn InjectionMarker>>,
    config: ReconcilerConfig,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    permits: Arc<Semaphore>,
    workers: JoinSet<()>,
    health: HealthRegistry,
    metrics: InjectorMetrics,
    logger: StructuredLogger,
}

impl ReconcileLoop {
    pub fn new(config: ReconcilerConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_size.max(1));

        Self {
            correlator: Correlator::new(config.retry.clone(), config.mark_injected_pods),
            executor,
            marker: None,
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            config,
            events_tx,
            events_rx,
            workers: JoinSet::new(),
            health: HealthRegistry::new(),
            metrics: InjectorMetrics::new(),
            logger: StructuredLogger::new("*"),
        }
    }

    /// Where to record successful injections.
    pub fn with_marker(mut self, marker: Arc<dyn InjectionMarker>) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Sender for feeding events into the loop.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }

    /// Run until `shutdown` fires, then wait for in-flight executions.
    ///
    /// Returns the correlator so its final state can be inspected.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Correlator {
        info!(
            max_concurrent = self.config.max_concurrent_executions,
            "Starting reconcile loop"
        );
        self.health.set_healthy(components::RECONCILER).await;

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.dispatch(event).await;
                }
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Injection worker terminated abnormally");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconcile loop");
                    break;
                }
            }
        }

        self.drain().await;
        self.correlator
    }

    /// Let running executions finish within the grace period, recording
    /// their outcome, then abort whatever is left.
    async fn drain(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!(
            in_flight = self.workers.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Waiting for in-flight injections"
        );

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.workers.is_empty() {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    if let Event::ExecutionFinished(report) = event {
                        self.dispatch(Event::ExecutionFinished(report)).await;
                    }
                }
                Some(_) = self.workers.join_next() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = self.workers.len(), "Grace period elapsed, aborting injections");
                    self.workers.abort_all();
                    break;
                }
            }
        }

        while let Ok(event) = self.events_rx.try_recv() {
            if let Event::ExecutionFinished(report) = event {
                self.dispatch(Event::ExecutionFinished(report)).await;
            }
        }
    }

    async fn dispatch(&mut self, event: Event) {
        self.metrics.inc_event(event.kind());

        let observed = match &event {
            Event::PodObserved(obs) => Some(obs.key.clone()),
            _ => None,
        };
        if let Event::ExecutionFinished(report) = &event {
            self.record_outcome(report).await;
        }

        let stale_before = self.correlator.stale_observations();
        let actions = self.correlator.handle(event, Instant::now());
        if self.correlator.stale_observations() > stale_before {
            self.metrics.inc_stale_observations();
            if let Some(key) = observed {
                self.logger.log_stale_observation(&key.to_string());
            }
        }

        for action in actions {
            self.perform(action);
        }

        self.metrics
            .set_pods_tracked(self.correlator.tracked_pods() as i64);
        self.metrics
            .set_executions_in_flight(self.correlator.in_flight_count() as i64);
    }

    async fn record_outcome(&self, report: &ExecutionReport) {
        let pod = report.key.to_string();
        let config = report.config.key().name;
        self.metrics.observe_exec_latency(report.elapsed.as_secs_f64());

        let error = match &report.result {
            Ok(()) => {
                self.metrics.inc_injection("succeeded");
                self.logger
                    .log_injection_succeeded(&pod, &config, report.elapsed.as_millis());
                self.health.set_healthy(components::EXECUTOR).await;
                return;
            }
            Err(e) => e,
        };

        let class = classify(error, &report.config);
        self.metrics.inc_injection(class.label());
        match class {
            FailureClass::AlreadyPresent => {
                self.logger
                    .log_injection_succeeded(&pod, &config, report.elapsed.as_millis());
            }
            FailureClass::Transient => {
                self.logger
                    .log_injection_failed(&pod, &config, class.label(), &error.to_string());
                self.health
                    .set_degraded(components::EXECUTOR, error.to_string())
                    .await;
            }
            FailureClass::Permanent | FailureClass::Retryable => {
                self.logger
                    .log_injection_failed(&pod, &config, class.label(), &error.to_string());
            }
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Execute(job) => self.spawn_execution(job),
            Action::ScheduleRetry { key, uid, delay } => {
                debug!(pod = %key, delay_ms = delay.as_millis(), "Scheduling injection retry");
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::RetryDue { key, uid }).await;
                });
            }
            Action::MarkInjected { key, config_name } => {
                let Some(marker) = self.marker.clone() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(e) = marker.mark_injected(&key, &config_name).await {
                        warn!(pod = %key, error = %e, "Failed to mark pod as injected");
                    }
                });
            }
        }
    }

    fn spawn_execution(&mut self, job: InjectionJob) {
        self.logger.log_injection_started(
            &job.key.to_string(),
            &job.request.container,
            &job.config.key().name,
            job.attempt,
        );

        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let tx = self.events_tx.clone();

        self.workers.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let started = Instant::now();

            let result = AssertUnwindSafe(executor.execute(job.request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ExecError::transport("executor panicked")));

            let report = ExecutionReport {
                key: job.key,
                uid: job.uid,
                config: job.config,
                attempt: job.attempt,
                elapsed: started.elapsed(),
                result: result.map(|_| ()),
            };
            let _ = tx.send(Event::ExecutionFinished(report)).await;
        });
    }
}
