//! Per-pod injection state machine

use super::decision::{classify, decide, FailureClass, InjectionDecision, SkipReason};
use super::{Action, Event, ExecutionReport, InjectionJob, RetryPolicy};
use crate::crd::MonitoringConfig;
use crate::models::{ConfigKey, ExecutionRequest, PodKey, PodObservation};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a pod is currently out of scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotApplicableReason {
    NotSelected,
    Terminated,
    /// Injection failed in a way only a config change can fix.
    PermanentFailure { config: ConfigKey, generation: i64 },
}

/// Injection state of one pod identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodState {
    Unknown,
    PendingInjection,
    Injected,
    NotApplicable(NotApplicableReason),
}

#[derive(Debug)]
struct PodRecord {
    uid: String,
    last_sequence: u64,
    observation: PodObservation,
    state: PodState,
    in_flight: bool,
    attempts: u32,
    /// Consecutive failed attempts, drives the backoff.
    failures: u32,
    transient_retries: u32,
    retry_at: Option<Instant>,
}

impl PodRecord {
    fn new(observation: PodObservation) -> Self {
        Self {
            uid: observation.uid.clone(),
            last_sequence: observation.sequence,
            observation,
            state: PodState::Unknown,
            in_flight: false,
            attempts: 0,
            failures: 0,
            transient_retries: 0,
            retry_at: None,
        }
    }

    fn reset_failures(&mut self) {
        self.failures = 0;
        self.transient_retries = 0;
        self.retry_at = None;
    }
}

/// Correlates config and pod events into injection actions.
///
/// Owns all per-pod state; it is driven by one event at a time and never
/// performs I/O itself. Side effects come back as [`Action`]s.
#[derive(Debug)]
pub struct Correlator {
    configs: BTreeMap<ConfigKey, Arc<MonitoringConfig>>,
    pods: HashMap<PodKey, PodRecord>,
    retry: RetryPolicy,
    mark_injected: bool,
    stale_observations: u64,
}

impl Correlator {
    pub fn new(retry: RetryPolicy, mark_injected: bool) -> Self {
        Self {
            configs: BTreeMap::new(),
            pods: HashMap::new(),
            retry,
            mark_injected,
            stale_observations: 0,
        }
    }

    /// Process one event and return the side effects it requires.
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Action> {
        match event {
            Event::ConfigApplied(config) => {
                if !config.is_actionable() {
                    warn!(
                        config = %config.key(),
                        "MonitoringConfig has an empty selector or command and selects nothing"
                    );
                }
                self.configs.insert(config.key(), Arc::new(config));
                self.evaluate_all(now)
            }
            Event::ConfigDeleted(key) => {
                self.configs.remove(&key);
                self.evaluate_all(now)
            }
            Event::ConfigsRestarted(configs) => {
                self.configs = configs
                    .into_iter()
                    .map(|c| (c.key(), Arc::new(c)))
                    .collect();
                self.evaluate_all(now)
            }
            Event::PodObserved(observation) => self.observe(observation, now),
            Event::PodDeleted { key, uid } => {
                if let Entry::Occupied(entry) = self.pods.entry(key) {
                    if uid.is_empty() || entry.get().uid == uid {
                        debug!(pod = %entry.key(), "Forgetting deleted pod");
                        entry.remove();
                    }
                }
                Vec::new()
            }
            Event::ExecutionFinished(report) => self.finish(report, now),
            Event::RetryDue { key, uid } => {
                let due = self
                    .pods
                    .get(&key)
                    .map(|r| r.uid == uid && !r.in_flight && r.state == PodState::PendingInjection)
                    .unwrap_or(false);
                if due {
                    self.evaluate(&key, now)
                } else {
                    Vec::new()
                }
            }
        }
    }

    pub fn state(&self, key: &PodKey) -> Option<&PodState> {
        self.pods.get(key).map(|r| &r.state)
    }

    pub fn is_in_flight(&self, key: &PodKey) -> bool {
        self.pods.get(key).map(|r| r.in_flight).unwrap_or(false)
    }

    /// Injection attempts dispatched for a pod identity so far.
    pub fn attempts(&self, key: &PodKey) -> u32 {
        self.pods.get(key).map(|r| r.attempts).unwrap_or(0)
    }

    pub fn tracked_pods(&self) -> usize {
        self.pods.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.pods.values().filter(|r| r.in_flight).count()
    }

    pub fn stale_observations(&self) -> u64 {
        self.stale_observations
    }

    fn observe(&mut self, observation: PodObservation, now: Instant) -> Vec<Action> {
        let key = observation.key.clone();

        match self.pods.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if observation.sequence <= record.last_sequence {
                    debug!(
                        pod = %key,
                        sequence = observation.sequence,
                        last_sequence = record.last_sequence,
                        "Discarding stale pod observation"
                    );
                    self.stale_observations += 1;
                    return Vec::new();
                }
                if record.uid != observation.uid {
                    debug!(pod = %key, uid = %observation.uid, "Pod was recreated, starting fresh");
                    *record = PodRecord::new(observation);
                } else {
                    record.last_sequence = observation.sequence;
                    record.observation = observation;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PodRecord::new(observation));
            }
        }

        self.evaluate(&key, now)
    }

    fn evaluate_all(&mut self, now: Instant) -> Vec<Action> {
        let keys: Vec<PodKey> = self.pods.keys().cloned().collect();
        keys.iter().flat_map(|key| self.evaluate(key, now)).collect()
    }

    fn evaluate(&mut self, key: &PodKey, now: Instant) -> Vec<Action> {
        let Some(record) = self.pods.get_mut(key) else {
            return Vec::new();
        };
        if record.state == PodState::Injected {
            return Vec::new();
        }

        match decide(&record.observation, &self.configs) {
            InjectionDecision::Skip(SkipReason::AlreadyPresent) => {
                debug!(pod = %key, "Agent already present");
                record.state = PodState::Injected;
                record.reset_failures();
                Vec::new()
            }
            InjectionDecision::Skip(SkipReason::NotReady) => {
                if matches!(
                    record.state,
                    PodState::NotApplicable(
                        NotApplicableReason::NotSelected | NotApplicableReason::Terminated
                    )
                ) && !record.in_flight
                {
                    record.state = PodState::Unknown;
                }
                debug!(pod = %key, "Target container not ready yet");
                Vec::new()
            }
            InjectionDecision::Skip(reason) => {
                let reason = match reason {
                    SkipReason::Terminated => NotApplicableReason::Terminated,
                    _ => NotApplicableReason::NotSelected,
                };
                if !matches!(
                    record.state,
                    PodState::NotApplicable(NotApplicableReason::PermanentFailure { .. })
                ) || reason == NotApplicableReason::Terminated
                {
                    debug!(pod = %key, reason = ?reason, "Pod not applicable");
                    record.state = PodState::NotApplicable(reason);
                    record.reset_failures();
                }
                Vec::new()
            }
            InjectionDecision::Inject { config, container } => {
                if record.in_flight {
                    debug!(pod = %key, "Injection already in flight, suppressing trigger");
                    return Vec::new();
                }
                if let PodState::NotApplicable(NotApplicableReason::PermanentFailure {
                    config: failed,
                    generation,
                }) = &record.state
                {
                    if *failed == config.key() && *generation == config.generation() {
                        return Vec::new();
                    }
                    record.reset_failures();
                }

                record.state = PodState::PendingInjection;
                if record.retry_at.map(|at| now < at).unwrap_or(false) {
                    debug!(pod = %key, "Backing off before next injection attempt");
                    return Vec::new();
                }

                record.in_flight = true;
                record.attempts += 1;

                let namespace = &record.observation.key.namespace;
                let pod_name = &record.observation.key.name;
                let mut request = ExecutionRequest::new(
                    namespace.clone(),
                    pod_name.clone(),
                    container.clone(),
                    config.render_command(namespace, pod_name, &container),
                );
                request.stdin = config.render_stdin(namespace, pod_name, &container);

                vec![Action::Execute(InjectionJob {
                    key: key.clone(),
                    uid: record.uid.clone(),
                    config,
                    attempt: record.attempts,
                    request,
                })]
            }
        }
    }

    fn finish(&mut self, report: ExecutionReport, now: Instant) -> Vec<Action> {
        let Some(record) = self.pods.get_mut(&report.key) else {
            debug!(pod = %report.key, "Execution finished for a pod no longer tracked");
            return Vec::new();
        };
        if record.uid != report.uid {
            return Vec::new();
        }
        record.in_flight = false;

        let mark = |record: &mut PodRecord| {
            record.state = PodState::Injected;
            record.reset_failures();
        };
        let marker_action = Action::MarkInjected {
            key: report.key.clone(),
            config_name: report.config.key().name,
        };

        let error = match report.result {
            Ok(()) => {
                mark(record);
                return if self.mark_injected { vec![marker_action] } else { Vec::new() };
            }
            Err(error) => error,
        };

        let class = classify(&error, &report.config);
        let wanted = record.state == PodState::PendingInjection;

        match class {
            FailureClass::AlreadyPresent => {
                info!(pod = %report.key, "Agent reported as already installed");
                mark(record);
                if self.mark_injected {
                    vec![marker_action]
                } else {
                    Vec::new()
                }
            }
            FailureClass::Permanent => {
                warn!(pod = %report.key, error = %error, "Injection failed permanently");
                record.state = PodState::NotApplicable(NotApplicableReason::PermanentFailure {
                    config: report.config.key(),
                    generation: report.config.generation(),
                });
                record.retry_at = None;
                Vec::new()
            }
            FailureClass::Transient | FailureClass::Retryable if wanted => {
                record.failures += 1;
                let delay = self.retry.backoff(record.failures);
                record.retry_at = Some(now + delay);

                if class == FailureClass::Transient
                    && record.transient_retries < self.retry.max_transient_retries
                {
                    record.transient_retries += 1;
                    vec![Action::ScheduleRetry {
                        key: report.key,
                        uid: report.uid,
                        delay,
                    }]
                } else {
                    Vec::new()
                }
            }
            FailureClass::Transient | FailureClass::Retryable => Vec::new(),
        }
    }
}
