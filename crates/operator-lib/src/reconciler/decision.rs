//! Per-observation injection decisions and failure classification

use crate::crd::MonitoringConfig;
use crate::error::ExecError;
use crate::models::{ConfigKey, PodObservation};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Why no injection is needed for an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyPresent,
    NotSelected,
    NotReady,
    Terminated,
}

/// Result of evaluating one pod observation
#[derive(Debug, Clone)]
pub enum InjectionDecision {
    Inject {
        config: Arc<MonitoringConfig>,
        container: String,
    },
    Skip(SkipReason),
}

impl InjectionDecision {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            InjectionDecision::Skip(reason) => Some(*reason),
            InjectionDecision::Inject { .. } => None,
        }
    }
}

/// Pick the config that applies to a pod.
///
/// Only configs in the pod's namespace are considered. When several
/// select the pod, the lexicographically smallest name wins; the map is
/// ordered by (namespace, name) so that is the first match.
pub fn select_config<'a>(
    configs: &'a BTreeMap<ConfigKey, Arc<MonitoringConfig>>,
    observation: &PodObservation,
) -> Option<&'a Arc<MonitoringConfig>> {
    configs
        .iter()
        .filter(|(key, _)| key.namespace == observation.key.namespace)
        .map(|(_, config)| config)
        .find(|config| config.selects(&observation.labels))
}

/// Decide what to do with a pod given the known configs.
pub fn decide(
    observation: &PodObservation,
    configs: &BTreeMap<ConfigKey, Arc<MonitoringConfig>>,
) -> InjectionDecision {
    if observation.terminating {
        return InjectionDecision::Skip(SkipReason::Terminated);
    }
    if observation.injected_by().is_some() {
        return InjectionDecision::Skip(SkipReason::AlreadyPresent);
    }

    let Some(config) = select_config(configs, observation) else {
        return InjectionDecision::Skip(SkipReason::NotSelected);
    };

    let Some(container) = observation
        .containers
        .iter()
        .find(|c| config.matches_container(&c.name))
    else {
        return InjectionDecision::Skip(SkipReason::NotSelected);
    };

    if !(container.running && container.ready) {
        return InjectionDecision::Skip(SkipReason::NotReady);
    }

    InjectionDecision::Inject {
        config: Arc::clone(config),
        container: container.name.clone(),
    }
}

/// How a failed execution affects the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transport trouble; retry with backoff.
    Transient,
    /// The command reported the agent is already there.
    AlreadyPresent,
    /// Retrying cannot help until the config changes.
    Permanent,
    /// The command failed; retry on a later observation.
    Retryable,
}

impl FailureClass {
    /// Outcome label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::AlreadyPresent => "already_present",
            FailureClass::Permanent => "permanent",
            FailureClass::Retryable => "retryable",
        }
    }
}

/// Classify an execution error using the config's stderr markers.
pub fn classify(error: &ExecError, config: &MonitoringConfig) -> FailureClass {
    match error {
        ExecError::Transport(_) | ExecError::Timeout(_) => FailureClass::Transient,
        ExecError::InvalidRequest(_) => FailureClass::Permanent,
        ExecError::NonZeroExit(_) => FailureClass::Retryable,
        ExecError::Stderr(text) => {
            let contains = |markers: &[String]| {
                markers
                    .iter()
                    .any(|m| !m.is_empty() && text.contains(m.as_str()))
            };
            if contains(&config.spec.already_present_markers) {
                FailureClass::AlreadyPresent
            } else if contains(&config.spec.permanent_error_markers) {
                FailureClass::Permanent
            } else {
                FailureClass::Retryable
            }
        }
    }
}
