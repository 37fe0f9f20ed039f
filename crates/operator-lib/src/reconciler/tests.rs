//! Tests for the correlator state machine and the reconcile loop
//!
//! The correlator tests drive the state machine directly with synthetic
//! events. The loop tests run it against a mock executor.

use super::*;
use crate::crd::test_support::config;
use crate::models::{ContainerObservation, INJECTED_ANNOTATION};
use std::collections::BTreeMap;
use tokio::time::Instant;

fn observation(name: &str, sequence: u64, app: &str, ready: bool) -> PodObservation {
    PodObservation {
        key: PodKey::new("default", name),
        uid: format!("uid-{}", name),
        sequence,
        labels: BTreeMap::from([("app".to_string(), app.to_string())]),
        annotations: BTreeMap::new(),
        containers: vec![ContainerObservation {
            name: "main".to_string(),
            running: true,
            ready,
        }],
        terminating: false,
    }
}

fn correlator() -> Correlator {
    Correlator::new(
        RetryPolicy {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            max_transient_retries: 2,
        },
        true,
    )
}

fn executes(actions: &[Action]) -> Vec<&InjectionJob> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Execute(job) => Some(job),
            _ => None,
        })
        .collect()
}

fn finished(job: &InjectionJob, result: Result<(), ExecError>) -> Event {
    Event::ExecutionFinished(ExecutionReport {
        key: job.key.clone(),
        uid: job.uid.clone(),
        config: job.config.clone(),
        attempt: job.attempt,
        elapsed: Duration::from_millis(10),
        result,
    })
}

/// Correlator with config `agent` selecting `app=svc-a` and a ready pod
/// `svc-a-0`; returns the dispatched job.
fn dispatched(c: &mut Correlator, now: Instant) -> InjectionJob {
    c.handle(Event::ConfigApplied(config("default", "agent", &[("app", "svc-a")])), now);
    let actions = c.handle(Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)), now);
    let jobs = executes(&actions);
    assert_eq!(jobs.len(), 1);
    jobs[0].clone()
}

mod decision_tests {
    use super::*;

    fn configs(list: Vec<MonitoringConfig>) -> BTreeMap<ConfigKey, Arc<MonitoringConfig>> {
        list.into_iter().map(|c| (c.key(), Arc::new(c))).collect()
    }

    #[test]
    fn test_selected_ready_pod_is_injected() {
        let configs = configs(vec![config("default", "agent", &[("app", "svc-a")])]);
        let obs = observation("svc-a-0", 1, "svc-a", true);

        match decide(&obs, &configs) {
            InjectionDecision::Inject { config, container } => {
                assert_eq!(config.key().name, "agent");
                assert_eq!(container, "main");
            }
            other => panic!("expected inject, got {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_labels_are_not_selected() {
        let configs = configs(vec![config("default", "agent", &[("app", "svc-a")])]);
        let obs = observation("svc-b-0", 1, "svc-b", true);

        assert_eq!(decide(&obs, &configs).skip_reason(), Some(SkipReason::NotSelected));
    }

    #[test]
    fn test_not_ready_container() {
        let configs = configs(vec![config("default", "agent", &[("app", "svc-a")])]);
        let obs = observation("svc-a-0", 1, "svc-a", false);

        assert_eq!(decide(&obs, &configs).skip_reason(), Some(SkipReason::NotReady));
    }

    #[test]
    fn test_config_in_other_namespace_does_not_select() {
        let configs = configs(vec![config("other", "agent", &[("app", "svc-a")])]);
        let obs = observation("svc-a-0", 1, "svc-a", true);

        assert_eq!(decide(&obs, &configs).skip_reason(), Some(SkipReason::NotSelected));
    }

    #[test]
    fn test_no_matching_container_is_not_selected() {
        let mut cfg = config("default", "agent", &[("app", "svc-a")]);
        cfg.spec.container = "java-*".to_string();
        let configs = configs(vec![cfg]);
        let obs = observation("svc-a-0", 1, "svc-a", true);

        assert_eq!(decide(&obs, &configs).skip_reason(), Some(SkipReason::NotSelected));
    }

    #[test]
    fn test_smallest_config_name_wins() {
        let configs = configs(vec![
            config("default", "zeta", &[("app", "svc-a")]),
            config("default", "alpha", &[("app", "svc-a")]),
            config("default", "beta", &[("app", "svc-a")]),
        ]);
        let obs = observation("svc-a-0", 1, "svc-a", true);

        let selected = select_config(&configs, &obs).unwrap();
        assert_eq!(selected.key().name, "alpha");
    }

    #[test]
    fn test_annotated_pod_is_already_present() {
        let configs = configs(vec![config("default", "agent", &[("app", "svc-a")])]);
        let mut obs = observation("svc-a-0", 1, "svc-a", true);
        obs.annotations
            .insert(INJECTED_ANNOTATION.to_string(), "agent".to_string());

        assert_eq!(
            decide(&obs, &configs).skip_reason(),
            Some(SkipReason::AlreadyPresent)
        );
    }

    #[test]
    fn test_terminating_pod() {
        let configs = configs(vec![config("default", "agent", &[("app", "svc-a")])]);
        let mut obs = observation("svc-a-0", 1, "svc-a", true);
        obs.terminating = true;

        assert_eq!(decide(&obs, &configs).skip_reason(), Some(SkipReason::Terminated));
    }

    #[test]
    fn test_classify_failures() {
        let mut cfg = config("default", "agent", &[("app", "svc-a")]);
        cfg.spec.permanent_error_markers = vec!["no such file".to_string()];

        assert_eq!(classify(&ExecError::transport("reset"), &cfg), FailureClass::Transient);
        assert_eq!(
            classify(&ExecError::Timeout(Duration::from_secs(30)), &cfg),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&ExecError::Stderr("agent already installed".into()), &cfg),
            FailureClass::AlreadyPresent
        );
        assert_eq!(
            classify(&ExecError::Stderr("java: no such file".into()), &cfg),
            FailureClass::Permanent
        );
        assert_eq!(
            classify(&ExecError::Stderr("attach failed".into()), &cfg),
            FailureClass::Retryable
        );
        assert_eq!(
            classify(&ExecError::InvalidRequest("empty command".into()), &cfg),
            FailureClass::Permanent
        );
        assert_eq!(
            classify(&ExecError::NonZeroExit("exit status 1".into()), &cfg),
            FailureClass::Retryable
        );
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            max_transient_retries: 3,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(100), Duration::from_secs(10));
    }
}

mod correlator_tests {
    use super::*;

    #[test]
    fn test_inject_scenario_targets_main_container() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        assert_eq!(job.request.namespace, "default");
        assert_eq!(job.request.pod_name, "svc-a-0");
        assert_eq!(job.request.container, "main");
        assert_eq!(
            job.request.command,
            vec!["/bin/sh", "-c", "install-agent svc-a-0"]
        );
        assert_eq!(job.attempt, 1);

        let key = PodKey::new("default", "svc-a-0");
        assert_eq!(c.state(&key), Some(&PodState::PendingInjection));
        assert!(c.is_in_flight(&key));
    }

    #[test]
    fn test_not_selected_scenario_issues_nothing() {
        let mut c = correlator();
        let now = Instant::now();
        c.handle(Event::ConfigApplied(config("default", "agent", &[("app", "svc-a")])), now);

        let actions = c.handle(Event::PodObserved(observation("svc-b-0", 1, "svc-b", true)), now);

        assert!(actions.is_empty());
        assert_eq!(
            c.state(&PodKey::new("default", "svc-b-0")),
            Some(&PodState::NotApplicable(NotApplicableReason::NotSelected))
        );
    }

    #[test]
    fn test_injected_pod_is_never_executed_again() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        let actions = c.handle(finished(&job, Ok(())), now);
        assert!(matches!(
            actions.as_slice(),
            [Action::MarkInjected { config_name, .. }] if config_name == "agent"
        ));
        assert_eq!(c.state(&job.key), Some(&PodState::Injected));

        for seq in 2..5 {
            let actions =
                c.handle(Event::PodObserved(observation("svc-a-0", seq, "svc-a", true)), now);
            assert!(actions.is_empty());
        }
        c.handle(Event::ConfigApplied(config("default", "agent2", &[("app", "svc-a")])), now);
        assert_eq!(c.attempts(&job.key), 1);
        assert_eq!(c.state(&job.key), Some(&PodState::Injected));
    }

    #[test]
    fn test_out_of_order_observation_is_discarded() {
        let mut c = correlator();
        let now = Instant::now();
        c.handle(Event::ConfigApplied(config("default", "agent", &[("app", "svc-a")])), now);
        let key = PodKey::new("default", "svc-a-0");

        c.handle(Event::PodObserved(observation("svc-a-0", 1, "svc-a", false)), now);
        assert_eq!(c.state(&key), Some(&PodState::Unknown));

        c.handle(Event::PodObserved(observation("svc-a-0", 3, "svc-b", false)), now);
        let actions = c.handle(Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)), now);

        assert!(actions.is_empty());
        assert_eq!(c.stale_observations(), 1);
        assert_eq!(
            c.state(&key),
            Some(&PodState::NotApplicable(NotApplicableReason::NotSelected))
        );
    }

    #[test]
    fn test_overlapping_triggers_yield_single_execution() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        let second = c.handle(Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)), now);
        let third = c.handle(
            Event::ConfigApplied(config("default", "agent", &[("app", "svc-a")])),
            now,
        );

        assert!(executes(&second).is_empty());
        assert!(executes(&third).is_empty());
        assert_eq!(c.in_flight_count(), 1);
        assert_eq!(c.attempts(&job.key), 1);
    }

    #[test]
    fn test_already_installed_stderr_marks_injected() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        let actions = c.handle(
            finished(&job, Err(ExecError::Stderr("agent already installed".into()))),
            now,
        );

        assert!(actions
            .iter()
            .all(|a| matches!(a, Action::MarkInjected { .. })));
        assert_eq!(c.state(&job.key), Some(&PodState::Injected));
        assert!(!c.is_in_flight(&job.key));
    }

    #[test]
    fn test_transient_failure_schedules_retry() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        let actions = c.handle(finished(&job, Err(ExecError::transport("reset"))), now);
        let delay = match actions.as_slice() {
            [Action::ScheduleRetry { delay, .. }] => *delay,
            other => panic!("expected retry, got {:?}", other),
        };
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(c.state(&job.key), Some(&PodState::PendingInjection));

        // An observation during backoff does not bypass it
        let early = c.handle(Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)), now);
        assert!(early.is_empty());

        let later = now + delay;
        let retry = c.handle(
            Event::RetryDue {
                key: job.key.clone(),
                uid: job.uid.clone(),
            },
            later,
        );
        let jobs = executes(&retry);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 2);
    }

    #[test]
    fn test_transient_retries_are_bounded() {
        let mut c = correlator();
        let mut now = Instant::now();
        let mut job = dispatched(&mut c, now);

        let mut scheduled = 0;
        for _ in 0..4 {
            let actions = c.handle(finished(&job, Err(ExecError::transport("reset"))), now);
            if actions
                .iter()
                .any(|a| matches!(a, Action::ScheduleRetry { .. }))
            {
                scheduled += 1;
            }
            now += Duration::from_secs(120);
            let retry = c.handle(
                Event::PodObserved(observation("svc-a-0", job.attempt as u64 + 10, "svc-a", true)),
                now,
            );
            job = executes(&retry)[0].clone();
        }

        assert_eq!(scheduled, 2);
    }

    #[test]
    fn test_application_failure_waits_for_next_observation() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        let actions = c.handle(
            finished(&job, Err(ExecError::Stderr("attach failed".into()))),
            now,
        );
        assert!(actions.is_empty());
        assert_eq!(c.state(&job.key), Some(&PodState::PendingInjection));

        let early = c.handle(Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)), now);
        assert!(early.is_empty());

        let later = now + Duration::from_secs(6);
        let retry = c.handle(Event::PodObserved(observation("svc-a-0", 3, "svc-a", true)), later);
        assert_eq!(executes(&retry).len(), 1);
    }

    #[test]
    fn test_failed_exit_is_retried_not_injected() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        let actions = c.handle(
            finished(&job, Err(ExecError::NonZeroExit("exit status 1".into()))),
            now,
        );
        assert!(actions.is_empty());
        assert_eq!(c.state(&job.key), Some(&PodState::PendingInjection));

        let later = now + Duration::from_secs(6);
        let retry = c.handle(Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)), later);
        let jobs = executes(&retry);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 2);
    }

    #[test]
    fn test_permanent_failure_waits_for_config_change() {
        let mut c = correlator();
        let now = Instant::now();
        let mut cfg = config("default", "agent", &[("app", "svc-a")]);
        cfg.spec.permanent_error_markers = vec!["unsupported runtime".to_string()];
        c.handle(Event::ConfigApplied(cfg.clone()), now);
        let actions = c.handle(Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)), now);
        let job = executes(&actions)[0].clone();

        c.handle(
            finished(&job, Err(ExecError::Stderr("unsupported runtime".into()))),
            now,
        );
        assert!(matches!(
            c.state(&job.key),
            Some(PodState::NotApplicable(NotApplicableReason::PermanentFailure { generation: 1, .. }))
        ));

        let later = now + Duration::from_secs(600);
        let again = c.handle(Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)), later);
        assert!(again.is_empty());

        cfg.metadata.generation = Some(2);
        let updated = c.handle(Event::ConfigApplied(cfg), later);
        assert_eq!(executes(&updated).len(), 1);
    }

    #[test]
    fn test_selector_change_makes_pending_pod_not_applicable() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);
        c.handle(finished(&job, Err(ExecError::transport("reset"))), now);

        c.handle(
            Event::ConfigApplied(config("default", "agent", &[("app", "svc-z")])),
            now,
        );
        assert_eq!(
            c.state(&job.key),
            Some(&PodState::NotApplicable(NotApplicableReason::NotSelected))
        );

        let retry = c.handle(
            Event::RetryDue {
                key: job.key.clone(),
                uid: job.uid.clone(),
            },
            now + Duration::from_secs(60),
        );
        assert!(retry.is_empty());
    }

    #[test]
    fn test_not_ready_then_ready() {
        let mut c = correlator();
        let now = Instant::now();
        c.handle(Event::ConfigApplied(config("default", "agent", &[("app", "svc-a")])), now);

        let first = c.handle(Event::PodObserved(observation("svc-a-0", 1, "svc-a", false)), now);
        assert!(first.is_empty());

        let second = c.handle(Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)), now);
        assert_eq!(executes(&second).len(), 1);
    }

    #[test]
    fn test_recreated_pod_starts_fresh() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);
        c.handle(finished(&job, Ok(())), now);

        let mut recreated = observation("svc-a-0", 10, "svc-a", true);
        recreated.uid = "uid-new".to_string();
        let actions = c.handle(Event::PodObserved(recreated), now);

        let jobs = executes(&actions);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uid, "uid-new");
        assert_eq!(jobs[0].attempt, 1);
    }

    #[test]
    fn test_terminated_pod_is_not_applicable() {
        let mut c = correlator();
        let now = Instant::now();
        c.handle(Event::ConfigApplied(config("default", "agent", &[("app", "svc-a")])), now);

        let mut obs = observation("svc-a-0", 1, "svc-a", true);
        obs.terminating = true;
        assert!(c.handle(Event::PodObserved(obs), now).is_empty());
        assert_eq!(
            c.state(&PodKey::new("default", "svc-a-0")),
            Some(&PodState::NotApplicable(NotApplicableReason::Terminated))
        );
    }

    #[test]
    fn test_report_for_deleted_pod_is_ignored() {
        let mut c = correlator();
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        c.handle(
            Event::PodDeleted {
                key: job.key.clone(),
                uid: job.uid.clone(),
            },
            now,
        );
        assert_eq!(c.tracked_pods(), 0);

        assert!(c.handle(finished(&job, Ok(())), now).is_empty());
        assert_eq!(c.tracked_pods(), 0);
    }

    #[test]
    fn test_config_arriving_after_pod_triggers_injection() {
        let mut c = correlator();
        let now = Instant::now();
        assert!(c
            .handle(Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)), now)
            .is_empty());

        let actions = c.handle(
            Event::ConfigsRestarted(vec![config("default", "agent", &[("app", "svc-a")])]),
            now,
        );
        assert_eq!(executes(&actions).len(), 1);
    }

    #[test]
    fn test_no_marker_action_when_disabled() {
        let mut c = Correlator::new(RetryPolicy::default(), false);
        let now = Instant::now();
        let job = dispatched(&mut c, now);

        assert!(c.handle(finished(&job, Ok(())), now).is_empty());
        assert_eq!(c.state(&job.key), Some(&PodState::Injected));
    }
}

mod loop_tests {
    use super::*;
    use crate::cluster::InjectionMarker;
    use crate::exec::CommandExecutor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    type Responder = Box<dyn Fn(usize) -> Result<Vec<u8>, ExecError> + Send + Sync>;

    /// Mock executor recording calls and peak concurrency
    struct MockExecutor {
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        respond: Responder,
    }

    impl MockExecutor {
        fn new(delay: Duration, respond: Responder) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                respond,
            })
        }

        fn succeeding(delay: Duration) -> Arc<Self> {
            Self::new(delay, Box::new(|_| Ok(b"ok".to_vec())))
        }
    }

    #[async_trait]
    impl CommandExecutor for MockExecutor {
        async fn execute(&self, _request: ExecutionRequest) -> Result<Vec<u8>, ExecError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            (self.respond)(call)
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl CommandExecutor for PanickingExecutor {
        async fn execute(&self, _request: ExecutionRequest) -> Result<Vec<u8>, ExecError> {
            panic!("boom");
        }
    }

    #[derive(Default)]
    struct RecordingMarker {
        marked: Mutex<Vec<(PodKey, String)>>,
    }

    #[async_trait]
    impl InjectionMarker for RecordingMarker {
        async fn mark_injected(&self, pod: &PodKey, config_name: &str) -> anyhow::Result<()> {
            self.marked
                .lock()
                .unwrap()
                .push((pod.clone(), config_name.to_string()));
            Ok(())
        }
    }

    fn loop_config(max_concurrent: usize) -> ReconcilerConfig {
        ReconcilerConfig {
            max_concurrent_executions: max_concurrent,
            event_queue_size: 64,
            shutdown_grace: Duration::from_secs(2),
            mark_injected_pods: true,
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(20),
                max_backoff: Duration::from_millis(100),
                max_transient_retries: 3,
            },
        }
    }

    async fn run_for(
        reconcile: ReconcileLoop,
        events: Vec<Event>,
        settle: Duration,
    ) -> Correlator {
        let tx = reconcile.sender();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(reconcile.run(shutdown_rx));

        for event in events {
            tx.send(event).await.unwrap();
        }
        tokio::time::sleep(settle).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap()
    }

    fn config_event() -> Event {
        Event::ConfigApplied(config("default", "agent", &[("app", "svc-a")]))
    }

    #[tokio::test]
    async fn test_overlapping_observations_run_once() {
        let executor = MockExecutor::succeeding(Duration::from_millis(100));
        let marker = Arc::new(RecordingMarker::default());
        let reconcile = ReconcileLoop::new(loop_config(4), executor.clone())
            .with_marker(marker.clone());

        let correlator = run_for(
            reconcile,
            vec![
                config_event(),
                Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)),
                Event::PodObserved(observation("svc-a-0", 2, "svc-a", true)),
                Event::PodObserved(observation("svc-a-0", 3, "svc-a", true)),
            ],
            Duration::from_millis(300),
        )
        .await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
        let key = PodKey::new("default", "svc-a-0");
        assert_eq!(correlator.state(&key), Some(&PodState::Injected));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let marked = marker.marked.lock().unwrap();
        assert_eq!(marked.as_slice(), &[(key, "agent".to_string())]);
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let executor = MockExecutor::succeeding(Duration::from_millis(30));
        let reconcile = ReconcileLoop::new(loop_config(2), executor.clone());

        let mut events = vec![config_event()];
        for i in 0..6 {
            events.push(Event::PodObserved(observation(
                &format!("svc-a-{}", i),
                1,
                "svc-a",
                true,
            )));
        }

        let correlator = run_for(reconcile, events, Duration::from_millis(400)).await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 6);
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        for i in 0..6 {
            let key = PodKey::new("default", format!("svc-a-{}", i));
            assert_eq!(correlator.state(&key), Some(&PodState::Injected));
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_by_timer() {
        let executor = MockExecutor::new(
            Duration::from_millis(5),
            Box::new(|call| {
                if call == 0 {
                    Err(ExecError::transport("connection reset"))
                } else {
                    Ok(Vec::new())
                }
            }),
        );
        let reconcile = ReconcileLoop::new(loop_config(1), executor.clone());

        let correlator = run_for(
            reconcile,
            vec![
                config_event(),
                Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)),
            ],
            Duration::from_millis(300),
        )
        .await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            correlator.state(&PodKey::new("default", "svc-a-0")),
            Some(&PodState::Injected)
        );
    }

    #[tokio::test]
    async fn test_panicking_executor_does_not_stop_the_loop() {
        let reconcile = ReconcileLoop::new(loop_config(1), Arc::new(PanickingExecutor));
        let tx = reconcile.sender();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(reconcile.run(shutdown_rx));

        tx.send(config_event()).await.unwrap();
        tx.send(Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Loop still accepts events after the worker panicked
        tx.send(Event::PodObserved(observation("svc-b-0", 1, "svc-b", true)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        let correlator = handle.await.unwrap();

        let key = PodKey::new("default", "svc-a-0");
        assert!(!correlator.is_in_flight(&key));
        assert_eq!(correlator.state(&key), Some(&PodState::PendingInjection));
        assert_eq!(
            correlator.state(&PodKey::new("default", "svc-b-0")),
            Some(&PodState::NotApplicable(NotApplicableReason::NotSelected))
        );
    }

    fn injections(outcome: &str) -> f64 {
        prometheus::gather()
            .iter()
            .filter(|family| family.get_name() == "agent_injector_injections_total")
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "outcome" && label.get_value() == outcome)
            })
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }

    #[tokio::test]
    async fn test_already_installed_counted_as_already_present() {
        let executor = MockExecutor::new(
            Duration::from_millis(5),
            Box::new(|_| Err(ExecError::Stderr("agent already installed".into()))),
        );
        let reconcile = ReconcileLoop::new(loop_config(1), executor.clone());
        let before = injections("already_present");

        let correlator = run_for(
            reconcile,
            vec![
                config_event(),
                Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)),
            ],
            Duration::from_millis(100),
        )
        .await;

        assert_eq!(
            correlator.state(&PodKey::new("default", "svc-a-0")),
            Some(&PodState::Injected)
        );
        assert!(injections("already_present") >= before + 1.0);
        assert_eq!(injections("stderr"), 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_execution() {
        let executor = MockExecutor::succeeding(Duration::from_millis(150));
        let reconcile = ReconcileLoop::new(loop_config(1), executor.clone());

        let correlator = run_for(
            reconcile,
            vec![
                config_event(),
                Event::PodObserved(observation("svc-a-0", 1, "svc-a", true)),
            ],
            Duration::from_millis(30),
        )
        .await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            correlator.state(&PodKey::new("default", "svc-a-0")),
            Some(&PodState::Injected)
        );
    }
}
