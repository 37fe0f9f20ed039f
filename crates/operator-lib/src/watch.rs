//! Bridges Kubernetes watch streams into reconciler events
//!
//! One task per watched kind. Watch errors are retried by the runtime's
//! backoff and only reflected in component health; the reconciler never
//! sees them.

use crate::cluster::ClusterClient;
use crate::crd::MonitoringConfig;
use crate::health::{components, HealthRegistry};
use crate::models::{PodKey, PodObservation};
use crate::reconciler::Event;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Translates config watch events.
pub fn config_events(event: watcher::Event<MonitoringConfig>) -> Vec<Event> {
    match event {
        watcher::Event::Applied(config) => vec![Event::ConfigApplied(config)],
        watcher::Event::Deleted(config) => vec![Event::ConfigDeleted(config.key())],
        watcher::Event::Restarted(configs) => vec![Event::ConfigsRestarted(configs)],
    }
}

/// Translates pod watch events, remembering which pods it has reported.
///
/// After a relist, pods that were known before but are missing from the
/// new list are reported as deleted.
#[derive(Debug, Default)]
pub struct PodEventMapper {
    known: HashMap<PodKey, String>,
    /// Fallback sequence for pods without a numeric resourceVersion
    counter: u64,
}

impl PodEventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, event: watcher::Event<Pod>) -> Vec<Event> {
        match event {
            watcher::Event::Applied(pod) => vec![self.observe(&pod)],
            watcher::Event::Deleted(pod) => {
                let key = PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any());
                let uid = pod.uid().unwrap_or_default();
                self.known.remove(&key);
                vec![Event::PodDeleted { key, uid }]
            }
            watcher::Event::Restarted(pods) => {
                let previous = std::mem::take(&mut self.known);
                let mut events: Vec<Event> = pods.iter().map(|pod| self.observe(pod)).collect();

                for (key, uid) in previous {
                    if !self.known.contains_key(&key) {
                        events.push(Event::PodDeleted { key, uid });
                    }
                }
                events
            }
        }
    }

    fn observe(&mut self, pod: &Pod) -> Event {
        self.counter += 1;
        let observation = PodObservation::from_pod(pod, self.counter);
        self.known
            .insert(observation.key.clone(), observation.uid.clone());
        Event::PodObserved(observation)
    }
}

/// Forward one watch stream into the event queue until shutdown.
async fn forward<K, F>(
    api: Api<K>,
    component: &'static str,
    events: mpsc::Sender<Event>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
    mut map: F,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: FnMut(watcher::Event<K>) -> Vec<Event>,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);
    info!(component = component, "Watch started");

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    health.set_healthy(component).await;
                    for event in map(event) {
                        if events.send(event).await.is_err() {
                            debug!(component = component, "Event queue closed, stopping watch");
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(component = component, error = %e, "Watch error, backing off");
                    health.set_unhealthy(component, e.to_string()).await;
                }
                None => {
                    warn!(component = component, "Watch stream ended");
                    health.set_unhealthy(component, "watch stream ended").await;
                    return;
                }
            },
            _ = shutdown.recv() => {
                info!(component = component, "Stopping watch");
                return;
            }
        }
    }
}

/// Spawn the config and pod watches.
///
/// `namespace` limits both watches; `None` watches the whole cluster.
pub fn spawn_watches(
    client: &ClusterClient,
    namespace: Option<&str>,
    events: mpsc::Sender<Event>,
    health: HealthRegistry,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let configs = tokio::spawn(forward(
        client.configs_in_scope(namespace),
        components::CONFIG_WATCHER,
        events.clone(),
        health.clone(),
        shutdown.subscribe(),
        config_events,
    ));

    let mut mapper = PodEventMapper::new();
    let pods = tokio::spawn(forward(
        client.pods_in_scope(namespace),
        components::POD_WATCHER,
        events,
        health,
        shutdown.subscribe(),
        move |event| mapper.map(event),
    ));

    vec![configs, pods]
}
