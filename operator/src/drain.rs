use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams},
    Api, Client, Resource, ResourceExt,
};
use prometheus::{CounterVec, Histogram, HistogramOpts, Opts, Registry};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::scaledown::safety::is_evictable;
use crate::util::{
    is_not_found, metrics::sanitize_label, Error, DRAIN_COMPLETED, DRAIN_FAILED,
    DRAIN_STATUS_ANNOTATION,
};

/// Deadline for cleanup operations that must run regardless of what
/// happened to the caller: uncordon and failure annotation.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial backoff between eviction retries while a disruption budget
/// rejects the eviction.
const EVICTION_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on a single eviction backoff step.
const EVICTION_BACKOFF_CAP: Duration = Duration::from_secs(16);

/// Poll interval while waiting for evicted pods to actually disappear.
const REMOVAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Limits for one drain operation.
#[derive(Clone, Debug)]
pub struct DrainConfig {
    /// Overall deadline for the drain.
    pub drain_timeout: Duration,

    /// Deadline for evicting any single pod.
    pub per_pod_timeout: Duration,

    /// Grace period handed to the eviction call.
    pub eviction_grace_period: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        DrainConfig {
            drain_timeout: Duration::from_secs(300),
            per_pod_timeout: Duration::from_secs(120),
            eviction_grace_period: Duration::from_secs(30),
        }
    }
}

/// Drain observability.
#[derive(Clone)]
pub struct DrainMetrics {
    pub duration: Histogram,
    pub results: CounterVec,
}

impl DrainMetrics {
    pub fn new(registry: &Registry) -> Self {
        let duration = Histogram::with_opts(HistogramOpts::new(
            "drain_duration_seconds",
            "Wall-clock time of node drains.",
        ))
        .unwrap();
        let results = CounterVec::new(
            Opts::new("drain_total", "Completed drains by node and result."),
            &["node", "result"],
        )
        .unwrap();
        registry.register(Box::new(duration.clone())).unwrap();
        registry.register(Box::new(results.clone())).unwrap();
        DrainMetrics { duration, results }
    }
}

/// Cordons a node, evicts its evictable pods under PodDisruptionBudget
/// constraints, and waits for them to disappear. Any abort path
/// restores the cordon state under a fresh background deadline so a
/// cancelled caller never leaves a node cordoned.
pub struct DrainEngine {
    client: Client,
    config: DrainConfig,
    metrics: DrainMetrics,
}

impl DrainEngine {
    pub fn new(client: Client, config: DrainConfig, metrics: DrainMetrics) -> Self {
        DrainEngine {
            client,
            config,
            metrics,
        }
    }

    /// Drains the named node. Invoking this twice is equivalent to
    /// invoking it once: cordon and annotations are idempotent and an
    /// already-empty node simply has nothing left to evict.
    pub async fn drain(&self, node_name: &str) -> Result<(), Error> {
        let started = Instant::now();
        let deadline = started + self.config.drain_timeout;

        self.cordon(node_name, true).await?;
        info!(node = %node_name, "cordoned node for drain");

        let result = self.evict_all(node_name, deadline).await;
        match result {
            Ok(()) => {
                self.annotate(node_name, DRAIN_COMPLETED).await?;
                self.metrics.duration.observe(started.elapsed().as_secs_f64());
                self.metrics
                    .results
                    .with_label_values(&[&sanitize_label(node_name), "completed"])
                    .inc();
                info!(node = %node_name, "drain completed");
                Ok(())
            }
            Err(err) => {
                self.metrics
                    .results
                    .with_label_values(&[&sanitize_label(node_name), "failed"])
                    .inc();
                self.cleanup_detached(node_name).await;
                Err(err)
            }
        }
    }

    async fn evict_all(&self, node_name: &str, deadline: Instant) -> Result<(), Error> {
        let pod_api: Api<Pod> = Api::all(self.client.clone());
        let pods = pod_api
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
            .await?;
        let mut targets: Vec<Pod> = pods.into_iter().filter(is_evictable).collect();
        sort_for_eviction(&mut targets);

        for pod in &targets {
            self.evict_one(pod, deadline).await?;
        }
        self.wait_for_removal(&targets, deadline).await
    }

    async fn evict_one(&self, pod: &Pod, drain_deadline: Instant) -> Result<(), Error> {
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(self.config.eviction_grace_period.as_secs() as u32),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod_deadline = Instant::now() + self.config.per_pod_timeout;
        let mut backoff = EVICTION_BACKOFF_BASE;
        loop {
            match api.evict(&name, &params).await {
                Ok(_) => return Ok(()),
                // Already gone.
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                // 429 is the disruption-budget rejection; retry with
                // bounded exponential backoff until a deadline trips.
                Err(kube::Error::Api(ae)) if ae.code == 429 => {
                    let now = Instant::now();
                    if now + backoff >= pod_deadline || now + backoff >= drain_deadline {
                        return Err(Error::PdbBlocked(format!("{}/{}", namespace, name)));
                    }
                    warn!(pod = %name, namespace = %namespace, "eviction rejected by disruption budget, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(EVICTION_BACKOFF_CAP);
                }
                Err(err) => {
                    return Err(Error::DrainFailed {
                        node: pod
                            .spec
                            .as_ref()
                            .and_then(|s| s.node_name.clone())
                            .unwrap_or_default(),
                        reason: format!("evicting {}/{}: {}", namespace, name, err),
                    });
                }
            }
        }
    }

    async fn wait_for_removal(&self, pods: &[Pod], deadline: Instant) -> Result<(), Error> {
        for pod in pods {
            let name = pod.name_any();
            let namespace = pod.namespace().unwrap_or_default();
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            loop {
                match api.get(&name).await {
                    Err(kube::Error::Api(ae)) if ae.code == 404 => break,
                    // A replacement with the same name but a different
                    // UID also means the original is gone.
                    Ok(current) if current.uid() != pod.uid() => break,
                    Ok(_) => {
                        if Instant::now() + REMOVAL_POLL_INTERVAL >= deadline {
                            return Err(Error::DrainFailed {
                                node: pod
                                    .spec
                                    .as_ref()
                                    .and_then(|s| s.node_name.clone())
                                    .unwrap_or_default(),
                                reason: format!(
                                    "pod {}/{} still present at the drain deadline",
                                    namespace, name
                                ),
                            });
                        }
                        tokio::time::sleep(REMOVAL_POLL_INTERVAL).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Marks the node (un)schedulable. Idempotent.
    pub async fn cordon(&self, node_name: &str, unschedulable: bool) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        api.patch(
            node_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn annotate(&self, node_name: &str, status: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "annotations": { DRAIN_STATUS_ANNOTATION: status }
            }
        });
        api.patch(
            node_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    /// Uncordons and annotates the node after a failed drain. Runs in a
    /// spawned task with its own deadline so neither the caller's
    /// cancellation nor controller shutdown can leave the node
    /// cordoned.
    async fn cleanup_detached(&self, node_name: &str) {
        let client = self.client.clone();
        let node_name = node_name.to_owned();
        let handle = tokio::spawn(async move {
            let cleanup = async {
                let api: Api<Node> = Api::all(client);
                let patch = json!({
                    "metadata": {
                        "annotations": { DRAIN_STATUS_ANNOTATION: DRAIN_FAILED }
                    },
                    "spec": { "unschedulable": false }
                });
                if let Err(err) = api
                    .patch(&node_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    if !is_not_found(&err) {
                        warn!(node = %node_name, error = %err, "drain cleanup failed");
                    }
                }
            };
            if tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await.is_err() {
                warn!(node = %node_name, "drain cleanup timed out");
            }
        });
        // Best effort: the spawned task keeps running even if this
        // await is dropped.
        let _ = handle.await;
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }
}

/// Orders pods for eviction: already-terminating pods first for their
/// fast exits, then ascending priority, with names breaking ties.
pub(crate) fn sort_for_eviction(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        let a_terminating = a.meta().deletion_timestamp.is_some();
        let b_terminating = b.meta().deletion_timestamp.is_some();
        b_terminating
            .cmp(&a_terminating)
            .then_with(|| {
                let a_priority = a.spec.as_ref().and_then(|s| s.priority).unwrap_or(0);
                let b_priority = b.spec.as_ref().and_then(|s| s.priority).unwrap_or(0);
                a_priority.cmp(&b_priority)
            })
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}
