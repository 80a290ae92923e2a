pub mod metrics;
pub mod policy;
pub mod safety;
pub mod source;
pub mod tracker;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{api::ListParams, Api, Client, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use vpsie_types::{NodeGroup, VPSNode, MANAGED_BY_LABEL, NODE_GROUP_LABEL};

use crate::drain::DrainEngine;
use crate::util::clock::Clock;
use crate::util::{self, events, patch::patch_status, Error, RETIRE_ANNOTATION};
use metrics::ScaleDownMetrics;
use policy::{PolicyDecision, PolicyEngine};
use safety::{ClusterView, RescheduleTarget, SafetyEvaluator, Verdict};
use source::NodeMetricsSource;
use tracker::{NodeUtilization, UtilizationTracker};

/// Weight of the mean utilization in the removal priority. Utilization
/// dominates only between nodes with equal pod pressure.
const W_UTIL: f64 = 10.0;

/// Weight of the plain pod count: busier nodes are removed later.
const W_PODS: i64 = 100;

/// Weight of the system-pod count: nodes carrying system controllers
/// are removed last.
const W_SYS: i64 = 500;

/// Storage provisioners that pin volumes to a node.
const LOCAL_PROVISIONERS: &[&str] = &[
    "kubernetes.io/no-provisioner",
    "rancher.io/local-path",
    "openebs.io/local",
];

/// Tunables for the scale-down pass.
#[derive(Clone, Debug)]
pub struct ScaleDownConfig {
    /// Cap on nodes retired in one pass over one group.
    pub max_nodes_per_scale_down: usize,
}

impl Default for ScaleDownConfig {
    fn default() -> Self {
        ScaleDownConfig {
            max_nodes_per_scale_down: 1,
        }
    }
}

/// Composes the utilization tracker, the policy engine, the safety
/// evaluator and the drain engine into an end-to-end scale-down pass
/// over one node group. The manager never deletes machines itself: a
/// drained node is handed to the NodeGroup reconciler via the retire
/// annotation so pods are always evicted before a VM disappears.
pub struct ScaleDownManager {
    client: Client,
    tracker: Arc<UtilizationTracker>,
    safety: SafetyEvaluator,
    policy: PolicyEngine,
    drain: Arc<DrainEngine>,
    config: ScaleDownConfig,
    metrics: ScaleDownMetrics,
    clock: Arc<dyn Clock>,
}

impl ScaleDownManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        tracker: Arc<UtilizationTracker>,
        safety: SafetyEvaluator,
        policy: PolicyEngine,
        drain: Arc<DrainEngine>,
        config: ScaleDownConfig,
        metrics: ScaleDownMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ScaleDownManager {
            client,
            tracker,
            safety,
            policy,
            drain,
            config,
            metrics,
            clock,
        }
    }

    /// Refreshes the utilization tracker from the metrics source,
    /// garbage-collecting nodes that left the cluster.
    pub async fn update_utilization(&self, source: &dyn NodeMetricsSource) -> Result<(), Error> {
        let node_api: Api<Node> = Api::all(self.client.clone());
        let live: HashSet<String> = node_api
            .list(&ListParams::default())
            .await?
            .iter()
            .map(|n| n.name_any())
            .collect();
        let usages = source.sample().await?;
        self.tracker.record(&usages, &live);
        Ok(())
    }

    /// One scale-down pass over one node group. Returns the number of
    /// nodes drained and handed over for retirement.
    pub async fn pass(&self, group: &NodeGroup) -> Result<usize, Error> {
        let group_name = group.name_any();
        let status = group.status.clone().unwrap_or_default();
        let current = status.current_nodes.unwrap_or(0) as i64;
        let min = i64::from(group.spec.min_nodes);
        let removable = (current - min).max(0) as usize;
        if removable == 0 {
            return Ok(0);
        }

        let node_api: Api<Node> = Api::all(self.client.clone());
        let selector = format!("{}={}", NODE_GROUP_LABEL, group_name);
        let group_nodes = node_api
            .list(&ListParams::default().labels(&selector))
            .await?;

        // Candidates: underutilized over a full observation window.
        let window = chrono::Duration::from_std(self.tracker.config().observation_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut candidates: Vec<(Node, NodeUtilization)> = Vec::new();
        for node in group_nodes {
            if node.labels().get(MANAGED_BY_LABEL).is_none() {
                continue;
            }
            if let Some(snapshot) = self.tracker.snapshot(&node.name_any()) {
                if snapshot.is_underutilized && snapshot.window_full(window) {
                    candidates.push((node, snapshot));
                }
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let last_scale = parse_time(status.last_scale_time.as_deref());
        let now = self.clock.now();
        let recorder = events::recorder(self.client.clone(), group);

        // Gather cluster state once for the whole pass.
        let all_nodes = node_api.list(&ListParams::default()).await?;
        let pod_api: Api<Pod> = Api::all(self.client.clone());
        let all_pods = pod_api.list(&ListParams::default()).await?;
        let mut pods_by_node: HashMap<String, Vec<Pod>> = HashMap::new();
        for pod in all_pods {
            if let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                pods_by_node.entry(node_name).or_default().push(pod);
            }
        }

        // Policy gate, then priority ordering.
        let mut allowed: Vec<(Node, NodeUtilization)> = Vec::new();
        for (node, snapshot) in candidates {
            match self.policy.evaluate(&node, last_scale, now) {
                PolicyDecision::Allow => allowed.push((node, snapshot)),
                PolicyDecision::Deny { reason } => {
                    self.metrics.blocked.with_label_values(&["policy"]).inc();
                    info!(group = %group_name, node = %node.name_any(), %reason, "scale-down blocked by policy");
                }
            }
        }
        let mut ranked: Vec<(i64, Node, NodeUtilization)> = allowed
            .into_iter()
            .map(|(node, snapshot)| {
                let pods = pods_by_node
                    .get(&node.name_any())
                    .map(|v| v.as_slice())
                    .unwrap_or(&[]);
                let priority = removal_priority(&snapshot, pods);
                (priority, node, snapshot)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name_any().cmp(&b.1.name_any())));

        let budget = removable.min(self.config.max_nodes_per_scale_down);
        let mut retired = 0usize;
        for (_, node, _) in ranked.into_iter().take(budget) {
            let node_name = node.name_any();
            let pods = pods_by_node.get(&node_name).cloned().unwrap_or_default();

            let view = self
                .cluster_view(&all_nodes.items, &pods_by_node, &node_name, &pods)
                .await?;
            match self.safety.evaluate(&node, &pods, &view) {
                Verdict::Safe => {}
                Verdict::Unsafe { reason } => {
                    self.metrics.blocked.with_label_values(&["safety"]).inc();
                    events::warning(
                        &recorder,
                        "ScaleDown",
                        "ScaleDownBlocked",
                        format!("node {} not removed: {}", node_name, reason),
                    )
                    .await;
                    continue;
                }
            }

            match self.drain.drain(&node_name).await {
                Ok(()) => {}
                Err(Error::PdbBlocked(pod)) => {
                    self.metrics.blocked.with_label_values(&["pdb"]).inc();
                    events::warning(
                        &recorder,
                        "ScaleDown",
                        "ScaleDownBlocked",
                        format!("drain of {} blocked by disruption budget on {}", node_name, pod),
                    )
                    .await;
                    continue;
                }
                Err(err) => {
                    self.metrics.failed.inc();
                    events::warning(
                        &recorder,
                        "ScaleDown",
                        "ScaleDownFailed",
                        format!("drain of {} failed: {}", node_name, err),
                    )
                    .await;
                    return Err(err);
                }
            }

            self.retire(group, &node_name).await?;
            self.metrics.retired.inc();
            events::normal(
                &recorder,
                "ScaleDown",
                "NodeRetired",
                format!("node {} drained and scheduled for retirement", node_name),
            )
            .await;
            retired += 1;
        }
        Ok(retired)
    }

    /// Builds the reschedulability view for one candidate: remaining
    /// ready, schedulable nodes with their pods, plus a node-local
    /// classification for every claim the candidate's pods reference.
    async fn cluster_view(
        &self,
        all_nodes: &[Node],
        pods_by_node: &HashMap<String, Vec<Pod>>,
        candidate: &str,
        candidate_pods: &[Pod],
    ) -> Result<ClusterView, Error> {
        let targets: Vec<RescheduleTarget> = all_nodes
            .iter()
            .filter(|node| node.name_any() != candidate)
            .filter(|node| safety::node_is_ready(node))
            .filter(|node| node.spec.as_ref().and_then(|s| s.unschedulable) != Some(true))
            .map(|node| RescheduleTarget {
                node: node.clone(),
                pods: pods_by_node
                    .get(&node.name_any())
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        let local_pvcs = self.classify_pvcs(candidate_pods).await?;
        Ok(ClusterView {
            targets,
            local_pvcs,
        })
    }

    /// Resolves each referenced claim to whether its storage class
    /// provisions node-local volumes. Permission and not-found errors
    /// degrade to "local" so the node is conservatively kept; transient
    /// errors bubble up so the caller requeues instead of silently
    /// allowing removal.
    async fn classify_pvcs(
        &self,
        pods: &[Pod],
    ) -> Result<HashMap<(String, String), bool>, Error> {
        let mut result = HashMap::new();
        let sc_api: Api<StorageClass> = Api::all(self.client.clone());
        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            let volumes = match pod.spec.as_ref().and_then(|s| s.volumes.as_ref()) {
                Some(volumes) => volumes,
                None => continue,
            };
            for volume in volumes {
                let claim = match volume.persistent_volume_claim.as_ref() {
                    Some(claim) => claim.claim_name.clone(),
                    None => continue,
                };
                let key = (namespace.clone(), claim.clone());
                if result.contains_key(&key) {
                    continue;
                }
                let pvc_api: Api<PersistentVolumeClaim> =
                    Api::namespaced(self.client.clone(), &namespace);
                let local = match pvc_api.get(&claim).await {
                    Ok(pvc) => match pvc.spec.and_then(|s| s.storage_class_name) {
                        Some(sc_name) => match sc_api.get(&sc_name).await {
                            Ok(sc) => is_local_provisioner(&sc.provisioner),
                            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 403 => true,
                            Err(err) => {
                                return Err(Error::TransientError(format!(
                                    "classifying storage class {}: {}",
                                    sc_name, err
                                )))
                            }
                        },
                        // No storage class recorded: stay conservative.
                        None => true,
                    },
                    Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 403 => true,
                    Err(err) => {
                        return Err(Error::TransientError(format!(
                            "classifying claim {}/{}: {}",
                            namespace, claim, err
                        )))
                    }
                };
                result.insert(key, local);
            }
        }
        Ok(result)
    }

    /// Hands a drained node over to the reconcilers: the group's
    /// desired count drops (never below the minimum) and the VPSNode is
    /// marked for retirement. Desired shrinks first so the group does
    /// not immediately replace the node it is giving up.
    async fn retire(&self, group: &NodeGroup, node_name: &str) -> Result<(), Error> {
        let now = self.clock.now().to_rfc3339();
        let min = group.spec.min_nodes;
        match patch_status(self.client.clone(), group, |status| {
            let desired = status.desired_nodes.unwrap_or(min).saturating_sub(1).max(min);
            status.desired_nodes = Some(desired);
            status.last_scale_time = Some(now);
        })
        .await
        {
            Ok(_) => {}
            Err(err) if util::is_conflict(&err) => {
                // Another writer got there first; the next pass retries.
                return Err(Error::TransientError(format!(
                    "conflict updating group {} while retiring {}",
                    group.name_any(),
                    node_name
                )));
            }
            Err(err) => return Err(err.into()),
        }

        let namespace = group.namespace().unwrap_or_default();
        let api: Api<VPSNode> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { RETIRE_ANNOTATION: "true" }
            }
        });
        match api
            .patch(
                node_name,
                &kube::api::PatchParams::default(),
                &kube::api::Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if util::is_not_found(&err) => {
                warn!(node = %node_name, "drained node has no VPSNode resource");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Removal priority: lower means removed first. Utilization is scaled
/// by `W_UTIL`, pod pressure by `W_PODS`, system pods by `W_SYS`; ties
/// are broken by node name upstream for determinism.
pub(crate) fn removal_priority(snapshot: &NodeUtilization, pods: &[Pod]) -> i64 {
    let mean_utilization = (snapshot.cpu_mean + snapshot.memory_mean) / 2.0;
    let evictable: Vec<&Pod> = pods.iter().filter(|p| safety::is_evictable(p)).collect();
    let system_pods = evictable
        .iter()
        .filter(|p| p.namespace().as_deref() == Some("kube-system"))
        .count() as i64;
    (mean_utilization * W_UTIL).round() as i64
        + evictable.len() as i64 * W_PODS
        + system_pods * W_SYS
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value.and_then(|v| v.parse::<DateTime<Utc>>().ok())
}

fn is_local_provisioner(provisioner: &str) -> bool {
    LOCAL_PROVISIONERS.iter().any(|p| *p == provisioner) || provisioner.contains("local")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kube::api::ObjectMeta;

    fn snapshot(cpu: f64, memory: f64) -> NodeUtilization {
        NodeUtilization {
            node_name: "n".to_owned(),
            samples: Vec::new(),
            cpu_mean: cpu,
            memory_mean: memory,
            last_updated: Utc::now(),
            is_underutilized: true,
        }
    }

    fn pod_in(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn priority_orders_by_utilization_then_pods_then_system_pods() {
        let idle_empty = removal_priority(&snapshot(5.0, 5.0), &[]);
        let idle_with_pod = removal_priority(&snapshot(5.0, 5.0), &[pod_in("default", "a")]);
        let busy_empty = removal_priority(&snapshot(50.0, 50.0), &[]);
        let idle_with_system = removal_priority(
            &snapshot(5.0, 5.0),
            &[pod_in("kube-system", "coredns-x")],
        );
        assert!(idle_empty < idle_with_pod);
        assert!(idle_empty < busy_empty);
        // A pod weighs as much as ten utilization points, so the busy
        // empty node still outranks the idle one carrying a pod.
        assert!(idle_with_pod < busy_empty);
        // A system pod outweighs a plain workload pod.
        assert!(idle_with_pod < idle_with_system);
    }

    #[test]
    fn priority_is_deterministic() {
        let pods = vec![pod_in("default", "a"), pod_in("default", "b")];
        assert_eq!(
            removal_priority(&snapshot(12.3, 45.6), &pods),
            removal_priority(&snapshot(12.3, 45.6), &pods)
        );
    }

    #[test]
    fn local_provisioner_detection() {
        assert!(is_local_provisioner("kubernetes.io/no-provisioner"));
        assert!(is_local_provisioner("rancher.io/local-path"));
        assert!(is_local_provisioner("topolvm.io/local-lvm"));
        assert!(!is_local_provisioner("ebs.csi.aws.com"));
    }
}
