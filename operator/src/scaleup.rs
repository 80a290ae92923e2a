use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Taint};
use kube::{Client, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{info, warn};
use vpsie_types::NodeGroup;

use crate::scaledown::safety::{labels_match_selector, pod_requests, tolerates};
use crate::util::{self, patch::patch_status, Error};
use crate::vpsie::types::Offering;

/// Pod condition reason attributing a scheduling failure to resources.
const UNSCHEDULABLE_REASON: &str = "Unschedulable";

/// Tunables for scale-up decisions.
#[derive(Clone, Debug)]
pub struct ScaleUpConfig {
    /// Minimum interval between scale-ups of the same group, damping
    /// repeated triggers while capacity is still coming online.
    pub stabilization_window: Duration,
}

impl Default for ScaleUpConfig {
    fn default() -> Self {
        ScaleUpConfig {
            stabilization_window: Duration::from_secs(300),
        }
    }
}

/// One desired-count delta for a node group.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleUpDecision {
    pub group: String,
    pub namespace: String,
    pub delta: i32,
    pub pending_pods: usize,
}

/// Interprets unschedulable-pod signals into per-group deltas. The
/// evaluator is pure; applying a delta goes through [`apply`].
pub struct ScaleUpEvaluator {
    config: ScaleUpConfig,
}

impl ScaleUpEvaluator {
    pub fn new(config: ScaleUpConfig) -> Self {
        ScaleUpEvaluator { config }
    }

    pub fn evaluate(
        &self,
        groups: &[NodeGroup],
        pods: &[Pod],
        offerings: &HashMap<String, Offering>,
        now: DateTime<Utc>,
    ) -> Vec<ScaleUpDecision> {
        // Pods are aggregated at most once even if they appear in the
        // signal repeatedly.
        let mut seen: HashSet<String> = HashSet::new();
        let mut sorted_groups: Vec<&NodeGroup> = groups.iter().collect();
        sorted_groups.sort_by_key(|g| g.name_any());

        // (cpu millis, memory bytes, pod count) of pending demand per group.
        let mut demand: HashMap<String, (i64, i64, usize)> = HashMap::new();
        for pod in pods {
            if !is_unschedulable(pod) {
                continue;
            }
            if let Some(uid) = pod.uid() {
                if !seen.insert(uid) {
                    continue;
                }
            }
            let group = match sorted_groups.iter().find(|g| group_matches_pod(g, pod)) {
                Some(group) => group,
                None => continue,
            };
            let (cpu, memory) = pod_requests(pod);
            let entry = demand.entry(group.name_any()).or_insert((0, 0, 0));
            entry.0 += cpu;
            entry.1 += memory;
            entry.2 += 1;
        }

        let mut decisions = Vec::new();
        for group in sorted_groups {
            let name = group.name_any();
            let (cpu, memory, pod_count) = match demand.get(&name) {
                Some(entry) => *entry,
                None => continue,
            };
            let status = group.status.clone().unwrap_or_default();
            let current = status.current_nodes.unwrap_or(0);
            let headroom = group.spec.max_nodes - current;
            if headroom <= 0 {
                info!(group = %name, "pending pods but group is at maxNodes");
                continue;
            }
            if let Some(last) = status
                .last_scale_time
                .as_deref()
                .and_then(|v| v.parse::<DateTime<Utc>>().ok())
            {
                let window = chrono::Duration::from_std(self.config.stabilization_window)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                if now.signed_duration_since(last) < window {
                    info!(group = %name, "holding scale-up inside the stabilization window");
                    continue;
                }
            }
            let offering = match group
                .spec
                .offerings
                .iter()
                .find_map(|id| offerings.get(id))
            {
                Some(offering) => offering,
                None => {
                    warn!(group = %name, "no known offering to size scale-up with");
                    continue;
                }
            };
            let needed = nodes_needed(cpu, memory, offering);
            let delta = needed.min(headroom);
            if delta > 0 {
                decisions.push(ScaleUpDecision {
                    group: name,
                    namespace: group.namespace().unwrap_or_default(),
                    delta,
                    pending_pods: pod_count,
                });
            }
        }
        decisions
    }
}

/// Applies a delta to the group's desired count, capped at `maxNodes`,
/// and stamps the scale time.
pub async fn apply(client: Client, group: &NodeGroup, decision: &ScaleUpDecision) -> Result<(), Error> {
    let max = group.spec.max_nodes;
    let min = group.spec.min_nodes;
    let delta = decision.delta;
    let now = chrono::Utc::now().to_rfc3339();
    match patch_status(client, group, move |status| {
        let desired = status.desired_nodes.unwrap_or(min);
        status.desired_nodes = Some((desired + delta).clamp(min, max));
        status.last_scale_time = Some(now);
    })
    .await
    {
        Ok(_) => Ok(()),
        Err(err) if util::is_conflict(&err) => Err(Error::TransientError(format!(
            "conflict applying scale-up to {}",
            decision.group
        ))),
        Err(err) => Err(err.into()),
    }
}

/// True for pending pods whose scheduling failure is attributed to
/// insufficient resources.
fn is_unschedulable(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    if status.phase.as_deref() != Some("Pending") {
        return false;
    }
    status
        .conditions
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some(UNSCHEDULABLE_REASON)
        })
}

/// A group can host a pod when its join-time labels satisfy the pod's
/// nodeSelector and the pod tolerates the group's join-time taints.
fn group_matches_pod(group: &NodeGroup, pod: &Pod) -> bool {
    let labels = group.spec.labels.clone().unwrap_or_default();
    if let Some(selector) = pod.spec.as_ref().and_then(|s| s.node_selector.as_ref()) {
        if !labels_match_selector(&labels, selector) {
            return false;
        }
    }
    let taints: Vec<Taint> = group
        .spec
        .taints
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|t| Taint {
            key: t.key.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            ..Default::default()
        })
        .collect();
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or(&[]);
    tolerates(&taints, tolerations)
}

/// Conservative bin-packing approximation: enough nodes of the
/// offering to absorb the summed deficit, rounding up, and never zero
/// once there is any pending demand.
fn nodes_needed(cpu_millis: i64, memory_bytes: i64, offering: &Offering) -> i32 {
    let cpu_capacity = i64::from(offering.cpu) * 1000;
    let memory_capacity = offering.memory_mb * 1024 * 1024;
    let by_cpu = if cpu_capacity > 0 {
        (cpu_millis + cpu_capacity - 1) / cpu_capacity
    } else {
        0
    };
    let by_memory = if memory_capacity > 0 {
        (memory_bytes + memory_capacity - 1) / memory_capacity
    } else {
        0
    };
    by_cpu.max(by_memory).max(1) as i32
}
