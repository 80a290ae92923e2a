use k8s_openapi::api::core::v1::{
    Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod, PodAffinityTerm, Taint,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};

use crate::util::quantity;
use crate::util::SCALE_DOWN_DISABLED_ANNOTATION;

/// Annotation value marking a pod as a static mirror pod.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Node labels that mark control-plane members.
const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Outcome of a safety evaluation. An unsafe verdict is a normal
/// result, not an error: it carries the human-readable blocker.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Safe,
    Unsafe { reason: String },
}

impl Verdict {
    fn blocked(reason: impl Into<String>) -> Self {
        Verdict::Unsafe {
            reason: reason.into(),
        }
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }
}

/// Tunables for the safety checks.
#[derive(Clone, Debug)]
pub struct SafetyConfig {
    /// Fraction of each target node's allocatable resources kept free
    /// when simulating rescheduling, in percent.
    pub headroom_percent: f64,

    /// Namespace hosting cluster-critical system controllers.
    pub system_namespace: String,

    /// Name prefixes of system controllers that must never lose their
    /// sole instance.
    pub critical_prefixes: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        SafetyConfig {
            headroom_percent: 15.0,
            system_namespace: "kube-system".to_owned(),
            critical_prefixes: vec![
                "coredns".to_owned(),
                "kube-dns".to_owned(),
                "metrics-server".to_owned(),
                "cluster-autoscaler".to_owned(),
            ],
        }
    }
}

/// One candidate target for rescheduling: a remaining ready node and
/// the pods currently on it.
#[derive(Clone, Debug)]
pub struct RescheduleTarget {
    pub node: Node,
    pub pods: Vec<Pod>,
}

/// A point-in-time view of the cluster around the node under
/// evaluation. Built once per scale-down pass and shared across the
/// candidate loop.
#[derive(Clone, Debug, Default)]
pub struct ClusterView {
    /// Remaining ready, schedulable nodes, excluding the candidate.
    pub targets: Vec<RescheduleTarget>,

    /// Whether a `(namespace, claim)` PVC is backed by node-local
    /// storage. Claims missing from the map are treated as local, which
    /// errs on the side of keeping the node.
    pub local_pvcs: HashMap<(String, String), bool>,
}

/// Multi-predicate check deciding whether removing a node would strand
/// or degrade workloads. Predicates short-circuit on the first blocker.
pub struct SafetyEvaluator {
    config: SafetyConfig,
}

impl SafetyEvaluator {
    pub fn new(config: SafetyConfig) -> Self {
        SafetyEvaluator { config }
    }

    pub fn evaluate(&self, node: &Node, pods_on_node: &[Pod], view: &ClusterView) -> Verdict {
        if let Some(reason) = self.protected(node) {
            return Verdict::blocked(reason);
        }
        let evictable: Vec<&Pod> = pods_on_node.iter().filter(|p| is_evictable(p)).collect();
        if let Some(reason) = self.local_storage_blocker(&evictable, view) {
            return Verdict::blocked(reason);
        }
        if let Some(reason) = self.sole_system_pod(&evictable, view) {
            return Verdict::blocked(reason);
        }
        self.reschedulable(&evictable, view)
    }

    /// Predicate 1: nodes explicitly protected by annotation or
    /// control-plane role are never removed.
    fn protected(&self, node: &Node) -> Option<String> {
        if node
            .annotations()
            .get(SCALE_DOWN_DISABLED_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            return Some("node has scale-down disabled".to_owned());
        }
        for label in CONTROL_PLANE_LABELS {
            if node.labels().contains_key(*label) {
                return Some("node is a control-plane member".to_owned());
            }
        }
        None
    }

    /// Predicate 2: pods with node-local state cannot move.
    fn local_storage_blocker(&self, pods: &[&Pod], view: &ClusterView) -> Option<String> {
        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            let volumes = match pod.spec.as_ref().and_then(|s| s.volumes.as_ref()) {
                Some(volumes) => volumes,
                None => continue,
            };
            for volume in volumes {
                if let Some(empty_dir) = volume.empty_dir.as_ref() {
                    if empty_dir.medium.as_deref() != Some("Memory") {
                        return Some(format!(
                            "pod {}/{} uses emptyDir volume {}",
                            namespace,
                            pod.name_any(),
                            volume.name
                        ));
                    }
                }
                if volume.host_path.is_some() {
                    return Some(format!(
                        "pod {}/{} uses hostPath volume {}",
                        namespace,
                        pod.name_any(),
                        volume.name
                    ));
                }
                if let Some(claim) = volume.persistent_volume_claim.as_ref() {
                    let key = (namespace.clone(), claim.claim_name.clone());
                    if view.local_pvcs.get(&key).copied().unwrap_or(true) {
                        return Some(format!(
                            "pod {}/{} is bound to node-local claim {}",
                            namespace,
                            pod.name_any(),
                            claim.claim_name
                        ));
                    }
                }
            }
        }
        None
    }

    /// Predicate 3: never remove the sole instance of a cluster-critical
    /// system controller.
    fn sole_system_pod(&self, pods: &[&Pod], view: &ClusterView) -> Option<String> {
        for pod in pods {
            if pod.namespace().as_deref() != Some(self.config.system_namespace.as_str()) {
                continue;
            }
            let name = pod.name_any();
            let prefix = match self
                .config
                .critical_prefixes
                .iter()
                .find(|prefix| name.starts_with(prefix.as_str()))
            {
                Some(prefix) => prefix,
                None => continue,
            };
            let siblings = view
                .targets
                .iter()
                .flat_map(|target| target.pods.iter())
                .filter(|other| {
                    other.namespace().as_deref() == Some(self.config.system_namespace.as_str())
                        && other.name_any().starts_with(prefix.as_str())
                })
                .count();
            if siblings == 0 {
                return Some(format!(
                    "pod {}/{} is the only instance of a system controller",
                    self.config.system_namespace, name
                ));
            }
        }
        None
    }

    /// Predicates 4 and 5: every evictable pod must fit somewhere else.
    /// Placements are recorded optimistically so anti-affinity and
    /// capacity are checked against a progressively filled target state.
    fn reschedulable(&self, pods: &[&Pod], view: &ClusterView) -> Verdict {
        let mut placements: HashMap<String, Vec<Pod>> = HashMap::new();
        let mut targets: Vec<&RescheduleTarget> = view.targets.iter().collect();
        targets.sort_by(|a, b| a.node.name_any().cmp(&b.node.name_any()));

        for pod in pods {
            match self.place(pod, &targets, &placements) {
                Some(node_name) => placements
                    .entry(node_name)
                    .or_insert_with(Vec::new)
                    .push((*pod).clone()),
                None => {
                    return Verdict::blocked(format!(
                        "pod {}/{} cannot be rescheduled on any remaining node",
                        pod.namespace().unwrap_or_default(),
                        pod.name_any()
                    ));
                }
            }
        }
        Verdict::Safe
    }

    fn place(
        &self,
        pod: &Pod,
        targets: &[&RescheduleTarget],
        placements: &HashMap<String, Vec<Pod>>,
    ) -> Option<String> {
        for target in targets {
            let node_name = target.node.name_any();
            if target.node.spec.as_ref().and_then(|s| s.unschedulable) == Some(true) {
                continue;
            }
            if !node_is_ready(&target.node) {
                continue;
            }
            if !self.taints_tolerated(pod, &target.node) {
                continue;
            }
            if !self.selector_matches(pod, &target.node) {
                continue;
            }
            if !self.node_affinity_matches(pod, &target.node) {
                continue;
            }
            if self.anti_affinity_violated(pod, target, targets, placements) {
                continue;
            }
            if !self.has_headroom(pod, target, placements.get(&node_name)) {
                continue;
            }
            return Some(node_name);
        }
        None
    }

    fn taints_tolerated(&self, pod: &Pod, node: &Node) -> bool {
        let taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_deref())
            .unwrap_or(&[]);
        let tolerations = pod
            .spec
            .as_ref()
            .and_then(|s| s.tolerations.as_deref())
            .unwrap_or(&[]);
        tolerates(taints, tolerations)
    }

    fn selector_matches(&self, pod: &Pod, node: &Node) -> bool {
        let selector = match pod.spec.as_ref().and_then(|s| s.node_selector.as_ref()) {
            Some(selector) => selector,
            None => return true,
        };
        labels_match_selector(node.labels(), selector)
    }

    fn node_affinity_matches(&self, pod: &Pod, node: &Node) -> bool {
        let required = pod
            .spec
            .as_ref()
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref());
        match required {
            Some(selector) => node_selector_matches(selector, node.labels()),
            None => true,
        }
    }

    /// Checks the pod's required anti-affinity against pods already in
    /// the target's topology domain, including ones placed earlier in
    /// this pass.
    fn anti_affinity_violated(
        &self,
        pod: &Pod,
        target: &RescheduleTarget,
        targets: &[&RescheduleTarget],
        placements: &HashMap<String, Vec<Pod>>,
    ) -> bool {
        let terms = match pod
            .spec
            .as_ref()
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .and_then(|aa| aa.required_during_scheduling_ignored_during_execution.as_ref())
        {
            Some(terms) => terms,
            None => return false,
        };
        for term in terms {
            let domain = topology_domain(&target.node, &term.topology_key);
            for other in targets {
                if topology_domain(&other.node, &term.topology_key) != domain {
                    continue;
                }
                let other_name = other.node.name_any();
                let placed = placements.get(&other_name).map(|v| v.as_slice()).unwrap_or(&[]);
                if other
                    .pods
                    .iter()
                    .chain(placed.iter())
                    .any(|existing| anti_affinity_term_matches(term, pod, existing))
                {
                    return true;
                }
            }
        }
        false
    }

    /// Predicate 5: the pod's requests plus everything already on (or
    /// optimistically placed on) the target must leave the configured
    /// headroom free.
    fn has_headroom(
        &self,
        pod: &Pod,
        target: &RescheduleTarget,
        placed: Option<&Vec<Pod>>,
    ) -> bool {
        let (alloc_cpu, alloc_memory) = match node_allocatable(&target.node) {
            Some(allocatable) => allocatable,
            None => return false,
        };
        let budget = 1.0 - self.config.headroom_percent / 100.0;
        let cpu_budget = (alloc_cpu as f64 * budget) as i64;
        let memory_budget = (alloc_memory as f64 * budget) as i64;

        let (pod_cpu, pod_memory) = pod_requests(pod);
        let (mut used_cpu, mut used_memory) = (pod_cpu, pod_memory);
        for existing in &target.pods {
            let (cpu, memory) = pod_requests(existing);
            used_cpu += cpu;
            used_memory += memory;
        }
        if let Some(placed) = placed {
            for existing in placed {
                let (cpu, memory) = pod_requests(existing);
                used_cpu += cpu;
                used_memory += memory;
            }
        }
        used_cpu <= cpu_budget && used_memory <= memory_budget
    }
}

/// Returns true for pods the drain engine would actually evict:
/// DaemonSet-owned pods and static mirror pods stay behind.
pub fn is_evictable(pod: &Pod) -> bool {
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return false;
    }
    !pod.owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet")
}

/// Returns true if the node reports a Ready=True condition.
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Standard toleration semantics over hard taint effects. Soft
/// (`PreferNoSchedule`) taints never block placement.
pub fn tolerates(taints: &[Taint], tolerations: &[Toleration]) -> bool {
    taints
        .iter()
        .filter(|taint| taint.effect == "NoSchedule" || taint.effect == "NoExecute")
        .all(|taint| tolerations.iter().any(|tol| toleration_matches(taint, tol)))
}

fn toleration_matches(taint: &Taint, toleration: &Toleration) -> bool {
    // An empty effect on the toleration matches all effects.
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    let operator = toleration.operator.as_deref().unwrap_or("Equal");
    let key = toleration.key.as_deref().unwrap_or("");
    if key.is_empty() {
        // A wildcard toleration (empty key + Exists) matches everything.
        return operator == "Exists";
    }
    if key != taint.key {
        return false;
    }
    match operator {
        "Exists" => true,
        "Equal" => toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or(""),
        _ => false,
    }
}

/// Plain nodeSelector semantics: every requested label must be present
/// with the exact value.
pub fn labels_match_selector(
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Required node affinity: terms are ORed, expressions within a term
/// are ANDed.
pub fn node_selector_matches(selector: &NodeSelector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .node_selector_terms
        .iter()
        .any(|term| node_selector_term_matches(term, labels))
}

fn node_selector_term_matches(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>) -> bool {
    term.match_expressions
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .all(|requirement| node_requirement_matches(requirement, labels))
}

fn node_requirement_matches(
    requirement: &NodeSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> bool {
    let value = labels.get(&requirement.key);
    let values = requirement.values.as_deref().unwrap_or(&[]);
    match requirement.operator.as_str() {
        "In" => value.map(|v| values.iter().any(|want| want == v)).unwrap_or(false),
        "NotIn" => value.map(|v| !values.iter().any(|want| want == v)).unwrap_or(true),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" => match (value.and_then(|v| v.parse::<i64>().ok()), values.first()) {
            (Some(have), Some(want)) => want.parse::<i64>().map(|w| have > w).unwrap_or(false),
            _ => false,
        },
        "Lt" => match (value.and_then(|v| v.parse::<i64>().ok()), values.first()) {
            (Some(have), Some(want)) => want.parse::<i64>().map(|w| have < w).unwrap_or(false),
            _ => false,
        },
        _ => false,
    }
}

fn topology_domain(node: &Node, topology_key: &str) -> Option<String> {
    if topology_key == "kubernetes.io/hostname" {
        return Some(node.name_any());
    }
    node.labels().get(topology_key).cloned()
}

fn anti_affinity_term_matches(term: &PodAffinityTerm, subject: &Pod, existing: &Pod) -> bool {
    let subject_namespace = subject.namespace().unwrap_or_default();
    let existing_namespace = existing.namespace().unwrap_or_default();
    let in_scope = match term.namespaces.as_deref() {
        Some(namespaces) if !namespaces.is_empty() => {
            namespaces.iter().any(|ns| *ns == existing_namespace)
        }
        // An empty namespace list scopes the term to the pod's own namespace.
        _ => subject_namespace == existing_namespace,
    };
    if !in_scope {
        return false;
    }
    match term.label_selector.as_ref() {
        Some(selector) => label_selector_matches(selector, existing.labels()),
        None => false,
    }
}

/// `metav1.LabelSelector` semantics: matchLabels and matchExpressions
/// are ANDed; an empty selector matches everything.
pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = selector.match_labels.as_ref() {
        if !match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
        {
            return false;
        }
    }
    selector
        .match_expressions
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .all(|requirement| {
            let value = labels.get(&requirement.key);
            let values = requirement.values.as_deref().unwrap_or(&[]);
            match requirement.operator.as_str() {
                "In" => value.map(|v| values.iter().any(|want| want == v)).unwrap_or(false),
                "NotIn" => value.map(|v| !values.iter().any(|want| want == v)).unwrap_or(true),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            }
        })
}

/// Sum of container CPU and memory requests, in millicores and bytes.
pub fn pod_requests(pod: &Pod) -> (i64, i64) {
    let mut cpu = 0;
    let mut memory = 0;
    if let Some(spec) = pod.spec.as_ref() {
        for container in &spec.containers {
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            {
                cpu += requests.get("cpu").and_then(quantity::cpu_millis).unwrap_or(0);
                memory += requests
                    .get("memory")
                    .and_then(quantity::memory_bytes)
                    .unwrap_or(0);
            }
        }
    }
    (cpu, memory)
}

/// Allocatable CPU and memory of a node, in millicores and bytes.
pub fn node_allocatable(node: &Node) -> Option<(i64, i64)> {
    let allocatable = node.status.as_ref()?.allocatable.as_ref()?;
    let cpu = allocatable.get("cpu").and_then(quantity::cpu_millis)?;
    let memory = allocatable.get("memory").and_then(quantity::memory_bytes)?;
    Some((cpu, memory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Affinity, Container, EmptyDirVolumeSource, NodeAffinity, NodeCondition, NodeSpec,
        NodeStatus, PodAntiAffinity, PodSpec, ResourceRequirements, Volume,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn node(name: &str, labels: &[(&str, &str)], cpu: &str, memory: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                allocatable: Some(
                    vec![
                        ("cpu".to_owned(), Quantity(cpu.to_owned())),
                        ("memory".to_owned(), Quantity(memory.to_owned())),
                    ]
                    .into_iter()
                    .collect(),
                ),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_owned(),
                    status: "True".to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn pod(namespace: &str, name: &str, cpu: &str, memory: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_owned(),
                    resources: Some(ResourceRequirements {
                        requests: Some(
                            vec![
                                ("cpu".to_owned(), Quantity(cpu.to_owned())),
                                ("memory".to_owned(), Quantity(memory.to_owned())),
                            ]
                            .into_iter()
                            .collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn target(node: Node, pods: Vec<Pod>) -> RescheduleTarget {
        RescheduleTarget { node, pods }
    }

    fn evaluator() -> SafetyEvaluator {
        SafetyEvaluator::new(SafetyConfig::default())
    }

    fn view(targets: Vec<RescheduleTarget>) -> ClusterView {
        ClusterView {
            targets,
            local_pvcs: HashMap::new(),
        }
    }

    #[test]
    fn control_plane_nodes_are_protected() {
        let candidate = node(
            "cp-1",
            &[("node-role.kubernetes.io/control-plane", "")],
            "4",
            "8Gi",
        );
        let verdict = evaluator().evaluate(&candidate, &[], &view(vec![]));
        assert!(!verdict.is_safe());
    }

    #[test]
    fn disabled_annotation_blocks_removal() {
        let mut candidate = node("worker-1", &[], "4", "8Gi");
        candidate.metadata.annotations = Some(
            vec![(SCALE_DOWN_DISABLED_ANNOTATION.to_owned(), "true".to_owned())]
                .into_iter()
                .collect(),
        );
        let remaining = target(node("worker-2", &[], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[], &view(vec![remaining]));
        assert!(!verdict.is_safe());
    }

    #[test]
    fn empty_dir_pod_blocks_removal() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let mut blocked = pod("default", "stateful", "100m", "128Mi");
        blocked.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "scratch".to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]);
        let remaining = target(node("worker-2", &[], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[blocked], &view(vec![remaining]));
        assert!(!verdict.is_safe());
    }

    #[test]
    fn memory_backed_empty_dir_is_fine() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let mut movable = pod("default", "cache", "100m", "128Mi");
        movable.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "tmpfs".to_owned(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let remaining = target(node("worker-2", &[], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[movable], &view(vec![remaining]));
        assert!(verdict.is_safe());
    }

    #[test]
    fn unknown_pvc_is_conservatively_local() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let mut blocked = pod("default", "db", "100m", "128Mi");
        blocked.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "data".to_owned(),
            persistent_volume_claim: Some(
                k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                    claim_name: "db-data".to_owned(),
                    ..Default::default()
                },
            ),
            ..Default::default()
        }]);
        let remaining = target(node("worker-2", &[], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[blocked], &view(vec![remaining]));
        assert!(!verdict.is_safe());
    }

    #[test]
    fn sole_system_controller_blocks_removal() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let critical = pod("kube-system", "coredns-abc123", "100m", "128Mi");
        let remaining = target(node("worker-2", &[], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[critical], &view(vec![remaining]));
        assert!(!verdict.is_safe());
    }

    #[test]
    fn replicated_system_controller_is_fine() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let critical = pod("kube-system", "coredns-abc123", "100m", "128Mi");
        let sibling = pod("kube-system", "coredns-def456", "100m", "128Mi");
        let remaining = target(node("worker-2", &[], "4", "8Gi"), vec![sibling]);
        let verdict = evaluator().evaluate(&candidate, &[critical], &view(vec![remaining]));
        assert!(verdict.is_safe());
    }

    #[test]
    fn untolerated_taint_blocks_placement() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let workload = pod("default", "web", "100m", "128Mi");
        let mut tainted = node("worker-2", &[], "4", "8Gi");
        tainted.spec.as_mut().unwrap().taints = Some(vec![Taint {
            key: "dedicated".to_owned(),
            value: Some("batch".to_owned()),
            effect: "NoSchedule".to_owned(),
            ..Default::default()
        }]);
        let verdict =
            evaluator().evaluate(&candidate, &[workload], &view(vec![target(tainted, vec![])]));
        assert!(!verdict.is_safe());
    }

    #[test]
    fn wildcard_toleration_matches_all_taints() {
        let taint = Taint {
            key: "anything".to_owned(),
            value: Some("at-all".to_owned()),
            effect: "NoExecute".to_owned(),
            ..Default::default()
        };
        let wildcard = Toleration {
            operator: Some("Exists".to_owned()),
            ..Default::default()
        };
        assert!(tolerates(&[taint], &[wildcard]));
    }

    #[test]
    fn toleration_matching_is_order_independent_and_idempotent() {
        let taints = vec![
            Taint {
                key: "a".to_owned(),
                value: Some("1".to_owned()),
                effect: "NoSchedule".to_owned(),
                ..Default::default()
            },
            Taint {
                key: "b".to_owned(),
                value: None,
                effect: "NoExecute".to_owned(),
                ..Default::default()
            },
        ];
        let tolerations = vec![
            Toleration {
                key: Some("b".to_owned()),
                operator: Some("Exists".to_owned()),
                ..Default::default()
            },
            Toleration {
                key: Some("a".to_owned()),
                operator: Some("Equal".to_owned()),
                value: Some("1".to_owned()),
                effect: Some("NoSchedule".to_owned()),
                ..Default::default()
            },
        ];
        let mut reversed_taints = taints.clone();
        reversed_taints.reverse();
        let mut duplicated = tolerations.clone();
        duplicated.extend(tolerations.clone());
        assert!(tolerates(&taints, &tolerations));
        assert!(tolerates(&reversed_taints, &tolerations));
        assert!(tolerates(&taints, &duplicated));
    }

    #[test]
    fn soft_taints_never_block() {
        let taint = Taint {
            key: "prefer".to_owned(),
            value: None,
            effect: "PreferNoSchedule".to_owned(),
            ..Default::default()
        };
        assert!(tolerates(&[taint], &[]));
    }

    #[test]
    fn node_selector_must_match() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let mut picky = pod("default", "gpu-job", "100m", "128Mi");
        picky.spec.as_mut().unwrap().node_selector = Some(
            vec![("gpu".to_owned(), "true".to_owned())].into_iter().collect(),
        );
        let plain = target(node("worker-2", &[], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[picky.clone()], &view(vec![plain]));
        assert!(!verdict.is_safe());

        let gpu = target(node("worker-3", &[("gpu", "true")], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[picky], &view(vec![gpu]));
        assert!(verdict.is_safe());
    }

    #[test]
    fn required_node_affinity_is_honored() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let mut pinned = pod("default", "zonal", "100m", "128Mi");
        pinned.spec.as_mut().unwrap().affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "zone".to_owned(),
                            operator: "In".to_owned(),
                            values: Some(vec!["a".to_owned()]),
                        }]),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let wrong_zone = target(node("worker-2", &[("zone", "b")], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[pinned.clone()], &view(vec![wrong_zone]));
        assert!(!verdict.is_safe());

        let right_zone = target(node("worker-3", &[("zone", "a")], "4", "8Gi"), vec![]);
        let verdict = evaluator().evaluate(&candidate, &[pinned], &view(vec![right_zone]));
        assert!(verdict.is_safe());
    }

    #[test]
    fn anti_affinity_sees_optimistic_placements() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let anti = |name: &str| -> Pod {
            let mut p = pod("default", name, "100m", "128Mi");
            p.metadata.labels = Some(
                vec![("app".to_owned(), "web".to_owned())].into_iter().collect(),
            );
            p.spec.as_mut().unwrap().affinity = Some(Affinity {
                pod_anti_affinity: Some(PodAntiAffinity {
                    required_during_scheduling_ignored_during_execution: Some(vec![
                        PodAffinityTerm {
                            label_selector: Some(LabelSelector {
                                match_labels: Some(
                                    vec![("app".to_owned(), "web".to_owned())]
                                        .into_iter()
                                        .collect(),
                                ),
                                ..Default::default()
                            }),
                            topology_key: "kubernetes.io/hostname".to_owned(),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            });
            p
        };
        // Two replicas, one free target: the second replica collides
        // with the first one's optimistic placement.
        let single = target(node("worker-2", &[], "16", "64Gi"), vec![]);
        let verdict = evaluator().evaluate(
            &candidate,
            &[anti("web-0"), anti("web-1")],
            &view(vec![single]),
        );
        assert!(!verdict.is_safe());

        // With two targets both replicas fit.
        let verdict = evaluator().evaluate(
            &candidate,
            &[anti("web-0"), anti("web-1")],
            &view(vec![
                target(node("worker-2", &[], "16", "64Gi"), vec![]),
                target(node("worker-3", &[], "16", "64Gi"), vec![]),
            ]),
        );
        assert!(verdict.is_safe());
    }

    #[test]
    fn aggregate_capacity_respects_headroom() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        // Target has 1 CPU; 15% headroom leaves 850m usable.
        let tight = target(node("worker-2", &[], "1", "8Gi"), vec![]);
        let big = pod("default", "heavy", "900m", "128Mi");
        let verdict = evaluator().evaluate(&candidate, &[big], &view(vec![tight]));
        assert!(!verdict.is_safe());

        let tight = target(node("worker-2", &[], "1", "8Gi"), vec![]);
        let fits = pod("default", "light", "800m", "128Mi");
        let verdict = evaluator().evaluate(&candidate, &[fits], &view(vec![tight]));
        assert!(verdict.is_safe());
    }

    #[test]
    fn daemonset_pods_do_not_count() {
        let candidate = node("worker-1", &[], "4", "8Gi");
        let mut ds_pod = pod("kube-system", "node-exporter-x1", "100m", "128Mi");
        ds_pod.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                kind: "DaemonSet".to_owned(),
                name: "node-exporter".to_owned(),
                ..Default::default()
            },
        ]);
        // No remaining targets at all, yet the verdict is safe because
        // the only pod stays behind with its DaemonSet.
        let verdict = evaluator().evaluate(&candidate, &[ds_pod], &view(vec![]));
        assert!(verdict.is_safe());
    }
}
