use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::time::Duration;
use vpsie_types::{group_conditions, get_condition, NodeGroup};

use super::cost::{CostComparison, OfferingCost, HOURS_PER_MONTH};
use crate::scaledown::policy::within_window;
use crate::scaledown::safety::{is_evictable, label_selector_matches};

/// Weight of realized monthly savings in the candidate score.
const SCORE_SAVINGS: f64 = 1.0;

/// Weight of node age (days since creation) in the candidate score.
const SCORE_AGE: f64 = 0.1;

/// Weight subtracting current utilization from the candidate score.
const SCORE_UTILIZATION: f64 = 0.5;

/// Recommendation produced by the analyzer.
#[derive(Clone, Debug, PartialEq)]
pub enum RecommendedAction {
    Proceed,
    Postpone { reason: String },
    Reject { reason: String },
    NeedsReview { reason: String },
}

/// Risk classification of migrating one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    fn penalty(self) -> f64 {
        match self {
            RiskTier::Low => 0.0,
            RiskTier::Medium => 10.0,
            RiskTier::High => 25.0,
        }
    }
}

/// One node worth migrating to a cheaper offering.
#[derive(Clone, Debug)]
pub struct RebalanceCandidate {
    /// Name of the VPSNode (and the cluster node) to replace.
    pub node_name: String,

    pub current_offering: String,
    pub target_offering: String,
    pub monthly_savings: f64,
    pub risk: RiskTier,
    pub priority_score: f64,
}

/// Outcome of one pre-flight check category.
#[derive(Clone, Debug)]
pub struct CheckOutcome {
    pub category: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Full analysis of one group.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub group: String,
    pub action: RecommendedAction,
    pub candidates: Vec<RebalanceCandidate>,
    pub checks: Vec<CheckOutcome>,
}

/// Everything the analyzer needs, gathered up-front by the caller so
/// the analysis itself is deterministic and unit-testable.
pub struct AnalyzerInput<'a> {
    pub group: &'a NodeGroup,

    /// The group's nodes with their pods and, where known, their
    /// current offering (from the owned-node summaries).
    pub nodes: Vec<(Node, Vec<Pod>, String)>,

    pub cluster_ready_nodes: usize,
    pub cluster_total_nodes: usize,

    pub pdbs: &'a [PodDisruptionBudget],

    /// Current prices, keyed by offering id.
    pub costs: &'a HashMap<String, OfferingCost>,

    /// Mean utilization percent per node, where tracked.
    pub utilization: &'a HashMap<String, f64>,

    pub last_rebalance: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Tunables for the analyzer.
#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    /// Minimum percentage of Ready cluster nodes required to touch
    /// anything.
    pub min_healthy_percent: f64,

    /// Minimum interval between rebalances of the same group.
    pub cooldown: Duration,

    /// Optional maintenance window (minutes since midnight) outside of
    /// which plans are postponed.
    pub maintenance_window: Option<(u32, u32)>,

    /// Savings below this per month are not worth the churn.
    pub min_monthly_savings: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            min_healthy_percent: 75.0,
            cooldown: Duration::from_secs(3600),
            maintenance_window: None,
            min_monthly_savings: 1.0,
        }
    }
}

/// Identifies nodes that can move to cheaper offerings and runs the
/// pre-flight checks gating a plan. All five categories must pass for
/// a `Proceed`.
pub struct RebalanceAnalyzer {
    config: AnalyzerConfig,
}

impl RebalanceAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        RebalanceAnalyzer { config }
    }

    pub fn analyze(&self, input: &AnalyzerInput<'_>) -> Analysis {
        let group_name = input.group.name_any();
        let mut checks = Vec::new();

        // Category 1: cluster health.
        let healthy_percent = if input.cluster_total_nodes == 0 {
            0.0
        } else {
            input.cluster_ready_nodes as f64 / input.cluster_total_nodes as f64 * 100.0
        };
        let cluster_ok = healthy_percent >= self.config.min_healthy_percent;
        checks.push(CheckOutcome {
            category: "cluster-health",
            passed: cluster_ok,
            detail: format!("{:.0}% of nodes ready", healthy_percent),
        });
        if !cluster_ok {
            return Analysis {
                group: group_name,
                action: RecommendedAction::Postpone {
                    reason: format!(
                        "cluster below {}% healthy nodes",
                        self.config.min_healthy_percent
                    ),
                },
                candidates: Vec::new(),
                checks,
            };
        }

        // Category 2: group health. Never shrink the safety margin of
        // a group already at its minimum or mid-scale.
        let status = input.group.status.clone().unwrap_or_default();
        let current = status.current_nodes.unwrap_or(0);
        let desired = status.desired_nodes.unwrap_or(current);
        let scaling = desired != current
            || status
                .conditions
                .as_deref()
                .and_then(|c| get_condition(c, group_conditions::SCALING))
                .map(|c| c.is_true())
                .unwrap_or(false);
        let group_ok = current > input.group.spec.min_nodes && !scaling;
        checks.push(CheckOutcome {
            category: "group-health",
            passed: group_ok,
            detail: format!("current={} desired={} min={}", current, desired, input.group.spec.min_nodes),
        });
        if !group_ok {
            return Analysis {
                group: group_name,
                action: RecommendedAction::Postpone {
                    reason: "group at minimum size or mid-scale".to_owned(),
                },
                candidates: Vec::new(),
                checks,
            };
        }

        // Category 5 (timing) is cheap, so it runs before the per-node
        // work.
        let minute_of_day = {
            use chrono::Timelike;
            input.now.time().hour() * 60 + input.now.time().minute()
        };
        let in_window = self
            .config
            .maintenance_window
            .map(|(start, end)| within_window(minute_of_day, start, end))
            .unwrap_or(true);
        let cooled_down = input
            .last_rebalance
            .map(|last| {
                input.now.signed_duration_since(last)
                    >= chrono::Duration::from_std(self.config.cooldown)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600))
            })
            .unwrap_or(true);
        checks.push(CheckOutcome {
            category: "timing",
            passed: in_window && cooled_down,
            detail: format!("in_window={} cooled_down={}", in_window, cooled_down),
        });
        if !(in_window && cooled_down) {
            return Analysis {
                group: group_name,
                action: RecommendedAction::Postpone {
                    reason: "outside the maintenance window or inside the cooldown".to_owned(),
                },
                candidates: Vec::new(),
                checks,
            };
        }

        // Candidate discovery plus categories 3 (PDB) and 4 (local
        // storage), applied per node.
        let mut candidates = Vec::new();
        let mut skipped_storage = Vec::new();
        let mut skipped_pdb = Vec::new();
        for (node, pods, offering_id) in &input.nodes {
            let node_name = node.name_any();
            let current_cost = match input.costs.get(offering_id) {
                Some(cost) => cost,
                None => continue,
            };
            let target = match cheaper_equivalent(current_cost, input.costs) {
                Some(target) => target,
                None => continue,
            };
            if target.monthly_saving < self.config.min_monthly_savings {
                continue;
            }

            if let Some(pod) = pods.iter().filter(|p| is_evictable(p)).find(|p| has_local_storage(p)) {
                skipped_storage.push(format!("{}: pod {} has local storage", node_name, pod.name_any()));
                continue;
            }
            if let Some(pod) = pods
                .iter()
                .filter(|p| is_evictable(p))
                .find(|p| pdb_blocks_eviction(p, input.pdbs))
            {
                skipped_pdb.push(format!("{}: pod {} has no disruption budget left", node_name, pod.name_any()));
                continue;
            }

            let utilization = input.utilization.get(&node_name).copied().unwrap_or(50.0);
            let risk = risk_tier(utilization);
            let age_days = node
                .meta()
                .creation_timestamp
                .as_ref()
                .map(|t| (input.now - t.0).num_days().max(0) as f64)
                .unwrap_or(0.0);
            let priority_score = target.monthly_saving * SCORE_SAVINGS + age_days * SCORE_AGE
                - utilization * SCORE_UTILIZATION
                - risk.penalty();
            candidates.push(RebalanceCandidate {
                node_name,
                current_offering: offering_id.clone(),
                target_offering: target.offering_id.clone(),
                monthly_savings: target.monthly_saving,
                risk,
                priority_score,
            });
        }
        checks.push(CheckOutcome {
            category: "disruption-budgets",
            passed: skipped_pdb.is_empty(),
            detail: skipped_pdb.join("; "),
        });
        checks.push(CheckOutcome {
            category: "local-storage",
            passed: skipped_storage.is_empty(),
            detail: skipped_storage.join("; "),
        });

        candidates.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_name.cmp(&b.node_name))
        });

        let action = if candidates.is_empty() {
            let mut skipped = skipped_storage;
            skipped.extend(skipped_pdb);
            RecommendedAction::Reject {
                reason: if skipped.is_empty() {
                    "no node has a cheaper equivalent offering".to_owned()
                } else {
                    format!("all candidates skipped: {}", skipped.join("; "))
                },
            }
        } else if candidates.iter().any(|c| c.risk == RiskTier::High) {
            RecommendedAction::NeedsReview {
                reason: "high-utilization candidates require operator review".to_owned(),
            }
        } else {
            RecommendedAction::Proceed
        };

        Analysis {
            group: group_name,
            action,
            candidates,
            checks,
        }
    }
}

/// The best cheaper offering with at least the current CPU and memory.
fn cheaper_equivalent(
    current: &OfferingCost,
    costs: &HashMap<String, OfferingCost>,
) -> Option<CostComparison> {
    costs
        .values()
        .filter(|cost| {
            cost.offering_id != current.offering_id
                && cost.cpu >= current.cpu
                && cost.memory_mb >= current.memory_mb
                && cost.hourly_price < current.hourly_price
        })
        .map(|cost| {
            let hourly = current.hourly_price - cost.hourly_price;
            CostComparison {
                offering_id: cost.offering_id.clone(),
                hourly_saving: hourly,
                monthly_saving: hourly * HOURS_PER_MONTH,
            }
        })
        .max_by(|a, b| {
            a.monthly_saving
                .partial_cmp(&b.monthly_saving)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.offering_id.cmp(&a.offering_id))
        })
}

fn risk_tier(utilization_percent: f64) -> RiskTier {
    if utilization_percent < 30.0 {
        RiskTier::Low
    } else if utilization_percent < 60.0 {
        RiskTier::Medium
    } else {
        RiskTier::High
    }
}

fn has_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes.iter().any(|v| {
                v.host_path.is_some()
                    || v.persistent_volume_claim.is_some()
                    || v.empty_dir
                        .as_ref()
                        .map(|e| e.medium.as_deref() != Some("Memory"))
                        .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// True if some matching budget has no disruptions left.
fn pdb_blocks_eviction(pod: &Pod, pdbs: &[PodDisruptionBudget]) -> bool {
    pdbs.iter().any(|pdb| {
        if pdb.metadata.namespace != pod.metadata.namespace {
            return false;
        }
        let selector = match pdb.spec.as_ref().and_then(|s| s.selector.as_ref()) {
            Some(selector) => selector,
            None => return false,
        };
        if !label_selector_matches(selector, pod.labels()) {
            return false;
        }
        pdb.status
            .as_ref()
            .map(|s| s.disruptions_allowed <= 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::api::policy::v1::{PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use vpsie_types::{NodeGroupSpec, NodeGroupStatus};

    fn cost(id: &str, cpu: i32, memory_mb: i64, price: f64) -> (String, OfferingCost) {
        (
            id.to_owned(),
            OfferingCost {
                offering_id: id.to_owned(),
                hourly_price: price,
                cpu,
                memory_mb,
                disk_gb: 80,
                datacenter: None,
                last_updated: Utc::now(),
            },
        )
    }

    fn group(min: i32, current: i32) -> NodeGroup {
        NodeGroup {
            metadata: ObjectMeta {
                name: Some("ng-a".to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            spec: NodeGroupSpec {
                min_nodes: min,
                max_nodes: 10,
                offerings: vec!["large".to_owned()],
                datacenter: "dc1".to_owned(),
                image: "ubuntu".to_owned(),
                kubernetes_version: "1.22.4".to_owned(),
                ..Default::default()
            },
            status: Some(NodeGroupStatus {
                current_nodes: Some(current),
                desired_nodes: Some(current),
                ..Default::default()
            }),
        }
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn costs() -> HashMap<String, OfferingCost> {
        vec![
            cost("large", 4, 8192, 0.05),
            cost("value", 4, 8192, 0.03),
            cost("small", 2, 4096, 0.01),
        ]
        .into_iter()
        .collect()
    }

    fn base_input<'a>(
        group: &'a NodeGroup,
        nodes: Vec<(Node, Vec<Pod>, String)>,
        pdbs: &'a [PodDisruptionBudget],
        costs: &'a HashMap<String, OfferingCost>,
        utilization: &'a HashMap<String, f64>,
    ) -> AnalyzerInput<'a> {
        AnalyzerInput {
            group,
            nodes,
            cluster_ready_nodes: 10,
            cluster_total_nodes: 10,
            pdbs,
            costs,
            utilization,
            last_rebalance: None,
            now: now(),
        }
    }

    #[test]
    fn finds_cheaper_equivalent_and_proceeds() {
        let group = group(1, 3);
        let costs = costs();
        let utilization: HashMap<String, f64> =
            vec![("worker-1".to_owned(), 10.0)].into_iter().collect();
        let input = base_input(
            &group,
            vec![(node("worker-1"), vec![], "large".to_owned())],
            &[],
            &costs,
            &utilization,
        );
        let analysis = RebalanceAnalyzer::new(AnalyzerConfig::default()).analyze(&input);
        assert_eq!(analysis.action, RecommendedAction::Proceed);
        assert_eq!(analysis.candidates.len(), 1);
        let candidate = &analysis.candidates[0];
        // `value` has the same shape as `large`; `small` is cheaper but
        // too small to qualify.
        assert_eq!(candidate.target_offering, "value");
        assert!((candidate.monthly_savings - 0.02 * HOURS_PER_MONTH).abs() < 1e-9);
        assert_eq!(candidate.risk, RiskTier::Low);
    }

    #[test]
    fn unhealthy_cluster_postpones() {
        let group = group(1, 3);
        let costs = costs();
        let utilization = HashMap::new();
        let mut input = base_input(
            &group,
            vec![(node("worker-1"), vec![], "large".to_owned())],
            &[],
            &costs,
            &utilization,
        );
        input.cluster_ready_nodes = 6;
        input.cluster_total_nodes = 10;
        let analysis = RebalanceAnalyzer::new(AnalyzerConfig::default()).analyze(&input);
        assert!(matches!(analysis.action, RecommendedAction::Postpone { .. }));
    }

    #[test]
    fn group_at_minimum_postpones() {
        let group = group(3, 3);
        let costs = costs();
        let utilization = HashMap::new();
        let input = base_input(
            &group,
            vec![(node("worker-1"), vec![], "large".to_owned())],
            &[],
            &costs,
            &utilization,
        );
        let analysis = RebalanceAnalyzer::new(AnalyzerConfig::default()).analyze(&input);
        assert!(matches!(analysis.action, RecommendedAction::Postpone { .. }));
    }

    #[test]
    fn exhausted_pdb_skips_the_candidate() {
        let group = group(1, 3);
        let costs = costs();
        let utilization = HashMap::new();
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_owned()),
                namespace: Some("default".to_owned()),
                labels: Some(vec![("app".to_owned(), "web".to_owned())].into_iter().collect()),
                ..Default::default()
            },
            ..Default::default()
        };
        pod.spec = Some(Default::default());
        let pdb = PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some("web".to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(
                        vec![("app".to_owned(), "web".to_owned())].into_iter().collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                disruptions_allowed: 0,
                ..Default::default()
            }),
        };
        let pdbs = vec![pdb];
        let input = base_input(
            &group,
            vec![(node("worker-1"), vec![pod], "large".to_owned())],
            &pdbs,
            &costs,
            &utilization,
        );
        let analysis = RebalanceAnalyzer::new(AnalyzerConfig::default()).analyze(&input);
        assert!(matches!(analysis.action, RecommendedAction::Reject { .. }));
        assert!(analysis.candidates.is_empty());
    }

    #[test]
    fn hot_nodes_need_review() {
        let group = group(1, 3);
        let costs = costs();
        let utilization: HashMap<String, f64> =
            vec![("worker-1".to_owned(), 85.0)].into_iter().collect();
        let input = base_input(
            &group,
            vec![(node("worker-1"), vec![], "large".to_owned())],
            &[],
            &costs,
            &utilization,
        );
        let analysis = RebalanceAnalyzer::new(AnalyzerConfig::default()).analyze(&input);
        assert!(matches!(analysis.action, RecommendedAction::NeedsReview { .. }));
    }

    #[test]
    fn already_cheapest_rejects() {
        let group = group(1, 3);
        let costs = costs();
        let utilization = HashMap::new();
        let input = base_input(
            &group,
            vec![(node("worker-1"), vec![], "value".to_owned())],
            &[],
            &costs,
            &utilization,
        );
        let analysis = RebalanceAnalyzer::new(AnalyzerConfig::default()).analyze(&input);
        assert!(matches!(analysis.action, RecommendedAction::Reject { .. }));
    }
}
