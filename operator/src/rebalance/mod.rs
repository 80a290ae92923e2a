pub mod analyzer;
pub mod cost;
pub mod executor;
pub mod metrics;
pub mod planner;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::{api::ListParams, Api, Client, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use vpsie_types::{NodeGroup, MANAGED_BY_LABEL, NODE_GROUP_LABEL};

use crate::scaledown::safety::node_is_ready;
use crate::scaledown::tracker::UtilizationTracker;
use crate::util::{
    events, metrics::sanitize_label, Error, LAST_REBALANCE_ANNOTATION,
    REBALANCE_PAUSED_ANNOTATION,
};
use analyzer::{AnalyzerInput, RebalanceAnalyzer, RecommendedAction};
use cost::CostCalculator;
use executor::{PlanOutcome, RebalanceExecutor};
use metrics::RebalanceMetrics;
use planner::PlannerConfig;

/// Wires the analyzer, planner and executor into one periodic pass
/// over a node group.
pub struct Rebalancer {
    client: Client,
    analyzer: RebalanceAnalyzer,
    executor: RebalanceExecutor,
    cost: Arc<CostCalculator>,
    tracker: Arc<UtilizationTracker>,
    planner_config: PlannerConfig,
    metrics: RebalanceMetrics,
}

impl Rebalancer {
    pub fn new(
        client: Client,
        analyzer: RebalanceAnalyzer,
        executor: RebalanceExecutor,
        cost: Arc<CostCalculator>,
        tracker: Arc<UtilizationTracker>,
        planner_config: PlannerConfig,
        metrics: RebalanceMetrics,
    ) -> Self {
        Rebalancer {
            client,
            analyzer,
            executor,
            cost,
            tracker,
            planner_config,
            metrics,
        }
    }

    /// One analyze → plan → execute pass over one group. A plan paused
    /// by a failed batch parks behind an annotation and is skipped
    /// until the operator clears it.
    pub async fn run_once(&self, group: &NodeGroup) -> Result<(), Error> {
        let group_name = group.name_any();
        if let Some(marker) = group.annotations().get(REBALANCE_PAUSED_ANNOTATION) {
            debug!(group = %group_name, %marker, "rebalance paused, waiting for operator acknowledgement");
            return Ok(());
        }

        let input_data = self.gather(group).await?;
        let analysis = self.analyzer.analyze(&AnalyzerInput {
            group,
            nodes: input_data.nodes,
            cluster_ready_nodes: input_data.cluster_ready_nodes,
            cluster_total_nodes: input_data.cluster_total_nodes,
            pdbs: &input_data.pdbs,
            costs: &input_data.costs,
            utilization: &input_data.utilization,
            last_rebalance: input_data.last_rebalance,
            now: Utc::now(),
        });

        let recorder = events::recorder(self.client.clone(), group);
        match &analysis.action {
            RecommendedAction::Proceed => {}
            RecommendedAction::Postpone { reason } => {
                debug!(group = %group_name, %reason, "rebalance postponed");
                return Ok(());
            }
            RecommendedAction::Reject { reason } => {
                debug!(group = %group_name, %reason, "rebalance rejected");
                return Ok(());
            }
            RecommendedAction::NeedsReview { reason } => {
                events::warning(
                    &recorder,
                    "Rebalance",
                    "NeedsReview",
                    format!("rebalance of {} needs review: {}", group_name, reason),
                )
                .await;
                return Ok(());
            }
        }

        let namespace = group.namespace().unwrap_or_default();
        let plan = match planner::plan(&analysis, &namespace, &self.planner_config) {
            Some(plan) => plan,
            None => return Ok(()),
        };
        self.metrics
            .plans
            .with_label_values(&[&plan.strategy.to_string()])
            .inc();
        self.metrics
            .monthly_savings
            .with_label_values(&[&sanitize_label(&group_name)])
            .set(plan.monthly_savings);
        events::normal(
            &recorder,
            "Rebalance",
            "PlanCreated",
            format!(
                "{} plan with {} batches, projected savings {:.2}/month",
                plan.strategy,
                plan.batches.len(),
                plan.monthly_savings
            ),
        )
        .await;

        match self.executor.execute(&plan, group).await? {
            PlanOutcome::Completed { batches } => {
                info!(group = %group_name, batches, "rebalance plan completed");
                let api: Api<NodeGroup> = Api::namespaced(self.client.clone(), &namespace);
                let stamp = serde_json::json!({
                    "metadata": {
                        "annotations": { LAST_REBALANCE_ANNOTATION: Utc::now().to_rfc3339() }
                    }
                });
                api.patch(
                    &group_name,
                    &kube::api::PatchParams::default(),
                    &kube::api::Patch::Merge(&stamp),
                )
                .await?;
                events::normal(
                    &recorder,
                    "Rebalance",
                    "PlanCompleted",
                    format!("all {} batches completed", batches),
                )
                .await;
            }
            PlanOutcome::Paused { batch, reason } => {
                info!(group = %group_name, batch, %reason, "rebalance plan paused");
            }
        }
        Ok(())
    }

    async fn gather(&self, group: &NodeGroup) -> Result<GatheredInput, Error> {
        let node_api: Api<Node> = Api::all(self.client.clone());
        let all_nodes = node_api.list(&ListParams::default()).await?;
        let cluster_total_nodes = all_nodes.items.len();
        let cluster_ready_nodes = all_nodes.items.iter().filter(|n| node_is_ready(n)).count();

        let pod_api: Api<Pod> = Api::all(self.client.clone());
        let all_pods = pod_api.list(&ListParams::default()).await?;
        let mut pods_by_node: HashMap<String, Vec<Pod>> = HashMap::new();
        for pod in all_pods {
            if let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                pods_by_node.entry(node_name).or_default().push(pod);
            }
        }

        // Offering per node comes from the owned-node summaries the
        // NodeGroup reconciler maintains.
        let offerings_by_node: HashMap<String, String> = group
            .status
            .as_ref()
            .and_then(|s| s.nodes.as_ref())
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|n| (n.name.clone(), n.offering.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let group_name = group.name_any();
        let nodes: Vec<(Node, Vec<Pod>, String)> = all_nodes
            .items
            .iter()
            .filter(|node| {
                node.labels().get(NODE_GROUP_LABEL) == Some(&group_name)
                    && node.labels().contains_key(MANAGED_BY_LABEL)
            })
            .filter_map(|node| {
                let name = node.name_any();
                offerings_by_node.get(&name).map(|offering| {
                    (
                        node.clone(),
                        pods_by_node.get(&name).cloned().unwrap_or_default(),
                        offering.clone(),
                    )
                })
            })
            .collect();

        let pdb_api: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        let pdbs = pdb_api.list(&ListParams::default()).await?.items;

        let costs = self.cost.all_costs().await?;

        let utilization: HashMap<String, f64> = nodes
            .iter()
            .filter_map(|(node, _, _)| {
                self.tracker.snapshot(&node.name_any()).map(|snapshot| {
                    (
                        node.name_any(),
                        (snapshot.cpu_mean + snapshot.memory_mean) / 2.0,
                    )
                })
            })
            .collect();

        let last_rebalance = group
            .annotations()
            .get(LAST_REBALANCE_ANNOTATION)
            .and_then(|v| v.parse::<DateTime<Utc>>().ok());

        Ok(GatheredInput {
            nodes,
            cluster_ready_nodes,
            cluster_total_nodes,
            pdbs,
            costs,
            utilization,
            last_rebalance,
        })
    }
}

struct GatheredInput {
    nodes: Vec<(Node, Vec<Pod>, String)>,
    cluster_ready_nodes: usize,
    cluster_total_nodes: usize,
    pdbs: Vec<PodDisruptionBudget>,
    costs: HashMap<String, cost::OfferingCost>,
    utilization: HashMap<String, f64>,
    last_rebalance: Option<DateTime<Utc>>,
}
