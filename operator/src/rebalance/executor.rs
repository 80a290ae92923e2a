use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::{strategy::FixedInterval, RetryIf};
use tracing::{info, warn};
use vpsie_types::{
    group_conditions, set_condition, Condition, NodeGroup, VPSNode, VPSNodePhase,
};

use super::metrics::RebalanceMetrics;
use super::planner::{Batch, Plan, Strategy};
use crate::drain::DrainEngine;
use crate::nodegroups::actions::{new_vpsnode, node_name};
use crate::util::{
    self, events, patch::patch_status, Error, REBALANCE_PAUSED_ANNOTATION, RETIRE_ANNOTATION,
};

/// Deadline for rollback work that must run regardless of the caller.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Executor tunables.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Poll interval while waiting on nodes and pods.
    pub poll_interval: Duration,

    /// Deadline for the moved workloads to become healthy after a
    /// batch's drains.
    pub health_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            poll_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(600),
        }
    }
}

/// Terminal state of one plan execution.
#[derive(Clone, Debug, PartialEq)]
pub enum PlanOutcome {
    Completed { batches: usize },
    Paused { batch: usize, reason: String },
}

/// Executes a plan batch by batch with health gates between steps.
/// A failing batch is rolled back (replacements terminated, originals
/// uncordoned) and parks the plan; completed batches stay.
pub struct RebalanceExecutor {
    client: Client,
    drain: Arc<DrainEngine>,
    metrics: RebalanceMetrics,
    config: ExecutorConfig,
}

impl RebalanceExecutor {
    pub fn new(
        client: Client,
        drain: Arc<DrainEngine>,
        metrics: RebalanceMetrics,
        config: ExecutorConfig,
    ) -> Self {
        RebalanceExecutor {
            client,
            drain,
            metrics,
            config,
        }
    }

    pub async fn execute(&self, plan: &Plan, group: &NodeGroup) -> Result<PlanOutcome, Error> {
        let recorder = events::recorder(self.client.clone(), group);
        let api: Api<VPSNode> = Api::namespaced(self.client.clone(), &plan.namespace);

        for batch in &plan.batches {
            // A batch whose originals are all gone already ran; this is
            // what lets a manual resume continue where a pause left off.
            if self.batch_already_done(&api, batch).await? {
                info!(group = %plan.group, batch = batch.id, "skipping completed batch");
                continue;
            }
            let mut created: Vec<String> = Vec::new();
            match self.execute_batch(plan, batch, group, &mut created).await {
                Ok(()) => {
                    self.metrics.batches_completed.inc();
                    events::normal(
                        &recorder,
                        "Rebalance",
                        "BatchCompleted",
                        format!("batch {} of plan for {} completed", batch.id, plan.group),
                    )
                    .await;
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!(group = %plan.group, batch = batch.id, error = %reason, "batch failed, rolling back");
                    self.rollback_batch(plan, batch, created, group).await;
                    events::warning(
                        &recorder,
                        "Rebalance",
                        "PlanPaused",
                        format!("batch {} failed and was rolled back: {}", batch.id, reason),
                    )
                    .await;
                    self.metrics
                        .outcomes
                        .with_label_values(&["paused"])
                        .inc();
                    return Ok(PlanOutcome::Paused {
                        batch: batch.id,
                        reason,
                    });
                }
            }
        }
        self.metrics.outcomes.with_label_values(&["completed"]).inc();
        Ok(PlanOutcome::Completed {
            batches: plan.batches.len(),
        })
    }

    async fn batch_already_done(&self, api: &Api<VPSNode>, batch: &Batch) -> Result<bool, Error> {
        for node in &batch.nodes {
            match api.get(&node.node_name).await {
                Ok(_) => return Ok(false),
                Err(err) if util::is_not_found(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    async fn execute_batch(
        &self,
        plan: &Plan,
        batch: &Batch,
        group: &NodeGroup,
        created: &mut Vec<String>,
    ) -> Result<(), Error> {
        let api: Api<VPSNode> = Api::namespaced(self.client.clone(), &plan.namespace);
        let deadline = Instant::now() + batch.timeout;

        // 1. Provision replacements and wait until they are in service.
        for node in &batch.nodes {
            let name = node_name(&plan.group);
            let replacement = new_vpsnode(group, &name, &node.target_offering);
            api.create(&Default::default(), &replacement).await?;
            created.push(name);
        }
        for name in created.iter() {
            self.wait_for_phase(&api, name, VPSNodePhase::Ready, deadline)
                .await?;
        }

        // 2. Cordon originals before touching their workloads.
        for node in &batch.nodes {
            self.drain.cordon(&node.node_name, true).await?;
        }

        // 3. Drain originals.
        for node in &batch.nodes {
            self.drain.drain(&node.node_name).await?;
        }

        // 4. Verify the moved workloads are healthy on the new nodes.
        self.verify_workloads(created, deadline).await?;

        // 5. Retire originals through the node lifecycle. Blue-green
        // still reaches this point only after every replacement in the
        // single batch is Ready, so no old node dies before its
        // replacement is in service.
        for node in &batch.nodes {
            let patch = json!({
                "metadata": { "annotations": { RETIRE_ANNOTATION: "true" } }
            });
            match api
                .patch(&node.node_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => {}
                Err(err) if util::is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if plan.strategy == Strategy::BlueGreen {
            info!(group = %plan.group, "blue-green cutover complete");
        }
        Ok(())
    }

    async fn wait_for_phase(
        &self,
        api: &Api<VPSNode>,
        name: &str,
        phase: VPSNodePhase,
        deadline: Instant,
    ) -> Result<(), Error> {
        let attempts = (deadline.saturating_duration_since(Instant::now()).as_secs()
            / self.config.poll_interval.as_secs().max(1))
        .max(1) as usize;
        let strategy = FixedInterval::new(self.config.poll_interval).take(attempts);
        RetryIf::spawn(
            strategy,
            || {
                let api = api.clone();
                async move {
                    let current = api.get(name).await?;
                    match current.status.as_ref().and_then(|s| s.phase) {
                        Some(p) if p == phase => Ok(()),
                        Some(VPSNodePhase::Failed) => Err(Error::FatalError(format!(
                            "replacement node {} failed to provision",
                            name
                        ))),
                        other => Err(Error::TransientError(format!(
                            "replacement node {} is {:?}, waiting for {}",
                            name, other, phase
                        ))),
                    }
                }
            },
            |err: &Error| !matches!(err, Error::FatalError(_)),
        )
        .await
    }

    /// All pods that landed on the replacement nodes must be running
    /// and ready before the originals are retired.
    async fn verify_workloads(&self, nodes: &[String], deadline: Instant) -> Result<(), Error> {
        let pod_api: Api<Pod> = Api::all(self.client.clone());
        let health_deadline =
            deadline.min(Instant::now() + self.config.health_timeout);
        loop {
            let mut unhealthy = 0usize;
            for node in nodes {
                let pods = pod_api
                    .list(&ListParams::default().fields(&format!("spec.nodeName={}", node)))
                    .await?;
                unhealthy += pods
                    .items
                    .iter()
                    .filter(|pod| !pod_is_healthy(pod))
                    .count();
            }
            if unhealthy == 0 {
                return Ok(());
            }
            if Instant::now() + self.config.poll_interval >= health_deadline {
                return Err(Error::TransientError(format!(
                    "{} moved pods still unhealthy at the health deadline",
                    unhealthy
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Undoes a failed batch: terminates the replacements provisioned
    /// for it, uncordons the originals, and parks the plan behind the
    /// pause annotation. Runs in a spawned task with its own deadline
    /// so caller cancellation cannot leave nodes cordoned.
    async fn rollback_batch(
        &self,
        plan: &Plan,
        batch: &Batch,
        created: Vec<String>,
        group: &NodeGroup,
    ) {
        self.metrics.rollbacks.inc();
        let client = self.client.clone();
        let drain = self.drain.clone();
        let namespace = plan.namespace.clone();
        let originals: Vec<String> = batch.nodes.iter().map(|n| n.node_name.clone()).collect();
        let group = group.clone();
        let batch_id = batch.id;

        let handle = tokio::spawn(async move {
            let rollback = async {
                let api: Api<VPSNode> = Api::namespaced(client.clone(), &namespace);
                for name in &created {
                    if let Err(err) = api.delete(name, &Default::default()).await {
                        if !util::is_not_found(&err) {
                            warn!(node = %name, error = %err, "failed to terminate replacement");
                        }
                    }
                }
                for name in &originals {
                    if let Err(err) = drain.cordon(name, false).await {
                        warn!(node = %name, error = %err, "failed to uncordon original");
                    }
                }

                // Park the plan until the operator acknowledges.
                let group_api: Api<NodeGroup> =
                    Api::namespaced(client.clone(), &group.namespace().unwrap_or_default());
                let pause = json!({
                    "metadata": {
                        "annotations": { REBALANCE_PAUSED_ANNOTATION: format!("batch-{}", batch_id) }
                    }
                });
                if let Err(err) = group_api
                    .patch(&group.name_any(), &PatchParams::default(), &Patch::Merge(&pause))
                    .await
                {
                    warn!(group = %group.name_any(), error = %err, "failed to annotate paused plan");
                }
                let result = patch_status(client, &group, |status| {
                    let conditions = status.conditions.get_or_insert_with(Vec::new);
                    set_condition(
                        conditions,
                        Condition::new(
                            group_conditions::REBALANCING,
                            false,
                            "Paused",
                            &format!("rolled back at batch {}", batch_id),
                        ),
                    );
                })
                .await;
                if let Err(err) = result {
                    if !util::is_conflict(&err) {
                        warn!(group = %group.name_any(), error = %err, "failed to record paused condition");
                    }
                }
            };
            if tokio::time::timeout(ROLLBACK_TIMEOUT, rollback).await.is_err() {
                warn!("rollback timed out");
            }
        });
        let _ = handle.await;
    }
}

fn pod_is_healthy(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    match status.phase.as_deref() {
        // Finished pods do not block the health gate.
        Some("Succeeded") => return true,
        Some("Running") => {}
        _ => return false,
    }
    status
        .conditions
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_health_requires_running_and_ready() {
        use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
        let mut pod = Pod::default();
        assert!(!pod_is_healthy(&pod));

        pod.status = Some(PodStatus {
            phase: Some("Running".to_owned()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_owned(),
                status: "False".to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!pod_is_healthy(&pod));

        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".to_owned(),
            status: "True".to_owned(),
            ..Default::default()
        }]);
        assert!(pod_is_healthy(&pod));

        pod.status.as_mut().unwrap().phase = Some("Succeeded".to_owned());
        assert!(pod_is_healthy(&pod));
    }
}
