use futures::stream::StreamExt;
use kube::{
    api::ListParams, client::Client, runtime::controller::Action, runtime::Controller, Api,
    Resource, ResourceExt,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use vpsie_types::*;

use super::{actions, VpsNodeMetrics};
use crate::drain::DrainEngine;
use crate::util::{self, metrics::sanitize_label, Error, PROBE_INTERVAL, RETIRE_ANNOTATION};
use crate::vpsie::VpsieApi;

/// Context injected with each `reconcile` and `on_error` invocation.
pub struct ContextData {
    pub client: Client,
    pub vpsie: Arc<dyn VpsieApi>,
    pub drain: Arc<DrainEngine>,
    pub metrics: VpsNodeMetrics,

    /// Resync interval for quiescent resources.
    pub resync: std::time::Duration,
}

/// Entrypoint for the `VPSNode` controller.
pub async fn run(context: Arc<ContextData>) -> Result<(), Error> {
    let client = context.client.clone();
    info!("starting VPSNode controller");

    let crd_api: Api<VPSNode> = Api::all(client);
    Controller::new(crd_api, ListParams::default())
        .shutdown_on_signal()
        .run(reconcile, on_error, context)
        .for_each(|result| async move {
            if let Err(err) = result {
                error!(error = %err, "VPSNode reconciliation failed");
            }
        })
        .await;
    Ok(())
}

/// Action to be taken upon a `VPSNode` resource during reconciliation.
/// The lifecycle advances at most one phase per pass.
#[derive(Debug, PartialEq)]
enum VpsNodeAction {
    /// Initialize status and attach the finalizer.
    Pending,
    /// Create the backing machine.
    Provision,
    /// Poll the machine until it runs.
    AwaitRunning,
    /// Wait for cluster registration and stamp node identity.
    Join,
    /// Wait for the cluster node's Ready condition.
    AwaitReady,
    /// Drain ahead of deletion.
    Terminate,
    /// Delete the machine, the cluster node and the finalizer.
    Delete,
    /// Nothing to do.
    NoOp,
}

impl VpsNodeAction {
    fn as_str(&self) -> &'static str {
        match self {
            VpsNodeAction::Pending => "Pending",
            VpsNodeAction::Provision => "Provision",
            VpsNodeAction::AwaitRunning => "AwaitRunning",
            VpsNodeAction::Join => "Join",
            VpsNodeAction::AwaitReady => "AwaitReady",
            VpsNodeAction::Terminate => "Terminate",
            VpsNodeAction::Delete => "Delete",
            VpsNodeAction::NoOp => "NoOp",
        }
    }
}

fn phase(instance: &VPSNode) -> Option<VPSNodePhase> {
    instance.status.as_ref().and_then(|s| s.phase)
}

/// Decides the next step from the observed state. Deletion intent
/// (resource deletion or the retire annotation) routes through
/// Terminating so pods are always evicted before the machine dies.
fn determine_action(instance: &VPSNode) -> VpsNodeAction {
    let current = phase(instance);
    let deleting = instance.meta().deletion_timestamp.is_some();
    let retiring = instance
        .annotations()
        .get(RETIRE_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(false);

    if deleting || retiring {
        return match current {
            // Never provisioned anything: clean up bookkeeping only.
            None | Some(VPSNodePhase::Pending) => VpsNodeAction::Delete,
            Some(VPSNodePhase::Deleting) => VpsNodeAction::Delete,
            Some(VPSNodePhase::Failed) => {
                if deleting {
                    VpsNodeAction::Delete
                } else {
                    VpsNodeAction::NoOp
                }
            }
            Some(VPSNodePhase::Terminating) => VpsNodeAction::Terminate,
            // Anything in between still owns a machine; drain first.
            Some(_) => VpsNodeAction::Terminate,
        };
    }

    match current {
        None => VpsNodeAction::Pending,
        Some(VPSNodePhase::Pending) => VpsNodeAction::Provision,
        Some(VPSNodePhase::Provisioning) => VpsNodeAction::AwaitRunning,
        Some(VPSNodePhase::Provisioned) => VpsNodeAction::Join,
        Some(VPSNodePhase::Joining) => VpsNodeAction::AwaitReady,
        Some(VPSNodePhase::Ready) => VpsNodeAction::NoOp,
        Some(VPSNodePhase::Terminating) => VpsNodeAction::Terminate,
        Some(VPSNodePhase::Deleting) => VpsNodeAction::Delete,
        Some(VPSNodePhase::Failed) => VpsNodeAction::NoOp,
    }
}

async fn reconcile(instance: Arc<VPSNode>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = match instance.namespace() {
        Some(namespace) => namespace,
        None => {
            return Err(Error::UserInputError(
                "expected VPSNode resource to be namespaced".to_owned(),
            ));
        }
    };
    let name = instance.name_any();

    context
        .metrics
        .controller
        .reconcile_counter
        .with_label_values(&[&sanitize_label(&name), &sanitize_label(&namespace)])
        .inc();

    let action = determine_action(&instance);
    if action != VpsNodeAction::NoOp {
        info!(node = %name, phase = ?phase(&instance), action = action.as_str(), "reconciling VPSNode");
    }
    context
        .metrics
        .controller
        .action_counter
        .with_label_values(&[
            &sanitize_label(&name),
            &sanitize_label(&namespace),
            action.as_str(),
        ])
        .inc();
    let timer = context
        .metrics
        .controller
        .reconcile_histogram
        .with_label_values(&[
            &sanitize_label(&name),
            &sanitize_label(&namespace),
            action.as_str(),
        ])
        .start_timer();

    let result = perform(&action, &instance, &context, &namespace).await;
    timer.observe_duration();

    match result {
        Ok(action) => Ok(action),
        // A status conflict is a stale read, not a failure: requeue to
        // observe the new version.
        Err(Error::KubeError { source }) if util::is_conflict(&source) => {
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(err) if err.is_transient() => Err(err),
        Err(err) => {
            // Fatal for this node only; siblings keep reconciling.
            error!(node = %name, error = %err, "VPSNode entered Failed");
            actions::fail(client, &context.metrics, &instance, &err).await?;
            Ok(Action::await_change())
        }
    }
}

async fn perform(
    action: &VpsNodeAction,
    instance: &VPSNode,
    context: &ContextData,
    namespace: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();
    match action {
        VpsNodeAction::Pending => {
            actions::pending(client, &context.metrics, instance, namespace).await?;
            Ok(Action::requeue(Duration::ZERO))
        }
        VpsNodeAction::Provision => {
            let group = owning_group(client.clone(), instance, namespace).await?;
            actions::provision(
                client,
                context.vpsie.as_ref(),
                &context.metrics,
                instance,
                group.as_ref(),
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        VpsNodeAction::AwaitRunning => {
            let advanced =
                actions::await_running(client, context.vpsie.as_ref(), &context.metrics, instance)
                    .await?;
            if advanced {
                Ok(Action::requeue(Duration::ZERO))
            } else {
                Ok(Action::requeue(Duration::from_secs(10)))
            }
        }
        VpsNodeAction::Join => {
            let advanced = actions::join_cluster(client, &context.metrics, instance).await?;
            if advanced {
                Ok(Action::requeue(Duration::ZERO))
            } else {
                Ok(Action::requeue(Duration::from_secs(10)))
            }
        }
        VpsNodeAction::AwaitReady => {
            let advanced = actions::await_ready(client, &context.metrics, instance).await?;
            if advanced {
                Ok(Action::requeue(PROBE_INTERVAL))
            } else {
                Ok(Action::requeue(Duration::from_secs(10)))
            }
        }
        VpsNodeAction::Terminate => {
            // One phase step per pass: first reach Terminating, then a
            // later pass drains and moves on to Deleting.
            if phase(instance) != Some(VPSNodePhase::Terminating) {
                actions::advance_phase(
                    client,
                    &context.metrics,
                    instance,
                    VPSNodePhase::Terminating,
                    crate::util::messages::TERMINATING,
                    |_| {},
                )
                .await?;
            } else {
                actions::terminate(client, context.drain.as_ref(), &context.metrics, instance)
                    .await?;
            }
            Ok(Action::requeue(Duration::ZERO))
        }
        VpsNodeAction::Delete => {
            actions::delete(client, context.vpsie.as_ref(), instance, namespace).await?;
            Ok(Action::await_change())
        }
        VpsNodeAction::NoOp => Ok(Action::requeue(context.resync)),
    }
}

/// Fetches the owning NodeGroup for offering fall-through. A missing
/// group is not fatal; provisioning then only tries the spec'd
/// offering.
async fn owning_group(
    client: Client,
    instance: &VPSNode,
    namespace: &str,
) -> Result<Option<NodeGroup>, Error> {
    let api: Api<NodeGroup> = Api::namespaced(client, namespace);
    match api.get(&instance.spec.node_group).await {
        Ok(group) => Ok(Some(group)),
        Err(err) if util::is_not_found(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Requeue policy on errors: transient classes back off briefly, auth
/// problems surface slowly, the rest at a middling pace.
fn on_error(instance: Arc<VPSNode>, error: &Error, _context: Arc<ContextData>) -> Action {
    error!(node = %instance.name_any(), error = %error, "reconciliation error");
    let delay = match error {
        Error::VpsieError { source } => match source {
            crate::vpsie::VpsieError::Unauthorized | crate::vpsie::VpsieError::Forbidden => {
                Duration::from_secs(300)
            }
            err if err.is_transient() => Duration::from_secs(15),
            _ => Duration::from_secs(60),
        },
        err if err.is_transient() => Duration::from_secs(15),
        _ => Duration::from_secs(60),
    };
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn instance(phase: Option<VPSNodePhase>, retiring: bool, deleting: bool) -> VPSNode {
        VPSNode {
            metadata: ObjectMeta {
                name: Some("ng-a-ab12c".to_owned()),
                namespace: Some("default".to_owned()),
                annotations: retiring.then(|| {
                    vec![(RETIRE_ANNOTATION.to_owned(), "true".to_owned())]
                        .into_iter()
                        .collect()
                }),
                deletion_timestamp: deleting.then(|| {
                    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                        "2026-03-01T00:00:00Z".parse().unwrap(),
                    )
                }),
                ..Default::default()
            },
            spec: Default::default(),
            status: phase.map(|p| VPSNodeStatus {
                phase: Some(p),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn lifecycle_advances_one_step_at_a_time() {
        assert_eq!(determine_action(&instance(None, false, false)), VpsNodeAction::Pending);
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Pending), false, false)),
            VpsNodeAction::Provision
        );
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Provisioning), false, false)),
            VpsNodeAction::AwaitRunning
        );
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Provisioned), false, false)),
            VpsNodeAction::Join
        );
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Joining), false, false)),
            VpsNodeAction::AwaitReady
        );
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Ready), false, false)),
            VpsNodeAction::NoOp
        );
    }

    #[test]
    fn retire_annotation_routes_through_terminating() {
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Ready), true, false)),
            VpsNodeAction::Terminate
        );
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Terminating), true, false)),
            VpsNodeAction::Terminate
        );
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Deleting), true, false)),
            VpsNodeAction::Delete
        );
    }

    #[test]
    fn deletion_of_an_unprovisioned_node_skips_the_drain() {
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Pending), false, true)),
            VpsNodeAction::Delete
        );
        assert_eq!(determine_action(&instance(None, false, true)), VpsNodeAction::Delete);
    }

    #[test]
    fn mid_provisioning_deletion_still_drains_first() {
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Provisioned), false, true)),
            VpsNodeAction::Terminate
        );
    }

    #[test]
    fn failed_is_terminal_until_deleted() {
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Failed), false, false)),
            VpsNodeAction::NoOp
        );
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Failed), true, false)),
            VpsNodeAction::NoOp
        );
        // Deleting a Failed resource still routes through cloud cleanup.
        assert_eq!(
            determine_action(&instance(Some(VPSNodePhase::Failed), false, true)),
            VpsNodeAction::Delete
        );
    }
}
