use futures::stream::StreamExt;
use kube::{
    api::ListParams, client::Client, runtime::controller::Action, runtime::Controller, Api,
    Resource, ResourceExt,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use vpsie_types::*;

use super::{actions, NodeGroupMetrics};
use crate::util::{self, events, metrics::sanitize_label, Error, PROBE_INTERVAL};

/// Context injected with each `reconcile` and `on_error` invocation.
pub struct ContextData {
    pub client: Client,
    pub metrics: NodeGroupMetrics,

    /// Resync interval for quiescent resources.
    pub resync: std::time::Duration,
}

/// Entrypoint for the `NodeGroup` controller.
pub async fn run(context: Arc<ContextData>) -> Result<(), Error> {
    let client = context.client.clone();
    info!("starting NodeGroup controller");

    let crd_api: Api<NodeGroup> = Api::all(client.clone());
    Controller::new(crd_api, ListParams::default())
        // Owned-node changes feed back into the group's status.
        .owns(Api::<VPSNode>::all(client), ListParams::default())
        .shutdown_on_signal()
        .run(reconcile, on_error, context)
        .for_each(|result| async move {
            if let Err(err) = result {
                error!(error = %err, "NodeGroup reconciliation failed");
            }
        })
        .await;
    Ok(())
}

/// Action to be taken upon a `NodeGroup` resource during
/// reconciliation.
#[derive(Debug, PartialEq)]
enum NodeGroupAction {
    /// Initialize status and attach the finalizer.
    Pending,
    /// Deletion branch: remove owned nodes, then the finalizer.
    Teardown,
    /// Surface a validation failure.
    Invalid(String),
    /// Create the deficit of VPSNodes.
    CreateNodes(usize),
    /// Bring the status subresource up to date.
    SyncStatus(Box<NodeGroupStatus>),
    /// The resource is in the desired state.
    NoOp,
}

impl NodeGroupAction {
    fn as_str(&self) -> &'static str {
        match self {
            NodeGroupAction::Pending => "Pending",
            NodeGroupAction::Teardown => "Teardown",
            NodeGroupAction::Invalid(_) => "Invalid",
            NodeGroupAction::CreateNodes(_) => "CreateNodes",
            NodeGroupAction::SyncStatus(_) => "SyncStatus",
            NodeGroupAction::NoOp => "NoOp",
        }
    }
}

/// Decides the next step. Scale-up creates nodes here; scale-down
/// never does — underutilized nodes arrive already drained through the
/// scale-down manager and leave through the VPSNode lifecycle, so this
/// controller only ever observes the shrinking population.
fn determine_action(group: &NodeGroup, owned: &[VPSNode]) -> NodeGroupAction {
    if group.meta().deletion_timestamp.is_some() {
        return NodeGroupAction::Teardown;
    }
    if group.status.is_none() {
        return NodeGroupAction::Pending;
    }
    if let Err(reason) = group.spec.validate() {
        return NodeGroupAction::Invalid(reason);
    }

    let computed = actions::compute_status(group, owned);
    let desired = computed.desired_nodes.unwrap_or(group.spec.min_nodes);
    let current = computed.current_nodes.unwrap_or(0);
    if desired > current {
        return NodeGroupAction::CreateNodes((desired - current) as usize);
    }

    let existing = group.status.clone().unwrap_or_default();
    if !actions::status_equal(&existing, &computed) {
        return NodeGroupAction::SyncStatus(Box::new(computed));
    }
    NodeGroupAction::NoOp
}

async fn reconcile(group: Arc<NodeGroup>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = match group.namespace() {
        Some(namespace) => namespace,
        None => {
            return Err(Error::UserInputError(
                "expected NodeGroup resource to be namespaced".to_owned(),
            ));
        }
    };
    let name = group.name_any();

    context
        .metrics
        .controller
        .reconcile_counter
        .with_label_values(&[&sanitize_label(&name), &sanitize_label(&namespace)])
        .inc();

    let owned = actions::list_owned(client.clone(), &group, &namespace).await?;
    let action = determine_action(&group, &owned);

    if action != NodeGroupAction::NoOp {
        info!(group = %name, action = action.as_str(), "reconciling NodeGroup");
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

    let result = perform(action, &group, &context, &namespace).await;
    timer.observe_duration();

    // Keep the population gauges current on every pass.
    if let Some(status) = group.status.as_ref() {
        let labels = [sanitize_label(&name), sanitize_label(&namespace)];
        let label_refs: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
        context
            .metrics
            .desired_nodes
            .with_label_values(&label_refs)
            .set(f64::from(status.desired_nodes.unwrap_or(0)));
        context
            .metrics
            .current_nodes
            .with_label_values(&label_refs)
            .set(f64::from(status.current_nodes.unwrap_or(0)));
        context
            .metrics
            .ready_nodes
            .with_label_values(&label_refs)
            .set(f64::from(status.ready_nodes.unwrap_or(0)));
    }

    match result {
        Ok(action) => Ok(action),
        // A status conflict means a concurrent writer won; re-read and
        // requeue rather than retry in place.
        Err(Error::KubeError { source }) if util::is_conflict(&source) => {
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(err) => {
            context
                .metrics
                .controller
                .error_counter
                .with_label_values(&[&sanitize_label(&name), &sanitize_label(&namespace)])
                .inc();
            Err(err)
        }
    }
}

async fn perform(
    action: NodeGroupAction,
    group: &NodeGroup,
    context: &ContextData,
    namespace: &str,
) -> Result<Action, Error> {
    let client = context.client.clone();
    match action {
        NodeGroupAction::Pending => {
            actions::pending(client, group, namespace).await?;
            Ok(Action::requeue(Duration::ZERO))
        }
        NodeGroupAction::Teardown => {
            let done = actions::teardown(client, group, namespace).await?;
            if done {
                Ok(Action::await_change())
            } else {
                Ok(Action::requeue(Duration::from_secs(5)))
            }
        }
        NodeGroupAction::Invalid(reason) => {
            actions::invalid(client.clone(), group, &reason).await?;
            let recorder = events::recorder(client, group);
            events::warning(&recorder, "Validate", "InvalidSpec", reason).await;
            // User input; nothing to retry until the spec changes.
            Ok(Action::requeue(Duration::from_secs(300)))
        }
        NodeGroupAction::CreateNodes(count) => {
            let created = actions::create_nodes(client.clone(), group, namespace, count).await?;
            let recorder = events::recorder(client, group);
            events::normal(
                &recorder,
                "ScaleUp",
                "NodesCreated",
                format!("created {} node(s): {}", created.len(), created.join(", ")),
            )
            .await;
            Ok(Action::requeue(Duration::ZERO))
        }
        NodeGroupAction::SyncStatus(computed) => {
            actions::sync_status(client, group, *computed).await?;
            Ok(Action::requeue(PROBE_INTERVAL))
        }
        NodeGroupAction::NoOp => Ok(Action::requeue(context.resync)),
    }
}

/// Requeue policy on errors, shaped by the cloud error taxonomy where
/// one is attached.
fn on_error(group: Arc<NodeGroup>, error: &Error, _context: Arc<ContextData>) -> Action {
    error!(group = %group.name_any(), error = %error, "reconciliation error");
    let delay = match error {
        Error::VpsieError { source } => match source {
            crate::vpsie::VpsieError::Unauthorized | crate::vpsie::VpsieError::Forbidden => {
                Duration::from_secs(300)
            }
            err if err.is_transient() => Duration::from_secs(15),
            _ => Duration::from_secs(60),
        },
        Error::UserInputError(_) => Duration::from_secs(300),
        err if err.is_transient() => Duration::from_secs(15),
        _ => Duration::from_secs(60),
    };
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn group(min: i32, max: i32, desired: Option<i32>, with_status: bool) -> NodeGroup {
        NodeGroup {
            metadata: ObjectMeta {
                name: Some("ng-a".to_owned()),
                namespace: Some("default".to_owned()),
                uid: Some("uid-group".to_owned()),
                ..Default::default()
            },
            spec: NodeGroupSpec {
                min_nodes: min,
                max_nodes: max,
                offerings: vec!["std-2-4".to_owned()],
                datacenter: "dc1".to_owned(),
                image: "ubuntu".to_owned(),
                kubernetes_version: "1.22.4".to_owned(),
                ..Default::default()
            },
            status: if with_status {
                Some(NodeGroupStatus {
                    desired_nodes: desired,
                    ..Default::default()
                })
            } else {
                None
            },
        }
    }

    fn owned_node(name: &str, phase: VPSNodePhase) -> VPSNode {
        VPSNode {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                owner_references: Some(vec![
                    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                        uid: "uid-group".to_owned(),
                        kind: "NodeGroup".to_owned(),
                        name: "ng-a".to_owned(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            },
            spec: VPSNodeSpec {
                offering: "std-2-4".to_owned(),
                ..Default::default()
            },
            status: Some(VPSNodeStatus {
                phase: Some(phase),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn fresh_group_initializes_first() {
        assert_eq!(
            determine_action(&group(1, 3, None, false), &[]),
            NodeGroupAction::Pending
        );
    }

    #[test]
    fn deficit_creates_nodes() {
        let action = determine_action(&group(1, 3, Some(3), true), &[owned_node("a", VPSNodePhase::Ready)]);
        assert_eq!(action, NodeGroupAction::CreateNodes(2));
    }

    #[test]
    fn surplus_never_deletes_here() {
        // desired < current must not produce any destructive action;
        // the drained nodes leave through the VPSNode lifecycle.
        let nodes = vec![
            owned_node("a", VPSNodePhase::Ready),
            owned_node("b", VPSNodePhase::Ready),
            owned_node("c", VPSNodePhase::Ready),
        ];
        let action = determine_action(&group(1, 5, Some(2), true), &nodes);
        assert!(matches!(action, NodeGroupAction::SyncStatus(_)));
    }

    #[test]
    fn invalid_spec_is_surfaced_not_acted_on() {
        let mut g = group(3, 1, Some(2), true);
        g.spec.max_nodes = 1;
        assert!(matches!(determine_action(&g, &[]), NodeGroupAction::Invalid(_)));
    }

    #[test]
    fn deletion_always_tears_down() {
        let mut g = group(1, 3, Some(2), true);
        g.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                "2026-03-01T00:00:00Z".parse().unwrap(),
            ),
        );
        assert_eq!(determine_action(&g, &[]), NodeGroupAction::Teardown);
    }

    #[test]
    fn converged_group_is_a_no_op() {
        let nodes = vec![owned_node("a", VPSNodePhase::Ready)];
        let g0 = group(1, 3, Some(1), true);
        // First pass computes the full status; feed it back in to
        // simulate the converged state.
        let computed = crate::nodegroups::actions::compute_status(&g0, &nodes);
        let mut converged = g0;
        converged.status = Some(computed);
        assert_eq!(determine_action(&converged, &nodes), NodeGroupAction::NoOp);
    }
}
