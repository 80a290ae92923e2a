use kube::{
    api::{DeleteParams, ListParams, ObjectMeta},
    Api, Client, Resource, ResourceExt,
};
use tracing::info;
use vpsie_types::*;

use crate::util::{
    self, finalizer, messages, patch::patch_status, Error, NODEGROUP_FINALIZER,
};

/// Builds one VPSNode for a group. The same shape is used for
/// scale-ups and for rebalance replacements.
pub fn new_vpsnode(group: &NodeGroup, name: &str, offering: &str) -> VPSNode {
    let group_name = group.name_any();
    VPSNode {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: group.namespace(),
            // The owner reference ties garbage collection to the group.
            owner_references: Some(vec![group.controller_owner_ref(&()).unwrap()]),
            labels: Some(
                vec![
                    (NODE_GROUP_LABEL.to_owned(), group_name.clone()),
                    (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: VPSNodeSpec {
            node_group: group_name,
            offering: offering.to_owned(),
            datacenter: group.spec.datacenter.clone(),
            image: group.spec.image.clone(),
            kubernetes_version: group.spec.kubernetes_version.clone(),
            labels: group.spec.labels.clone(),
            taints: group.spec.taints.clone(),
            ssh_keys: group.spec.ssh_keys.clone(),
            overrides: None,
        },
        status: None,
    }
}

/// Generated node names: the group name plus a short random suffix.
pub fn node_name(group: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", group, &suffix[..5])
}

/// Initializes the status object and attaches the group finalizer.
pub async fn pending(client: Client, group: &NodeGroup, namespace: &str) -> Result<(), Error> {
    let name = group.name_any();
    let group: NodeGroup =
        finalizer::add(client.clone(), &name, namespace, NODEGROUP_FINALIZER).await?;
    let min = group.spec.min_nodes;
    patch_status(client, &group, move |status| {
        status.desired_nodes = Some(min);
        status.current_nodes = Some(0);
        status.ready_nodes = Some(0);
        status.message = Some(messages::PENDING.to_owned());
    })
    .await?;
    Ok(())
}

/// Creates the deficit of VPSNodes with generated names, the group as
/// owner, and the first offering preference.
pub async fn create_nodes(
    client: Client,
    group: &NodeGroup,
    namespace: &str,
    count: usize,
) -> Result<Vec<String>, Error> {
    let offering = group
        .spec
        .offerings
        .first()
        .cloned()
        .ok_or_else(|| Error::UserInputError("node group has no offerings".to_owned()))?;
    let api: Api<VPSNode> = Api::namespaced(client, namespace);
    let mut created = Vec::with_capacity(count);
    for _ in 0..count {
        let name = node_name(&group.name_any());
        let node = new_vpsnode(group, &name, &offering);
        api.create(&Default::default(), &node).await?;
        info!(group = %group.name_any(), node = %name, %offering, "created VPSNode");
        created.push(name);
    }
    Ok(created)
}

/// Lists the VPSNodes owned by this group, filtered by both the group
/// label and the owner reference.
pub async fn list_owned(
    client: Client,
    group: &NodeGroup,
    namespace: &str,
) -> Result<Vec<VPSNode>, Error> {
    let api: Api<VPSNode> = Api::namespaced(client, namespace);
    let selector = format!("{}={}", NODE_GROUP_LABEL, group.name_any());
    let owned = api
        .list(&ListParams::default().labels(&selector))
        .await?
        .into_iter()
        .filter(|node| {
            node.owner_references()
                .iter()
                .any(|owner| Some(owner.uid.as_str()) == group.uid().as_deref())
        })
        .collect();
    Ok(owned)
}

/// Deletion branch: removes owned VPSNodes first and drops the group
/// finalizer only once none remain. Returns true when teardown has
/// fully completed.
pub async fn teardown(client: Client, group: &NodeGroup, namespace: &str) -> Result<bool, Error> {
    let owned = list_owned(client.clone(), group, namespace).await?;
    if owned.is_empty() {
        finalizer::remove::<NodeGroup>(
            client,
            &group.name_any(),
            namespace,
            NODEGROUP_FINALIZER,
        )
        .await?;
        return Ok(true);
    }
    let api: Api<VPSNode> = Api::namespaced(client.clone(), namespace);
    for node in &owned {
        if node.meta().deletion_timestamp.is_some() {
            continue;
        }
        match api.delete(&node.name_any(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(err) if util::is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(false)
}

/// Derives the status the group should be showing for the observed set
/// of owned nodes. Pure so the shape is testable.
pub fn compute_status(group: &NodeGroup, owned: &[VPSNode]) -> NodeGroupStatus {
    let existing = group.status.clone().unwrap_or_default();
    let min = group.spec.min_nodes;
    let max = group.spec.max_nodes;

    let live: Vec<&VPSNode> = owned
        .iter()
        .filter(|node| {
            node.meta().deletion_timestamp.is_none()
                && !node
                    .status
                    .as_ref()
                    .and_then(|s| s.phase)
                    .map(|p| p.is_terminating())
                    .unwrap_or(false)
        })
        .collect();
    let current = live.len() as i32;
    let ready = live
        .iter()
        .filter(|node| node.status.as_ref().and_then(|s| s.phase) == Some(VPSNodePhase::Ready))
        .count() as i32;
    let desired = existing.desired_nodes.unwrap_or(min).clamp(min, max);

    let mut summaries: Vec<NodeGroupNodeSummary> = owned
        .iter()
        .map(|node| NodeGroupNodeSummary {
            name: node.name_any(),
            vps_id: node.status.as_ref().and_then(|s| s.vps_id.clone()),
            offering: node.spec.offering.clone(),
            phase: node.status.as_ref().and_then(|s| s.phase),
            address: node.status.as_ref().and_then(|s| s.ip_address.clone()),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut conditions = existing.conditions.clone().unwrap_or_default();
    let scaling = desired != current;
    let ready_now = !scaling && ready == desired;
    set_condition(
        &mut conditions,
        Condition::new(
            group_conditions::READY,
            ready_now,
            if ready_now { "AllNodesReady" } else { "NodesPending" },
            &format!("{}/{} nodes ready", ready, desired),
        ),
    );
    set_condition(
        &mut conditions,
        Condition::new(
            group_conditions::SCALING,
            scaling,
            if scaling { "Converging" } else { "Stable" },
            &format!("current={} desired={}", current, desired),
        ),
    );
    set_condition(
        &mut conditions,
        Condition::new(
            group_conditions::AT_MIN,
            current <= min,
            "SizeCheck",
            &format!("current={} min={}", current, min),
        ),
    );
    set_condition(
        &mut conditions,
        Condition::new(
            group_conditions::AT_MAX,
            current >= max,
            "SizeCheck",
            &format!("current={} max={}", current, max),
        ),
    );

    NodeGroupStatus {
        desired_nodes: Some(desired),
        current_nodes: Some(current),
        ready_nodes: Some(ready),
        nodes: Some(summaries),
        last_scale_time: existing.last_scale_time.clone(),
        conditions: Some(conditions),
        message: Some(if scaling {
            messages::GROUP_SCALING.to_owned()
        } else {
            messages::GROUP_READY.to_owned()
        }),
        last_updated: existing.last_updated.clone(),
    }
}

/// Compares the observable parts of two statuses, ignoring volatile
/// timestamps, so an unchanged group reconciles without a write.
pub fn status_equal(a: &NodeGroupStatus, b: &NodeGroupStatus) -> bool {
    let conditions = |status: &NodeGroupStatus| -> Vec<(String, String, Option<String>)> {
        status
            .conditions
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|c| (c.type_.clone(), c.status.clone(), c.reason.clone()))
            .collect()
    };
    a.desired_nodes == b.desired_nodes
        && a.current_nodes == b.current_nodes
        && a.ready_nodes == b.ready_nodes
        && a.nodes == b.nodes
        && a.message == b.message
        && a.last_scale_time == b.last_scale_time
        && conditions(a) == conditions(b)
}

/// Writes the computed status, carrying the error condition over from
/// the previous status only if the caller just set it.
pub async fn sync_status(
    client: Client,
    group: &NodeGroup,
    computed: NodeGroupStatus,
) -> Result<(), Error> {
    patch_status(client, group, move |status| {
        status.desired_nodes = computed.desired_nodes;
        status.current_nodes = computed.current_nodes;
        status.ready_nodes = computed.ready_nodes;
        status.nodes = computed.nodes;
        status.conditions = computed.conditions;
        status.message = computed.message;
        status.last_scale_time = computed.last_scale_time;
    })
    .await?;
    Ok(())
}

/// Flags a validation failure on the group without giving up on it.
pub async fn invalid(client: Client, group: &NodeGroup, reason: &str) -> Result<(), Error> {
    let reason = reason.to_owned();
    patch_status(client, group, move |status| {
        let conditions = status.conditions.get_or_insert_with(Vec::new);
        set_condition(
            conditions,
            Condition::new(group_conditions::ERROR, true, "InvalidSpec", &reason),
        );
        status.message = Some(format!("invalid spec: {}", reason));
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn group(min: i32, max: i32, desired: Option<i32>) -> NodeGroup {
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
            status: desired.map(|d| NodeGroupStatus {
                desired_nodes: Some(d),
                ..Default::default()
            }),
        }
    }

    fn owned(name: &str, phase: VPSNodePhase) -> VPSNode {
        VPSNode {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
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
    fn desired_is_clamped_into_bounds() {
        let status = compute_status(&group(2, 5, Some(9)), &[]);
        assert_eq!(status.desired_nodes, Some(5));
        let status = compute_status(&group(2, 5, Some(0)), &[]);
        assert_eq!(status.desired_nodes, Some(2));
        let status = compute_status(&group(2, 5, None), &[]);
        assert_eq!(status.desired_nodes, Some(2));
    }

    #[test]
    fn terminating_nodes_do_not_count_as_current() {
        let nodes = vec![
            owned("a", VPSNodePhase::Ready),
            owned("b", VPSNodePhase::Terminating),
            owned("c", VPSNodePhase::Provisioning),
        ];
        let status = compute_status(&group(1, 5, Some(2)), &nodes);
        assert_eq!(status.current_nodes, Some(2));
        assert_eq!(status.ready_nodes, Some(1));
        // Summaries still list every owned resource.
        assert_eq!(status.nodes.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn conditions_reflect_the_population() {
        let nodes = vec![owned("a", VPSNodePhase::Ready), owned("b", VPSNodePhase::Ready)];
        let status = compute_status(&group(1, 2, Some(2)), &nodes);
        let conditions = status.conditions.unwrap();
        assert!(get_condition(&conditions, group_conditions::READY).unwrap().is_true());
        assert!(!get_condition(&conditions, group_conditions::SCALING).unwrap().is_true());
        assert!(!get_condition(&conditions, group_conditions::AT_MIN).unwrap().is_true());
        assert!(get_condition(&conditions, group_conditions::AT_MAX).unwrap().is_true());
    }

    #[test]
    fn scaling_condition_tracks_the_deficit() {
        let nodes = vec![owned("a", VPSNodePhase::Ready)];
        let status = compute_status(&group(1, 5, Some(3)), &nodes);
        let conditions = status.conditions.clone().unwrap();
        assert!(get_condition(&conditions, group_conditions::SCALING).unwrap().is_true());
        assert!(!get_condition(&conditions, group_conditions::READY).unwrap().is_true());
    }

    #[test]
    fn unchanged_status_is_detected() {
        let nodes = vec![owned("a", VPSNodePhase::Ready)];
        let g = group(1, 5, Some(1));
        let first = compute_status(&g, &nodes);
        let mut with_status = g.clone();
        with_status.status = Some(first.clone());
        let second = compute_status(&with_status, &nodes);
        assert!(status_equal(&first, &second));

        let third = compute_status(&with_status, &[]);
        assert!(!status_equal(&first, &third));
    }

    #[test]
    fn generated_names_carry_the_group_prefix() {
        let name = node_name("ng-a");
        assert!(name.starts_with("ng-a-"));
        assert_ne!(node_name("ng-a"), node_name("ng-a"));
    }
}
