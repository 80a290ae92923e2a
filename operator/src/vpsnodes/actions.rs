use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};
use vpsie_types::*;

use crate::drain::DrainEngine;
use crate::util::{
    self, finalizer, messages,
    patch::patch_status,
    Error, VPSNODE_FINALIZER,
};
use crate::vpsie::{
    types::{CreateVmRequest, Vm},
    VpsieApi, VpsieError,
};
use super::VpsNodeMetrics;

/// Transitions the node to a new phase in a single status patch,
/// stamping the phase timestamp and recording the transition metrics.
pub async fn advance_phase(
    client: Client,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
    next: VPSNodePhase,
    message: &str,
    mutate: impl FnOnce(&mut VPSNodeStatus),
) -> Result<VPSNode, Error> {
    let previous = instance.status.as_ref().and_then(|s| s.phase);
    if let Some(previous) = previous {
        if !previous.can_advance_to(next) {
            return Err(Error::FatalError(format!(
                "illegal phase transition {} -> {}",
                previous, next
            )));
        }
    }
    let now = Utc::now();
    let message = message.to_owned();
    let updated = patch_status(client, instance, move |status| {
        status.phase = Some(next);
        status.message = Some(message);
        status
            .phase_timestamps
            .get_or_insert_with(BTreeMap::new)
            .insert(next.to_string(), now.to_rfc3339());
        mutate(status);
    })
    .await?;

    let from = previous.map(|p| p.to_string()).unwrap_or_else(|| "None".to_owned());
    metrics
        .phase_transitions
        .with_label_values(&[&from, &next.to_string()])
        .inc();
    if let Some(previous) = previous {
        if let Some(entered) = instance
            .status
            .as_ref()
            .and_then(|s| s.phase_timestamps.as_ref())
            .and_then(|t| t.get(&previous.to_string()))
            .and_then(|v| v.parse::<DateTime<Utc>>().ok())
        {
            let spent = (now - entered).num_milliseconds().max(0) as f64 / 1000.0;
            metrics
                .phase_duration
                .with_label_values(&[&previous.to_string()])
                .observe(spent);
        }
    }
    Ok(updated)
}

/// First contact: the finalizer goes on before anything is provisioned
/// so the resource can never vanish with a machine behind it.
pub async fn pending(
    client: Client,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
    namespace: &str,
) -> Result<(), Error> {
    let name = instance.name_any();
    let instance: VPSNode =
        finalizer::add(client.clone(), &name, namespace, VPSNODE_FINALIZER).await?;
    advance_phase(
        client,
        metrics,
        &instance,
        VPSNodePhase::Pending,
        messages::PENDING,
        |_| {},
    )
    .await?;
    Ok(())
}

/// Creates the backing machine, trying the group's offerings in
/// preference order when the provider rejects one. A machine that
/// already exists under this hostname is adopted instead of recreated,
/// which keeps the action idempotent across interrupted reconciles.
pub async fn provision(
    client: Client,
    vpsie: &dyn VpsieApi,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
    group: Option<&NodeGroup>,
) -> Result<(), Error> {
    let hostname = instance.name_any();

    let existing = vpsie
        .list_vms()
        .await?
        .into_iter()
        .find(|vm| vm.hostname == hostname);
    let vm = match existing {
        Some(vm) => {
            info!(node = %hostname, vps_id = %vm.id, "adopting existing machine");
            vm
        }
        None => create_with_fallback(vpsie, instance, group, &hostname).await?,
    };

    // Record the external id in the same status write as the phase so
    // an interrupted reconcile never forgets a machine it created.
    let chosen_offering = vm.offering_id.clone();
    let allocated = AllocatedResources {
        cpu: vm.cpu,
        memory_mb: vm.memory_mb,
        disk_gb: vm.disk_gb,
    };
    let vps_id = vm.id.clone();
    let updated = advance_phase(
        client.clone(),
        metrics,
        instance,
        VPSNodePhase::Provisioning,
        messages::PROVISIONING,
        move |status| {
            status.vps_id = Some(vps_id);
            status.allocated = Some(allocated);
            status.last_error = None;
        },
    )
    .await?;

    if updated.spec.offering != chosen_offering {
        let api: Api<VPSNode> = Api::namespaced(client, &instance.namespace().unwrap_or_default());
        let patch = json!({ "spec": { "offering": chosen_offering } });
        api.patch(&hostname, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }
    Ok(())
}

async fn create_with_fallback(
    vpsie: &dyn VpsieApi,
    instance: &VPSNode,
    group: Option<&NodeGroup>,
    hostname: &str,
) -> Result<Vm, Error> {
    // The spec'd offering first, then the rest of the group's
    // preference list.
    let mut offerings = vec![instance.spec.offering.clone()];
    if let Some(group) = group {
        for offering in &group.spec.offerings {
            if !offerings.contains(offering) {
                offerings.push(offering.clone());
            }
        }
    }

    let mut last_error: Option<VpsieError> = None;
    for offering in &offerings {
        let request = CreateVmRequest {
            hostname: hostname.to_owned(),
            offering_id: offering.clone(),
            datacenter_id: instance.spec.datacenter.clone(),
            image_id: instance.spec.image.clone(),
            ssh_keys: instance.spec.ssh_keys.clone(),
            tags: vec![MANAGED_BY_VALUE.to_owned(), instance.spec.node_group.clone()],
            overrides: instance.spec.overrides.clone().unwrap_or_default(),
        };
        match vpsie.create_vm(&request).await {
            Ok(vm) => return Ok(vm),
            Err(err) if err.is_transient() => return Err(err.into()),
            Err(err) => {
                warn!(node = %hostname, offering = %offering, error = %err, "offering rejected, falling through");
                last_error = Some(err);
            }
        }
    }
    Err(last_error
        .map(Error::from)
        .unwrap_or_else(|| Error::FatalError("no offerings to try".to_owned())))
}

/// Polls the machine's cloud-side state; once it runs, the address is
/// recorded and the node moves on to waiting for cluster registration.
pub async fn await_running(
    client: Client,
    vpsie: &dyn VpsieApi,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
) -> Result<bool, Error> {
    let vps_id = match instance.status.as_ref().and_then(|s| s.vps_id.clone()) {
        Some(id) => id,
        None => {
            return Err(Error::FatalError(
                "provisioning node has no machine id".to_owned(),
            ))
        }
    };
    let vm = vpsie.get_vm(&vps_id).await?;
    if !vm.is_running() {
        return Ok(false);
    }
    let address = vm.ip_address.clone();
    advance_phase(
        client,
        metrics,
        instance,
        VPSNodePhase::Provisioned,
        messages::PROVISIONED,
        move |status| {
            status.ip_address = address;
        },
    )
    .await?;
    Ok(true)
}

/// Finds the registered cluster node by name or address and stamps the
/// group's labels and taints on it.
pub async fn join_cluster(
    client: Client,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
) -> Result<bool, Error> {
    let node = match find_cluster_node(client.clone(), instance).await? {
        Some(node) => node,
        None => return Ok(false),
    };
    apply_node_identity(client.clone(), instance, &node).await?;
    advance_phase(
        client,
        metrics,
        instance,
        VPSNodePhase::Joining,
        messages::JOINING,
        |_| {},
    )
    .await?;
    Ok(true)
}

/// Waits for the cluster node's Ready condition.
pub async fn await_ready(
    client: Client,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
) -> Result<bool, Error> {
    let node = match find_cluster_node(client.clone(), instance).await? {
        Some(node) => node,
        None => return Ok(false),
    };
    if !crate::scaledown::safety::node_is_ready(&node) {
        return Ok(false);
    }
    let joined = Utc::now().to_rfc3339();
    advance_phase(
        client,
        metrics,
        instance,
        VPSNodePhase::Ready,
        messages::READY,
        move |status| {
            status.joined_at = Some(joined);
        },
    )
    .await?;
    Ok(true)
}

/// Starts teardown: the workloads leave first. Draining a node that
/// never joined the cluster is a no-op.
pub async fn terminate(
    client: Client,
    drain: &DrainEngine,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
) -> Result<(), Error> {
    if find_cluster_node(client.clone(), instance).await?.is_some() {
        drain.drain(&instance.name_any()).await?;
    }
    advance_phase(
        client,
        metrics,
        instance,
        VPSNodePhase::Deleting,
        messages::DELETING,
        |_| {},
    )
    .await?;
    Ok(())
}

/// Removes the machine at VPSie, the cluster node object, and finally
/// the finalizer. `NotFound` from the provider counts as success; the
/// resource must never outlive a machine it cannot account for.
pub async fn delete(
    client: Client,
    vpsie: &dyn VpsieApi,
    instance: &VPSNode,
    namespace: &str,
) -> Result<(), Error> {
    let name = instance.name_any();
    if let Some(vps_id) = instance.status.as_ref().and_then(|s| s.vps_id.as_deref()) {
        match vpsie.delete_vm(vps_id).await {
            Ok(()) => info!(node = %name, vps_id, "machine deleted"),
            Err(VpsieError::NotFound) => {
                info!(node = %name, vps_id, "machine already gone")
            }
            Err(err) => return Err(err.into()),
        }
    }

    let node_api: Api<Node> = Api::all(client.clone());
    match node_api.delete(&name, &Default::default()).await {
        Ok(_) => {}
        Err(err) if util::is_not_found(&err) => {}
        Err(err) => return Err(err.into()),
    }

    finalizer::remove::<VPSNode>(client, &name, namespace, VPSNODE_FINALIZER).await?;
    Ok(())
}

/// Surfaces a fatal error on the resource. Terminal until the operator
/// deletes the resource, which still routes through cloud cleanup.
pub async fn fail(
    client: Client,
    metrics: &VpsNodeMetrics,
    instance: &VPSNode,
    error: &Error,
) -> Result<(), Error> {
    let detail = error.to_string();
    advance_phase(
        client,
        metrics,
        instance,
        VPSNodePhase::Failed,
        "Fatal error; operator intervention required.",
        move |status| {
            status.last_error = Some(detail.clone());
            let conditions = status.conditions.get_or_insert_with(Vec::new);
            set_condition(
                conditions,
                Condition::new("Ready", false, "Failed", &detail),
            );
        },
    )
    .await?;
    Ok(())
}

/// Locates the cluster node backing this resource, matching by name
/// first and falling back to the recorded address.
pub async fn find_cluster_node(
    client: Client,
    instance: &VPSNode,
) -> Result<Option<Node>, Error> {
    let api: Api<Node> = Api::all(client);
    let name = instance.name_any();
    match api.get(&name).await {
        Ok(node) => return Ok(Some(node)),
        Err(err) if util::is_not_found(&err) => {}
        Err(err) => return Err(err.into()),
    }
    let address = match instance.status.as_ref().and_then(|s| s.ip_address.as_deref()) {
        Some(address) => address.to_owned(),
        None => return Ok(None),
    };
    let nodes = api.list(&ListParams::default()).await?;
    Ok(nodes.into_iter().find(|node| {
        node.status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .map(|addresses| addresses.iter().any(|a| a.address == address))
            .unwrap_or(false)
    }))
}

/// Applies the managed-by marker plus the spec's labels and taints to
/// the cluster node. Existing taints are kept; ours are merged in by
/// key and effect.
async fn apply_node_identity(
    client: Client,
    instance: &VPSNode,
    node: &Node,
) -> Result<(), Error> {
    let mut labels: BTreeMap<String, String> = instance.spec.labels.clone().unwrap_or_default();
    labels.insert(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned());
    labels.insert(NODE_GROUP_LABEL.to_owned(), instance.spec.node_group.clone());

    let mut taints: Vec<Taint> = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    for wanted in instance.spec.taints.as_deref().unwrap_or(&[]) {
        if !taints
            .iter()
            .any(|t| t.key == wanted.key && t.effect == wanted.effect)
        {
            taints.push(Taint {
                key: wanted.key.clone(),
                value: wanted.value.clone(),
                effect: wanted.effect.clone(),
                ..Default::default()
            });
        }
    }

    let api: Api<Node> = Api::all(client);
    let patch = json!({
        "metadata": { "labels": labels },
        "spec": { "taints": taints }
    });
    api.patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
