use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Condition, VPSNodePhase};

/// [`NodeGroupSpec`] declares a pool of equivalent worker nodes backed by
/// VPSie virtual machines. The controller keeps the number of owned
/// [`VPSNode`](crate::VPSNode) resources between `minNodes` and `maxNodes`,
/// creating machines when pods cannot be scheduled and retiring drained
/// machines when the pool is underutilized.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaler.vpsie.io",
    version = "v1alpha1",
    kind = "NodeGroup",
    plural = "nodegroups",
    derive = "PartialEq",
    status = "NodeGroupStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(shortname = "ng")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.minNodes\", \"name\": \"MIN\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.maxNodes\", \"name\": \"MAX\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.desiredNodes\", \"name\": \"DESIRED\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.currentNodes\", \"name\": \"CURRENT\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.readyNodes\", \"name\": \"READY\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct NodeGroupSpec {
    /// Minimum number of nodes the group may shrink to.
    #[serde(rename = "minNodes")]
    pub min_nodes: i32,

    /// Maximum number of nodes the group may grow to.
    #[serde(rename = "maxNodes")]
    pub max_nodes: i32,

    /// Ordered preference list of VPSie offering identifiers. Provisioning
    /// tries each offering in order and falls through on failure.
    pub offerings: Vec<String>,

    /// VPSie datacenter identifier all nodes are provisioned in.
    pub datacenter: String,

    /// VPSie OS image identifier used for new machines.
    pub image: String,

    /// Kubernetes version the machines join the cluster with.
    #[serde(rename = "kubernetesVersion")]
    pub kubernetes_version: String,

    /// Labels applied to cluster nodes when they join.
    pub labels: Option<BTreeMap<String, String>>,

    /// Taints applied to cluster nodes when they join.
    pub taints: Option<Vec<NodeTaint>>,

    /// Names of SSH keys registered with VPSie to install on new machines.
    #[serde(rename = "sshKeys")]
    pub ssh_keys: Option<Vec<String>>,
}

/// A taint to apply to cluster nodes on join. Mirrors the core taint
/// shape so it can be declared in the CRD schema.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeTaint {
    /// Taint key.
    pub key: String,

    /// Taint value, if any.
    pub value: Option<String>,

    /// Taint effect: `NoSchedule`, `PreferNoSchedule` or `NoExecute`.
    pub effect: String,
}

/// Status object for the [`NodeGroup`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct NodeGroupStatus {
    /// Number of nodes the reconciler is currently converging towards.
    /// Always within `[minNodes, maxNodes]`.
    #[serde(rename = "desiredNodes")]
    pub desired_nodes: Option<i32>,

    /// Count of owned, non-terminating [`VPSNode`](crate::VPSNode) resources.
    #[serde(rename = "currentNodes")]
    pub current_nodes: Option<i32>,

    /// Count of owned nodes whose phase is `Ready`.
    #[serde(rename = "readyNodes")]
    pub ready_nodes: Option<i32>,

    /// Summaries of the owned nodes, one per [`VPSNode`](crate::VPSNode).
    pub nodes: Option<Vec<NodeGroupNodeSummary>>,

    /// RFC3339 timestamp of the last scale-up or scale-down.
    #[serde(rename = "lastScaleTime")]
    pub last_scale_time: Option<String>,

    /// Observed conditions: `Ready`, `Scaling`, `AtMin`, `AtMax`, `Error`.
    pub conditions: Option<Vec<Condition>>,

    /// A human-readable message indicating details about the current state.
    pub message: Option<String>,

    /// Timestamp of when the status object was last updated.
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
}

/// A compact view of one owned node, surfaced in the group status for
/// `kubectl get` inspection.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NodeGroupNodeSummary {
    /// Name of the [`VPSNode`](crate::VPSNode) resource.
    pub name: String,

    /// Identifier of the backing virtual machine at VPSie, once known.
    #[serde(rename = "vpsId")]
    pub vps_id: Option<String>,

    /// Offering the machine was provisioned with.
    pub offering: String,

    /// Current lifecycle phase of the node.
    pub phase: Option<VPSNodePhase>,

    /// IP address of the machine, once assigned.
    pub address: Option<String>,
}

impl NodeGroupSpec {
    /// Validates the cross-field constraints that the admission webhook
    /// also enforces. Returns a human-readable description of the first
    /// violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_nodes < 0 {
            return Err(format!("minNodes must not be negative, got {}", self.min_nodes));
        }
        if self.max_nodes < self.min_nodes {
            return Err(format!(
                "maxNodes ({}) must be >= minNodes ({})",
                self.max_nodes, self.min_nodes
            ));
        }
        if self.offerings.is_empty() {
            return Err("at least one offering is required".to_owned());
        }
        if self.datacenter.is_empty() {
            return Err("datacenter must not be empty".to_owned());
        }
        if self.image.is_empty() {
            return Err("image must not be empty".to_owned());
        }
        Ok(())
    }
}

/// Condition types maintained on the [`NodeGroup`] status.
pub mod group_conditions {
    /// All desired nodes exist and are ready.
    pub const READY: &str = "Ready";
    /// A scale-up or scale-down is in progress.
    pub const SCALING: &str = "Scaling";
    /// The group is at its minimum size.
    pub const AT_MIN: &str = "AtMin";
    /// The group is at its maximum size.
    pub const AT_MAX: &str = "AtMax";
    /// The last reconciliation hit an error worth surfacing.
    pub const ERROR: &str = "Error";
    /// A rebalance plan is being executed against this group.
    pub const REBALANCING: &str = "Rebalancing";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> NodeGroupSpec {
        NodeGroupSpec {
            min_nodes: 1,
            max_nodes: 3,
            offerings: vec!["standard-2cpu-4gb".to_owned()],
            datacenter: "dc-ams1".to_owned(),
            image: "ubuntu-22.04".to_owned(),
            kubernetes_version: "1.22.4".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_accepts_sane_spec() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut spec = valid_spec();
        spec.min_nodes = 4;
        assert!(spec.validate().unwrap_err().contains("minNodes"));
    }

    #[test]
    fn validate_rejects_missing_offerings() {
        let mut spec = valid_spec();
        spec.offerings.clear();
        assert!(spec.validate().unwrap_err().contains("offering"));
    }

    #[test]
    fn validate_rejects_negative_min() {
        let mut spec = valid_spec();
        spec.min_nodes = -1;
        assert!(spec.validate().is_err());
    }
}
