use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

use crate::{Condition, NodeTaint};

/// [`VPSNodeSpec`] declares one virtual machine provisioned at VPSie on
/// behalf of a [`NodeGroup`](crate::NodeGroup). Instances are created by
/// the NodeGroup controller with an owner reference back to their group
/// and are advanced through their lifecycle by the VPSNode controller.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaler.vpsie.io",
    version = "v1alpha1",
    kind = "VPSNode",
    plural = "vpsnodes",
    derive = "PartialEq",
    status = "VPSNodeStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(shortname = "vn")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.offering\", \"name\": \"OFFERING\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.ipAddress\", \"name\": \"ADDRESS\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct VPSNodeSpec {
    /// Name of the owning [`NodeGroup`](crate::NodeGroup).
    #[serde(rename = "nodeGroup")]
    pub node_group: String,

    /// VPSie offering identifier the machine is provisioned with.
    pub offering: String,

    /// VPSie datacenter identifier.
    pub datacenter: String,

    /// VPSie OS image identifier.
    pub image: String,

    /// Kubernetes version the machine joins the cluster with.
    #[serde(rename = "kubernetesVersion")]
    pub kubernetes_version: String,

    /// Labels applied to the cluster node when it joins.
    pub labels: Option<BTreeMap<String, String>>,

    /// Taints applied to the cluster node when it joins.
    pub taints: Option<Vec<NodeTaint>>,

    /// Names of SSH keys registered with VPSie to install on the machine.
    #[serde(rename = "sshKeys")]
    pub ssh_keys: Option<Vec<String>>,

    /// Free-form provisioning overrides forwarded verbatim to the
    /// create-VM call, keyed by VPSie API field name.
    pub overrides: Option<BTreeMap<String, String>>,
}

/// Status object for the [`VPSNode`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct VPSNodeStatus {
    /// Current lifecycle phase.
    pub phase: Option<VPSNodePhase>,

    /// Identifier of the backing virtual machine at VPSie. Set once the
    /// create call succeeds; the resource must not disappear from the
    /// cluster while this is set and the machine still exists.
    #[serde(rename = "vpsId")]
    pub vps_id: Option<String>,

    /// IP address assigned to the machine.
    #[serde(rename = "ipAddress")]
    pub ip_address: Option<String>,

    /// Resources allocated to the machine, as reported by VPSie.
    pub allocated: Option<AllocatedResources>,

    /// RFC3339 timestamp per phase entry, keyed by phase name.
    #[serde(rename = "phaseTimestamps")]
    pub phase_timestamps: Option<BTreeMap<String, String>>,

    /// RFC3339 timestamp of when the cluster node became Ready.
    #[serde(rename = "joinedAt")]
    pub joined_at: Option<String>,

    /// Description of the most recent error, if any.
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,

    /// Observed conditions.
    pub conditions: Option<Vec<Condition>>,

    /// A human-readable message indicating details about the current state.
    pub message: Option<String>,

    /// Timestamp of when the status object was last updated.
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
}

/// Machine resources as reported by the VPSie API.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AllocatedResources {
    /// Number of virtual CPU cores.
    pub cpu: i32,

    /// Memory in megabytes.
    #[serde(rename = "memoryMb")]
    pub memory_mb: i64,

    /// Disk in gigabytes.
    #[serde(rename = "diskGb")]
    pub disk_gb: i64,
}

/// Lifecycle phase of a [`VPSNode`]. Phases advance strictly forward,
/// one step per reconciliation; `Failed` is the only terminal branch
/// reachable from any other phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum VPSNodePhase {
    /// The resource first appeared to the controller.
    Pending,

    /// The create-VM call succeeded; waiting for the machine to run.
    Provisioning,

    /// The machine is running; waiting for it to register with the cluster.
    Provisioned,

    /// The cluster node exists; waiting for its Ready condition.
    Joining,

    /// The node is in service.
    Ready,

    /// The node is being drained ahead of deletion.
    Terminating,

    /// The machine is being deleted at VPSie.
    Deleting,

    /// A fatal error occurred; operator intervention is required.
    Failed,
}

impl VPSNodePhase {
    /// Ordinal used to enforce monotonic phase advancement. `Failed` is
    /// reachable from anywhere and has no ordinal.
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            VPSNodePhase::Pending => Some(0),
            VPSNodePhase::Provisioning => Some(1),
            VPSNodePhase::Provisioned => Some(2),
            VPSNodePhase::Joining => Some(3),
            VPSNodePhase::Ready => Some(4),
            VPSNodePhase::Terminating => Some(5),
            VPSNodePhase::Deleting => Some(6),
            VPSNodePhase::Failed => None,
        }
    }

    /// Returns true if a transition from `self` to `next` is legal:
    /// strictly forward, or into `Failed` from anywhere.
    pub fn can_advance_to(&self, next: VPSNodePhase) -> bool {
        match (self.ordinal(), next.ordinal()) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => b > a,
        }
    }

    /// Returns true for phases on the teardown half of the lifecycle.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            VPSNodePhase::Terminating | VPSNodePhase::Deleting | VPSNodePhase::Failed
        )
    }
}

impl FromStr for VPSNodePhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(VPSNodePhase::Pending),
            "Provisioning" => Ok(VPSNodePhase::Provisioning),
            "Provisioned" => Ok(VPSNodePhase::Provisioned),
            "Joining" => Ok(VPSNodePhase::Joining),
            "Ready" => Ok(VPSNodePhase::Ready),
            "Terminating" => Ok(VPSNodePhase::Terminating),
            "Deleting" => Ok(VPSNodePhase::Deleting),
            "Failed" => Ok(VPSNodePhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for VPSNodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VPSNodePhase::Pending => write!(f, "Pending"),
            VPSNodePhase::Provisioning => write!(f, "Provisioning"),
            VPSNodePhase::Provisioned => write!(f, "Provisioned"),
            VPSNodePhase::Joining => write!(f, "Joining"),
            VPSNodePhase::Ready => write!(f, "Ready"),
            VPSNodePhase::Terminating => write!(f, "Terminating"),
            VPSNodePhase::Deleting => write!(f, "Deleting"),
            VPSNodePhase::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_forward_only() {
        assert!(VPSNodePhase::Pending.can_advance_to(VPSNodePhase::Provisioning));
        assert!(VPSNodePhase::Ready.can_advance_to(VPSNodePhase::Terminating));
        assert!(!VPSNodePhase::Ready.can_advance_to(VPSNodePhase::Joining));
        assert!(!VPSNodePhase::Deleting.can_advance_to(VPSNodePhase::Pending));
    }

    #[test]
    fn failed_is_reachable_from_anywhere_and_terminal() {
        for phase in [
            VPSNodePhase::Pending,
            VPSNodePhase::Provisioning,
            VPSNodePhase::Ready,
            VPSNodePhase::Deleting,
        ] {
            assert!(phase.can_advance_to(VPSNodePhase::Failed));
        }
        assert!(!VPSNodePhase::Failed.can_advance_to(VPSNodePhase::Pending));
        assert!(VPSNodePhase::Failed.can_advance_to(VPSNodePhase::Failed));
    }

    #[test]
    fn phase_round_trips_through_strings() {
        for phase in [
            VPSNodePhase::Pending,
            VPSNodePhase::Provisioning,
            VPSNodePhase::Provisioned,
            VPSNodePhase::Joining,
            VPSNodePhase::Ready,
            VPSNodePhase::Terminating,
            VPSNodePhase::Deleting,
            VPSNodePhase::Failed,
        ] {
            assert_eq!(phase.to_string().parse::<VPSNodePhase>(), Ok(phase));
        }
    }
}
