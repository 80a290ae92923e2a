/// User-friendly message to display in `status.message` whenever a resource
/// is in the `Pending` phase.
pub const PENDING: &str = "Resource first appeared to the controller.";

/// Message for a VPSNode whose create-VM call succeeded.
pub const PROVISIONING: &str = "Waiting for the virtual machine to start.";

/// Message for a VPSNode whose machine is running.
pub const PROVISIONED: &str = "Waiting for the machine to register with the cluster.";

/// Message for a VPSNode whose cluster node exists but is not Ready yet.
pub const JOINING: &str = "Waiting for the cluster node to become Ready.";

/// Message for a VPSNode in service.
pub const READY: &str = "Node is in service.";

/// Message for a VPSNode being drained ahead of deletion.
pub const TERMINATING: &str = "Draining workloads off the node.";

/// Message for a VPSNode whose machine is being deleted at VPSie.
pub const DELETING: &str = "Deleting the virtual machine.";

/// Message for a NodeGroup whose nodes are all present and ready.
pub const GROUP_READY: &str = "All desired nodes are ready.";

/// Message for a NodeGroup with a scale operation in flight.
pub const GROUP_SCALING: &str = "Converging towards the desired node count.";

/// Message for a NodeGroup whose deletion is pending teardown of its nodes.
pub const GROUP_TERMINATING: &str = "Waiting for owned nodes to be removed.";
