mod condition;
mod nodegroup;
mod vpsnode;

pub use condition::*;
pub use nodegroup::*;
pub use vpsnode::*;

/// API group shared by all resources owned by the autoscaler.
pub const API_GROUP: &str = "autoscaler.vpsie.io";

/// API version shared by all resources owned by the autoscaler.
pub const API_VERSION: &str = "v1alpha1";

/// Label applied to every cluster node provisioned by the autoscaler.
/// Nodes without this label are never touched.
pub const MANAGED_BY_LABEL: &str = "autoscaler.vpsie.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] for nodes owned by this operator.
pub const MANAGED_BY_VALUE: &str = "vpsie-autoscaler";

/// Label connecting a cluster node or a [`VPSNode`] back to its
/// owning [`NodeGroup`].
pub const NODE_GROUP_LABEL: &str = "autoscaler.vpsie.io/node-group";
