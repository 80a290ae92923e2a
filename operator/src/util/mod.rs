use std::time::Duration;

pub mod clock;
pub mod events;
pub mod finalizer;
pub mod metrics;
pub mod patch;
pub mod quantity;

pub(crate) mod messages;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "vpsie-autoscaler";

/// Finalizer guarding NodeGroup deletion until all owned VPSNodes are gone.
pub(crate) const NODEGROUP_FINALIZER: &str = "vpsie.autoscaler/nodegroup";

/// Finalizer guarding VPSNode deletion until the backing VM is confirmed
/// removed at VPSie.
pub(crate) const VPSNODE_FINALIZER: &str = "vpsie.autoscaler/vpsnode";

/// Annotation set by the scale-down manager on a VPSNode whose node has
/// been drained and may now be retired.
pub(crate) const RETIRE_ANNOTATION: &str = "autoscaler.vpsie.io/retire";

/// Annotation blocking scale-down of a node when set to "true".
pub(crate) const SCALE_DOWN_DISABLED_ANNOTATION: &str = "autoscaler.vpsie.io/scale-down-disabled";

/// Annotation restricting scale-down of a node to a daily HH:MM-HH:MM window.
pub(crate) const ALLOWED_HOURS_ANNOTATION: &str = "autoscaler.vpsie.io/scale-down-allowed-hours";

/// Annotation recording the outcome of the last drain on a cluster node.
pub(crate) const DRAIN_STATUS_ANNOTATION: &str = "autoscaler.vpsie.io/drain-status";

/// Value of [`DRAIN_STATUS_ANNOTATION`] after a successful drain.
pub(crate) const DRAIN_COMPLETED: &str = "completed";

/// Value of [`DRAIN_STATUS_ANNOTATION`] after a failed drain.
pub(crate) const DRAIN_FAILED: &str = "failed";

/// Annotation recording the RFC3339 time of the last rebalance touching
/// a node group.
pub(crate) const LAST_REBALANCE_ANNOTATION: &str = "autoscaler.vpsie.io/last-rebalance";

/// Annotation parking a rebalance plan until the operator acknowledges
/// the failure that paused it.
pub(crate) const REBALANCE_PAUSED_ANNOTATION: &str = "autoscaler.vpsie.io/rebalance-paused";
