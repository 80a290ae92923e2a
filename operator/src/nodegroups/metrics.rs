use const_format::concatcp;
use prometheus::{GaugeVec, Opts, Registry};

use crate::util::metrics::{ControllerMetrics, METRICS_PREFIX};

/// Metrics for the NodeGroup controller: the shared controller bundle
/// plus per-group population gauges.
#[derive(Clone)]
pub struct NodeGroupMetrics {
    pub controller: ControllerMetrics,
    pub desired_nodes: GaugeVec,
    pub current_nodes: GaugeVec,
    pub ready_nodes: GaugeVec,
}

impl NodeGroupMetrics {
    pub fn new(registry: &Registry) -> Self {
        let controller = ControllerMetrics::new(registry, "nodegroup");
        let labels = ["name", "namespace"];
        let desired_nodes = GaugeVec::new(
            Opts::new(
                concatcp!(METRICS_PREFIX, "_nodegroup_desired_nodes"),
                "Desired node count per group.",
            ),
            &labels,
        )
        .unwrap();
        let current_nodes = GaugeVec::new(
            Opts::new(
                concatcp!(METRICS_PREFIX, "_nodegroup_current_nodes"),
                "Current node count per group.",
            ),
            &labels,
        )
        .unwrap();
        let ready_nodes = GaugeVec::new(
            Opts::new(
                concatcp!(METRICS_PREFIX, "_nodegroup_ready_nodes"),
                "Ready node count per group.",
            ),
            &labels,
        )
        .unwrap();
        registry.register(Box::new(desired_nodes.clone())).unwrap();
        registry.register(Box::new(current_nodes.clone())).unwrap();
        registry.register(Box::new(ready_nodes.clone())).unwrap();
        NodeGroupMetrics {
            controller,
            desired_nodes,
            current_nodes,
            ready_nodes,
        }
    }
}
