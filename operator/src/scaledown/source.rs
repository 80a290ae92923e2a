use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{
    api::ListParams,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Api, Client, ResourceExt,
};

use super::tracker::NodeUsage;
use crate::util::{quantity, Error};

/// Source of per-node usage readings, abstracted so the tracker can be
/// driven by a fake in tests.
#[async_trait]
pub trait NodeMetricsSource: Send + Sync {
    async fn sample(&self) -> Result<Vec<NodeUsage>, Error>;
}

/// Reads `metrics.k8s.io/v1beta1` node metrics and converts absolute
/// usage into percentages of each node's allocatable resources.
pub struct MetricsServerSource {
    client: Client,
}

impl MetricsServerSource {
    pub fn new(client: Client) -> Self {
        MetricsServerSource { client }
    }
}

#[async_trait]
impl NodeMetricsSource for MetricsServerSource {
    async fn sample(&self) -> Result<Vec<NodeUsage>, Error> {
        let node_api: Api<Node> = Api::all(self.client.clone());
        let nodes = node_api.list(&ListParams::default()).await?;

        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "nodes");
        let metrics_api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let metrics = metrics_api.list(&ListParams::default()).await?;

        let mut usages = Vec::with_capacity(metrics.items.len());
        for item in metrics.items {
            let name = item.name_any();
            let node = match nodes.items.iter().find(|n| n.name_any() == name) {
                Some(node) => node,
                None => continue,
            };
            let allocatable = match node.status.as_ref().and_then(|s| s.allocatable.as_ref()) {
                Some(allocatable) => allocatable,
                None => continue,
            };
            let alloc_cpu = allocatable.get("cpu").and_then(quantity::cpu_millis);
            let alloc_memory = allocatable.get("memory").and_then(quantity::memory_bytes);

            let usage = &item.data["usage"];
            let used_cpu = usage["cpu"]
                .as_str()
                .map(|s| Quantity(s.to_owned()))
                .as_ref()
                .and_then(quantity::cpu_millis);
            let used_memory = usage["memory"]
                .as_str()
                .map(|s| Quantity(s.to_owned()))
                .as_ref()
                .and_then(quantity::memory_bytes);

            match (alloc_cpu, alloc_memory, used_cpu, used_memory) {
                (Some(ac), Some(am), Some(uc), Some(um)) if ac > 0 && am > 0 => {
                    usages.push(NodeUsage {
                        node_name: name,
                        cpu_percent: (uc as f64 / ac as f64 * 100.0).clamp(0.0, 100.0),
                        memory_percent: (um as f64 / am as f64 * 100.0).clamp(0.0, 100.0),
                    });
                }
                _ => {
                    tracing::warn!(node = %name, "skipping node with unparseable metrics");
                }
            }
        }
        Ok(usages)
    }
}
