pub mod actions;
mod metrics;
mod reconcile;

pub use metrics::NodeGroupMetrics;
pub use reconcile::{run, ContextData};
