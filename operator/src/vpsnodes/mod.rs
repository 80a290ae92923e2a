mod actions;
mod metrics;
mod reconcile;

pub use metrics::VpsNodeMetrics;
pub use reconcile::{run, ContextData};
