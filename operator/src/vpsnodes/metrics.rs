use const_format::concatcp;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

use crate::util::metrics::{ControllerMetrics, METRICS_PREFIX};

/// Metrics for the VPSNode controller: the shared controller bundle
/// plus lifecycle-specific families.
#[derive(Clone)]
pub struct VpsNodeMetrics {
    pub controller: ControllerMetrics,

    /// Phase transitions, labelled by the edge.
    pub phase_transitions: CounterVec,

    /// Time spent in each phase before leaving it.
    pub phase_duration: HistogramVec,
}

impl VpsNodeMetrics {
    pub fn new(registry: &Registry) -> Self {
        let controller = ControllerMetrics::new(registry, "vpsnode");
        let phase_transitions = CounterVec::new(
            Opts::new(
                concatcp!(METRICS_PREFIX, "_vpsnode_phase_transitions_total"),
                "VPSNode phase transitions, by edge.",
            ),
            &["from", "to"],
        )
        .unwrap();
        let phase_duration = HistogramVec::new(
            HistogramOpts::new(
                concatcp!(METRICS_PREFIX, "_vpsnode_phase_duration_seconds"),
                "Time spent in each VPSNode phase.",
            )
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 180.0, 600.0, 1800.0]),
            &["phase"],
        )
        .unwrap();
        registry
            .register(Box::new(phase_transitions.clone()))
            .unwrap();
        registry.register(Box::new(phase_duration.clone())).unwrap();
        VpsNodeMetrics {
            controller,
            phase_transitions,
            phase_duration,
        }
    }
}
