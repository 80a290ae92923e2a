use prometheus::{CounterVec, IntCounter, Opts, Registry};

/// Counters for the scale-down pass.
#[derive(Clone)]
pub struct ScaleDownMetrics {
    /// Scale-down intents blocked before the node was retired, by
    /// reason (`policy`, `safety`, `pdb`, `min_nodes`).
    pub blocked: CounterVec,

    /// Drains that started and then failed.
    pub failed: IntCounter,

    /// Nodes successfully drained and handed over for retirement.
    pub retired: IntCounter,
}

impl ScaleDownMetrics {
    pub fn new(registry: &Registry) -> Self {
        let blocked = CounterVec::new(
            Opts::new(
                "scale_down_blocked_total",
                "Scale-down intents blocked, by reason.",
            ),
            &["reason"],
        )
        .unwrap();
        let failed = IntCounter::new(
            "scale_down_failed_total",
            "Scale-down attempts that failed during drain.",
        )
        .unwrap();
        let retired = IntCounter::new(
            "scale_down_retired_total",
            "Nodes drained and handed over for retirement.",
        )
        .unwrap();
        registry.register(Box::new(blocked.clone())).unwrap();
        registry.register(Box::new(failed.clone())).unwrap();
        registry.register(Box::new(retired.clone())).unwrap();
        ScaleDownMetrics {
            blocked,
            failed,
            retired,
        }
    }
}
