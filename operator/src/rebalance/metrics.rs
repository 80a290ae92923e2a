use prometheus::{CounterVec, GaugeVec, IntCounter, Opts, Registry};

/// Observability for the rebalancing pipeline.
#[derive(Clone)]
pub struct RebalanceMetrics {
    /// Plans created, by strategy.
    pub plans: CounterVec,

    /// Terminal plan outcomes (`completed`, `paused`).
    pub outcomes: CounterVec,

    /// Batches that ran to completion.
    pub batches_completed: IntCounter,

    /// Batch rollbacks performed.
    pub rollbacks: IntCounter,

    /// Projected monthly savings of the most recent plan per group.
    pub monthly_savings: GaugeVec,
}

impl RebalanceMetrics {
    pub fn new(registry: &Registry) -> Self {
        let plans = CounterVec::new(
            Opts::new("rebalance_plans_total", "Rebalance plans created, by strategy."),
            &["strategy"],
        )
        .unwrap();
        let outcomes = CounterVec::new(
            Opts::new("rebalance_plan_outcomes_total", "Terminal plan outcomes."),
            &["outcome"],
        )
        .unwrap();
        let batches_completed = IntCounter::new(
            "rebalance_batches_completed_total",
            "Rebalance batches that ran to completion.",
        )
        .unwrap();
        let rollbacks = IntCounter::new(
            "rebalance_rollbacks_total",
            "Rebalance batch rollbacks performed.",
        )
        .unwrap();
        let monthly_savings = GaugeVec::new(
            Opts::new(
                "rebalance_projected_monthly_savings",
                "Projected monthly savings of the most recent plan per group.",
            ),
            &["group"],
        )
        .unwrap();
        registry.register(Box::new(plans.clone())).unwrap();
        registry.register(Box::new(outcomes.clone())).unwrap();
        registry.register(Box::new(batches_completed.clone())).unwrap();
        registry.register(Box::new(rollbacks.clone())).unwrap();
        registry.register(Box::new(monthly_savings.clone())).unwrap();
        RebalanceMetrics {
            plans,
            outcomes,
            batches_completed,
            rollbacks,
            monthly_savings,
        }
    }
}
