use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

/// Prefix shared by all metric families exported by the operator.
pub const METRICS_PREFIX: &str = "vpsie_autoscaler";

/// Maximum length of an exported label value.
const MAX_LABEL_LEN: usize = 100;

/// Sanitizes a label value before it reaches the metric backend:
/// characters outside `[A-Za-z0-9_.-]` become `_`, values are truncated
/// to 100 characters, and an empty value becomes `unknown`.
pub fn sanitize_label(value: &str) -> String {
    if value.is_empty() {
        return "unknown".to_owned();
    }
    value
        .chars()
        .take(MAX_LABEL_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Contains the metrics for a controller. Each controller uses unique
/// metric names, but they share these metric types. All collectors are
/// registered on the injected registry rather than a process-global one.
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Number of reconciliations by the controller.
    pub reconcile_counter: CounterVec,

    /// Number of actions taken by the controller.
    pub action_counter: CounterVec,

    /// Number of reconciliations that returned an error.
    pub error_counter: CounterVec,

    /// Full reconciliation latency of the controller.
    pub reconcile_histogram: HistogramVec,
}

impl ControllerMetrics {
    /// Creates a new set of metrics for a controller. The tag is used
    /// to associate the metrics with a specific controller.
    pub fn new(registry: &Registry, tag: &str) -> Self {
        let pre = format!("{}_{}", METRICS_PREFIX, tag);
        let reconcile_counter = CounterVec::new(
            Opts::new(
                format!("{}_reconcile_total", pre),
                "Number of reconciliations by the controller.",
            ),
            &["name", "namespace"],
        )
        .unwrap();
        let action_counter = CounterVec::new(
            Opts::new(
                format!("{}_action_total", pre),
                "Number of actions taken by the controller.",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let error_counter = CounterVec::new(
            Opts::new(
                format!("{}_reconcile_errors_total", pre),
                "Number of reconciliations that returned an error.",
            ),
            &["name", "namespace"],
        )
        .unwrap();
        let reconcile_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_reconcile_duration_seconds", pre),
                "Reconciliation latency of the controller.",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        registry
            .register(Box::new(reconcile_counter.clone()))
            .unwrap();
        registry.register(Box::new(action_counter.clone())).unwrap();
        registry.register(Box::new(error_counter.clone())).unwrap();
        registry
            .register(Box::new(reconcile_histogram.clone()))
            .unwrap();
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            error_counter,
            reconcile_histogram,
        }
    }
}
