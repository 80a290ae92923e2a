use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::util::clock::Clock;

/// Upper bound on samples retained per node.
pub const MAX_SAMPLES: usize = 50;

/// One CPU/memory observation for a node.
#[derive(Clone, Debug, PartialEq)]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Rolling utilization state for one node. Snapshots returned by the
/// tracker are fully detached copies of this struct.
#[derive(Clone, Debug)]
pub struct NodeUtilization {
    pub node_name: String,
    pub samples: Vec<UtilizationSample>,
    pub cpu_mean: f64,
    pub memory_mean: f64,
    pub last_updated: DateTime<Utc>,
    pub is_underutilized: bool,
}

impl NodeUtilization {
    /// Returns true once the retained samples span the observation
    /// window.
    pub fn window_full(&self, window: ChronoDuration) -> bool {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp >= window,
            _ => false,
        }
    }
}

/// Thresholds and window driving the underutilization flag.
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// CPU percentage below which a sample counts as idle.
    pub cpu_threshold: f64,

    /// Memory percentage below which a sample counts as idle.
    pub memory_threshold: f64,

    /// Time span samples must cover before underutilization is asserted.
    pub observation_window: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            cpu_threshold: 20.0,
            memory_threshold: 20.0,
            observation_window: Duration::from_secs(600),
        }
    }
}

/// A fresh usage reading handed to the tracker, one per live node.
#[derive(Clone, Debug)]
pub struct NodeUsage {
    pub node_name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Per-node rolling windows guarded by a reader/writer lock. Callers
/// only ever receive deep copies; nothing outside this module holds a
/// reference into the map after a lock is released.
pub struct UtilizationTracker {
    inner: RwLock<HashMap<String, NodeUtilization>>,
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
}

impl UtilizationTracker {
    pub fn new(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        UtilizationTracker {
            inner: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Appends one sample per reading, recomputes the rolling means and
    /// the underutilization flag, and drops state for nodes that are no
    /// longer in the live set.
    pub fn record(&self, usages: &[NodeUsage], live_nodes: &HashSet<String>) {
        let now = self.clock.now();
        let window = ChronoDuration::from_std(self.config.observation_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(600));
        let mut inner = self.inner.write();

        // GC first so a node removed from the cluster disappears even
        // if the metrics source still reports a final reading for it.
        inner.retain(|name, _| live_nodes.contains(name));

        for usage in usages {
            if !live_nodes.contains(&usage.node_name) {
                continue;
            }
            let entry = inner
                .entry(usage.node_name.clone())
                .or_insert_with(|| NodeUtilization {
                    node_name: usage.node_name.clone(),
                    samples: Vec::new(),
                    cpu_mean: 0.0,
                    memory_mean: 0.0,
                    last_updated: now,
                    is_underutilized: false,
                });
            let sample = UtilizationSample {
                timestamp: now,
                cpu_percent: usage.cpu_percent,
                memory_percent: usage.memory_percent,
            };
            if entry.samples.len() >= MAX_SAMPLES {
                // Allocate a fresh ring rather than shifting in place so
                // a previously returned snapshot keeps its backing data.
                let mut rolled: Vec<UtilizationSample> =
                    Vec::with_capacity(MAX_SAMPLES);
                rolled.extend_from_slice(&entry.samples[entry.samples.len() - MAX_SAMPLES + 1..]);
                rolled.push(sample);
                entry.samples = rolled;
            } else {
                entry.samples.push(sample);
            }
            let count = entry.samples.len() as f64;
            entry.cpu_mean = entry.samples.iter().map(|s| s.cpu_percent).sum::<f64>() / count;
            entry.memory_mean =
                entry.samples.iter().map(|s| s.memory_percent).sum::<f64>() / count;
            entry.last_updated = now;
            entry.is_underutilized = entry.window_full(window)
                && entry.samples.iter().all(|s| {
                    s.cpu_percent < self.config.cpu_threshold
                        && s.memory_percent < self.config.memory_threshold
                });
        }
    }

    /// Returns a detached copy of one node's state.
    pub fn snapshot(&self, node_name: &str) -> Option<NodeUtilization> {
        self.inner.read().get(node_name).cloned()
    }

    /// Returns detached copies for every tracked node accepted by the
    /// filter.
    pub fn snapshot_where(&self, filter: impl Fn(&NodeUtilization) -> bool) -> Vec<NodeUtilization> {
        self.inner
            .read()
            .values()
            .filter(|entry| filter(entry))
            .cloned()
            .collect()
    }

    /// Names of all currently tracked nodes.
    pub fn tracked_nodes(&self) -> HashSet<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    fn usage(name: &str, cpu: f64, memory: f64) -> NodeUsage {
        NodeUsage {
            node_name: name.to_owned(),
            cpu_percent: cpu,
            memory_percent: memory,
        }
    }

    fn live(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    fn tracker(window_secs: u64) -> (UtilizationTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new("2026-03-01T00:00:00Z".parse().unwrap()));
        let config = TrackerConfig {
            cpu_threshold: 20.0,
            memory_threshold: 20.0,
            observation_window: Duration::from_secs(window_secs),
        };
        (UtilizationTracker::new(config, clock.clone()), clock)
    }

    #[test]
    fn underutilized_only_after_full_window() {
        let (tracker, clock) = tracker(120);
        let nodes = live(&["worker-1"]);
        tracker.record(&[usage("worker-1", 5.0, 5.0)], &nodes);
        assert!(!tracker.snapshot("worker-1").unwrap().is_underutilized);

        clock.advance(ChronoDuration::seconds(60));
        tracker.record(&[usage("worker-1", 5.0, 5.0)], &nodes);
        assert!(!tracker.snapshot("worker-1").unwrap().is_underutilized);

        clock.advance(ChronoDuration::seconds(60));
        tracker.record(&[usage("worker-1", 5.0, 5.0)], &nodes);
        assert!(tracker.snapshot("worker-1").unwrap().is_underutilized);
    }

    #[test]
    fn one_hot_sample_clears_the_flag() {
        let (tracker, clock) = tracker(60);
        let nodes = live(&["worker-1"]);
        for _ in 0..3 {
            tracker.record(&[usage("worker-1", 5.0, 5.0)], &nodes);
            clock.advance(ChronoDuration::seconds(60));
        }
        assert!(tracker.snapshot("worker-1").unwrap().is_underutilized);
        tracker.record(&[usage("worker-1", 95.0, 5.0)], &nodes);
        assert!(!tracker.snapshot("worker-1").unwrap().is_underutilized);
    }

    #[test]
    fn ring_is_bounded() {
        let (tracker, clock) = tracker(60);
        let nodes = live(&["worker-1"]);
        for _ in 0..(MAX_SAMPLES + 10) {
            tracker.record(&[usage("worker-1", 10.0, 10.0)], &nodes);
            clock.advance(ChronoDuration::seconds(10));
        }
        assert_eq!(tracker.snapshot("worker-1").unwrap().samples.len(), MAX_SAMPLES);
    }

    #[test]
    fn removed_nodes_are_garbage_collected() {
        let (tracker, _clock) = tracker(60);
        let all = live(&["a", "b", "c"]);
        tracker.record(
            &[usage("a", 1.0, 1.0), usage("b", 1.0, 1.0), usage("c", 1.0, 1.0)],
            &all,
        );
        assert_eq!(tracker.tracked_nodes().len(), 3);

        let remaining = live(&["a", "c"]);
        tracker.record(&[usage("a", 1.0, 1.0), usage("c", 1.0, 1.0)], &remaining);
        assert_eq!(tracker.tracked_nodes(), remaining);
    }

    #[test]
    fn readings_for_unknown_nodes_are_ignored() {
        let (tracker, _clock) = tracker(60);
        tracker.record(&[usage("gone", 1.0, 1.0)], &live(&["present"]));
        assert!(tracker.snapshot("gone").is_none());
    }

    #[test]
    fn snapshots_do_not_alias_tracker_state() {
        let (tracker, clock) = tracker(60);
        let nodes = live(&["worker-1"]);
        tracker.record(&[usage("worker-1", 10.0, 10.0)], &nodes);
        let mut snapshot = tracker.snapshot("worker-1").unwrap();
        snapshot.samples[0].cpu_percent = 99.0;
        snapshot.cpu_mean = 99.0;

        clock.advance(ChronoDuration::seconds(10));
        tracker.record(&[usage("worker-1", 10.0, 10.0)], &nodes);
        let fresh = tracker.snapshot("worker-1").unwrap();
        assert!((fresh.samples[0].cpu_percent - 10.0).abs() < f64::EPSILON);
        assert!((fresh.cpu_mean - 10.0).abs() < f64::EPSILON);
    }
}
