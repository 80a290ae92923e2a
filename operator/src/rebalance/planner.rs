use std::str::FromStr;
use std::time::Duration;
use std::fmt;

use super::analyzer::{Analysis, RebalanceCandidate, RiskTier};

/// How replacements are rolled through a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Small sequential batches; the default.
    Rolling,

    /// All replacements provisioned in parallel before any original is
    /// drained. Needs transient over-capacity.
    Surge,

    /// A full replacement fleet and a single cutover. Highest risk;
    /// never chosen implicitly.
    BlueGreen,
}

impl Strategy {
    pub fn risk(self) -> RiskTier {
        match self {
            Strategy::Rolling => RiskTier::Low,
            Strategy::Surge => RiskTier::Medium,
            Strategy::BlueGreen => RiskTier::High,
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rolling" => Ok(Strategy::Rolling),
            "surge" => Ok(Strategy::Surge),
            "blue-green" | "bluegreen" => Ok(Strategy::BlueGreen),
            other => Err(format!("unknown rebalancing strategy {:?}", other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Rolling => write!(f, "rolling"),
            Strategy::Surge => write!(f, "surge"),
            Strategy::BlueGreen => write!(f, "blue-green"),
        }
    }
}

/// Planner tunables.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub strategy: Strategy,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            strategy: Strategy::Rolling,
            batch_size: 2,
            batch_timeout: Duration::from_secs(1200),
        }
    }
}

/// One node migration inside a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNode {
    /// Name of the VPSNode (and cluster node) being replaced.
    pub node_name: String,
    pub target_offering: String,
}

/// A group of migrations executed together.
#[derive(Clone, Debug)]
pub struct Batch {
    pub id: usize,

    pub nodes: Vec<BatchNode>,

    /// Batches that must complete before this one starts.
    pub depends_on: Vec<usize>,

    pub timeout: Duration,
}

/// Per-batch rollback procedure: uncordon the originals and terminate
/// whatever replacements were provisioned.
#[derive(Clone, Debug)]
pub struct RollbackStep {
    pub batch_id: usize,
    pub uncordon: Vec<String>,
    pub terminate_replacements: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
}

/// A complete migration plan for one group.
#[derive(Clone, Debug)]
pub struct Plan {
    pub group: String,
    pub namespace: String,
    pub strategy: Strategy,
    pub batches: Vec<Batch>,
    pub rollback: RollbackPlan,

    /// Projected monthly savings once every batch lands.
    pub monthly_savings: f64,
}

/// Turns an analysis into an ordered batch plan with rollback
/// metadata. Returns `None` when there is nothing to migrate.
pub fn plan(
    analysis: &Analysis,
    namespace: &str,
    config: &PlannerConfig,
) -> Option<Plan> {
    if analysis.candidates.is_empty() {
        return None;
    }
    let batches = match config.strategy {
        Strategy::Rolling => chunk(&analysis.candidates, config.batch_size.max(1), config.batch_timeout),
        // Surge and blue-green provision the whole fleet at once; they
        // differ in when originals are retired, which the executor
        // decides from the strategy.
        Strategy::Surge | Strategy::BlueGreen => {
            chunk(&analysis.candidates, analysis.candidates.len(), config.batch_timeout)
        }
    };
    let rollback = RollbackPlan {
        steps: batches
            .iter()
            .map(|batch| RollbackStep {
                batch_id: batch.id,
                uncordon: batch.nodes.iter().map(|n| n.node_name.clone()).collect(),
                terminate_replacements: true,
            })
            .collect(),
    };
    Some(Plan {
        group: analysis.group.clone(),
        namespace: namespace.to_owned(),
        strategy: config.strategy,
        monthly_savings: analysis.candidates.iter().map(|c| c.monthly_savings).sum(),
        batches,
        rollback,
    })
}

fn chunk(candidates: &[RebalanceCandidate], size: usize, timeout: Duration) -> Vec<Batch> {
    candidates
        .chunks(size)
        .enumerate()
        .map(|(id, chunk)| Batch {
            id,
            nodes: chunk
                .iter()
                .map(|candidate| BatchNode {
                    node_name: candidate.node_name.clone(),
                    target_offering: candidate.target_offering.clone(),
                })
                .collect(),
            depends_on: if id == 0 { Vec::new() } else { vec![id - 1] },
            timeout,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalance::analyzer::RecommendedAction;

    fn candidate(name: &str, savings: f64) -> RebalanceCandidate {
        RebalanceCandidate {
            node_name: name.to_owned(),
            current_offering: "large".to_owned(),
            target_offering: "value".to_owned(),
            monthly_savings: savings,
            risk: RiskTier::Low,
            priority_score: savings,
        }
    }

    fn analysis(count: usize) -> Analysis {
        Analysis {
            group: "ng-a".to_owned(),
            action: RecommendedAction::Proceed,
            candidates: (0..count)
                .map(|i| candidate(&format!("worker-{}", i), 10.0))
                .collect(),
            checks: Vec::new(),
        }
    }

    #[test]
    fn rolling_chunks_sequentially_with_dependencies() {
        let plan = plan(&analysis(6), "default", &PlannerConfig::default()).unwrap();
        assert_eq!(plan.batches.len(), 3);
        assert_eq!(plan.batches[0].nodes.len(), 2);
        assert!(plan.batches[0].depends_on.is_empty());
        assert_eq!(plan.batches[1].depends_on, vec![0]);
        assert_eq!(plan.batches[2].depends_on, vec![1]);
        assert!((plan.monthly_savings - 60.0).abs() < 1e-9);
    }

    #[test]
    fn surge_provisions_everything_in_one_batch() {
        let config = PlannerConfig {
            strategy: Strategy::Surge,
            ..Default::default()
        };
        let plan = plan(&analysis(5), "default", &config).unwrap();
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].nodes.len(), 5);
    }

    #[test]
    fn every_batch_has_a_rollback_step() {
        let plan = plan(&analysis(5), "default", &PlannerConfig::default()).unwrap();
        assert_eq!(plan.rollback.steps.len(), plan.batches.len());
        for (step, batch) in plan.rollback.steps.iter().zip(plan.batches.iter()) {
            assert_eq!(step.batch_id, batch.id);
            assert_eq!(step.uncordon.len(), batch.nodes.len());
            assert!(step.terminate_replacements);
        }
    }

    #[test]
    fn empty_analysis_yields_no_plan() {
        assert!(plan(&analysis(0), "default", &PlannerConfig::default()).is_none());
    }

    #[test]
    fn strategies_parse_from_config_strings() {
        assert_eq!("rolling".parse::<Strategy>().unwrap(), Strategy::Rolling);
        assert_eq!("surge".parse::<Strategy>().unwrap(), Strategy::Surge);
        assert_eq!("blue-green".parse::<Strategy>().unwrap(), Strategy::BlueGreen);
        assert!("yolo".parse::<Strategy>().is_err());
    }
}
