//! Clustered federated learning: client units, importance estimation, selection,
//! aggregation, validation and the round orchestrator that drives them.

pub mod aggregation;
pub mod client;
pub mod importance;
pub mod orchestrator;
pub mod selection;
pub mod validation;

use std::sync::Arc;

use crate::params::ParamSet;

pub type ClientId = usize;
pub type ClusterId = usize;
pub type RoundId = u64;
pub type ModelVersion = u64;

pub use aggregation::{Aggregator, AggregateOutcome, WeightedAverage, Weighting};
pub use client::{ClientRecord, ClientUnit, LocalUpdate, UpdateKind, UpdatePayload};
pub use importance::{EstimatorKind, GradientNormImportance, ImportanceEstimator, ImportanceScore, LossImportance, SENTINEL_SCORE};
pub use orchestrator::{CancelToken, Orchestrator, OrchestratorParts, RoundSummary, RunSummary};
pub use selection::{ClusterBalanced, SelectionPolicy, SelectionPolicyKind, SelectionRefresh, SelectionSet, TopK};
pub use validation::{EvalScope, MetricValues, ScopeSelection, ValidationReport, Validator};

/// The single shared parameter set under training.
///
/// Readers take an `Arc` snapshot; the orchestrator swaps in a new version at the
/// round commit point so nobody ever observes a half-aggregated state.
#[derive(Debug, Clone)]
pub struct GlobalModel {
    pub version: ModelVersion,
    pub params: Arc<ParamSet>,
}

impl GlobalModel {
    pub fn new(params: ParamSet) -> Self { Self { version: 1, params: Arc::new(params) } }

    pub fn snapshot(&self) -> Arc<ParamSet> { Arc::clone(&self.params) }

    pub fn commit(&mut self, params: ParamSet) -> ModelVersion {
        self.params = Arc::new(params);
        self.version += 1;
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_swaps_version_without_touching_snapshots() {
        let mut g = GlobalModel::new(ParamSet::new(vec![vec![1.0]]));
        let snap = g.snapshot();
        assert_eq!(g.commit(ParamSet::new(vec![vec![2.0]])), 2);
        assert_eq!(snap.layers[0][0], 1.0);
        assert_eq!(g.params.layers[0][0], 2.0);
    }
}
