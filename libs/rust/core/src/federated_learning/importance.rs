//! Client importance estimation.
//!
//! Scores are a deterministic function of (global snapshot, client data). A client
//! that cannot be scored gets [`SENTINEL_SCORE`] instead of failing the pass.

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::{panic_message, ClientRecord, ClientUnit};
use super::{ClientId, RoundId};
use crate::error::FlError;
use crate::model::{mean_loss, Model, ModelFactory};
use crate::params::ParamSet;
use crate::telemetry::FL_METRICS;

/// Lowest possible score; ranks last under every selection policy.
pub const SENTINEL_SCORE: f64 = f64::NEG_INFINITY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceScore {
    pub client_id: ClientId,
    pub round_index: RoundId,
    pub value: f64,
}

impl ImportanceScore {
    pub fn is_sentinel(&self) -> bool { self.value == SENTINEL_SCORE }
}

pub trait ImportanceEstimator: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, model: &dyn Model, record: &ClientRecord) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    Loss,
    GradientNorm,
}

impl EstimatorKind {
    pub fn build(self, weight_by_samples: bool) -> Box<dyn ImportanceEstimator> {
        match self {
            EstimatorKind::Loss => Box::new(LossImportance { weight_by_samples }),
            EstimatorKind::GradientNorm => Box::new(GradientNormImportance { weight_by_samples }),
        }
    }
}

/// Mean training loss of the global model on the client's partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossImportance { pub weight_by_samples: bool }

impl ImportanceEstimator for LossImportance {
    fn name(&self) -> &'static str { "loss" }
    fn score(&self, model: &dyn Model, record: &ClientRecord) -> Result<f64> {
        let loss = mean_loss(model, &record.train)?;
        Ok(if self.weight_by_samples { loss * record.train.len() as f64 } else { loss })
    }
}

/// L2 norm of the full-partition gradient at the global parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientNormImportance { pub weight_by_samples: bool }

impl ImportanceEstimator for GradientNormImportance {
    fn name(&self) -> &'static str { "gradient_norm" }
    fn score(&self, model: &dyn Model, record: &ClientRecord) -> Result<f64> {
        let (_, grad) = model.loss_and_gradient(&record.train.full_batch())?;
        let norm = grad.l2_norm();
        Ok(if self.weight_by_samples { norm * record.train.len() as f64 } else { norm })
    }
}

/// Score every client against `global`. Only a model/parameter layout mismatch is fatal.
pub fn estimate_all(estimator: &dyn ImportanceEstimator, factory: &ModelFactory, global: &ParamSet, clients: &[ClientUnit], round: RoundId, parallel: bool) -> Result<Vec<ImportanceScore>, FlError> {
    let mut model = factory();
    model.set_parameters(global.clone()).map_err(|e| FlError::Layout(e.to_string()))?;
    let model: &dyn Model = model.as_ref();
    let score_one = |unit: &ClientUnit| {
        let record = unit.record();
        let value = if record.train.is_empty() {
            debug!(client = record.client_id, "empty_partition_sentinel_score");
            SENTINEL_SCORE
        } else {
            match catch_unwind(AssertUnwindSafe(|| estimator.score(model, record))) {
                Ok(Ok(v)) if v.is_finite() => v,
                Ok(Ok(v)) => { warn!(client = record.client_id, value = v, "non_finite_importance_score"); SENTINEL_SCORE }
                Ok(Err(e)) => { warn!(client = record.client_id, error = %e, "importance_estimation_failed"); SENTINEL_SCORE }
                Err(panic) => { warn!(client = record.client_id, panic = %panic_message(panic.as_ref()), "importance_estimation_panicked"); SENTINEL_SCORE }
            }
        };
        ImportanceScore { client_id: record.client_id, round_index: round, value }
    };
    let scores: Vec<ImportanceScore> = if parallel { clients.par_iter().map(&score_one).collect() } else { clients.iter().map(&score_one).collect() };
    FL_METRICS.estimations_total.add(1, &[]);
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ClientSolver;
    use crate::data::Dataset;
    use crate::federated_learning::UpdateKind;
    use crate::model::ModelConfig;
    use crate::optimizer::OptimizerState;

    fn unit(id: ClientId, train: Dataset) -> ClientUnit {
        let solver = ClientSolver::default();
        let record = ClientRecord { client_id: id, cluster_id: 0, train, held_out: None, optimizer_state: OptimizerState::default() };
        ClientUnit::new(record, Arc::new(solver.optimizer()), solver, UpdateKind::Snapshot)
    }

    fn clients() -> Vec<ClientUnit> {
        vec![
            unit(0, Dataset::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![0, 1])),
            unit(1, Dataset::default()),
            unit(2, Dataset::new(vec![vec![5.0, -5.0]], vec![1])),
            unit(3, Dataset::new(vec![vec![1.0]], vec![0])),
        ]
    }

    #[test]
    fn empty_and_broken_partitions_get_sentinel() {
        let factory = ModelConfig::Softmax { input_dim: 2, num_class: 2, seed: 4 }.factory();
        let global = factory().parameters();
        let scores = estimate_all(&LossImportance::default(), &factory, &global, &clients(), 0, true).unwrap();
        assert_eq!(scores.iter().map(|s| s.client_id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(!scores[0].is_sentinel());
        assert!(scores[1].is_sentinel());
        assert!(scores[3].is_sentinel());
    }

    #[test]
    fn estimation_is_deterministic_across_modes() {
        let factory = ModelConfig::Mlp { input_dim: 2, hidden: 3, num_class: 2, seed: 4 }.factory();
        let global = factory().parameters();
        for kind in [EstimatorKind::Loss, EstimatorKind::GradientNorm] {
            let est = kind.build(true);
            let a = estimate_all(est.as_ref(), &factory, &global, &clients(), 2, true).unwrap();
            let b = estimate_all(est.as_ref(), &factory, &global, &clients(), 2, false).unwrap();
            assert_eq!(a, b);
            assert!(a.iter().all(|s| s.round_index == 2));
        }
    }

    /// Softmax that panics on rows whose first feature is out of range.
    struct Fragile(Box<dyn Model>);
    impl Model for Fragile {
        fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
            if input[0] > 50.0 { panic!("feature out of range"); }
            self.0.forward(input)
        }
        fn loss_and_gradient(&self, batch: &crate::data::Batch<'_>) -> Result<(f32, ParamSet)> { self.0.loss_and_gradient(batch) }
        fn parameters(&self) -> ParamSet { self.0.parameters() }
        fn set_parameters(&mut self, params: ParamSet) -> Result<()> { self.0.set_parameters(params) }
        fn describe(&self) -> crate::model::ModelDescription { self.0.describe() }
    }

    #[test]
    fn panicking_model_scores_sentinel_for_that_client_only() {
        let inner = ModelConfig::Softmax { input_dim: 2, num_class: 2, seed: 4 }.factory();
        let factory: ModelFactory = Arc::new(move || Box::new(Fragile(inner())) as Box<dyn Model>);
        let global = factory().parameters();
        let mut units = clients();
        units[2] = unit(2, Dataset::new(vec![vec![99.0, 0.0]], vec![1]));
        for parallel in [true, false] {
            let scores = estimate_all(&LossImportance::default(), &factory, &global, &units, 0, parallel).unwrap();
            assert!(scores[2].is_sentinel());
            assert!(!scores[0].is_sentinel());
        }
    }

    #[test]
    fn layout_mismatch_is_fatal() {
        let factory = ModelConfig::Softmax { input_dim: 2, num_class: 2, seed: 4 }.factory();
        let bad = ParamSet::new(vec![vec![0.0]]);
        assert!(matches!(estimate_all(&LossImportance::default(), &factory, &bad, &clients(), 0, false), Err(FlError::Layout(_))));
    }
}
