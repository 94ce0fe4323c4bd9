//! Local optimizer collaborator used inside a client unit.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::data::Batch;
use crate::model::Model;
use crate::params::ParamSet;

/// Per-client optimizer state carried across rounds (e.g. momentum buffers).
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    pub velocity: Option<ParamSet>,
    pub steps: u64,
}

pub trait LocalOptimizer: Send + Sync {
    /// One update on `batch`; returns the batch loss before the update.
    fn step(&self, model: &mut dyn Model, batch: &Batch<'_>, state: &mut OptimizerState) -> Result<f32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl Default for Sgd {
    fn default() -> Self { Self { learning_rate: 0.05, momentum: 0.0, weight_decay: 0.0 } }
}

impl LocalOptimizer for Sgd {
    fn step(&self, model: &mut dyn Model, batch: &Batch<'_>, state: &mut OptimizerState) -> Result<f32> {
        let (loss, mut grad) = model.loss_and_gradient(batch)?;
        let mut params = model.parameters();
        if self.weight_decay != 0.0 { grad.axpy(self.weight_decay, &params)?; }
        let direction = if self.momentum > 0.0 {
            let velocity = match state.velocity.take() {
                Some(mut v) if v.same_shape(&grad) => { v.scale(self.momentum); v.axpy(1.0, &grad)?; v }
                Some(_) => bail!("momentum buffer does not match parameter layout"),
                None => grad,
            };
            state.velocity = Some(velocity.clone());
            velocity
        } else {
            grad
        };
        params.axpy(-self.learning_rate, &direction)?;
        model.set_parameters(params)?;
        state.steps += 1;
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::model::SoftmaxRegression;

    fn separable() -> Dataset {
        Dataset::new(vec![vec![1.0, 0.0], vec![0.9, 0.1], vec![0.0, 1.0], vec![0.1, 0.9]], vec![0, 0, 1, 1])
    }

    #[test]
    fn sgd_reduces_loss() {
        let ds = separable();
        let mut m = SoftmaxRegression::new(2, 2, 3);
        let opt = Sgd { learning_rate: 0.5, ..Default::default() };
        let mut st = OptimizerState::default();
        let first = opt.step(&mut m, &ds.full_batch(), &mut st).unwrap();
        let mut last = first;
        for _ in 0..50 { last = opt.step(&mut m, &ds.full_batch(), &mut st).unwrap(); }
        assert!(last < first);
        assert_eq!(st.steps, 51);
        assert!(st.velocity.is_none());
    }

    #[test]
    fn momentum_buffer_is_kept() {
        let ds = separable();
        let mut m = SoftmaxRegression::new(2, 2, 3);
        let opt = Sgd { learning_rate: 0.1, momentum: 0.9, weight_decay: 1e-4 };
        let mut st = OptimizerState::default();
        opt.step(&mut m, &ds.full_batch(), &mut st).unwrap();
        assert!(st.velocity.as_ref().map(|v| v.same_shape(&m.parameters())).unwrap_or(false));
    }
}
