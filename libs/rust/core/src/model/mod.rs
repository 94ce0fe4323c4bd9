//! Model capability interface.
//!
//! The orchestrator only ever talks to `dyn Model`; architectures are interchangeable
//! as long as they can run a forward pass, expose their parameters and differentiate
//! a batch loss for the local optimizer.

mod mlp;
mod softmax;

pub use mlp::MlpClassifier;
pub use softmax::SoftmaxRegression;

use std::sync::Arc;

use anyhow::{bail, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::{Batch, Dataset};
use crate::params::ParamSet;

pub trait Model: Send + Sync {
    /// Class probabilities for one input row.
    fn forward(&self, input: &[f32]) -> Result<Vec<f32>>;
    /// Mean cross-entropy over the batch and its gradient w.r.t. [`Model::parameters`].
    fn loss_and_gradient(&self, batch: &Batch<'_>) -> Result<(f32, ParamSet)>;
    fn parameters(&self) -> ParamSet;
    fn set_parameters(&mut self, params: ParamSet) -> Result<()>;
    fn describe(&self) -> ModelDescription;
}

/// Builds fresh model instances; takes no orchestration arguments.
pub type ModelFactory = Arc<dyn Fn() -> Box<dyn Model> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    pub layer_shapes: Vec<usize>,
    pub num_params: usize,
    pub num_class: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelConfig {
    Softmax { input_dim: usize, num_class: usize, #[serde(default)] seed: u64 },
    Mlp { input_dim: usize, hidden: usize, num_class: usize, #[serde(default)] seed: u64 },
}

impl Default for ModelConfig {
    fn default() -> Self { ModelConfig::Mlp { input_dim: 16, hidden: 32, num_class: 4, seed: 7 } }
}

impl ModelConfig {
    pub fn num_class(&self) -> usize {
        match self { ModelConfig::Softmax { num_class, .. } | ModelConfig::Mlp { num_class, .. } => *num_class }
    }

    pub fn factory(&self) -> ModelFactory {
        match self.clone() {
            ModelConfig::Softmax { input_dim, num_class, seed } => Arc::new(move || Box::new(SoftmaxRegression::new(input_dim, num_class, seed)) as Box<dyn Model>),
            ModelConfig::Mlp { input_dim, hidden, num_class, seed } => Arc::new(move || Box::new(MlpClassifier::new(input_dim, hidden, num_class, seed)) as Box<dyn Model>),
        }
    }
}

/// Mean cross-entropy of `model` over a dataset. Empty datasets are an error.
pub fn mean_loss(model: &dyn Model, data: &Dataset) -> Result<f64> {
    if data.is_empty() { bail!("empty dataset"); }
    if !data.is_consistent() { bail!("{} feature rows for {} labels", data.features.len(), data.labels.len()); }
    let mut total = 0.0f64;
    for (x, y) in data.features.iter().zip(&data.labels) {
        let probs = model.forward(x)?;
        total += cross_entropy(&probs, *y)? as f64;
    }
    Ok(total / data.len() as f64)
}

pub fn cross_entropy(probs: &[f32], label: usize) -> Result<f32> {
    match probs.get(label) {
        Some(p) => Ok(-(p.max(1e-12)).ln()),
        None => bail!("label {label} out of range for {} classes", probs.len()),
    }
}

pub fn argmax(values: &[f32]) -> usize {
    values.iter().enumerate().fold((0, f32::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best }).0
}

pub(crate) fn softmax_in_place(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in logits.iter_mut() { *v = (*v - max).exp(); sum += *v; }
    if sum > 0.0 { for v in logits.iter_mut() { *v /= sum; } }
}

/// Glorot-uniform weights for a `fan_out x fan_in` matrix.
pub(crate) fn xavier_uniform(rng: &mut StdRng, fan_in: usize, fan_out: usize) -> Vec<f32> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    (0..fan_in * fan_out).map(|_| rng.gen_range(-limit..=limit)).collect()
}

pub(crate) fn seeded(seed: u64) -> StdRng { StdRng::seed_from_u64(seed) }

pub(crate) fn check_layout(expected: &[usize], params: &ParamSet) -> Result<()> {
    if params.shape() != expected { bail!("parameter layout {:?} does not match {:?}", params.shape(), expected); }
    Ok(())
}

pub(crate) fn check_label(label: usize, num_class: usize) -> Result<()> {
    if label >= num_class { bail!("label {label} out of range for {num_class} classes"); }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Central-difference check of `loss_and_gradient` on every parameter.
    pub fn check_gradient(model: &mut dyn Model, batch: &Batch<'_>) {
        let (_, grad) = model.loss_and_gradient(batch).unwrap();
        let base = model.parameters();
        let eps = 1e-3f32;
        for (li, layer) in base.layers.iter().enumerate() {
            for wi in 0..layer.len() {
                let mut plus = base.clone();
                plus.layers[li][wi] += eps;
                model.set_parameters(plus).unwrap();
                let (lp, _) = model.loss_and_gradient(batch).unwrap();
                let mut minus = base.clone();
                minus.layers[li][wi] -= eps;
                model.set_parameters(minus).unwrap();
                let (lm, _) = model.loss_and_gradient(batch).unwrap();
                let numeric = (lp - lm) / (2.0 * eps);
                let analytic = grad.layers[li][wi];
                assert!((numeric - analytic).abs() < 2e-2, "layer {li} weight {wi}: numeric {numeric} analytic {analytic}");
            }
        }
        model.set_parameters(base).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_is_deterministic() {
        let cfg = ModelConfig::Mlp { input_dim: 3, hidden: 4, num_class: 2, seed: 11 };
        let f = cfg.factory();
        assert_eq!(f().parameters(), f().parameters());
        assert_eq!(f().describe().num_class, 2);
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut v = vec![1.0, 2.0, 3.0];
        softmax_in_place(&mut v);
        assert!((v.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(argmax(&v), 2);
    }

    #[test]
    fn cross_entropy_rejects_bad_label() {
        assert!(cross_entropy(&[0.5, 0.5], 2).is_err());
        assert!((cross_entropy(&[0.5, 0.5], 0).unwrap() - 0.5f32.ln().abs()).abs() < 1e-6);
    }
}
