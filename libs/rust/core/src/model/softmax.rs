use anyhow::{bail, Result};

use super::{check_label, check_layout, seeded, softmax_in_place, xavier_uniform, Model, ModelDescription};
use crate::data::Batch;
use crate::params::ParamSet;

/// Multinomial logistic regression. Layers: `[weights (class-major), bias]`.
#[derive(Debug, Clone)]
pub struct SoftmaxRegression {
    input_dim: usize,
    num_class: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl SoftmaxRegression {
    pub fn new(input_dim: usize, num_class: usize, seed: u64) -> Self {
        let mut rng = seeded(seed);
        Self { input_dim, num_class, weights: xavier_uniform(&mut rng, input_dim, num_class), bias: vec![0.0; num_class] }
    }

    fn layout(&self) -> [usize; 2] { [self.input_dim * self.num_class, self.num_class] }

    fn logits(&self, input: &[f32]) -> Result<Vec<f32>> {
        if input.len() != self.input_dim { bail!("expected {} features, got {}", self.input_dim, input.len()); }
        Ok((0..self.num_class)
            .map(|k| {
                let row = &self.weights[k * self.input_dim..(k + 1) * self.input_dim];
                self.bias[k] + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>()
            })
            .collect())
    }
}

impl Model for SoftmaxRegression {
    fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        let mut out = self.logits(input)?;
        softmax_in_place(&mut out);
        Ok(out)
    }

    fn loss_and_gradient(&self, batch: &Batch<'_>) -> Result<(f32, ParamSet)> {
        if batch.is_empty() { bail!("empty batch"); }
        let mut gw = vec![0.0f32; self.weights.len()];
        let mut gb = vec![0.0f32; self.num_class];
        let mut loss = 0.0f32;
        for (x, &y) in batch.inputs.iter().zip(&batch.labels) {
            check_label(y, self.num_class)?;
            let probs = self.forward(x)?;
            loss -= probs[y].max(1e-12).ln();
            for k in 0..self.num_class {
                let d = probs[k] - if k == y { 1.0 } else { 0.0 };
                gb[k] += d;
                for (g, xi) in gw[k * self.input_dim..(k + 1) * self.input_dim].iter_mut().zip(x.iter()) { *g += d * xi; }
            }
        }
        let n = batch.len() as f32;
        let mut grad = ParamSet::new(vec![gw, gb]);
        grad.scale(1.0 / n);
        Ok((loss / n, grad))
    }

    fn parameters(&self) -> ParamSet { ParamSet::new(vec![self.weights.clone(), self.bias.clone()]) }

    fn set_parameters(&mut self, params: ParamSet) -> Result<()> {
        check_layout(&self.layout(), &params)?;
        let mut layers = params.layers.into_iter();
        if let (Some(w), Some(b)) = (layers.next(), layers.next()) {
            self.weights = w;
            self.bias = b;
        }
        Ok(())
    }

    fn describe(&self) -> ModelDescription {
        ModelDescription { name: "softmax_regression".into(), layer_shapes: self.layout().to_vec(), num_params: self.weights.len() + self.bias.len(), num_class: self.num_class }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::model::test_support::check_gradient;

    #[test]
    fn gradient_matches_finite_differences() {
        let ds = Dataset::new(vec![vec![0.5, -1.0, 0.25], vec![-0.3, 0.8, 1.2], vec![1.0, 0.0, -0.5]], vec![0, 2, 1]);
        let mut m = SoftmaxRegression::new(3, 3, 5);
        check_gradient(&mut m, &ds.full_batch());
    }

    #[test]
    fn rejects_wrong_layout_and_width() {
        let mut m = SoftmaxRegression::new(2, 2, 1);
        assert!(m.set_parameters(ParamSet::new(vec![vec![0.0; 3], vec![0.0; 2]])).is_err());
        assert!(m.forward(&[1.0]).is_err());
        assert_eq!(m.describe().num_params, 6);
    }
}
