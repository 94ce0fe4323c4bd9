use anyhow::{bail, Result};

use super::{check_label, check_layout, seeded, softmax_in_place, xavier_uniform, Model, ModelDescription};
use crate::data::Batch;
use crate::params::ParamSet;

/// One hidden ReLU layer followed by a softmax output.
/// Layers: `[w1 (hidden-major), b1, w2 (class-major), b2]`.
#[derive(Debug, Clone)]
pub struct MlpClassifier {
    input_dim: usize,
    hidden: usize,
    num_class: usize,
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: Vec<f32>,
}

struct Activations { pre: Vec<f32>, hidden: Vec<f32>, probs: Vec<f32> }

impl MlpClassifier {
    pub fn new(input_dim: usize, hidden: usize, num_class: usize, seed: u64) -> Self {
        let mut rng = seeded(seed);
        let w1 = xavier_uniform(&mut rng, input_dim, hidden);
        let w2 = xavier_uniform(&mut rng, hidden, num_class);
        Self { input_dim, hidden, num_class, w1, b1: vec![0.0; hidden], w2, b2: vec![0.0; num_class] }
    }

    fn layout(&self) -> [usize; 4] {
        [self.input_dim * self.hidden, self.hidden, self.hidden * self.num_class, self.num_class]
    }

    fn activations(&self, input: &[f32]) -> Result<Activations> {
        if input.len() != self.input_dim { bail!("expected {} features, got {}", self.input_dim, input.len()); }
        let pre: Vec<f32> = (0..self.hidden)
            .map(|i| self.b1[i] + self.w1[i * self.input_dim..(i + 1) * self.input_dim].iter().zip(input).map(|(w, x)| w * x).sum::<f32>())
            .collect();
        let hidden: Vec<f32> = pre.iter().map(|v| v.max(0.0)).collect();
        let mut probs: Vec<f32> = (0..self.num_class)
            .map(|k| self.b2[k] + self.w2[k * self.hidden..(k + 1) * self.hidden].iter().zip(&hidden).map(|(w, h)| w * h).sum::<f32>())
            .collect();
        softmax_in_place(&mut probs);
        Ok(Activations { pre, hidden, probs })
    }
}

impl Model for MlpClassifier {
    fn forward(&self, input: &[f32]) -> Result<Vec<f32>> { Ok(self.activations(input)?.probs) }

    fn loss_and_gradient(&self, batch: &Batch<'_>) -> Result<(f32, ParamSet)> {
        if batch.is_empty() { bail!("empty batch"); }
        let (d, h, c) = (self.input_dim, self.hidden, self.num_class);
        let mut gw1 = vec![0.0f32; self.w1.len()];
        let mut gb1 = vec![0.0f32; h];
        let mut gw2 = vec![0.0f32; self.w2.len()];
        let mut gb2 = vec![0.0f32; c];
        let mut loss = 0.0f32;
        for (x, &y) in batch.inputs.iter().zip(&batch.labels) {
            check_label(y, c)?;
            let act = self.activations(x)?;
            loss -= act.probs[y].max(1e-12).ln();
            let mut dh = vec![0.0f32; h];
            for k in 0..c {
                let dk = act.probs[k] - if k == y { 1.0 } else { 0.0 };
                gb2[k] += dk;
                for i in 0..h {
                    gw2[k * h + i] += dk * act.hidden[i];
                    dh[i] += self.w2[k * h + i] * dk;
                }
            }
            for i in 0..h {
                if act.pre[i] <= 0.0 { continue; }
                gb1[i] += dh[i];
                for (g, xj) in gw1[i * d..(i + 1) * d].iter_mut().zip(x.iter()) { *g += dh[i] * xj; }
            }
        }
        let n = batch.len() as f32;
        let mut grad = ParamSet::new(vec![gw1, gb1, gw2, gb2]);
        grad.scale(1.0 / n);
        Ok((loss / n, grad))
    }

    fn parameters(&self) -> ParamSet {
        ParamSet::new(vec![self.w1.clone(), self.b1.clone(), self.w2.clone(), self.b2.clone()])
    }

    fn set_parameters(&mut self, params: ParamSet) -> Result<()> {
        check_layout(&self.layout(), &params)?;
        let mut it = params.layers.into_iter();
        if let (Some(w1), Some(b1), Some(w2), Some(b2)) = (it.next(), it.next(), it.next(), it.next()) {
            self.w1 = w1;
            self.b1 = b1;
            self.w2 = w2;
            self.b2 = b2;
        }
        Ok(())
    }

    fn describe(&self) -> ModelDescription {
        let layer_shapes = self.layout().to_vec();
        ModelDescription { name: "mlp_classifier".into(), num_params: layer_shapes.iter().sum(), layer_shapes, num_class: self.num_class }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::model::test_support::check_gradient;

    #[test]
    fn gradient_matches_finite_differences() {
        let ds = Dataset::new(vec![vec![0.7, -0.2], vec![-0.4, 0.9], vec![0.1, 0.3], vec![1.1, -0.8]], vec![0, 1, 2, 0]);
        let mut m = MlpClassifier::new(2, 5, 3, 3);
        check_gradient(&mut m, &ds.full_batch());
    }

    #[test]
    fn forward_yields_distribution() {
        let m = MlpClassifier::new(4, 8, 3, 9);
        let p = m.forward(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(p.len(), 3);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
