//! Flat layered parameter sets shared by models, optimizers and the aggregator.

use serde::{Deserialize, Serialize};

use crate::error::FlError;

/// Model parameters as `layers -> weights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParamSet {
    pub layers: Vec<Vec<f32>>,
}

impl ParamSet {
    pub fn new(layers: Vec<Vec<f32>>) -> Self { Self { layers } }

    pub fn zeros_like(other: &ParamSet) -> Self {
        Self { layers: other.layers.iter().map(|l| vec![0.0; l.len()]).collect() }
    }

    pub fn shape(&self) -> Vec<usize> { self.layers.iter().map(Vec::len).collect() }

    pub fn num_params(&self) -> usize { self.layers.iter().map(Vec::len).sum() }

    pub fn same_shape(&self, other: &ParamSet) -> bool {
        self.layers.len() == other.layers.len() && self.layers.iter().zip(&other.layers).all(|(a, b)| a.len() == b.len())
    }

    pub fn ensure_same_shape(&self, other: &ParamSet) -> Result<(), FlError> {
        if self.same_shape(other) { return Ok(()); }
        Err(FlError::Layout(format!("expected {:?}, got {:?}", self.shape(), other.shape())))
    }

    /// `self += alpha * other`. Shapes must match.
    pub fn axpy(&mut self, alpha: f32, other: &ParamSet) -> Result<(), FlError> {
        self.ensure_same_shape(other)?;
        for (dst, src) in self.layers.iter_mut().zip(&other.layers) {
            for (d, s) in dst.iter_mut().zip(src) { *d += alpha * s; }
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        for v in self.layers.iter_mut().flat_map(|l| l.iter_mut()) { *v *= factor; }
    }

    pub fn l2_norm(&self) -> f64 {
        self.layers.iter().flat_map(|l| l.iter()).map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt()
    }

    pub fn is_finite(&self) -> bool { self.layers.iter().flat_map(|l| l.iter()).all(|v| v.is_finite()) }

    /// Element-wise `self - base`.
    pub fn delta_from(&self, base: &ParamSet) -> Result<ParamSet, FlError> {
        let mut out = self.clone();
        out.axpy(-1.0, base)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axpy_and_delta() {
        let base = ParamSet::new(vec![vec![1.0, 2.0], vec![3.0]]);
        let mut p = base.clone();
        p.axpy(2.0, &ParamSet::new(vec![vec![0.5, 0.5], vec![1.0]])).unwrap();
        assert_eq!(p.layers, vec![vec![2.0, 3.0], vec![5.0]]);
        let d = p.delta_from(&base).unwrap();
        assert_eq!(d.layers, vec![vec![1.0, 1.0], vec![2.0]]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut a = ParamSet::new(vec![vec![0.0; 3]]);
        let b = ParamSet::new(vec![vec![0.0; 2]]);
        assert!(a.axpy(1.0, &b).is_err());
        assert!(!a.same_shape(&b));
    }

    #[test]
    fn norm_and_finiteness() {
        let p = ParamSet::new(vec![vec![3.0], vec![4.0]]);
        assert!((p.l2_norm() - 5.0).abs() < 1e-9);
        assert!(p.is_finite());
        assert!(!ParamSet::new(vec![vec![f32::NAN]]).is_finite());
    }
}
