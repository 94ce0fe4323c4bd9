//! Labelled datasets and the partitions handed over by the data collaborator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::federated_learning::{ClientId, ClusterId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

/// Borrowed mini-batch of rows from a [`Dataset`].
#[derive(Debug, Clone)]
pub struct Batch<'a> {
    pub inputs: Vec<&'a [f32]>,
    pub labels: Vec<usize>,
}

impl Batch<'_> {
    pub fn len(&self) -> usize { self.labels.len() }
    pub fn is_empty(&self) -> bool { self.labels.is_empty() }
}

impl Dataset {
    pub fn new(features: Vec<Vec<f32>>, labels: Vec<usize>) -> Self {
        debug_assert_eq!(features.len(), labels.len());
        Self { features, labels }
    }

    pub fn len(&self) -> usize { self.labels.len() }
    pub fn is_empty(&self) -> bool { self.labels.is_empty() }
    /// One feature row per label. Fields are public, so callers re-check before use.
    pub fn is_consistent(&self) -> bool { self.features.len() == self.labels.len() }
    pub fn feature_dim(&self) -> Option<usize> { self.features.first().map(Vec::len) }

    pub fn full_batch(&self) -> Batch<'_> {
        Batch { inputs: self.features.iter().map(Vec::as_slice).collect(), labels: self.labels.clone() }
    }

    /// Gather rows by index. Out-of-range indices are skipped.
    pub fn batch(&self, indices: &[usize]) -> Batch<'_> {
        let mut inputs = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            if let (Some(x), Some(y)) = (self.features.get(i), self.labels.get(i)) {
                inputs.push(x.as_slice());
                labels.push(*y);
            }
        }
        Batch { inputs, labels }
    }

    /// Split off the last `fraction` of rows as a held-out set.
    pub fn split_tail(mut self, fraction: f32) -> (Dataset, Dataset) {
        let keep = ((self.len() as f32) * (1.0 - fraction.clamp(0.0, 1.0))).round() as usize;
        let tail_x = self.features.split_off(keep.min(self.features.len()));
        let tail_y = self.labels.split_off(keep.min(self.labels.len()));
        (self, Dataset::new(tail_x, tail_y))
    }

    pub fn extend(&mut self, other: &Dataset) {
        self.features.extend(other.features.iter().cloned());
        self.labels.extend_from_slice(&other.labels);
    }
}

/// One client's data as supplied by the partitioning collaborator.
#[derive(Debug, Clone)]
pub struct ClientData {
    pub client_id: ClientId,
    pub cluster_id: ClusterId,
    pub train: Dataset,
    pub held_out: Option<Dataset>,
}

/// Held-out sets owned by the validator: one global set and one per cluster.
#[derive(Debug, Clone, Default)]
pub struct EvalSets {
    pub global: Option<Dataset>,
    pub clusters: BTreeMap<ClusterId, Dataset>,
}
