//! Deterministic clustered-Gaussian partitioner.
//!
//! Stand-in for a real data collaborator: every cluster is a "domain" with its own
//! feature shift and label skew, clients are assigned to clusters round-robin.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use rand::{distributions::WeightedIndex, prelude::Distribution, rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::{ClientData, Dataset, EvalSets};
use crate::federated_learning::ClusterId;

/// Supplies client partitions and validator held-out sets.
pub trait PartitionSource {
    fn partition(&self) -> Result<Partition>;
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub clients: Vec<ClientData>,
    pub eval: EvalSets,
    pub summary: PreparationSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparationSummary {
    pub num_clients: usize,
    pub num_clusters: usize,
    pub num_classes: usize,
    pub train_samples: usize,
    pub held_out_samples: usize,
    pub clients_per_cluster: BTreeMap<ClusterId, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub num_clients: usize,
    pub num_clusters: usize,
    pub num_class: usize,
    pub feature_dim: usize,
    pub samples_per_client: usize,
    pub held_out_fraction: f32,
    pub cluster_eval_samples: usize,
    pub global_eval_samples: usize,
    pub cluster_shift: f32,
    pub noise: f32,
    pub label_skew: f32,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_clients: 30,
            num_clusters: 5,
            num_class: 10,
            feature_dim: 16,
            samples_per_client: 120,
            held_out_fraction: 0.2,
            cluster_eval_samples: 200,
            global_eval_samples: 400,
            cluster_shift: 1.0,
            noise: 0.6,
            label_skew: 3.0,
            seed: 7,
        }
    }
}

struct Domain { shift: Vec<f32>, class_weights: WeightedIndex<f32> }

fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

impl SyntheticConfig {
    fn sample(&self, rng: &mut StdRng, prototypes: &[Vec<f32>], domain: &Domain, n: usize) -> Dataset {
        let mut features = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        for _ in 0..n {
            let class = domain.class_weights.sample(rng);
            let x = prototypes[class].iter().zip(&domain.shift).map(|(p, s)| p + s + self.noise * gaussian(rng)).collect();
            features.push(x);
            labels.push(class);
        }
        Dataset::new(features, labels)
    }
}

impl PartitionSource for SyntheticConfig {
    fn partition(&self) -> Result<Partition> {
        if self.num_clusters == 0 || self.num_class == 0 || self.feature_dim == 0 { bail!("synthetic data needs clusters, classes and features"); }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let prototypes: Vec<Vec<f32>> = (0..self.num_class).map(|_| (0..self.feature_dim).map(|_| 2.0 * gaussian(&mut rng)).collect()).collect();
        let mut domains = Vec::with_capacity(self.num_clusters);
        for k in 0..self.num_clusters {
            let shift = (0..self.feature_dim).map(|_| self.cluster_shift * gaussian(&mut rng)).collect();
            let weights: Vec<f32> = (0..self.num_class).map(|c| if c % self.num_clusters == k { 1.0 + self.label_skew } else { 1.0 }).collect();
            domains.push(Domain { shift, class_weights: WeightedIndex::new(weights)? });
        }

        let mut clients = Vec::with_capacity(self.num_clients);
        let mut clients_per_cluster = BTreeMap::new();
        let (mut train_samples, mut held_out_samples) = (0, 0);
        for client_id in 0..self.num_clients {
            let cluster_id = client_id % self.num_clusters;
            let all = self.sample(&mut rng, &prototypes, &domains[cluster_id], self.samples_per_client);
            let (train, held) = all.split_tail(self.held_out_fraction);
            train_samples += train.len();
            held_out_samples += held.len();
            *clients_per_cluster.entry(cluster_id).or_insert(0) += 1;
            clients.push(ClientData { client_id, cluster_id, train, held_out: (!held.is_empty()).then_some(held) });
        }

        let mut eval = EvalSets::default();
        for (k, domain) in domains.iter().enumerate() {
            eval.clusters.insert(k, self.sample(&mut rng, &prototypes, domain, self.cluster_eval_samples));
        }
        if self.global_eval_samples > 0 {
            let per_domain = self.global_eval_samples.div_ceil(self.num_clusters);
            let mut global = Dataset::default();
            for domain in &domains { global.extend(&self.sample(&mut rng, &prototypes, domain, per_domain)); }
            eval.global = Some(global);
        }

        let summary = PreparationSummary { num_clients: self.num_clients, num_clusters: self.num_clusters, num_classes: self.num_class, train_samples, held_out_samples, clients_per_cluster };
        Ok(Partition { clients, eval, summary })
    }
}
