//! Weighted federated averaging.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::client::{LocalUpdate, UpdatePayload};
use super::ClientId;
use crate::error::FlError;
use crate::params::ParamSet;
use crate::telemetry::FL_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    #[default]
    SampleCount,
    Uniform,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOutcome {
    /// `None` when nothing was accepted; the global model stays as it was.
    pub params: Option<ParamSet>,
    pub accepted: Vec<ClientId>,
    pub rejected: Vec<ClientId>,
    /// Accepted updates combined into non-finite parameters and were discarded.
    pub non_finite: bool,
}

pub trait Aggregator: Send + Sync {
    /// Combine `updates` (already in deterministic order) against `global`.
    fn aggregate(&self, global: &ParamSet, updates: &[LocalUpdate]) -> Result<AggregateOutcome, FlError>;
}

/// FedAvg. Snapshots average directly; deltas are applied on top of `global`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedAverage { pub weighting: Weighting }

impl WeightedAverage {
    pub fn new(weighting: Weighting) -> Self { Self { weighting } }

    fn weights(&self, accepted: &[&LocalUpdate]) -> Vec<f64> {
        let by_samples: Vec<f64> = accepted.iter().map(|u| u.sample_count as f64).collect();
        match self.weighting {
            Weighting::SampleCount if by_samples.iter().sum::<f64>() > 0.0 => by_samples,
            _ => vec![1.0; accepted.len()],
        }
    }
}

impl Aggregator for WeightedAverage {
    fn aggregate(&self, global: &ParamSet, updates: &[LocalUpdate]) -> Result<AggregateOutcome, FlError> {
        let started = Instant::now();
        let mut outcome = AggregateOutcome::default();
        let mut accepted: Vec<&LocalUpdate> = Vec::with_capacity(updates.len());
        for u in updates {
            if u.payload.params().same_shape(global) {
                outcome.accepted.push(u.client_id);
                accepted.push(u);
            } else {
                warn!(client = u.client_id, expected = ?global.shape(), got = ?u.payload.params().shape(), "update_layout_rejected");
                FL_METRICS.rejected_updates_total.add(1, &[]);
                outcome.rejected.push(u.client_id);
            }
        }
        if accepted.is_empty() { return Ok(outcome); }

        let weights = self.weights(&accepted);
        let total: f64 = weights.iter().sum();
        let mut acc: Vec<Vec<f64>> = global.layers.iter().map(|l| vec![0.0; l.len()]).collect();
        for (u, w) in accepted.iter().zip(&weights) {
            let share = w / total;
            let is_delta = matches!(u.payload, UpdatePayload::Delta(_));
            for (li, layer) in u.payload.params().layers.iter().enumerate() {
                let base = &global.layers[li];
                for (wi, v) in layer.iter().enumerate() {
                    // deltas are lifted to snapshots so mixed payloads average consistently
                    let value = if is_delta { base[wi] as f64 + *v as f64 } else { *v as f64 };
                    acc[li][wi] += share * value;
                }
            }
        }
        let params = ParamSet::new(acc.into_iter().map(|l| l.into_iter().map(|v| v as f32).collect()).collect());
        FL_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        if params.is_finite() {
            outcome.params = Some(params);
        } else {
            warn!(participants = outcome.accepted.len(), "aggregate_non_finite_discarded");
            outcome.non_finite = true;
        }
        Ok(outcome)
    }
}
