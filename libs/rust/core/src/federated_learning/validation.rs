//! Forward-only evaluation of the global model over global, cluster and client scopes.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::client::{panic_message, ClientUnit};
use super::{ClientId, ClusterId, RoundId};
use crate::data::{Dataset, EvalSets};
use crate::error::FlError;
use crate::model::{argmax, cross_entropy, Model, ModelFactory};
use crate::params::ParamSet;
use crate::telemetry::FL_METRICS;

/// Which scopes a validation pass touches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeSelection {
    pub global: bool,
    pub clusters: bool,
    /// Evaluated in this order.
    pub clients: Vec<ClientId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "scope_id", rename_all = "snake_case")]
pub enum EvalScope {
    Global,
    Cluster(ClusterId),
    Client(ClientId),
}

impl EvalScope {
    pub fn id(&self) -> Option<usize> {
        match self { EvalScope::Global => None, EvalScope::Cluster(id) | EvalScope::Client(id) => Some(*id) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub loss: f64,
    pub accuracy: f64,
    pub macro_f1: f64,
    /// `None` for classes absent from the evaluated set.
    pub per_class_recall: Vec<Option<f64>>,
    pub num_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub round_index: RoundId,
    #[serde(flatten)]
    pub scope: EvalScope,
    pub metrics: MetricValues,
}

/// Confusion-matrix metrics of `model` on `data`.
pub fn evaluate_dataset(model: &dyn Model, data: &Dataset, num_class: usize) -> anyhow::Result<MetricValues> {
    if data.is_empty() { anyhow::bail!("empty evaluation set"); }
    if !data.is_consistent() { anyhow::bail!("{} feature rows for {} labels", data.features.len(), data.labels.len()); }
    let mut confusion = vec![vec![0u64; num_class]; num_class];
    let mut loss = 0.0f64;
    for (x, y) in data.features.iter().zip(&data.labels) {
        if *y >= num_class { anyhow::bail!("label {y} out of range for {num_class} classes"); }
        let probs = model.forward(x)?;
        loss += cross_entropy(&probs, *y)? as f64;
        let predicted = argmax(&probs).min(num_class - 1);
        confusion[*y][predicted] += 1;
    }
    let n = data.len() as f64;
    let correct: u64 = (0..num_class).map(|c| confusion[c][c]).sum();
    let mut per_class_recall = Vec::with_capacity(num_class);
    let mut f1_sum = 0.0;
    let mut f1_classes = 0usize;
    for c in 0..num_class {
        let tp = confusion[c][c] as f64;
        let support: f64 = confusion[c].iter().sum::<u64>() as f64;
        let predicted: f64 = confusion.iter().map(|row| row[c]).sum::<u64>() as f64;
        per_class_recall.push((support > 0.0).then(|| tp / support));
        if support + predicted > 0.0 {
            f1_sum += 2.0 * tp / (support + predicted);
            f1_classes += 1;
        }
    }
    Ok(MetricValues {
        loss: loss / n,
        accuracy: correct as f64 / n,
        macro_f1: if f1_classes > 0 { f1_sum / f1_classes as f64 } else { 0.0 },
        per_class_recall,
        num_samples: data.len(),
    })
}

pub struct Validator {
    eval: EvalSets,
    num_class: usize,
    parallel: bool,
}

impl Validator {
    pub fn new(eval: EvalSets, num_class: usize, parallel: bool) -> Self { Self { eval, num_class, parallel } }

    pub fn eval_sets(&self) -> &EvalSets { &self.eval }

    /// Reports for every scope that evaluated cleanly: global, populated clusters by
    /// id, then clients in configured order. Only a parameter layout mismatch is an error.
    pub fn evaluate(&self, factory: &ModelFactory, params: &ParamSet, clients: &[ClientUnit], scopes: &ScopeSelection, round: RoundId) -> Result<Vec<ValidationReport>, FlError> {
        let mut model = factory();
        model.set_parameters(params.clone()).map_err(|e| FlError::Layout(e.to_string()))?;
        let model: &dyn Model = model.as_ref();

        let mut wanted = Vec::new();
        if scopes.global && self.eval.global.is_some() { wanted.push(EvalScope::Global); }
        if scopes.clusters {
            let populated: BTreeSet<ClusterId> = clients.iter().map(ClientUnit::cluster).collect();
            wanted.extend(self.eval.clusters.keys().filter(|c| populated.contains(c)).map(|c| EvalScope::Cluster(*c)));
        }
        wanted.extend(scopes.clients.iter().map(|c| EvalScope::Client(*c)));

        let run = |scope: &EvalScope| -> Option<ValidationReport> {
            let outcome = catch_unwind(AssertUnwindSafe(|| self.evaluate_scope(model, clients, *scope)))
                .unwrap_or_else(|panic| Err(anyhow::anyhow!("evaluation panicked: {}", panic_message(panic.as_ref()))));
            match outcome {
                Ok(metrics) => Some(ValidationReport { round_index: round, scope: *scope, metrics }),
                Err(e) => {
                    warn!(round, scope = ?scope, error = %e, "validation_scope_failed");
                    FL_METRICS.validation_failures_total.add(1, &[]);
                    None
                }
            }
        };
        let reports: Vec<Option<ValidationReport>> = if self.parallel { wanted.par_iter().map(run).collect() } else { wanted.iter().map(run).collect() };
        Ok(reports.into_iter().flatten().collect())
    }

    fn evaluate_scope(&self, model: &dyn Model, clients: &[ClientUnit], scope: EvalScope) -> anyhow::Result<MetricValues> {
        match scope {
            EvalScope::Global => match &self.eval.global {
                Some(ds) => evaluate_dataset(model, ds, self.num_class),
                None => anyhow::bail!("no global held-out set"),
            },
            EvalScope::Cluster(id) => match self.eval.clusters.get(&id) {
                Some(ds) => evaluate_dataset(model, ds, self.num_class),
                None => anyhow::bail!("no held-out set for cluster {id}"),
            },
            EvalScope::Client(id) => match clients.iter().find(|c| c.id() == id) {
                Some(unit) => unit.evaluate(model, self.num_class),
                None => anyhow::bail!("unknown client {id}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::config::ClientSolver;
    use crate::federated_learning::{ClientRecord, UpdateKind};
    use crate::model::ModelConfig;
    use crate::optimizer::OptimizerState;

    fn ds() -> Dataset { Dataset::new(vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.2]], vec![0, 1, 0]) }

    fn factory() -> ModelFactory { ModelConfig::Softmax { input_dim: 2, num_class: 2, seed: 3 }.factory() }

    fn unit(id: ClientId, cluster_id: ClusterId, held_out: Option<Dataset>) -> ClientUnit {
        let solver = ClientSolver::default();
        let record = ClientRecord { client_id: id, cluster_id, train: ds(), held_out, optimizer_state: OptimizerState::default() };
        ClientUnit::new(record, Arc::new(solver.optimizer()), solver, UpdateKind::Snapshot)
    }

    #[test]
    fn metrics_from_confusion_matrix() {
        // weights [[1,0],[0,1]], zero bias: predicts the larger feature
        let mut model = factory()();
        model.set_parameters(ParamSet::new(vec![vec![1.0, 0.0, 0.0, 1.0], vec![0.0, 0.0]])).unwrap();
        let data = Dataset::new(vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.2, 1.0], vec![0.0, 2.0]], vec![0, 1, 0, 1]);
        let m = evaluate_dataset(model.as_ref(), &data, 3).unwrap();
        assert!((m.accuracy - 0.75).abs() < 1e-9);
        assert_eq!(m.per_class_recall, vec![Some(0.5), Some(1.0), None]);
        // f1(0) = 2/3, f1(1) = 0.8; class 2 never seen nor predicted
        assert!((m.macro_f1 - (2.0 / 3.0 + 0.8) / 2.0).abs() < 1e-9);
        assert_eq!(m.num_samples, 4);
        assert!(evaluate_dataset(model.as_ref(), &Dataset::default(), 3).is_err());
    }

    #[test]
    fn reports_follow_scope_order_and_skip_failures() {
        let f = factory();
        let eval = EvalSets { global: Some(ds()), clusters: BTreeMap::from([(2, ds()), (7, ds()), (0, ds())]) };
        let clients = vec![unit(4, 0, Some(ds())), unit(1, 2, None), unit(0, 0, Some(ds()))];
        let scopes = ScopeSelection { global: true, clusters: true, clients: vec![4, 1, 0] };
        let reports = Validator::new(eval, 2, true).evaluate(&f, &f().parameters(), &clients, &scopes, 3).unwrap();
        let order: Vec<EvalScope> = reports.iter().map(|r| r.scope).collect();
        assert_eq!(order, vec![EvalScope::Global, EvalScope::Cluster(0), EvalScope::Cluster(2), EvalScope::Client(4), EvalScope::Client(0)]);
        assert!(reports.iter().all(|r| r.round_index == 3));
    }

    #[test]
    fn mismatched_rows_and_labels_are_rejected() {
        let model = factory()();
        let bad = Dataset { features: vec![vec![1.0, 0.0]], labels: vec![0, 1] };
        assert!(evaluate_dataset(model.as_ref(), &bad, 2).is_err());
    }

    struct PanicsOnEval(Box<dyn Model>);
    impl Model for PanicsOnEval {
        fn forward(&self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
            if input[1] > 50.0 { panic!("bad row"); }
            self.0.forward(input)
        }
        fn loss_and_gradient(&self, batch: &crate::data::Batch<'_>) -> anyhow::Result<(f32, ParamSet)> { self.0.loss_and_gradient(batch) }
        fn parameters(&self) -> ParamSet { self.0.parameters() }
        fn set_parameters(&mut self, params: ParamSet) -> anyhow::Result<()> { self.0.set_parameters(params) }
        fn describe(&self) -> crate::model::ModelDescription { self.0.describe() }
    }

    #[test]
    fn panicking_scope_is_skipped() {
        let inner = factory();
        let f: ModelFactory = Arc::new(move || Box::new(PanicsOnEval(inner())) as Box<dyn Model>);
        let poisoned = Dataset::new(vec![vec![0.0, 99.0]], vec![1]);
        let eval = EvalSets { global: Some(ds()), clusters: BTreeMap::from([(0, poisoned), (1, ds())]) };
        let clients = vec![unit(0, 0, None), unit(1, 1, None)];
        let scopes = ScopeSelection { global: true, clusters: true, clients: Vec::new() };
        let reports = Validator::new(eval, 2, true).evaluate(&f, &f().parameters(), &clients, &scopes, 0).unwrap();
        let order: Vec<EvalScope> = reports.iter().map(|r| r.scope).collect();
        assert_eq!(order, vec![EvalScope::Global, EvalScope::Cluster(1)]);
    }

    #[test]
    fn report_serializes_scope_fields() {
        let r = ValidationReport { round_index: 1, scope: EvalScope::Cluster(2), metrics: MetricValues { loss: 0.5, accuracy: 1.0, macro_f1: 1.0, per_class_recall: vec![Some(1.0)], num_samples: 1 } };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["scope"], "cluster");
        assert_eq!(v["scope_id"], 2);
        assert_eq!(v["metrics"]["num_samples"], 1);
    }
}
