//! Client unit: one client's partitions plus its carried optimizer state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::validation::{evaluate_dataset, MetricValues};
use super::{ClientId, ClusterId, RoundId};
use crate::config::ClientSolver;
use crate::data::{ClientData, Dataset};
use crate::error::ClientError;
use crate::model::{Model, ModelFactory};
use crate::optimizer::{LocalOptimizer, OptimizerState};
use crate::params::ParamSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    #[default]
    Snapshot,
    Delta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    /// Full locally-trained parameters.
    Snapshot(ParamSet),
    /// Locally-trained parameters minus the round snapshot.
    Delta(ParamSet),
}

impl UpdatePayload {
    pub fn params(&self) -> &ParamSet {
        match self { UpdatePayload::Snapshot(p) | UpdatePayload::Delta(p) => p }
    }
}

#[derive(Debug, Clone)]
pub struct LocalUpdate {
    pub client_id: ClientId,
    pub round_index: RoundId,
    pub payload: UpdatePayload,
    pub sample_count: u64,
    pub train_loss: f32,
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client_id: ClientId,
    pub cluster_id: ClusterId,
    pub train: Dataset,
    pub held_out: Option<Dataset>,
    pub optimizer_state: OptimizerState,
}

impl From<ClientData> for ClientRecord {
    fn from(d: ClientData) -> Self {
        Self { client_id: d.client_id, cluster_id: d.cluster_id, train: d.train, held_out: d.held_out, optimizer_state: OptimizerState::default() }
    }
}

pub struct ClientUnit {
    record: ClientRecord,
    optimizer: Arc<dyn LocalOptimizer>,
    solver: ClientSolver,
    update_kind: UpdateKind,
}

impl ClientUnit {
    pub fn new(record: ClientRecord, optimizer: Arc<dyn LocalOptimizer>, solver: ClientSolver, update_kind: UpdateKind) -> Self {
        Self { record, optimizer, solver, update_kind }
    }

    pub fn id(&self) -> ClientId { self.record.client_id }
    pub fn cluster(&self) -> ClusterId { self.record.cluster_id }
    pub fn record(&self) -> &ClientRecord { &self.record }
    pub fn sample_count(&self) -> usize { self.record.train.len() }

    /// Train from a private copy of `snapshot`. Optimizer state is only carried
    /// forward when the whole local round succeeds.
    pub fn local_train(&mut self, snapshot: &ParamSet, factory: &ModelFactory, round: RoundId) -> Result<LocalUpdate, ClientError> {
        let client = self.record.client_id;
        if self.record.train.is_empty() { return Err(ClientError::EmptyPartition(client)); }
        let mut state = self.record.optimizer_state.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.train_steps(snapshot, factory, round, &mut state)));
        let (params, train_loss) = match outcome {
            Ok(Ok(v)) => v,
            Ok(Err(source)) => return Err(ClientError::Training { client, source }),
            Err(panic) => return Err(ClientError::Panicked { client, message: panic_message(panic.as_ref()) }),
        };
        if !params.is_finite() { return Err(ClientError::Diverged { client }); }
        let payload = match self.update_kind {
            UpdateKind::Snapshot => UpdatePayload::Snapshot(params),
            UpdateKind::Delta => UpdatePayload::Delta(params.delta_from(snapshot).map_err(|e| ClientError::Training { client, source: e.into() })?),
        };
        self.record.optimizer_state = state;
        debug!(client, round, train_loss, "local_round_complete");
        Ok(LocalUpdate { client_id: client, round_index: round, payload, sample_count: self.record.train.len() as u64, train_loss })
    }

    fn train_steps(&self, snapshot: &ParamSet, factory: &ModelFactory, round: RoundId, state: &mut OptimizerState) -> anyhow::Result<(ParamSet, f32)> {
        let mut model = factory();
        model.set_parameters(snapshot.clone())?;
        let data = &self.record.train;
        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut rng = StdRng::seed_from_u64(shuffle_seed(self.solver.shuffle_seed, self.record.client_id, round));
        let batch_size = self.solver.batch_size.max(1);
        let (mut loss_sum, mut steps) = (0.0f32, 0usize);
        for _ in 0..self.solver.local_epochs {
            order.shuffle(&mut rng);
            for chunk in order.chunks(batch_size) {
                loss_sum += self.optimizer.step(model.as_mut(), &data.batch(chunk), state)?;
                steps += 1;
            }
        }
        Ok((model.parameters(), if steps > 0 { loss_sum / steps as f32 } else { 0.0 }))
    }

    /// Forward-only metrics on this client's held-out partition.
    pub fn evaluate(&self, model: &dyn Model, num_class: usize) -> anyhow::Result<MetricValues> {
        match &self.record.held_out {
            Some(ds) => evaluate_dataset(model, ds, num_class),
            None => anyhow::bail!("client {} has no held-out partition", self.record.client_id),
        }
    }
}

fn shuffle_seed(base: u64, client: ClientId, round: RoundId) -> u64 {
    base ^ (client as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ round.wrapping_mul(0xc2b2_ae3d_27d4_eb4f)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic.downcast_ref::<&str>().map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
