//! Experiment configuration surface.
//!
//! Loaded through [`crate::load_config`] (defaults, optional file, `CLUSTERFED__*` env).
//! Each solver can describe itself as JSON for the experiment log.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::federated_learning::{ClientId, EstimatorKind, ScopeSelection, SelectionPolicyKind, SelectionRefresh, UpdateKind, Weighting};
use crate::model::ModelConfig;
use crate::optimizer::Sgd;
use crate::synthetic::SyntheticConfig;

/// Server-side orchestration knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSolver {
    pub estimation_interval: u64,
    pub do_selection: bool,
    pub selection_size: usize,
    pub selection_refresh: SelectionRefresh,
    pub selection_policy: SelectionPolicyKind,
    pub estimator: EstimatorKind,
    pub weight_by_samples: bool,
    pub weighting: Weighting,
    pub update_kind: UpdateKind,
    pub parallel: bool,
}

impl Default for ServerSolver {
    fn default() -> Self {
        Self {
            estimation_interval: 2,
            do_selection: true,
            selection_size: 15,
            selection_refresh: SelectionRefresh::EveryRound,
            selection_policy: SelectionPolicyKind::TopK,
            estimator: EstimatorKind::Loss,
            weight_by_samples: false,
            weighting: Weighting::SampleCount,
            update_kind: UpdateKind::Snapshot,
            parallel: true,
        }
    }
}

/// Local training knobs shared by every client unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSolver {
    pub local_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub shuffle_seed: u64,
}

impl Default for ClientSolver {
    fn default() -> Self { Self { local_epochs: 1, batch_size: 32, learning_rate: 0.05, momentum: 0.0, weight_decay: 0.0, shuffle_seed: 0 } }
}

impl ClientSolver {
    pub fn optimizer(&self) -> Sgd { Sgd { learning_rate: self.learning_rate, momentum: self.momentum, weight_decay: self.weight_decay } }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.local_epochs == 0 { return Err(ConfigError::InvalidClientSolver); }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 { return Err(ConfigError::InvalidLearningRate(self.learning_rate)); }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub num_class: usize,
    pub do_global_eval: bool,
    pub do_cluster_eval: bool,
    pub do_client_eval: bool,
    pub do_importance_estimation: bool,
    pub client_eval_idx_vec: Vec<ClientId>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { num_class: 4, do_global_eval: true, do_cluster_eval: true, do_client_eval: false, do_importance_estimation: true, client_eval_idx_vec: Vec::new() }
    }
}

impl ValidatorConfig {
    pub fn scopes(&self) -> ScopeSelection {
        ScopeSelection {
            global: self.do_global_eval,
            clusters: self.do_cluster_eval,
            clients: if self.do_client_eval { self.client_eval_idx_vec.clone() } else { Vec::new() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub exp_id: String,
    pub description: String,
    pub num_epochs: u64,
    pub server: ServerSolver,
    pub client: ClientSolver,
    pub validation: ValidatorConfig,
    pub model: ModelConfig,
    pub data: SyntheticConfig,
    pub log_path: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let data = SyntheticConfig::default();
        Self {
            exp_id: "clusterfed_experiment".into(),
            description: "clustered federated training".into(),
            num_epochs: 20,
            server: ServerSolver { selection_size: data.num_clients / 2, ..Default::default() },
            client: ClientSolver::default(),
            validation: ValidatorConfig { num_class: data.num_class, ..Default::default() },
            model: ModelConfig::Mlp { input_dim: data.feature_dim, hidden: 32, num_class: data.num_class, seed: data.seed },
            data,
            log_path: None,
        }
    }
}

impl ExperimentConfig {
    /// Population-independent checks; the orchestrator re-checks against real clients.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.estimation_interval == 0 { return Err(ConfigError::ZeroEstimationInterval); }
        if self.server.do_selection && self.server.selection_size == 0 { return Err(ConfigError::ZeroSelectionSize); }
        if self.validation.num_class == 0 { return Err(ConfigError::ZeroClasses); }
        if self.model.num_class() != self.validation.num_class {
            return Err(ConfigError::ClassCountMismatch { model: self.model.num_class(), validation: self.validation.num_class });
        }
        if self.server.do_selection && self.server.selection_size > self.data.num_clients {
            return Err(ConfigError::SelectionExceedsPopulation { selection_size: self.server.selection_size, population: self.data.num_clients });
        }
        self.client.validate()
    }
}

pub trait Descriptor: Serialize {
    fn to_json(&self) -> serde_json::Value { serde_json::to_value(self).unwrap_or(serde_json::Value::Null) }
}

impl Descriptor for ServerSolver {}
impl Descriptor for ClientSolver {}
impl Descriptor for ValidatorConfig {}
