//! Error taxonomy for round orchestration.
//!
//! Setup problems are fatal (`ConfigError`). Client and validation problems are
//! recovered inside the round and only surface through logs, metrics and summaries.

use thiserror::Error;

use crate::federated_learning::{ClientId, ClusterId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no clients registered")]
    NoClients,
    #[error("duplicate client id {0}")]
    DuplicateClient(ClientId),
    #[error("estimation_interval must be at least 1")]
    ZeroEstimationInterval,
    #[error("selection_size must be at least 1 when selection is enabled")]
    ZeroSelectionSize,
    #[error("selection_size {selection_size} exceeds client population {population}")]
    SelectionExceedsPopulation { selection_size: usize, population: usize },
    #[error("num_class must be at least 1")]
    ZeroClasses,
    #[error("model predicts {model} classes but validation expects {validation}")]
    ClassCountMismatch { model: usize, validation: usize },
    #[error("client_eval_idx_vec references unknown client {0}")]
    UnknownEvalClient(ClientId),
    #[error("client_eval_idx_vec lists client {0} more than once")]
    DuplicateEvalClient(ClientId),
    #[error("client {0} is listed for evaluation but has no held-out partition")]
    MissingClientHeldOut(ClientId),
    #[error("cluster evaluation enabled but cluster {0} has no held-out set")]
    MissingClusterHeldOut(ClusterId),
    #[error("local training needs batch_size >= 1 and local_epochs >= 1")]
    InvalidClientSolver,
    #[error("invalid learning rate {0}")]
    InvalidLearningRate(f32),
    #[error("{0} has {1} feature rows but {2} labels")]
    InconsistentDataset(String, usize, usize),
    #[error("initial model parameters do not match the model layout: {0}")]
    ModelLayout(String),
}

/// Failure of a single client's local round. Never aborts the round.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client {0} has an empty training partition")]
    EmptyPartition(ClientId),
    #[error("client {client} produced non-finite parameters")]
    Diverged { client: ClientId },
    #[error("client {client} local training panicked: {message}")]
    Panicked { client: ClientId, message: String },
    #[error("client {client} local training failed: {source}")]
    Training { client: ClientId, #[source] source: anyhow::Error },
}

impl ClientError {
    pub fn client(&self) -> ClientId {
        match self {
            ClientError::EmptyPartition(c) => *c,
            ClientError::Diverged { client } | ClientError::Panicked { client, .. } | ClientError::Training { client, .. } => *client,
        }
    }
}

#[derive(Debug, Error)]
pub enum FlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("parameter layout mismatch: {0}")]
    Layout(String),
    #[error("experiment log sink failed: {0}")]
    Sink(#[source] anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type FlResult<T> = std::result::Result<T, FlError>;
