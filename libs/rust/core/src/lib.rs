//! Core library for clustered federated learning experiments.
//!
//! A single in-process orchestrator owns the global model and drives rounds of
//! importance estimation, participant selection, local training, weighted
//! aggregation and multi-scope validation over a fixed client population.

use std::path::{Path, PathBuf};

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod data;
pub mod error;
pub mod experiment_log;
pub mod federated_learning;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod synthetic;
pub mod telemetry;

pub use crate::config::{ClientSolver, Descriptor, ExperimentConfig, ServerSolver, ValidatorConfig};
pub use crate::error::{ClientError, ConfigError, FlError, FlResult};
pub use crate::experiment_log::{ExperimentLog, JsonLinesLog, LogRecord, MemoryLog, TracingLog};
pub use crate::federated_learning::{CancelToken, Orchestrator, OrchestratorParts, RoundSummary, RunSummary};
pub use crate::params::ParamSet;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub const CONFIG_FILE_ENV: &str = "CLUSTERFED_CONFIG_FILE";
pub const JSON_LOG_ENV: &str = "CLUSTERFED_JSON_LOG";

/// Install the global subscriber once. `RUST_LOG` drives the filter and
/// `CLUSTERFED_JSON_LOG=1` switches to JSON output.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var(JSON_LOG_ENV).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json_layer = json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
        });
        let text_layer = (!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
        });
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "clusterfed", service, "tracing initialized");
    Ok(())
}

/// Defaults, then the file named by `CLUSTERFED_CONFIG_FILE`, then `CLUSTERFED__*` env vars.
pub fn load_config(service: &str) -> Result<ExperimentConfig> {
    let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
    let cfg = load_config_from(file.as_deref())?;
    info!(service, exp_id = %cfg.exp_id, file = ?file, "configuration loaded");
    Ok(cfg)
}

pub fn load_config_from(file: Option<&Path>) -> Result<ExperimentConfig> {
    let mut builder = ::config::Config::builder().add_source(::config::Config::try_from(&ExperimentConfig::default())?);
    if let Some(path) = file {
        builder = builder.add_source(::config::File::from(path).required(false));
    }
    builder = builder.add_source(
        ::config::Environment::with_prefix("CLUSTERFED")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("validation.client_eval_idx_vec"),
    );
    let cfg: ExperimentConfig = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "exp_id = \"digits\"\nnum_epochs = 3\n[server]\nselection_size = 4\ndo_selection = true\n[model]\nkind = \"softmax\"\ninput_dim = 16\nnum_class = 10").unwrap();
        let cfg = load_config_from(Some(&path)).unwrap();
        assert_eq!(cfg.exp_id, "digits");
        assert_eq!(cfg.num_epochs, 3);
        assert_eq!(cfg.server.selection_size, 4);
        assert_eq!(cfg.client, ClientSolver::default());
        assert!(matches!(cfg.model, model::ModelConfig::Softmax { input_dim: 16, num_class: 10, .. }));
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_config_from(Some(Path::new("/nonexistent/clusterfed.yaml"))).unwrap();
        assert_eq!(cfg.num_epochs, ExperimentConfig::default().num_epochs);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("test").unwrap();
        init_tracing("test").unwrap();
    }
}
