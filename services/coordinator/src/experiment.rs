//! Assembles one experiment (data, model, sink, orchestrator) from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use clusterfed_core::synthetic::PartitionSource;
use clusterfed_core::{ExperimentConfig, ExperimentLog, JsonLinesLog, Orchestrator, OrchestratorParts, TracingLog};
use tracing::info;
use uuid::Uuid;

pub fn build_sink(cfg: &ExperimentConfig, run_id: Uuid) -> Result<Arc<dyn ExperimentLog>> {
    Ok(match &cfg.log_path {
        Some(path) => {
            info!(path = %path.display(), "experiment_log_file");
            Arc::new(JsonLinesLog::open(path, run_id)?)
        }
        None => Arc::new(TracingLog),
    })
}

pub fn assemble(cfg: &ExperimentConfig, sink: Arc<dyn ExperimentLog>, run_id: Uuid) -> Result<Orchestrator> {
    cfg.validate()?;
    let partition = cfg.data.partition().context("preparing client partitions")?;
    info!(clients = partition.summary.num_clients, clusters = partition.summary.num_clusters, train_samples = partition.summary.train_samples, "clients_prepared");

    let mut parts = OrchestratorParts::new(cfg.server.clone(), cfg.client.clone(), cfg.validation.clone(), cfg.model.factory(), partition.clients, partition.eval);
    parts.exp_id = cfg.exp_id.clone();
    parts.description = cfg.description.clone();
    parts.run_id = run_id;
    parts.preparation = Some(partition.summary);
    parts.sink = sink;
    Ok(Orchestrator::new(parts)?)
}

#[cfg(test)]
mod tests {
    use clusterfed_core::model::ModelConfig;
    use clusterfed_core::synthetic::SyntheticConfig;
    use clusterfed_core::{LogRecord, MemoryLog};

    use super::*;

    fn small() -> ExperimentConfig {
        let data = SyntheticConfig { num_clients: 6, num_clusters: 2, num_class: 3, feature_dim: 4, samples_per_client: 20, cluster_eval_samples: 12, global_eval_samples: 12, ..Default::default() };
        let mut cfg = ExperimentConfig { num_epochs: 2, ..Default::default() };
        cfg.model = ModelConfig::Softmax { input_dim: 4, num_class: 3, seed: 1 };
        cfg.validation.num_class = 3;
        cfg.server.selection_size = 3;
        cfg.data = data;
        cfg
    }

    #[tokio::test]
    async fn runs_small_experiment_off_the_runtime() {
        let cfg = small();
        let log = Arc::new(MemoryLog::new());
        let mut orch = assemble(&cfg, log.clone(), Uuid::new_v4()).unwrap();
        let summary = tokio::task::spawn_blocking(move || orch.run(2)).await.unwrap().unwrap();
        assert_eq!(summary.rounds_completed, 2);
        assert!(log.records().iter().any(|r| matches!(r, LogRecord::ClientPreparation(p) if p.num_clients == 6)));
        // global + two clusters per round
        assert_eq!(log.reports().len(), 6);
    }

    #[tokio::test]
    async fn writes_json_lines_when_log_path_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = small();
        cfg.log_path = Some(dir.path().join("run.jsonl"));
        let run_id = Uuid::new_v4();
        let sink = build_sink(&cfg, run_id).unwrap();
        let mut orch = assemble(&cfg, sink, run_id).unwrap();
        tokio::task::spawn_blocking(move || orch.run(1)).await.unwrap().unwrap();
        let text = std::fs::read_to_string(dir.path().join("run.jsonl")).unwrap();
        assert!(text.lines().any(|l| l.contains("\"kind\":\"validation\"")));
    }

    #[test]
    fn invalid_config_is_rejected_before_partitioning() {
        let mut cfg = small();
        cfg.server.selection_size = 99;
        assert!(assemble(&cfg, Arc::new(MemoryLog::new()), Uuid::new_v4()).is_err());
    }
}
