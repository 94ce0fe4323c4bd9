//! Append-only experiment log sinks.
//!
//! The orchestrator sends descriptors once at experiment start, fresh importance
//! scores when an estimation fires, and validation reports once per round.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::federated_learning::{ClientId, EvalScope, ImportanceScore, RoundId, ValidationReport};
use crate::model::ModelDescription;
use crate::synthetic::PreparationSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    ExperimentInfo { exp_id: String, description: String, run_id: Uuid, started_at: DateTime<Utc> },
    ServerSolver { descriptor: Value },
    ClientSolver { descriptor: Value },
    ValidatorConfig { descriptor: Value },
    ClientPreparation(PreparationSummary),
    ModelDescription(ModelDescription),
    Importance { round_index: RoundId, scores: Vec<ImportanceScore> },
    Validation(ValidationReport),
    DegradedRound { round_index: RoundId, reason: String, failed_clients: Vec<ClientId> },
}

pub trait ExperimentLog: Send + Sync {
    fn append(&self, record: LogRecord) -> Result<()>;

    fn log_exp_info(&self, exp_id: &str, description: &str, run_id: Uuid) -> Result<()> {
        self.append(LogRecord::ExperimentInfo { exp_id: exp_id.into(), description: description.into(), run_id, started_at: Utc::now() })
    }
    fn log_server_solver(&self, descriptor: Value) -> Result<()> { self.append(LogRecord::ServerSolver { descriptor }) }
    fn log_client_solver(&self, descriptor: Value) -> Result<()> { self.append(LogRecord::ClientSolver { descriptor }) }
    fn log_validator(&self, descriptor: Value) -> Result<()> { self.append(LogRecord::ValidatorConfig { descriptor }) }
    fn log_client_preparation(&self, summary: &PreparationSummary) -> Result<()> { self.append(LogRecord::ClientPreparation(summary.clone())) }
    fn log_model_description(&self, description: &ModelDescription) -> Result<()> { self.append(LogRecord::ModelDescription(description.clone())) }
    fn log_importance(&self, round_index: RoundId, scores: &[ImportanceScore]) -> Result<()> {
        self.append(LogRecord::Importance { round_index, scores: scores.to_vec() })
    }
    fn log_validation(&self, report: &ValidationReport) -> Result<()> { self.append(LogRecord::Validation(report.clone())) }
    fn log_degraded_round(&self, round_index: RoundId, reason: &str, failed_clients: &[ClientId]) -> Result<()> {
        self.append(LogRecord::DegradedRound { round_index, reason: reason.into(), failed_clients: failed_clients.to_vec() })
    }
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl ExperimentLog for TracingLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        let body = serde_json::to_string(&record)?;
        match &record {
            LogRecord::DegradedRound { round_index, .. } => warn!(target: "clusterfed::experiment", round = round_index, record = %body, "degraded_round"),
            LogRecord::Validation(r) => info!(target: "clusterfed::experiment", round = r.round_index, accuracy = r.metrics.accuracy, loss = r.metrics.loss, record = %body, "validation"),
            _ => info!(target: "clusterfed::experiment", record = %body, "experiment_record"),
        }
        Ok(())
    }
}

/// Keeps every record in memory; used by tests and embedders that inspect a run.
#[derive(Debug, Default)]
pub struct MemoryLog { records: Mutex<Vec<LogRecord>> }

impl MemoryLog {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<LogRecord> { self.records.lock().clone() }

    pub fn reports(&self) -> Vec<ValidationReport> {
        self.records.lock().iter().filter_map(|r| match r { LogRecord::Validation(v) => Some(v.clone()), _ => None }).collect()
    }

    pub fn reports_for(&self, round: RoundId) -> Vec<ValidationReport> {
        self.reports().into_iter().filter(|r| r.round_index == round).collect()
    }

    pub fn count_scope(&self, matches: impl Fn(&EvalScope) -> bool) -> usize {
        self.reports().iter().filter(|r| matches(&r.scope)).count()
    }

    pub fn importance_rounds(&self) -> Vec<RoundId> {
        self.records.lock().iter().filter_map(|r| match r { LogRecord::Importance { round_index, .. } => Some(*round_index), _ => None }).collect()
    }
}

impl ExperimentLog for MemoryLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    ts: DateTime<Utc>,
    run_id: Uuid,
    #[serde(flatten)]
    record: &'a LogRecord,
}

/// One JSON object per line, stamped with time and run id. Appends to existing files.
pub struct JsonLinesLog {
    path: PathBuf,
    run_id: Uuid,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesLog {
    pub fn open(path: impl AsRef<Path>, run_id: Uuid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).with_context(|| format!("opening {}", path.display()))?;
        Ok(Self { path, run_id, writer: Mutex::new(BufWriter::new(file)) })
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl ExperimentLog for JsonLinesLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        let line = serde_json::to_string(&Envelope { ts: Utc::now(), run_id: self.run_id, record: &record })?;
        let mut w = self.writer.lock();
        writeln!(w, "{line}")?;
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::MetricValues;

    fn report(round_index: RoundId, scope: EvalScope) -> ValidationReport {
        ValidationReport { round_index, scope, metrics: MetricValues { loss: 1.0, accuracy: 0.5, macro_f1: 0.4, per_class_recall: vec![Some(0.5), None], num_samples: 8 } }
    }

    #[test]
    fn memory_log_filters_reports() {
        let log = MemoryLog::new();
        log.log_server_solver(serde_json::json!({"selection_size": 5})).unwrap();
        log.log_validation(&report(0, EvalScope::Global)).unwrap();
        log.log_validation(&report(0, EvalScope::Cluster(1))).unwrap();
        log.log_validation(&report(1, EvalScope::Global)).unwrap();
        assert_eq!(log.records().len(), 4);
        assert_eq!(log.reports_for(0).len(), 2);
        assert_eq!(log.count_scope(|s| matches!(s, EvalScope::Global)), 2);
    }

    #[test]
    fn json_lines_appends_one_object_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("exp.jsonl");
        let run_id = Uuid::new_v4();
        let log = JsonLinesLog::open(&path, run_id).unwrap();
        log.log_exp_info("exp", "demo", run_id).unwrap();
        log.log_validation(&report(2, EvalScope::Client(7))).unwrap();
        log.log_degraded_round(3, "no updates", &[1, 2]).unwrap();
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "experiment_info");
        assert_eq!(lines[1]["kind"], "validation");
        assert_eq!(lines[1]["scope"], "client");
        assert_eq!(lines[1]["scope_id"], 7);
        assert_eq!(lines[2]["failed_clients"], serde_json::json!([1, 2]));
        assert!(lines.iter().all(|l| l["run_id"] == run_id.to_string()));
    }

    #[test]
    fn tracing_log_accepts_records() {
        TracingLog.log_degraded_round(0, "all clients failed", &[]).unwrap();
        TracingLog.log_validation(&report(0, EvalScope::Global)).unwrap();
    }
}
