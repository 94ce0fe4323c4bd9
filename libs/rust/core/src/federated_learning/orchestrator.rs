//! Round orchestrator: estimate, select, train, aggregate, validate.
//!
//! The orchestrator exclusively owns the [`GlobalModel`]. Each round reads one
//! `Arc` snapshot and commits at most one new version after aggregation; if no
//! update survives, the round is degraded and the previous version persists.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::aggregation::{Aggregator, WeightedAverage};
use super::client::{ClientRecord, ClientUnit, LocalUpdate};
use super::importance::{estimate_all, ImportanceEstimator, ImportanceScore};
use super::selection::{SelectionPolicy, SelectionRefresh, SelectionSet};
use super::validation::{ScopeSelection, ValidationReport, Validator};
use super::{ClientId, GlobalModel, ModelVersion, RoundId};
use crate::config::{ClientSolver, Descriptor, ServerSolver, ValidatorConfig};
use crate::data::{ClientData, Dataset, EvalSets};
use crate::error::{ClientError, ConfigError, FlError};
use crate::experiment_log::{ExperimentLog, TracingLog};
use crate::model::ModelFactory;
use crate::optimizer::LocalOptimizer;
use crate::params::ParamSet;
use crate::synthetic::PreparationSummary;
use crate::telemetry::FL_METRICS;

/// Cooperative stop flag, checked before each round.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub round_index: RoundId,
    pub estimated: bool,
    pub selection: SelectionSet,
    pub failed_clients: Vec<ClientId>,
    pub rejected_clients: Vec<ClientId>,
    pub model_version: ModelVersion,
    pub degraded: bool,
    pub reports: Vec<ValidationReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub rounds_completed: u64,
    pub cancelled: bool,
    pub degraded_rounds: u64,
    pub final_version: ModelVersion,
    pub rounds: Vec<RoundSummary>,
}

/// Everything needed to assemble an [`Orchestrator`]. Collaborator overrides
/// default to the ones named in the solver configs.
pub struct OrchestratorParts {
    pub exp_id: String,
    pub description: String,
    pub run_id: Uuid,
    pub server: ServerSolver,
    pub client: ClientSolver,
    pub validation: ValidatorConfig,
    pub model_factory: ModelFactory,
    pub initial_params: Option<ParamSet>,
    pub clients: Vec<ClientData>,
    pub eval: EvalSets,
    pub preparation: Option<PreparationSummary>,
    pub sink: Arc<dyn ExperimentLog>,
    pub optimizer: Option<Arc<dyn LocalOptimizer>>,
    pub estimator: Option<Box<dyn ImportanceEstimator>>,
    pub selection_policy: Option<Box<dyn SelectionPolicy>>,
    pub aggregator: Option<Box<dyn Aggregator>>,
}

impl OrchestratorParts {
    pub fn new(server: ServerSolver, client: ClientSolver, validation: ValidatorConfig, model_factory: ModelFactory, clients: Vec<ClientData>, eval: EvalSets) -> Self {
        Self {
            exp_id: "clusterfed_experiment".into(),
            description: String::new(),
            run_id: Uuid::new_v4(),
            server,
            client,
            validation,
            model_factory,
            initial_params: None,
            clients,
            eval,
            preparation: None,
            sink: Arc::new(TracingLog),
            optimizer: None,
            estimator: None,
            selection_policy: None,
            aggregator: None,
        }
    }
}

pub struct Orchestrator {
    exp_id: String,
    description: String,
    run_id: Uuid,
    server: ServerSolver,
    client_solver: ClientSolver,
    validation: ValidatorConfig,
    scopes: ScopeSelection,
    factory: ModelFactory,
    global: GlobalModel,
    clients: Vec<ClientUnit>,
    estimator: Box<dyn ImportanceEstimator>,
    selector: Box<dyn SelectionPolicy>,
    aggregator: Box<dyn Aggregator>,
    validator: Validator,
    sink: Arc<dyn ExperimentLog>,
    preparation: Option<PreparationSummary>,
    scores: Vec<ImportanceScore>,
    cached_selection: Option<SelectionSet>,
    estimated_once: bool,
    announced: bool,
    round: RoundId,
    cancel: CancelToken,
}

impl Orchestrator {
    /// Validates the configuration against the actual population. Nothing runs on error.
    pub fn new(parts: OrchestratorParts) -> Result<Self, FlError> {
        let OrchestratorParts { exp_id, description, run_id, server, client, validation, model_factory, initial_params, clients, eval, preparation, sink, optimizer, estimator, selection_policy, aggregator } = parts;
        check_config(&server, &client, &validation, &model_factory, &clients, &eval)?;

        let initial = match initial_params {
            Some(params) => {
                let mut model = model_factory();
                model.set_parameters(params.clone()).map_err(|e| ConfigError::ModelLayout(e.to_string()))?;
                params
            }
            None => model_factory().parameters(),
        };

        let membership: BTreeMap<ClientId, usize> = clients.iter().map(|c| (c.client_id, c.cluster_id)).collect();
        let optimizer = optimizer.unwrap_or_else(|| Arc::new(client.optimizer()) as Arc<dyn LocalOptimizer>);
        let units = clients
            .into_iter()
            .map(|c| ClientUnit::new(ClientRecord::from(c), Arc::clone(&optimizer), client.clone(), server.update_kind))
            .collect();

        Ok(Self {
            exp_id,
            description,
            run_id,
            scopes: validation.scopes(),
            factory: model_factory,
            global: GlobalModel::new(initial),
            clients: units,
            estimator: estimator.unwrap_or_else(|| server.estimator.build(server.weight_by_samples)),
            selector: selection_policy.unwrap_or_else(|| server.selection_policy.build(membership)),
            aggregator: aggregator.unwrap_or_else(|| Box::new(WeightedAverage::new(server.weighting)) as Box<dyn Aggregator>),
            validator: Validator::new(eval, validation.num_class, server.parallel),
            sink,
            preparation,
            scores: Vec::new(),
            cached_selection: None,
            estimated_once: false,
            announced: false,
            round: 0,
            cancel: CancelToken::new(),
            server,
            client_solver: client,
            validation,
        })
    }

    pub fn global_model(&self) -> &GlobalModel { &self.global }
    pub fn scores(&self) -> &[ImportanceScore] { &self.scores }
    pub fn current_round(&self) -> RoundId { self.round }
    pub fn clients(&self) -> &[ClientUnit] { &self.clients }
    pub fn run_id(&self) -> Uuid { self.run_id }
    pub fn cancel_token(&self) -> CancelToken { self.cancel.clone() }

    /// Run up to `num_global_epochs` rounds, stopping early only on cancellation.
    pub fn run(&mut self, num_global_epochs: u64) -> Result<RunSummary, FlError> {
        let mut rounds = Vec::new();
        let mut cancelled = false;
        for _ in 0..num_global_epochs {
            if self.cancel.is_cancelled() {
                info!(completed = rounds.len(), "run_cancelled");
                cancelled = true;
                break;
            }
            rounds.push(self.run_round()?);
        }
        let degraded_rounds = rounds.iter().filter(|r: &&RoundSummary| r.degraded).count() as u64;
        let summary = RunSummary { rounds_completed: rounds.len() as u64, cancelled, degraded_rounds, final_version: self.global.version, rounds };
        info!(rounds = summary.rounds_completed, degraded = degraded_rounds, version = summary.final_version, cancelled, "run_complete");
        Ok(summary)
    }

    #[instrument(name = "round", skip_all, fields(round = self.round))]
    pub fn run_round(&mut self) -> Result<RoundSummary, FlError> {
        self.announce()?;
        let started = Instant::now();
        let round = self.round;
        let snapshot = self.global.snapshot();

        let estimated = self.should_estimate(round);
        if estimated {
            self.scores = estimate_all(self.estimator.as_ref(), &self.factory, &snapshot, &self.clients, round, self.server.parallel)?;
            self.estimated_once = true;
            debug!(estimator = self.estimator.name(), clients = self.scores.len(), "importance_estimated");
        }

        let selection = self.select(estimated);
        let (updates, failed) = dispatch(&mut self.clients, &selection, &snapshot, &self.factory, round, self.server.parallel);
        let outcome = self.aggregator.aggregate(&snapshot, &updates)?;

        // commit point: version and round index move together, before any sink I/O
        let degraded = outcome.params.is_none();
        let model_version = match outcome.params {
            Some(params) => self.global.commit(params),
            None => self.global.version,
        };
        self.round += 1;
        FL_METRICS.participants_total.add(outcome.accepted.len() as u64, &[]);

        if estimated { self.record_or_warn("importance", self.sink.log_importance(round, &self.scores)); }
        if degraded {
            let reason = degraded_reason(updates.is_empty(), outcome.non_finite);
            warn!(failed = failed.len(), rejected = outcome.rejected.len(), reason, "round_degraded");
            FL_METRICS.degraded_rounds_total.add(1, &[]);
            self.record_or_warn("degraded_round", self.sink.log_degraded_round(round, reason, &failed));
        }

        let reports = self.validator.evaluate(&self.factory, &self.global.snapshot(), &self.clients, &self.scopes, round).unwrap_or_else(|e| {
            warn!(error = %e, "validation_failed");
            FL_METRICS.validation_failures_total.add(1, &[]);
            Vec::new()
        });
        for report in &reports { self.record_or_warn("validation", self.sink.log_validation(report)); }

        FL_METRICS.rounds_total.add(1, &[]);
        FL_METRICS.round_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(selected = selection.len(), aggregated = outcome.accepted.len(), failed = failed.len(), version = model_version, degraded, "round_complete");
        Ok(RoundSummary { round_index: round, estimated, selection, failed_clients: failed, rejected_clients: outcome.rejected, model_version, degraded, reports })
    }

    /// Mid-round sink failures never undo a committed round.
    fn record_or_warn(&self, record: &'static str, result: anyhow::Result<()>) {
        if let Err(e) = result {
            warn!(record, error = %e, "experiment_log_write_failed");
            FL_METRICS.sink_failures_total.add(1, &[]);
        }
    }

    fn should_estimate(&self, round: RoundId) -> bool {
        if self.validation.do_importance_estimation {
            round % self.server.estimation_interval == 0
        } else {
            self.server.do_selection && !self.estimated_once
        }
    }

    fn select(&mut self, estimated: bool) -> SelectionSet {
        if !self.server.do_selection {
            return SelectionSet::from_ids(self.clients.iter().map(ClientUnit::id));
        }
        match (self.server.selection_refresh, &self.cached_selection) {
            (SelectionRefresh::OnEstimation, Some(cached)) if !estimated => cached.clone(),
            _ => {
                let fresh = self.selector.select(&self.scores, self.server.selection_size);
                debug!(policy = self.selector.name(), members = ?fresh.ids(), "selection_refreshed");
                self.cached_selection = Some(fresh.clone());
                fresh
            }
        }
    }

    /// Descriptors go to the sink exactly once, before the first round.
    fn announce(&mut self) -> Result<(), FlError> {
        if self.announced { return Ok(()); }
        let sink = &self.sink;
        sink.log_exp_info(&self.exp_id, &self.description, self.run_id).map_err(FlError::Sink)?;
        sink.log_server_solver(self.server.to_json()).map_err(FlError::Sink)?;
        sink.log_client_solver(self.client_solver.to_json()).map_err(FlError::Sink)?;
        sink.log_validator(self.validation.to_json()).map_err(FlError::Sink)?;
        if let Some(prep) = &self.preparation { sink.log_client_preparation(prep).map_err(FlError::Sink)?; }
        sink.log_model_description(&(self.factory)().describe()).map_err(FlError::Sink)?;
        self.announced = true;
        info!(exp_id = %self.exp_id, run_id = %self.run_id, clients = self.clients.len(), "experiment_started");
        Ok(())
    }
}

fn degraded_reason(no_updates: bool, non_finite: bool) -> &'static str {
    if no_updates {
        "no client produced an update"
    } else if non_finite {
        "aggregate of accepted updates was non-finite"
    } else {
        "every update was rejected"
    }
}

/// Train every selected client against the shared snapshot. Updates come back in
/// selection order so aggregation sums in a fixed order.
fn dispatch(clients: &mut [ClientUnit], selection: &SelectionSet, snapshot: &ParamSet, factory: &ModelFactory, round: RoundId, parallel: bool) -> (Vec<LocalUpdate>, Vec<ClientId>) {
    let chosen: Vec<(usize, &mut ClientUnit)> = clients.iter_mut().filter_map(|u| selection.position(u.id()).map(|p| (p, u))).collect();
    let train = |(pos, unit): (usize, &mut ClientUnit)| (pos, unit.local_train(snapshot, factory, round));
    let mut results: Vec<(usize, Result<LocalUpdate, ClientError>)> =
        if parallel { chosen.into_par_iter().map(train).collect() } else { chosen.into_iter().map(train).collect() };
    results.sort_by_key(|(pos, _)| *pos);

    let mut updates = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (_, result) in results {
        match result {
            Ok(update) => updates.push(update),
            Err(e) => {
                warn!(client = e.client(), error = %e, "client_training_failed");
                FL_METRICS.client_failures_total.add(1, &[]);
                failed.push(e.client());
            }
        }
    }
    (updates, failed)
}

fn check_rows(what: &str, data: &Dataset) -> Result<(), ConfigError> {
    if data.is_consistent() { return Ok(()); }
    Err(ConfigError::InconsistentDataset(what.to_string(), data.features.len(), data.labels.len()))
}

fn check_config(server: &ServerSolver, client: &ClientSolver, validation: &ValidatorConfig, factory: &ModelFactory, clients: &[ClientData], eval: &EvalSets) -> Result<(), ConfigError> {
    if clients.is_empty() { return Err(ConfigError::NoClients); }
    let mut ids = BTreeSet::new();
    for c in clients {
        if !ids.insert(c.client_id) { return Err(ConfigError::DuplicateClient(c.client_id)); }
    }
    for c in clients {
        let label = format!("client {}", c.client_id);
        check_rows(&label, &c.train)?;
        if let Some(held) = &c.held_out { check_rows(&format!("{label} held-out"), held)?; }
    }
    if let Some(global) = &eval.global { check_rows("global held-out", global)?; }
    for (id, ds) in &eval.clusters { check_rows(&format!("cluster {id} held-out"), ds)?; }
    if server.estimation_interval == 0 { return Err(ConfigError::ZeroEstimationInterval); }
    if server.do_selection {
        if server.selection_size == 0 { return Err(ConfigError::ZeroSelectionSize); }
        if server.selection_size > clients.len() {
            return Err(ConfigError::SelectionExceedsPopulation { selection_size: server.selection_size, population: clients.len() });
        }
    }
    if validation.num_class == 0 { return Err(ConfigError::ZeroClasses); }
    let model_classes = factory().describe().num_class;
    if model_classes != validation.num_class {
        return Err(ConfigError::ClassCountMismatch { model: model_classes, validation: validation.num_class });
    }
    client.validate()?;
    if validation.do_client_eval {
        let mut seen = BTreeSet::new();
        for id in &validation.client_eval_idx_vec {
            let Some(c) = clients.iter().find(|c| c.client_id == *id) else { return Err(ConfigError::UnknownEvalClient(*id)); };
            if !seen.insert(*id) { return Err(ConfigError::DuplicateEvalClient(*id)); }
            if c.held_out.as_ref().map_or(true, |d| d.is_empty()) { return Err(ConfigError::MissingClientHeldOut(*id)); }
        }
    }
    if validation.do_cluster_eval {
        for c in clients {
            if !eval.clusters.contains_key(&c.cluster_id) { return Err(ConfigError::MissingClusterHeldOut(c.cluster_id)); }
        }
    }
    Ok(())
}
