use anyhow::Result;
use clusterfed_core::{init_tracing, load_config};
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

mod experiment;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("clusterfed-coordinator")?;
    let cfg = load_config("clusterfed-coordinator")?;
    info!(exp_id = %cfg.exp_id, epochs = cfg.num_epochs, "coordinator starting");

    let run_id = Uuid::new_v4();
    let sink = experiment::build_sink(&cfg, run_id)?;
    let mut orchestrator = experiment::assemble(&cfg, sink, run_id)?;

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current round");
            cancel.cancel();
        }
    });

    let epochs = cfg.num_epochs;
    let summary = tokio::task::spawn_blocking(move || orchestrator.run(epochs)).await??;
    if let Some(last) = summary.rounds.last() {
        for r in &last.reports {
            info!(scope = ?r.scope, accuracy = r.metrics.accuracy, macro_f1 = r.metrics.macro_f1, loss = r.metrics.loss, "final_validation");
        }
    }
    info!(rounds = summary.rounds_completed, degraded = summary.degraded_rounds, version = summary.final_version, cancelled = summary.cancelled, "shutdown");
    Ok(())
}
