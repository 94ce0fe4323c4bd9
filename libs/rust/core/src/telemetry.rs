//! Federated round metrics, registered lazily on the global meter.
//!
//! Without an installed meter provider these are no-ops, so tests and the
//! library never require an exporter.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct FlMetrics {
    pub rounds_total: Counter<u64>,
    pub degraded_rounds_total: Counter<u64>,
    pub participants_total: Counter<u64>,
    pub client_failures_total: Counter<u64>,
    pub rejected_updates_total: Counter<u64>,
    pub estimations_total: Counter<u64>,
    pub validation_failures_total: Counter<u64>,
    pub sink_failures_total: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub round_latency_ms: Histogram<f64>,
}

static FL_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("clusterfed"));

pub static FL_METRICS: Lazy<FlMetrics> = Lazy::new(|| FlMetrics {
    rounds_total: FL_METER.u64_counter("clusterfed_rounds_total").with_description("Federated rounds executed").build(),
    degraded_rounds_total: FL_METER.u64_counter("clusterfed_degraded_rounds_total").with_description("Rounds that committed no new model version").build(),
    participants_total: FL_METER.u64_counter("clusterfed_participants_total").with_description("Client updates aggregated").build(),
    client_failures_total: FL_METER.u64_counter("clusterfed_client_failures_total").with_description("Client local rounds that failed").build(),
    rejected_updates_total: FL_METER.u64_counter("clusterfed_rejected_updates_total").with_description("Updates rejected for layout mismatch").build(),
    estimations_total: FL_METER.u64_counter("clusterfed_estimations_total").with_description("Importance estimation passes").build(),
    validation_failures_total: FL_METER.u64_counter("clusterfed_validation_failures_total").with_description("Validation scopes that failed").build(),
    sink_failures_total: FL_METER.u64_counter("clusterfed_sink_failures_total").with_description("Experiment log writes that failed mid-run").build(),
    aggregation_latency_ms: FL_METER.f64_histogram("clusterfed_aggregation_latency_ms").with_description("Aggregation latency ms").with_unit("ms").build(),
    round_latency_ms: FL_METER.f64_histogram("clusterfed_round_latency_ms").with_description("Full round latency ms").with_unit("ms").build(),
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruments_are_noops_without_provider() {
        FL_METRICS.rounds_total.add(1, &[]);
        FL_METRICS.round_latency_ms.record(12.5, &[]);
    }
}
