//! Observability infrastructure for the recommender
//!
//! Prometheus metrics covering loop step latency, tracked objects, status
//! writes and metrics-provider responses. Registered once in a global
//! registry; handles are cheap clones.

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Buckets for loop step durations (in seconds).
const STEP_BUCKETS: &[f64] = &[0.001, 0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0];

static GLOBAL_METRICS: OnceLock<RecommenderMetricsInner> = OnceLock::new();

struct RecommenderMetricsInner {
    loop_step_seconds: HistogramVec,
    vpas_tracked: IntGauge,
    aggregate_states_tracked: IntGauge,
    recommendations_written: IntCounter,
    status_write_errors: IntCounter,
    oom_events: IntCounter,
    source_responses: IntCounterVec,
    checkpoints_written: IntCounter,
}

impl RecommenderMetricsInner {
    fn new() -> Self {
        Self {
            loop_step_seconds: register_histogram_vec!(
                "vpa_recommender_loop_step_seconds",
                "Wall time of each recommender loop step",
                &["step"],
                STEP_BUCKETS.to_vec()
            )
            .expect("Failed to register loop_step_seconds"),

            vpas_tracked: register_int_gauge!(
                "vpa_recommender_vpas_tracked",
                "Number of VPA objects currently in the cluster model"
            )
            .expect("Failed to register vpas_tracked"),

            aggregate_states_tracked: register_int_gauge!(
                "vpa_recommender_aggregate_states_tracked",
                "Number of aggregate container states currently held"
            )
            .expect("Failed to register aggregate_states_tracked"),

            recommendations_written: register_int_counter!(
                "vpa_recommender_recommendations_written_total",
                "Status updates written because the recommendation changed"
            )
            .expect("Failed to register recommendations_written"),

            status_write_errors: register_int_counter!(
                "vpa_recommender_status_write_errors_total",
                "Failed VPA status writes"
            )
            .expect("Failed to register status_write_errors"),

            oom_events: register_int_counter!(
                "vpa_recommender_oom_events_total",
                "OOM events folded into memory histograms"
            )
            .expect("Failed to register oom_events"),

            source_responses: register_int_counter_vec!(
                "vpa_recommender_metrics_source_responses_total",
                "Responses from metrics sources by outcome",
                &["source", "outcome"]
            )
            .expect("Failed to register source_responses"),

            checkpoints_written: register_int_counter!(
                "vpa_recommender_checkpoints_written_total",
                "Aggregate state checkpoints persisted"
            )
            .expect("Failed to register checkpoints_written"),
        }
    }
}

/// Handle to the global recommender metrics.
#[derive(Clone)]
pub struct RecommenderMetrics {
    _private: (),
}

impl Default for RecommenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RecommenderMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RecommenderMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RecommenderMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_loop_step(&self, step: &str, seconds: f64) {
        self.inner()
            .loop_step_seconds
            .with_label_values(&[step])
            .observe(seconds);
    }

    pub fn set_vpas_tracked(&self, count: i64) {
        self.inner().vpas_tracked.set(count);
    }

    pub fn set_aggregate_states_tracked(&self, count: i64) {
        self.inner().aggregate_states_tracked.set(count);
    }

    pub fn inc_recommendations_written(&self) {
        self.inner().recommendations_written.inc();
    }

    pub fn inc_status_write_errors(&self) {
        self.inner().status_write_errors.inc();
    }

    pub fn inc_oom_events(&self) {
        self.inner().oom_events.inc();
    }

    pub fn observe_source_response(&self, source: &str, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.inner()
            .source_responses
            .with_label_values(&[source, outcome])
            .inc();
    }

    pub fn inc_checkpoints_written(&self) {
        self.inner().checkpoints_written.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handle_is_usable() {
        let metrics = RecommenderMetrics::new();
        metrics.observe_loop_step("load_vpas", 0.01);
        metrics.set_vpas_tracked(3);
        metrics.set_aggregate_states_tracked(7);
        metrics.inc_recommendations_written();
        metrics.inc_status_write_errors();
        metrics.inc_oom_events();
        metrics.observe_source_response("time-series", true);
        metrics.observe_source_response("time-series", false);
        metrics.inc_checkpoints_written();
    }
}
