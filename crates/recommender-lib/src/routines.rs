//! The recommender loop
//!
//! One iteration, in strict order: load VPAs, load pods, observe OOMs,
//! load metrics, update recommendations, garbage collect. Errors in the
//! input steps leave the model stale; a failure for one VPA never aborts
//! the others.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::annotations;
use crate::checkpoint::CheckpointManager;
use crate::error::{RecommenderError, Result};
use crate::health::{components, HealthRegistry};
use crate::input::metrics::PodMetricsLister;
use crate::input::ClusterStateFeeder;
use crate::logic::{ExternalRecommender, HistogramRecommender};
use crate::model::{ClusterState, ExternalRecommendationsState, VpaId};
use crate::observability::RecommenderMetrics;
use crate::postprocess::{PostProcessContext, PostProcessorChain};
use crate::status::{VpaStatus, VpaStatusWriter};

/// Histories shorter than this flag the recommendation as low confidence.
fn low_confidence_history() -> Duration {
    Duration::hours(24)
}

/// How recommendations are derived; the two modes are mutually exclusive
/// per process instance.
pub enum RecommendationEngine {
    Histogram(HistogramRecommender),
    External {
        recommender: ExternalRecommender,
        state: ExternalRecommendationsState,
    },
}

/// Loop cadence settings.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub interval: std::time::Duration,
    pub checkpoint_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(60),
            checkpoint_interval: Duration::minutes(10),
        }
    }
}

/// Builder for the recommender loop.
pub struct RecommenderLoopBuilder {
    cluster: Option<ClusterState>,
    feeder: Option<ClusterStateFeeder>,
    sources: Vec<Box<dyn PodMetricsLister>>,
    engine: Option<RecommendationEngine>,
    chain: Option<PostProcessorChain>,
    status_writer: Option<Arc<dyn VpaStatusWriter>>,
    checkpoints: Option<CheckpointManager>,
    health: Option<HealthRegistry>,
    config: LoopConfig,
}

impl RecommenderLoopBuilder {
    pub fn new() -> Self {
        Self {
            cluster: None,
            feeder: None,
            sources: Vec::new(),
            engine: None,
            chain: None,
            status_writer: None,
            checkpoints: None,
            health: None,
            config: LoopConfig::default(),
        }
    }

    pub fn cluster(mut self, cluster: ClusterState) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn feeder(mut self, feeder: ClusterStateFeeder) -> Self {
        self.feeder = Some(feeder);
        self
    }

    pub fn source(mut self, source: Box<dyn PodMetricsLister>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn engine(mut self, engine: RecommendationEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn chain(mut self, chain: PostProcessorChain) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn status_writer(mut self, writer: Arc<dyn VpaStatusWriter>) -> Self {
        self.status_writer = Some(writer);
        self
    }

    pub fn checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<RecommenderLoop> {
        let missing = |what: &str| RecommenderError::ConfigInvalid(format!("{} is required", what));
        Ok(RecommenderLoop {
            cluster: self.cluster.ok_or_else(|| missing("cluster state"))?,
            feeder: self.feeder.ok_or_else(|| missing("feeder"))?,
            sources: self.sources,
            engine: self.engine.ok_or_else(|| missing("engine"))?,
            chain: self.chain.ok_or_else(|| missing("post-processor chain"))?,
            status_writer: self.status_writer.ok_or_else(|| missing("status writer"))?,
            checkpoints: self.checkpoints,
            health: self.health.ok_or_else(|| missing("health registry"))?,
            config: self.config,
            metrics: RecommenderMetrics::new(),
            last_statuses: HashMap::new(),
            last_checkpoint: None,
        })
    }
}

impl Default for RecommenderLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the cluster model and drives the whole pipeline.
pub struct RecommenderLoop {
    cluster: ClusterState,
    feeder: ClusterStateFeeder,
    sources: Vec<Box<dyn PodMetricsLister>>,
    engine: RecommendationEngine,
    chain: PostProcessorChain,
    status_writer: Arc<dyn VpaStatusWriter>,
    checkpoints: Option<CheckpointManager>,
    health: HealthRegistry,
    config: LoopConfig,
    metrics: RecommenderMetrics,
    last_statuses: HashMap<VpaId, VpaStatus>,
    last_checkpoint: Option<DateTime<Utc>>,
}

impl RecommenderLoop {
    pub fn builder() -> RecommenderLoopBuilder {
        RecommenderLoopBuilder::new()
    }

    /// Restores checkpoints before the first iteration (internal mode).
    pub async fn startup(&mut self) {
        if matches!(self.engine, RecommendationEngine::External { .. }) {
            return;
        }
        if let Some(checkpoints) = &self.checkpoints {
            match checkpoints.load_checkpoints(&mut self.cluster, Utc::now()).await {
                Ok(loaded) => {
                    self.health.set_healthy(components::CHECKPOINT_WRITER).await;
                    info!(loaded, "Checkpoint restore complete");
                }
                Err(err) => {
                    self.health
                        .set_degraded(components::CHECKPOINT_WRITER, err.to_string())
                        .await;
                    error!(error = %err, "Checkpoint restore failed, starting cold");
                }
            }
        }
    }

    /// Runs iterations on the configured interval until shutdown. The
    /// current iteration always completes before the loop exits.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting recommender loop"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down recommender loop");
                    if let (Some(checkpoints), RecommendationEngine::Histogram(_)) =
                        (&self.checkpoints, &self.engine)
                    {
                        // Final checkpoint boundary before exit.
                        checkpoints.write_checkpoints(&self.cluster, Utc::now()).await;
                    }
                    break;
                }
            }
        }
    }

    /// One full iteration at `now`.
    pub async fn run_once(&mut self, now: DateTime<Utc>) {
        let timer = StepTimer::new(self.metrics.clone());

        let snapshot = self.feeder.snapshot();
        self.feeder.load_vpas(&snapshot, &mut self.cluster);
        if let RecommendationEngine::External { state, .. } = &mut self.engine {
            for vpa in self.cluster.vpas() {
                state.add_or_update_vpa(vpa);
            }
            for id in state.vpa_ids() {
                if self.cluster.vpa(&id).is_none() {
                    state.delete_vpa(&id);
                }
            }
        }
        let timer = timer.observe("load_vpas");

        self.feeder.load_pods(&snapshot, &mut self.cluster);
        let timer = timer.observe("load_pods");

        let ooms = self.feeder.observe_ooms(&mut self.cluster);
        if ooms > 0 {
            debug!(ooms, "Injected OOM samples");
        }
        let timer = timer.observe("observe_ooms");

        match &mut self.engine {
            RecommendationEngine::Histogram(_) => {
                self.feeder
                    .load_metrics_into_cluster(&self.sources, &mut self.cluster)
                    .await;
            }
            RecommendationEngine::External { state, .. } => {
                self.feeder
                    .load_metrics_into_external_state(&self.sources, &self.cluster, state)
                    .await;
            }
        }
        self.health.set_healthy(components::FEEDER).await;
        let timer = timer.observe("load_metrics");

        self.update_vpas(now).await;
        let timer = timer.observe("update_vpas");

        self.cluster.rate_limited_garbage_collect(now);
        if let RecommendationEngine::External { state, .. } = &mut self.engine {
            state.rate_limited_garbage_collect(now);
        }
        timer.observe("garbage_collect");

        if let RecommendationEngine::Histogram(_) = self.engine {
            let due = self
                .last_checkpoint
                .map_or(true, |last| now - last >= self.config.checkpoint_interval);
            if due {
                if let Some(checkpoints) = &self.checkpoints {
                    checkpoints.write_checkpoints(&self.cluster, now).await;
                    self.last_checkpoint = Some(now);
                }
            }
        }

        self.metrics
            .set_aggregate_states_tracked(self.cluster.aggregate_state_count() as i64);
        self.health.record_iteration(now).await;
        self.health.set_healthy(components::RECOMMENDER_LOOP).await;
    }

    /// Computes, post-processes and writes one recommendation per VPA.
    async fn update_vpas(&mut self, now: DateTime<Utc>) {
        let mut ids = self.cluster.vpa_ids();
        ids.sort();
        let mut write_failures = 0usize;

        for id in ids {
            let Some(vpa) = self.cluster.vpa(&id) else {
                continue;
            };
            let pod_template = self.cluster.pod_template_view(&id);

            let (recommendation, low_confidence) = match &self.engine {
                RecommendationEngine::Histogram(recommender) => {
                    let states = self.cluster.aggregate_states_for(&id);
                    let low_confidence = states.is_empty()
                        || states
                            .values()
                            .any(|s| s.history() < low_confidence_history());
                    (recommender.recommend(vpa, &states), low_confidence)
                }
                RecommendationEngine::External { recommender, state } => {
                    let raw = state.recommendations_for(&id);
                    let low_confidence = raw.is_empty() && vpa.pod_count > 0;
                    (recommender.recommend(vpa, &raw), low_confidence)
                }
            };

            let ctx = PostProcessContext {
                vpa,
                pod_template: &pod_template,
            };
            let processed = self.chain.apply(&ctx, recommendation);
            let config_deprecated =
                !annotations::malformed_recommender_annotations(&vpa.annotations).is_empty();

            let status = VpaStatus::build(vpa, &processed, low_confidence, config_deprecated, now);
            if let Some(vpa) = self.cluster.vpa_mut(&id) {
                vpa.recommendation = Some(processed);
            }

            if !status.differs_from(self.last_statuses.get(&id)) {
                continue;
            }
            match self.status_writer.update_vpa_status(&id, &status).await {
                Ok(()) => {
                    self.metrics.inc_recommendations_written();
                    self.last_statuses.insert(id, status);
                }
                Err(err) => {
                    // Isolated to this VPA; the loop moves on.
                    write_failures += 1;
                    self.metrics.inc_status_write_errors();
                    error!(vpa = %id, error = %err, "Failed to write VPA status");
                }
            }
        }

        if write_failures == 0 {
            self.health.set_healthy(components::STATUS_WRITER).await;
        } else {
            self.health
                .set_degraded(
                    components::STATUS_WRITER,
                    format!("{} status writes failed", write_failures),
                )
                .await;
        }
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }
}

/// Tracks per-step wall time into the loop-step histogram.
struct StepTimer {
    metrics: RecommenderMetrics,
    started: std::time::Instant,
}

impl StepTimer {
    fn new(metrics: RecommenderMetrics) -> Self {
        Self {
            metrics,
            started: std::time::Instant::now(),
        }
    }

    fn observe(self, step: &str) -> Self {
        self.metrics
            .observe_loop_step(step, self.started.elapsed().as_secs_f64());
        Self {
            metrics: self.metrics,
            started: std::time::Instant::now(),
        }
    }
}
