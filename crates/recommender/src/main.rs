//! Vertical pod autoscaler recommender daemon
//!
//! Observes per-container usage and VPA objects, maintains an in-memory
//! cluster model, and periodically writes resource recommendations back
//! to the orchestrator.

use anyhow::Result;
use chrono::Duration;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use recommender_lib::checkpoint::CheckpointManager;
use recommender_lib::health::components;
use recommender_lib::input::metrics::{
    ExternalMetricsSource, ExternalSourceOptions, PodMetricsLister, ResourceMetricsSource,
    TimeSeriesSource, TimeSeriesSourceConfig,
};
use recommender_lib::input::{ClusterFeed, ClusterStateFeeder};
use recommender_lib::logic::{ExternalRecommender, HistogramRecommender};
use recommender_lib::model::{ClusterState, ExternalRecommendationsState};
use recommender_lib::postprocess::PostProcessorChain;
use recommender_lib::routines::{RecommendationEngine, RecommenderLoop};
use recommender_lib::{HealthRegistry, RecommenderMetrics};

mod api;
mod config;
mod orchestrator;

use config::{Args, Mode};
use orchestrator::OrchestratorClient;

const RECOMMENDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    if let Err(err) = args.validate() {
        error!(error = %err, "Fatal configuration error");
        return ExitCode::from(1);
    }

    match run(args).await {
        Ok(clean) if clean => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(err) => {
            error!(error = %err, "Fatal configuration error");
            ExitCode::from(1)
        }
    }
}

/// Wires everything and runs until shutdown. Returns whether the
/// shutdown was clean (as opposed to an unrecoverable feed failure).
async fn run(args: Args) -> Result<bool> {
    info!(
        version = RECOMMENDER_VERSION,
        recommender = %args.recommender_name,
        mode = ?args.mode,
        "Starting vpa-recommender"
    );

    let endpoint = Url::parse(&args.orchestrator_endpoint)?;
    let request_timeout = std::time::Duration::from_secs(args.loop_interval_secs);
    let client = Arc::new(OrchestratorClient::new(
        endpoint,
        args.orchestrator_token.clone(),
        request_timeout,
    ));

    // Metrics registry and health tracking; the health endpoint degrades
    // when iterations stop landing.
    let _metrics = RecommenderMetrics::new();
    let staleness = Duration::seconds(args.loop_interval_secs as i64 * 2);
    let health = HealthRegistry::new(staleness);
    health.register(components::FEEDER).await;
    health.register(components::RECOMMENDER_LOOP).await;
    health.register(components::STATUS_WRITER).await;
    if args.mode == Mode::Internal {
        health.register(components::CHECKPOINT_WRITER).await;
    }

    let app_state = Arc::new(api::AppState::new(health.clone()));
    tokio::spawn(api::serve(args.api_port, app_state));

    // Feeds: poll-based refresh into the shared snapshot, plus the OOM
    // event channel for whatever watcher surfaces kills.
    let feed = ClusterFeed::new();
    let (_oom_tx, oom_rx) = mpsc::channel(1024);
    let (shutdown_tx, _) = broadcast::channel(4);
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
    tokio::spawn(orchestrator::run_feed_poller(
        client.clone(),
        feed.clone(),
        args.namespace.clone(),
        std::time::Duration::from_secs(args.loop_interval_secs),
        fatal_tx,
        shutdown_tx.subscribe(),
    ));

    let feeder = ClusterStateFeeder::new(feed, oom_rx, args.feeder_config());
    let cluster = ClusterState::new(args.cluster_config());
    let chain = PostProcessorChain::from_config(&args.chain_config());
    info!(chain = ?chain.names(), "Post-processor chain assembled");

    let mut builder = RecommenderLoop::builder()
        .cluster(cluster)
        .feeder(feeder)
        .chain(chain)
        .status_writer(client.clone())
        .health(health.clone())
        .config(args.loop_config());

    builder = match args.mode {
        Mode::Internal => {
            let source: Box<dyn PodMetricsLister> = match &args.timeseries_endpoint {
                Some(endpoint) => Box::new(TimeSeriesSource::new(TimeSeriesSourceConfig {
                    endpoint: Url::parse(endpoint)?,
                    api_key: args.timeseries_api_key.clone(),
                    app_key: args.timeseries_app_key.clone(),
                    cluster_name: args.timeseries_cluster_name.clone(),
                    query_interval: Duration::seconds(args.loop_interval_secs as i64),
                    extra_tags: args.timeseries_extra_tag_list(),
                })),
                None => Box::new(ResourceMetricsSource::new(client.clone())),
            };
            builder
                .source(source)
                .engine(RecommendationEngine::Histogram(HistogramRecommender::new(
                    args.estimator_config(),
                )))
                .checkpoints(CheckpointManager::new(
                    Box::new(OrchestratorClient::new(
                        Url::parse(&args.orchestrator_endpoint)?,
                        args.orchestrator_token.clone(),
                        request_timeout,
                    )),
                    Duration::days(args.checkpoint_retention_days),
                ))
        }
        Mode::External => builder
            .source(Box::new(ExternalMetricsSource::new(
                client.clone(),
                ExternalSourceOptions {
                    pod_namespace_label: args.external_pod_namespace_label.clone(),
                    pod_name_label: args.external_pod_name_label.clone(),
                    container_name_label: args.external_container_name_label.clone(),
                    ..Default::default()
                },
            )))
            .engine(RecommendationEngine::External {
                recommender: ExternalRecommender::new(args.estimator_config()),
                state: ExternalRecommendationsState::new(
                    Duration::hours(1),
                    Duration::minutes(args.gc_interval_minutes),
                ),
            }),
    };

    let mut recommender_loop = builder.build()?;
    recommender_loop.startup().await;

    let loop_handle = tokio::spawn(recommender_loop.run(shutdown_tx.subscribe()));

    // Block until either an operator shutdown or an unrecoverable feed.
    let clean = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
            true
        }
        _ = fatal_rx.recv() => {
            error!("Unrecoverable feed failure");
            false
        }
    };

    let _ = shutdown_tx.send(());
    let _ = loop_handle.await;
    info!("Shutdown complete");
    Ok(clean)
}
