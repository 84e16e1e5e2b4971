//! Recommender configuration
//!
//! Every option is a flag with an environment fallback. Validation
//! failures are fatal: the process exits with code 1 before any loop
//! iteration starts.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use clap::{Parser, ValueEnum};
use url::Url;

use recommender_lib::input::{FeederConfig, DEFAULT_RECOMMENDER_NAME};
use recommender_lib::logic::EstimatorConfig;
use recommender_lib::model::{ClusterStateConfig, ResourceName};
use recommender_lib::postprocess::ChainConfig;
use recommender_lib::routines::LoopConfig;

/// Where recommendations come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Aggregate usage into histograms and derive percentiles.
    Internal,
    /// Pass through raw recommendations from the external metrics API.
    External,
}

/// Vertical pod autoscaler recommender
#[derive(Debug, Parser)]
#[command(name = "vpa-recommender")]
#[command(author, version, about = "Computes resource recommendations for containers", long_about = None)]
pub struct Args {
    /// Name of this recommender; VPAs may pin a specific one
    #[arg(long, env = "VPA_RECOMMENDER_NAME", default_value = DEFAULT_RECOMMENDER_NAME)]
    pub recommender_name: String,

    /// Recommendation mode
    #[arg(long, value_enum, env = "VPA_RECOMMENDER_MODE", default_value = "internal")]
    pub mode: Mode,

    /// Loop interval in seconds
    #[arg(long, env = "VPA_LOOP_INTERVAL_SECS", default_value_t = 60)]
    pub loop_interval_secs: u64,

    /// Namespace to watch; empty watches all namespaces
    #[arg(long, env = "VPA_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Orchestrator API endpoint
    #[arg(long, env = "VPA_ORCHESTRATOR_ENDPOINT", default_value = "http://localhost:8001")]
    pub orchestrator_endpoint: String,

    /// Bearer token for the orchestrator API
    #[arg(long, env = "VPA_ORCHESTRATOR_TOKEN")]
    pub orchestrator_token: Option<String>,

    /// CPU histogram half-life in hours
    #[arg(long, env = "VPA_CPU_HALF_LIFE_HOURS", default_value_t = 24)]
    pub cpu_half_life_hours: i64,

    /// Memory histogram half-life in hours
    #[arg(long, env = "VPA_MEMORY_HALF_LIFE_HOURS", default_value_t = 48)]
    pub memory_half_life_hours: i64,

    /// Safety margin factor applied to every estimate
    #[arg(long, env = "VPA_SAFETY_MARGIN_FACTOR", default_value_t = 1.15)]
    pub safety_margin_factor: f64,

    /// Minimum CPU millicores recommended per pod
    #[arg(long, env = "VPA_POD_MIN_CPU_MILLICORES", default_value_t = 25)]
    pub pod_min_cpu_millicores: i64,

    /// Minimum memory in MiB recommended per pod
    #[arg(long, env = "VPA_POD_MIN_MEMORY_MB", default_value_t = 250)]
    pub pod_min_memory_mb: i64,

    /// Garbage collection interval in minutes
    #[arg(long, env = "VPA_GC_INTERVAL_MINUTES", default_value_t = 60)]
    pub gc_interval_minutes: i64,

    /// Aggregations without samples for this many hours are evicted
    #[arg(long, env = "VPA_OBSOLESCENCE_THRESHOLD_HOURS", default_value_t = 192)]
    pub obsolescence_threshold_hours: i64,

    /// Checkpoint write interval in minutes (internal mode)
    #[arg(long, env = "VPA_CHECKPOINT_INTERVAL_MINUTES", default_value_t = 10)]
    pub checkpoint_interval_minutes: i64,

    /// Checkpoints older than this many days are discarded
    #[arg(long, env = "VPA_CHECKPOINT_RETENTION_DAYS", default_value_t = 7)]
    pub checkpoint_retention_days: i64,

    /// Enable the safety margin modifier post-processor
    #[arg(long, env = "VPA_ENABLE_SAFETY_MARGIN_MODIFIER")]
    pub enable_safety_margin_modifier: bool,

    /// Enable the resource ratio post-processor
    #[arg(long, env = "VPA_ENABLE_RESOURCE_RATIOS")]
    pub enable_resource_ratios: bool,

    /// Enable the replica restrictions post-processor
    #[arg(long, env = "VPA_ENABLE_REPLICA_GUARD")]
    pub enable_replica_guard: bool,

    /// Enable the CPU integer rounding post-processor
    #[arg(long, env = "VPA_ENABLE_CPU_ROUNDING")]
    pub enable_cpu_rounding: bool,

    /// Comma-separated allow-list of resources; empty disables filtering
    #[arg(long, env = "VPA_ALLOWED_RESOURCES", default_value = "")]
    pub allowed_resources: String,

    /// Time-series provider endpoint; switches internal mode to the
    /// time-series source when set
    #[arg(long, env = "VPA_TIMESERIES_ENDPOINT")]
    pub timeseries_endpoint: Option<String>,

    /// Cluster name used in time-series queries
    #[arg(long, env = "VPA_TIMESERIES_CLUSTER_NAME", default_value = "")]
    pub timeseries_cluster_name: String,

    /// Time-series provider API key
    #[arg(long, env = "VPA_TIMESERIES_API_KEY")]
    pub timeseries_api_key: Option<String>,

    /// Time-series provider application key
    #[arg(long, env = "VPA_TIMESERIES_APP_KEY")]
    pub timeseries_app_key: Option<String>,

    /// Extra key:value tags appended to every time-series query
    #[arg(long, env = "VPA_TIMESERIES_EXTRA_TAGS", default_value = "")]
    pub timeseries_extra_tags: String,

    /// Label key carrying the pod namespace in external metrics
    #[arg(long, env = "VPA_EXTERNAL_POD_NAMESPACE_LABEL", default_value = "kube_namespace")]
    pub external_pod_namespace_label: String,

    /// Label key carrying the pod name in external metrics
    #[arg(long, env = "VPA_EXTERNAL_POD_NAME_LABEL", default_value = "pod_name")]
    pub external_pod_name_label: String,

    /// Label key carrying the container name in external metrics
    #[arg(long, env = "VPA_EXTERNAL_CONTAINER_NAME_LABEL", default_value = "container_name")]
    pub external_container_name_label: String,

    /// Port for the health and metrics HTTP server
    #[arg(long, env = "VPA_API_PORT", default_value_t = 8080)]
    pub api_port: u16,
}

impl Args {
    /// Validates cross-field constraints and parses compound flags.
    pub fn validate(&self) -> Result<()> {
        if self.loop_interval_secs == 0 {
            bail!("loop interval must be positive");
        }
        if self.cpu_half_life_hours <= 0 || self.memory_half_life_hours <= 0 {
            bail!("histogram half-lives must be positive");
        }
        if self.safety_margin_factor < 1.0 {
            bail!(
                "safety margin factor {} would shrink recommendations",
                self.safety_margin_factor
            );
        }
        if self.pod_min_cpu_millicores < 0 || self.pod_min_memory_mb < 0 {
            bail!("pod minimums must not be negative");
        }
        Url::parse(&self.orchestrator_endpoint)
            .with_context(|| format!("invalid orchestrator endpoint {:?}", self.orchestrator_endpoint))?;
        if let Some(endpoint) = &self.timeseries_endpoint {
            Url::parse(endpoint)
                .with_context(|| format!("invalid time-series endpoint {:?}", endpoint))?;
        }
        if self.mode == Mode::External && self.timeseries_endpoint.is_some() {
            bail!("the time-series source is an internal-mode source");
        }
        Ok(())
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            interval: std::time::Duration::from_secs(self.loop_interval_secs),
            checkpoint_interval: Duration::minutes(self.checkpoint_interval_minutes),
        }
    }

    pub fn cluster_config(&self) -> ClusterStateConfig {
        ClusterStateConfig {
            cpu_half_life: Duration::hours(self.cpu_half_life_hours),
            memory_half_life: Duration::hours(self.memory_half_life_hours),
            gc_interval: Duration::minutes(self.gc_interval_minutes),
            obsolescence_threshold: Duration::hours(self.obsolescence_threshold_hours),
            ..Default::default()
        }
    }

    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            safety_margin_factor: self.safety_margin_factor,
            pod_min_cpu_millicores: self.pod_min_cpu_millicores,
            pod_min_memory_mb: self.pod_min_memory_mb,
            ..Default::default()
        }
    }

    pub fn feeder_config(&self) -> FeederConfig {
        FeederConfig {
            recommender_name: self.recommender_name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            enable_safety_margin_modifier: self.enable_safety_margin_modifier,
            default_safety_margin_factor: self.safety_margin_factor,
            enable_resource_ratios: self.enable_resource_ratios,
            enable_replica_guard: self.enable_replica_guard,
            enable_cpu_rounding: self.enable_cpu_rounding,
            allowed_resources: self.allowed_resource_names(),
        }
    }

    pub fn allowed_resource_names(&self) -> Option<Vec<ResourceName>> {
        let names: Vec<ResourceName> = self
            .allowed_resources
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ResourceName::from)
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }

    pub fn timeseries_extra_tag_list(&self) -> Vec<String> {
        self.timeseries_extra_tags
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
