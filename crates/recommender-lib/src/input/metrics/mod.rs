//! Pluggable producers of per-container usage samples
//!
//! Every source normalizes its provider's responses into the same
//! `PodMetrics` stream: CPU in millicores, memory in bytes, one timestamp
//! and one strictly positive window per pod.

mod external;
mod resource;
mod timeseries;

pub use external::{
    ExternalMetricValue, ExternalMetricsClient, ExternalMetricsSource, ExternalSourceOptions,
};
pub use resource::{ResourceMetricsClient, ResourceMetricsSource};
pub use timeseries::{TimeSeriesSource, TimeSeriesSourceConfig};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::error::{RecommenderError, Result};
use crate::model::{LabelSelector, PodId, Resources, VpaId};

/// Usage of one container inside a metrics list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMetrics {
    pub name: String,
    pub usage: Resources,
}

/// Usage of one pod over one sampling window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMetrics {
    pub pod_id: PodId,
    pub timestamp: DateTime<Utc>,
    pub window: Duration,
    pub containers: Vec<ContainerMetrics>,
}

impl PodMetrics {
    /// Enforces the source contract: the window is strictly positive.
    pub fn validate(&self) -> Result<()> {
        if self.window <= Duration::zero() {
            return Err(RecommenderError::Internal(format!(
                "pod {} reported a non-positive window",
                self.pod_id
            )));
        }
        Ok(())
    }
}

/// The slice of a VPA a metrics source is allowed to see.
#[derive(Debug, Clone)]
pub struct VpaMetricsView {
    pub id: VpaId,
    pub pod_count: usize,
    pub selector: LabelSelector,
    pub annotations: BTreeMap<String, String>,
}

/// Uniform capability of every metrics source.
///
/// An upstream failure fails the whole list with `UpstreamUnavailable`;
/// missing data for a single pod never does.
#[async_trait]
pub trait PodMetricsLister: Send + Sync {
    /// Human-readable source name for logs and counters.
    fn name(&self) -> &'static str;

    /// Lists current usage, scoped to `namespace` when non-empty.
    async fn list(&self, namespace: &str, vpas: &[VpaMetricsView]) -> Result<Vec<PodMetrics>>;
}
