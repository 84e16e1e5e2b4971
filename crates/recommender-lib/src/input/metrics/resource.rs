//! Resource-metrics source
//!
//! Thin pass-through to the orchestrator's resource-metrics API. The
//! transport client is a collaborator; this wrapper only validates the
//! contract on the way out.

use async_trait::async_trait;
use std::sync::Arc;

use super::{PodMetrics, PodMetricsLister, VpaMetricsView};
use crate::error::Result;

/// Transport to the orchestrator's resource-metrics API.
#[async_trait]
pub trait ResourceMetricsClient: Send + Sync {
    async fn list_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetrics>>;
}

/// Source wrapper around a [`ResourceMetricsClient`].
pub struct ResourceMetricsSource {
    client: Arc<dyn ResourceMetricsClient>,
}

impl ResourceMetricsSource {
    pub fn new(client: Arc<dyn ResourceMetricsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodMetricsLister for ResourceMetricsSource {
    fn name(&self) -> &'static str {
        "resource-metrics"
    }

    async fn list(&self, namespace: &str, _vpas: &[VpaMetricsView]) -> Result<Vec<PodMetrics>> {
        let metrics = self.client.list_pod_metrics(namespace).await?;
        for pod in &metrics {
            pod.validate()?;
        }
        Ok(metrics)
    }
}
