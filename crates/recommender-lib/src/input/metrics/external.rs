//! External-metrics source
//!
//! Driven by VPA annotations: each `metric-<resource>-<container>`
//! annotation names an external metric whose returned labels identify the
//! pod and container a value belongs to. One list query is issued per
//! distinct (resource, metric) pair; values missing any of the identifying
//! labels are dropped silently.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ContainerMetrics, PodMetrics, PodMetricsLister, VpaMetricsView};
use crate::annotations::{metric_mappings, MetricSpec};
use crate::error::Result;
use crate::model::{PodId, ResourceName, Resources};

/// A single value returned by the external metrics API.
#[derive(Debug, Clone)]
pub struct ExternalMetricValue {
    pub labels: BTreeMap<String, String>,
    /// Canonical units: millicores for CPU metrics, bytes for memory.
    pub value: i64,
    pub timestamp: DateTime<Utc>,
    pub window_seconds: Option<i64>,
}

/// Transport to the external metrics API.
#[async_trait]
pub trait ExternalMetricsClient: Send + Sync {
    async fn list(&self, namespace: &str, metric: &MetricSpec)
        -> Result<Vec<ExternalMetricValue>>;
}

/// Label keys that disambiguate pod and container in returned metrics.
#[derive(Debug, Clone)]
pub struct ExternalSourceOptions {
    pub pod_namespace_label: String,
    pub pod_name_label: String,
    pub container_name_label: String,
    /// Window reported when the provider omits one.
    pub default_window: Duration,
}

impl Default for ExternalSourceOptions {
    fn default() -> Self {
        Self {
            pod_namespace_label: "kube_namespace".to_string(),
            pod_name_label: "pod_name".to_string(),
            container_name_label: "container_name".to_string(),
            default_window: Duration::seconds(60),
        }
    }
}

/// Source that turns annotation-declared external metrics into pod samples.
pub struct ExternalMetricsSource {
    client: Arc<dyn ExternalMetricsClient>,
    options: ExternalSourceOptions,
}

type PodContainerResourceMap = HashMap<PodId, HashMap<String, Resources>>;

impl ExternalMetricsSource {
    pub fn new(client: Arc<dyn ExternalMetricsClient>, options: ExternalSourceOptions) -> Self {
        Self { client, options }
    }

    /// Identifies the container a metric value belongs to, or `None` when
    /// any of the three identifying labels is missing.
    fn container_id(&self, value: &ExternalMetricValue) -> Option<(PodId, String)> {
        let namespace = value.labels.get(&self.options.pod_namespace_label)?;
        let pod_name = value.labels.get(&self.options.pod_name_label)?;
        let container = value.labels.get(&self.options.container_name_label)?;
        Some((
            PodId::new(namespace.clone(), pod_name.clone()),
            container.clone(),
        ))
    }

    fn accumulate(
        &self,
        values: &[ExternalMetricValue],
        resource: &ResourceName,
        map: &mut PodContainerResourceMap,
    ) {
        for value in values {
            let Some((pod_id, container)) = self.container_id(value) else {
                continue;
            };
            map.entry(pod_id)
                .or_default()
                .entry(container)
                .or_default()
                .insert(resource.clone(), value.value);
        }
    }
}

#[async_trait]
impl PodMetricsLister for ExternalMetricsSource {
    fn name(&self) -> &'static str {
        "external-metrics"
    }

    async fn list(&self, namespace: &str, vpas: &[VpaMetricsView]) -> Result<Vec<PodMetrics>> {
        let mut result = Vec::new();
        for vpa in vpas {
            // VPAs without matched pods would only generate API traffic.
            if vpa.pod_count == 0 {
                continue;
            }
            if !namespace.is_empty() && vpa.id.namespace != namespace {
                continue;
            }
            let (mappings, bad_keys) = metric_mappings(&vpa.annotations);
            for key in &bad_keys {
                warn!(vpa = %vpa.id, annotation = %key, "Skipping malformed metric annotation");
            }
            if mappings.is_empty() {
                continue;
            }

            // One query per distinct (resource, metric), regardless of how
            // many containers share it.
            let mut queries: Vec<(ResourceName, MetricSpec)> = Vec::new();
            for mapping in &mappings {
                let entry = (mapping.resource.clone(), mapping.metric.clone());
                if !queries.contains(&entry) {
                    queries.push(entry);
                }
            }

            let mut values = PodContainerResourceMap::new();
            let mut timestamp = None;
            let mut window = self.options.default_window;
            for (resource, metric) in &queries {
                let items = self.client.list(&vpa.id.namespace, metric).await?;
                if items.is_empty() {
                    debug!(vpa = %vpa.id, metric = %metric.name, "External metric returned no values");
                    continue;
                }
                self.accumulate(&items, resource, &mut values);
                if timestamp.is_none() {
                    timestamp = Some(items[0].timestamp);
                    if let Some(secs) = items[0].window_seconds {
                        if secs > 0 {
                            window = Duration::seconds(secs);
                        }
                    }
                }
            }

            let Some(timestamp) = timestamp else {
                continue;
            };
            for (pod_id, containers) in values {
                let pod = PodMetrics {
                    pod_id,
                    timestamp,
                    window,
                    containers: containers
                        .into_iter()
                        .map(|(name, usage)| ContainerMetrics { name, usage })
                        .collect(),
                };
                pod.validate()?;
                result.push(pod);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LabelSelector, VpaId};
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    struct FakeClient {
        responses: HashMap<String, Vec<ExternalMetricValue>>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExternalMetricsClient for FakeClient {
        async fn list(
            &self,
            _namespace: &str,
            metric: &MetricSpec,
        ) -> Result<Vec<ExternalMetricValue>> {
            self.queries.lock().unwrap().push(metric.name.clone());
            Ok(self.responses.get(&metric.name).cloned().unwrap_or_default())
        }
    }

    fn value(labels: &[(&str, &str)], amount: i64) -> ExternalMetricValue {
        ExternalMetricValue {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value: amount,
            timestamp: t0(),
            window_seconds: Some(30),
        }
    }

    fn vpa_view(annotations: &[(&str, &str)], pod_count: usize) -> VpaMetricsView {
        VpaMetricsView {
            id: VpaId::new("prod", "web"),
            pod_count,
            selector: LabelSelector::everything(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn full_labels() -> Vec<(&'static str, &'static str)> {
        vec![
            ("kube_namespace", "prod"),
            ("pod_name", "web-0"),
            ("container_name", "nginx"),
        ]
    }

    #[tokio::test]
    async fn test_partial_pod_metrics_are_emitted() {
        // CPU present, memory metric returns nothing: the pod still shows
        // up with a CPU-only usage map.
        let client = Arc::new(FakeClient {
            responses: HashMap::from([(
                "cpu.rec".to_string(),
                vec![value(&full_labels(), 1200)],
            )]),
            queries: Mutex::new(vec![]),
        });
        let source = ExternalMetricsSource::new(client, ExternalSourceOptions::default());
        let vpas = [vpa_view(
            &[
                ("vpa.scalewise.dev/metric-cpu-nginx", "cpu.rec"),
                ("vpa.scalewise.dev/metric-memory-nginx", "mem.rec"),
            ],
            1,
        )];
        let metrics = source.list("", &vpas).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].pod_id, PodId::new("prod", "web-0"));
        assert_eq!(metrics[0].window, Duration::seconds(30));
        let usage = &metrics[0].containers[0].usage;
        assert_eq!(usage.get(&ResourceName::Cpu), Some(&1200));
        assert_eq!(usage.get(&ResourceName::Memory), None);
    }

    #[tokio::test]
    async fn test_values_missing_labels_are_dropped() {
        let client = Arc::new(FakeClient {
            responses: HashMap::from([(
                "cpu.rec".to_string(),
                vec![
                    value(&full_labels(), 1200),
                    value(&[("pod_name", "web-1"), ("container_name", "nginx")], 900),
                ],
            )]),
            queries: Mutex::new(vec![]),
        });
        let source = ExternalMetricsSource::new(client, ExternalSourceOptions::default());
        let vpas = [vpa_view(&[("vpa.scalewise.dev/metric-cpu-nginx", "cpu.rec")], 1)];
        let metrics = source.list("", &vpas).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].pod_id.pod_name, "web-0");
    }

    #[tokio::test]
    async fn test_skips_vpas_without_pods() {
        let client = Arc::new(FakeClient {
            responses: HashMap::new(),
            queries: Mutex::new(vec![]),
        });
        let source =
            ExternalMetricsSource::new(client.clone(), ExternalSourceOptions::default());
        let vpas = [vpa_view(&[("vpa.scalewise.dev/metric-cpu-nginx", "cpu.rec")], 0)];
        let metrics = source.list("", &vpas).await.unwrap();
        assert!(metrics.is_empty());
        assert!(client.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_metric_queried_once() {
        let client = Arc::new(FakeClient {
            responses: HashMap::from([(
                "cpu.rec".to_string(),
                vec![
                    value(&full_labels(), 1200),
                    value(
                        &[
                            ("kube_namespace", "prod"),
                            ("pod_name", "web-0"),
                            ("container_name", "sidecar"),
                        ],
                        150,
                    ),
                ],
            )]),
            queries: Mutex::new(vec![]),
        });
        let source =
            ExternalMetricsSource::new(client.clone(), ExternalSourceOptions::default());
        let vpas = [vpa_view(
            &[
                ("vpa.scalewise.dev/metric-cpu-nginx", "cpu.rec"),
                ("vpa.scalewise.dev/metric-cpu-sidecar", "cpu.rec"),
            ],
            1,
        )];
        let metrics = source.list("", &vpas).await.unwrap();
        assert_eq!(client.queries.lock().unwrap().len(), 1);
        assert_eq!(metrics[0].containers.len(), 2);
    }
}
