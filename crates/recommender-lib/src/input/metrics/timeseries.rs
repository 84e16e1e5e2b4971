//! Time-series source
//!
//! Issues two range queries per tick (CPU usage total, memory usage)
//! against a third-party time-series backend and derives per-container
//! samples from the tagged series in the response. Per container the
//! maximum value observed in the window wins; CPU is scaled to millicores
//! using the provider-reported unit scale, memory to bytes.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

use super::{ContainerMetrics, PodMetrics, PodMetricsLister, VpaMetricsView};
use crate::error::{RecommenderError, Result};
use crate::model::{PodId, ResourceName, Resources};
use crate::retry::{retry_transient, RetryConfig};

const NAMESPACE_TAG: &str = "kube_namespace";
const POD_TAG: &str = "pod_name";
const CONTAINER_TAG: &str = "container_name";
const UNKNOWN_POD: &str = "unknown-pod";
const UNKNOWN_CONTAINER: &str = "unknown-container";

/// Queries end this far in the past so late-arriving points have settled.
fn time_shift() -> Duration {
    Duration::minutes(2)
}

/// Connection and query settings for the time-series backend.
#[derive(Debug, Clone)]
pub struct TimeSeriesSourceConfig {
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub app_key: Option<String>,
    pub cluster_name: String,
    /// Window covered by each range query; also the reported sample window.
    pub query_interval: Duration,
    /// Extra `key:value` clauses appended to every query.
    pub extra_tags: Vec<String>,
}

/// Source backed by a remote time-series HTTP API.
pub struct TimeSeriesSource {
    http: reqwest::Client,
    config: TimeSeriesSourceConfig,
    retry: RetryConfig,
    extra_clause: String,
}

#[derive(Debug, Clone, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    series: Vec<Series>,
}

#[derive(Debug, Clone, Deserialize)]
struct Series {
    #[serde(default)]
    tag_set: Vec<String>,
    /// Rows of `[timestamp_ms, value]`.
    #[serde(default)]
    pointlist: Vec<Vec<Option<f64>>>,
    #[serde(default)]
    unit: Vec<Option<UnitDescriptor>>,
}

#[derive(Debug, Clone, Deserialize)]
struct UnitDescriptor {
    scale_factor: Option<f64>,
}

impl Series {
    fn scale_factor(&self) -> f64 {
        self.unit
            .first()
            .and_then(|u| u.as_ref())
            .and_then(|u| u.scale_factor)
            .unwrap_or(1.0)
    }

    /// Maximum value across the window; `>=` so an all-zero series still
    /// reports zero usage.
    fn max_value(&self) -> Option<f64> {
        let mut max: Option<f64> = None;
        for row in &self.pointlist {
            if let [Some(_ts), Some(value)] = row.as_slice() {
                max = Some(max.map_or(*value, |m| if *value >= m { *value } else { m }));
            } else {
                debug!("Skipping short or null row in series");
            }
        }
        max
    }
}

/// Splits series by the value of a tag; series without the tag land under
/// `empty_key`.
fn classify_by_tag<'a>(
    series: &'a [&'a Series],
    tag_key: &str,
    empty_key: &str,
) -> HashMap<String, Vec<&'a Series>> {
    let prefix = format!("{}:", tag_key);
    let mut result: HashMap<String, Vec<&Series>> = HashMap::new();
    for entry in series {
        let tag_value = entry
            .tag_set
            .iter()
            .find_map(|t| t.strip_prefix(&prefix));
        let key = tag_value.unwrap_or(empty_key).to_string();
        result.entry(key).or_default().push(entry);
    }
    result
}

/// First occurrence of a tag value anywhere in the given series.
fn find_first_tag(series_lists: &[&[&Series]], tag_key: &str) -> Option<String> {
    let prefix = format!("{}:", tag_key);
    for list in series_lists {
        for entry in *list {
            if let Some(value) = entry.tag_set.iter().find_map(|t| t.strip_prefix(&prefix)) {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn cpu_millis_from(series: &Series, value: f64) -> i64 {
    (value * series.scale_factor() * 1000.0) as i64
}

fn memory_bytes_from(series: &Series, value: f64) -> i64 {
    (value * series.scale_factor()) as i64
}

/// Builds the usage map of one pod from its CPU and memory series.
fn container_usage(cpu: &[&Series], memory: &[&Series]) -> HashMap<String, Resources> {
    let mut containers: HashMap<String, Resources> = HashMap::new();
    for (resource, series) in [(ResourceName::Cpu, cpu), (ResourceName::Memory, memory)] {
        let per_container = classify_by_tag(series, CONTAINER_TAG, UNKNOWN_CONTAINER);
        for (container, entries) in per_container {
            let mut best: Option<(f64, &Series)> = None;
            for entry in entries {
                if let Some(value) = entry.max_value() {
                    let better = best.map_or(true, |(b, _)| value >= b);
                    if better {
                        best = Some((value, entry));
                    }
                }
            }
            if let Some((value, entry)) = best {
                let amount = match resource {
                    ResourceName::Cpu => cpu_millis_from(entry, value),
                    _ => memory_bytes_from(entry, value),
                };
                containers
                    .entry(container)
                    .or_default()
                    .insert(resource.clone(), amount);
            }
        }
    }
    containers
}

impl TimeSeriesSource {
    pub fn new(config: TimeSeriesSourceConfig) -> Self {
        let extra_clause = build_extra_clause(&config.extra_tags);
        let interval = config
            .query_interval
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));
        // Requests and retries both stay inside one loop iteration.
        let http = reqwest::Client::builder()
            .timeout(interval)
            .build()
            .unwrap_or_default();
        Self {
            http,
            config,
            retry: RetryConfig::within_interval(interval),
            extra_clause,
        }
    }

    fn query_string(&self, metric: &str, namespace: &str, rollup_seconds: i64) -> String {
        let ns_clause = if namespace.is_empty() {
            String::new()
        } else {
            format!(" AND {}:{}", NAMESPACE_TAG, namespace)
        };
        format!(
            "max:{}{{kube_cluster_name:{}{}{}}}by{{{},{},{}}}.rollup(max, {})",
            metric,
            self.config.cluster_name,
            ns_clause,
            self.extra_clause,
            NAMESPACE_TAG,
            POD_TAG,
            CONTAINER_TAG,
            rollup_seconds
        )
    }

    async fn range_query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        query: &str,
    ) -> Result<QueryResponse> {
        retry_transient(&self.retry, "timeseries_query", || async {
            let url = self
                .config
                .endpoint
                .join("api/v1/query")
                .map_err(|e| RecommenderError::ConfigInvalid(e.to_string()))?;
            let mut request = self.http.get(url).query(&[
                ("from", start.timestamp().to_string()),
                ("to", end.timestamp().to_string()),
                ("query", query.to_string()),
            ]);
            if let Some(key) = &self.config.api_key {
                request = request.header("DD-API-KEY", key);
            }
            if let Some(key) = &self.config.app_key {
                request = request.header("DD-APPLICATION-KEY", key);
            }
            let response = request
                .send()
                .await
                .map_err(|e| RecommenderError::UpstreamUnavailable(e.to_string()))?;
            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(RecommenderError::Transient(format!(
                    "provider returned {}",
                    status
                )));
            }
            if !status.is_success() {
                return Err(RecommenderError::UpstreamUnavailable(format!(
                    "provider returned {}",
                    status
                )));
            }
            response
                .json::<QueryResponse>()
                .await
                .map_err(|e| RecommenderError::UpstreamUnavailable(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl PodMetricsLister for TimeSeriesSource {
    fn name(&self) -> &'static str {
        "time-series"
    }

    async fn list(&self, namespace: &str, _vpas: &[VpaMetricsView]) -> Result<Vec<PodMetrics>> {
        let end = Utc::now() - time_shift();
        let start = end - self.config.query_interval;
        let rollup = self.config.query_interval.num_seconds().max(1);

        let cpu_query = self.query_string("kubernetes.cpu.usage.total", namespace, rollup);
        let mem_query = self.query_string("kubernetes.memory.usage", namespace, rollup);
        let cpu_response = self.range_query(start, end, &cpu_query).await?;
        let mem_response = self.range_query(start, end, &mem_query).await?;

        let cpu_refs: Vec<&Series> = cpu_response.series.iter().collect();
        let mem_refs: Vec<&Series> = mem_response.series.iter().collect();
        Ok(assemble_pod_metrics(
            namespace,
            &cpu_refs,
            &mem_refs,
            start,
            self.config.query_interval,
        ))
    }
}

/// Groups both responses by pod and emits one `PodMetrics` per pod. The
/// reported timestamp is the window start.
fn assemble_pod_metrics(
    namespace: &str,
    cpu_series: &[&Series],
    mem_series: &[&Series],
    window_start: DateTime<Utc>,
    window: Duration,
) -> Vec<PodMetrics> {
    let pod_cpus = classify_by_tag(cpu_series, POD_TAG, UNKNOWN_POD);
    let pod_mems = classify_by_tag(mem_series, POD_TAG, UNKNOWN_POD);

    let mut pod_names: Vec<&String> = pod_cpus.keys().chain(pod_mems.keys()).collect();
    pod_names.sort();
    pod_names.dedup();

    let mut result = Vec::new();
    for pod_name in pod_names {
        if pod_name == UNKNOWN_POD {
            warn!("Dropping series without a pod tag");
            continue;
        }
        let empty = Vec::new();
        let cpu = pod_cpus.get(pod_name).unwrap_or(&empty);
        let mem = pod_mems.get(pod_name).unwrap_or(&empty);

        let pod_namespace = if namespace.is_empty() {
            match find_first_tag(&[cpu.as_slice(), mem.as_slice()], NAMESPACE_TAG) {
                Some(ns) => ns,
                None => {
                    warn!(pod = %pod_name, "Cannot recover namespace from series tags, skipping pod");
                    continue;
                }
            }
        } else {
            namespace.to_string()
        };

        let containers = container_usage(cpu, mem);
        if containers.is_empty() {
            continue;
        }
        let mut container_list: Vec<ContainerMetrics> = containers
            .into_iter()
            .map(|(name, usage)| ContainerMetrics { name, usage })
            .collect();
        container_list.sort_by(|a, b| a.name.cmp(&b.name));
        result.push(PodMetrics {
            pod_id: PodId::new(pod_namespace, pod_name.clone()),
            timestamp: window_start,
            window,
            containers: container_list,
        });
    }
    result
}

fn build_extra_clause(tags: &[String]) -> String {
    let valid: Vec<&str> = tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| {
            !t.is_empty()
                && t.contains(':')
                && t.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.'))
        })
        .collect();
    if valid.is_empty() {
        String::new()
    } else {
        format!(" AND {}", valid.join(" AND "))
    }
}
