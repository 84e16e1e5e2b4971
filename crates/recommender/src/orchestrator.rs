//! Orchestrator API adapters
//!
//! Thin REST client behind the library's collaborator traits: the VPA and
//! pod feeds, the resource-metrics and external-metrics APIs, status
//! writes and checkpoint objects. Watching is poll-based: each refresh
//! re-lists both feeds and swaps them into the shared snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use recommender_lib::annotations::MetricSpec;
use recommender_lib::checkpoint::{AggregateStateCheckpoint, CheckpointClient};
use recommender_lib::error::{RecommenderError, Result};
use recommender_lib::input::metrics::{
    ContainerMetrics, ExternalMetricValue, ExternalMetricsClient, PodMetrics,
    ResourceMetricsClient,
};
use recommender_lib::input::{ClusterFeed, FeedSnapshot};
use recommender_lib::model::{
    AggregateStateKey, ContainerSpec, ControllerRef, LabelSelector, PodId, PodResourcePolicy,
    PodSpec, Resources, TargetRef, UpdateMode, VpaId, VpaSpec,
};
use recommender_lib::status::{VpaStatus, VpaStatusWriter};

/// Shared REST client for every orchestrator interaction.
pub struct OrchestratorClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl OrchestratorClient {
    pub fn new(base: Url, token: Option<String>, request_timeout: std::time::Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { http, base, token }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| RecommenderError::ConfigInvalid(e.to_string()))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .request(self.http.get(self.url(path)?))
            .send()
            .await
            .map_err(|e| RecommenderError::UpstreamUnavailable(e.to_string()))?;
        let response = classify_status(response)?;
        response
            .json::<T>()
            .await
            .map_err(|e| RecommenderError::UpstreamUnavailable(e.to_string()))
    }

    async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let response = self
            .request(self.http.put(self.url(path)?).json(body))
            .send()
            .await
            .map_err(|e| RecommenderError::UpstreamUnavailable(e.to_string()))?;
        classify_status(response).map(|_| ())
    }
}

fn classify_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => RecommenderError::NotFound(status.to_string()),
        StatusCode::TOO_MANY_REQUESTS => RecommenderError::Transient(status.to_string()),
        s if s.is_server_error() => RecommenderError::Transient(status.to_string()),
        s => RecommenderError::UpstreamUnavailable(s.to_string()),
    })
}

// Wire shapes of the orchestrator objects this process reads and writes.

#[derive(Debug, Clone, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct ObjectMeta {
    name: String,
    namespace: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "creationTimestamp")]
    creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct VpaObject {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: VpaObjectSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VpaObjectSpec {
    #[serde(default)]
    selector: LabelSelector,
    target_ref: Option<TargetRef>,
    resource_policy: Option<PodResourcePolicy>,
    update_policy: Option<UpdatePolicy>,
    #[serde(default)]
    recommenders: Vec<RecommenderSelector>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePolicy {
    update_mode: Option<UpdateMode>,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Clone, Deserialize)]
struct RecommenderSelector {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PodObject {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodObjectSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodObjectSpec {
    #[serde(default)]
    containers: Vec<ContainerObject>,
    owner_ref: Option<ControllerRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContainerObject {
    name: String,
    #[serde(default)]
    requests: Resources,
}

#[derive(Debug, Clone, Deserialize)]
struct PodMetricsObject {
    metadata: ObjectMeta,
    timestamp: DateTime<Utc>,
    /// Window length in seconds.
    window: i64,
    #[serde(default)]
    containers: Vec<ContainerMetricsObject>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContainerMetricsObject {
    name: String,
    #[serde(default)]
    usage: Resources,
}

#[derive(Debug, Clone, Deserialize)]
struct ExternalMetricObject {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    value: i64,
    timestamp: DateTime<Utc>,
    #[serde(rename = "windowSeconds")]
    window_seconds: Option<i64>,
}

fn vpa_spec_from_object(object: VpaObject) -> VpaSpec {
    let update_policy = object.spec.update_policy;
    VpaSpec {
        id: VpaId::new(object.metadata.namespace, object.metadata.name),
        selector: object.spec.selector,
        target_ref: object.spec.target_ref,
        resource_policy: object.spec.resource_policy,
        update_mode: update_policy
            .as_ref()
            .and_then(|p| p.update_mode)
            .unwrap_or_default(),
        update_priority: update_policy.map(|p| p.priority).unwrap_or(0),
        recommender_name: object
            .spec
            .recommenders
            .first()
            .map(|r| r.name.clone())
            .unwrap_or_default(),
        annotations: object.metadata.annotations,
        created: object.metadata.creation_timestamp.unwrap_or_else(Utc::now),
    }
}

fn pod_spec_from_object(object: PodObject) -> PodSpec {
    PodSpec {
        id: PodId::new(object.metadata.namespace, object.metadata.name),
        labels: object.metadata.labels,
        controller_ref: object.spec.owner_ref,
        containers: object
            .spec
            .containers
            .into_iter()
            .map(|c| ContainerSpec {
                name: c.name,
                requests: c.requests,
            })
            .collect(),
    }
}

impl OrchestratorClient {
    fn scoped(path: &str, namespace: &str, resource: &str) -> String {
        if namespace.is_empty() {
            format!("{}/{}", path, resource)
        } else {
            format!("{}/namespaces/{}/{}", path, namespace, resource)
        }
    }

    /// One full re-list of both object feeds.
    pub async fn list_feeds(&self, namespace: &str) -> Result<FeedSnapshot> {
        let vpas: ObjectList<VpaObject> = self
            .get_json(&Self::scoped(
                "apis/autoscaling/v1",
                namespace,
                "verticalpodautoscalers",
            ))
            .await?;
        let pods: ObjectList<PodObject> = self
            .get_json(&Self::scoped("api/v1", namespace, "pods"))
            .await?;
        Ok(FeedSnapshot {
            vpas: vpas.items.into_iter().map(vpa_spec_from_object).collect(),
            pods: pods.items.into_iter().map(pod_spec_from_object).collect(),
        })
    }
}

#[async_trait]
impl ResourceMetricsClient for OrchestratorClient {
    async fn list_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetrics>> {
        let listed: ObjectList<PodMetricsObject> = self
            .get_json(&Self::scoped("apis/metrics/v1beta1", namespace, "pods"))
            .await?;
        Ok(listed
            .items
            .into_iter()
            .map(|m| PodMetrics {
                pod_id: PodId::new(m.metadata.namespace, m.metadata.name),
                timestamp: m.timestamp,
                window: Duration::seconds(m.window.max(1)),
                containers: m
                    .containers
                    .into_iter()
                    .map(|c| ContainerMetrics {
                        name: c.name,
                        usage: c.usage,
                    })
                    .collect(),
            })
            .collect())
    }
}

#[async_trait]
impl ExternalMetricsClient for OrchestratorClient {
    async fn list(&self, namespace: &str, metric: &MetricSpec) -> Result<Vec<ExternalMetricValue>> {
        let selector = metric
            .selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let mut path = Self::scoped("apis/external.metrics/v1beta1", namespace, &metric.name);
        if !selector.is_empty() {
            path = format!("{}?labelSelector={}", path, selector);
        }
        let listed: ObjectList<ExternalMetricObject> = self.get_json(&path).await?;
        Ok(listed
            .items
            .into_iter()
            .map(|v| ExternalMetricValue {
                labels: v.labels,
                value: v.value,
                timestamp: v.timestamp,
                window_seconds: v.window_seconds,
            })
            .collect())
    }
}

#[async_trait]
impl VpaStatusWriter for OrchestratorClient {
    async fn update_vpa_status(&self, vpa_id: &VpaId, status: &VpaStatus) -> Result<()> {
        let path = format!(
            "apis/autoscaling/v1/namespaces/{}/verticalpodautoscalers/{}/status",
            vpa_id.namespace, vpa_id.name
        );
        self.put_json(&path, status).await
    }
}

fn checkpoint_path(key: &AggregateStateKey) -> String {
    format!(
        "apis/autoscaling/v1/namespaces/{}/verticalpodautoscalercheckpoints/{}-{}-{}",
        key.namespace,
        key.controller.kind.to_lowercase(),
        key.controller.name,
        key.container_name
    )
}

#[async_trait]
impl CheckpointClient for OrchestratorClient {
    async fn write(&self, checkpoint: &AggregateStateCheckpoint) -> Result<()> {
        self.put_json(&checkpoint_path(&checkpoint.key()), checkpoint)
            .await
    }

    async fn list(&self) -> Result<Vec<AggregateStateCheckpoint>> {
        let listed: ObjectList<AggregateStateCheckpoint> = self
            .get_json("apis/autoscaling/v1/verticalpodautoscalercheckpoints")
            .await?;
        Ok(listed.items)
    }

    async fn delete(&self, key: &AggregateStateKey) -> Result<()> {
        let response = self
            .request(self.http.delete(self.url(&checkpoint_path(key))?))
            .send()
            .await
            .map_err(|e| RecommenderError::UpstreamUnavailable(e.to_string()))?;
        match classify_status(response) {
            Ok(_) => Ok(()),
            Err(RecommenderError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Consecutive feed failures tolerated before the process gives up.
const MAX_CONSECUTIVE_FEED_FAILURES: u32 = 10;

/// Poll-based feed refresher. Runs until shutdown; signals a fatal feed
/// failure through the returned channel when the orchestrator stays
/// unreachable.
pub async fn run_feed_poller(
    client: Arc<OrchestratorClient>,
    feed: Arc<ClusterFeed>,
    namespace: String,
    interval: std::time::Duration,
    fatal_tx: tokio::sync::mpsc::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(interval_secs = interval.as_secs(), "Starting feed poller");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.list_feeds(&namespace).await {
                    Ok(snapshot) => {
                        debug!(
                            vpas = snapshot.vpas.len(),
                            pods = snapshot.pods.len(),
                            "Feed refresh complete"
                        );
                        feed.replace(snapshot);
                        failures = 0;
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(error = %err, failures, "Feed refresh failed");
                        if failures >= MAX_CONSECUTIVE_FEED_FAILURES {
                            error!("Feed is unrecoverable, requesting shutdown");
                            let _ = fatal_tx.send(()).await;
                            return;
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down feed poller");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpa_object_conversion() {
        let json = r#"{
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "annotations": {"a": "b"},
                "creationTimestamp": "2024-03-01T00:00:00Z"
            },
            "spec": {
                "selector": {"match_labels": {"app": "web"}},
                "targetRef": {"kind": "Deployment", "api_version": "apps/v1", "name": "web"},
                "updatePolicy": {"updateMode": "Off", "priority": 3},
                "recommenders": [{"name": "custom"}]
            }
        }"#;
        let object: VpaObject = serde_json::from_str(json).unwrap();
        let spec = vpa_spec_from_object(object);
        assert_eq!(spec.id, VpaId::new("prod", "web"));
        assert_eq!(spec.update_mode, UpdateMode::Off);
        assert_eq!(spec.update_priority, 3);
        assert_eq!(spec.recommender_name, "custom");
        assert_eq!(spec.annotations["a"], "b");
    }

    #[test]
    fn test_pod_object_conversion() {
        let json = r#"{
            "metadata": {"name": "web-0", "namespace": "prod", "labels": {"app": "web"}},
            "spec": {
                "containers": [{"name": "nginx", "requests": {"cpu": 500}}],
                "ownerRef": {"kind": "ReplicaSet", "name": "web-abc"}
            }
        }"#;
        let object: PodObject = serde_json::from_str(json).unwrap();
        let spec = pod_spec_from_object(object);
        assert_eq!(spec.id, PodId::new("prod", "web-0"));
        assert_eq!(
            spec.controller_ref,
            Some(ControllerRef::new("ReplicaSet", "web-abc"))
        );
        assert_eq!(spec.containers.len(), 1);
    }

    #[test]
    fn test_scoped_paths() {
        assert_eq!(
            OrchestratorClient::scoped("api/v1", "", "pods"),
            "api/v1/pods"
        );
        assert_eq!(
            OrchestratorClient::scoped("api/v1", "prod", "pods"),
            "api/v1/namespaces/prod/pods"
        );
    }
}
