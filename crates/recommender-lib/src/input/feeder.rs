//! Cluster state feeder
//!
//! Reconciles the feed snapshot into the cluster model, drains the OOM
//! stream and routes metrics-source output into histograms (internal mode)
//! or the external recommendations state.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::feed::{ClusterFeed, FeedSnapshot};
use super::metrics::{PodMetricsLister, VpaMetricsView};
use crate::model::{
    ClusterState, ContainerId, ExternalRecommendationsState, OomEvent, PodId, VpaId,
};
use crate::observability::RecommenderMetrics;

/// Feeder scoping and identity.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    /// This process's recommender name; VPAs claimed by another name are
    /// ignored. An empty `recommenderName` on the object means "default",
    /// which every recommender picks up when its own name is the default.
    pub recommender_name: String,
    /// Namespace filter; empty means all namespaces.
    pub namespace: String,
}

impl FeederConfig {
    fn selects_namespace(&self, namespace: &str) -> bool {
        self.namespace.is_empty() || self.namespace == namespace
    }

    fn selects_recommender(&self, name: &str) -> bool {
        name.is_empty() || name == self.recommender_name
    }
}

/// Default recommender name used when the flag is left unset.
pub const DEFAULT_RECOMMENDER_NAME: &str = "default";

/// Pushes observed state into the in-memory model.
pub struct ClusterStateFeeder {
    feed: Arc<ClusterFeed>,
    oom_rx: mpsc::Receiver<OomEvent>,
    config: FeederConfig,
    metrics: RecommenderMetrics,
}

impl ClusterStateFeeder {
    pub fn new(
        feed: Arc<ClusterFeed>,
        oom_rx: mpsc::Receiver<OomEvent>,
        config: FeederConfig,
    ) -> Self {
        Self {
            feed,
            oom_rx,
            config,
            metrics: RecommenderMetrics::new(),
        }
    }

    /// The feed state this iteration works from.
    pub fn snapshot(&self) -> FeedSnapshot {
        self.feed.snapshot()
    }

    /// Reconciles VPAs: adds and updates everything selected by namespace
    /// and recommender name, drops what disappeared from the feed.
    pub fn load_vpas(&self, snapshot: &FeedSnapshot, cluster: &mut ClusterState) {
        let mut seen: HashSet<VpaId> = HashSet::new();
        for spec in &snapshot.vpas {
            if !self.config.selects_namespace(&spec.id.namespace) {
                continue;
            }
            if !self.config.selects_recommender(&spec.recommender_name) {
                debug!(vpa = %spec.id, recommender = %spec.recommender_name, "VPA belongs to another recommender");
                continue;
            }
            match cluster.add_or_update_vpa(spec.clone()) {
                Ok(()) => {
                    seen.insert(spec.id.clone());
                }
                Err(err) => {
                    warn!(vpa = %spec.id, error = %err, "Rejected VPA spec");
                }
            }
        }
        for id in cluster.vpa_ids() {
            if !seen.contains(&id) {
                info!(vpa = %id, "VPA disappeared from feed, deleting");
                let _ = cluster.delete_vpa(&id);
            }
        }
        self.metrics.set_vpas_tracked(seen.len() as i64);
    }

    /// Reconciles pods and re-links them to their controlling VPAs.
    pub fn load_pods(&self, snapshot: &FeedSnapshot, cluster: &mut ClusterState) {
        let mut seen: HashSet<PodId> = HashSet::new();
        for spec in &snapshot.pods {
            if !self.config.selects_namespace(&spec.id.namespace) {
                continue;
            }
            seen.insert(spec.id.clone());
            cluster.add_or_update_pod(spec.clone());
        }
        for id in cluster.pod_ids() {
            if !seen.contains(&id) {
                cluster.delete_pod(&id);
            }
        }
    }

    /// Drains the OOM channel into synthesized memory samples.
    pub fn observe_ooms(&mut self, cluster: &mut ClusterState) -> usize {
        let mut observed = 0;
        while let Ok(event) = self.oom_rx.try_recv() {
            debug!(
                container = %event.container_id,
                requested = event.requested_memory,
                "Observed OOM"
            );
            match cluster.record_oom(&event) {
                Ok(()) => {
                    observed += 1;
                    self.metrics.inc_oom_events();
                }
                Err(err) => debug!(container = %event.container_id, error = %err, "Dropping OOM"),
            }
        }
        observed
    }

    /// Internal mode: every container usage sample lands in a histogram.
    pub async fn load_metrics_into_cluster(
        &self,
        sources: &[Box<dyn PodMetricsLister>],
        cluster: &mut ClusterState,
    ) {
        let views = metrics_views(cluster);
        for source in sources {
            let listed = match source.list(&self.config.namespace, &views).await {
                Ok(listed) => {
                    self.metrics.observe_source_response(source.name(), true);
                    listed
                }
                Err(err) => {
                    self.metrics.observe_source_response(source.name(), false);
                    warn!(source = source.name(), error = %err, "Metrics source failed, continuing with stale data");
                    continue;
                }
            };
            let mut samples = 0usize;
            for pod in listed {
                for container in &pod.containers {
                    let id = ContainerId::new(pod.pod_id.clone(), container.name.clone());
                    for (resource, value) in &container.usage {
                        match cluster.add_sample(&id, resource, *value, pod.timestamp) {
                            Ok(()) => samples += 1,
                            Err(err) => {
                                debug!(container = %id, error = %err, "Dropping sample")
                            }
                        }
                    }
                }
            }
            debug!(source = source.name(), samples, "Loaded metrics");
        }
    }

    /// External mode: container usage is a raw recommendation for the
    /// pod's controlling VPA.
    pub async fn load_metrics_into_external_state(
        &self,
        sources: &[Box<dyn PodMetricsLister>],
        cluster: &ClusterState,
        external: &mut ExternalRecommendationsState,
    ) {
        let views = metrics_views(cluster);
        for source in sources {
            let listed = match source.list(&self.config.namespace, &views).await {
                Ok(listed) => {
                    self.metrics.observe_source_response(source.name(), true);
                    listed
                }
                Err(err) => {
                    self.metrics.observe_source_response(source.name(), false);
                    warn!(source = source.name(), error = %err, "Metrics source failed, continuing with stale data");
                    continue;
                }
            };
            for pod in listed {
                let Some(vpa_id) = cluster.pod(&pod.pod_id).and_then(|p| p.vpa_id.clone())
                else {
                    debug!(pod = %pod.pod_id, "No controlling VPA for external recommendation");
                    continue;
                };
                for container in &pod.containers {
                    if let Err(err) = external.add_container_recommendation(
                        &vpa_id,
                        &container.name,
                        container.usage.clone(),
                        pod.timestamp,
                    ) {
                        debug!(vpa = %vpa_id, error = %err, "Dropping external recommendation");
                    }
                }
            }
        }
    }
}

/// The read-only VPA view handed to metrics sources.
pub fn metrics_views(cluster: &ClusterState) -> Vec<VpaMetricsView> {
    cluster
        .vpas()
        .map(|vpa| VpaMetricsView {
            id: vpa.id.clone(),
            pod_count: vpa.pod_count,
            selector: vpa.selector.clone(),
            annotations: vpa.annotations.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::metrics::{ContainerMetrics, PodMetrics};
    use crate::input::OomSender;
    use crate::model::{
        ClusterStateConfig, ContainerSpec, LabelSelector, PodSpec, ResourceName, Resources,
        VpaSpec,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn vpa_spec(name: &str, recommender: &str) -> VpaSpec {
        VpaSpec {
            id: VpaId::new("prod", name),
            selector: LabelSelector::from_labels([("app", "web")]),
            target_ref: None,
            resource_policy: None,
            update_mode: Default::default(),
            update_priority: 0,
            recommender_name: recommender.to_string(),
            annotations: BTreeMap::new(),
            created: t0(),
        }
    }

    fn pod_spec(name: &str) -> PodSpec {
        PodSpec {
            id: PodId::new("prod", name),
            labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            controller_ref: None,
            containers: vec![ContainerSpec {
                name: "nginx".into(),
                requests: Resources::new(),
            }],
        }
    }

    fn feeder(config: FeederConfig) -> (ClusterStateFeeder, Arc<ClusterFeed>, OomSender) {
        let feed = ClusterFeed::new();
        let (tx, rx) = mpsc::channel(16);
        (
            ClusterStateFeeder::new(feed.clone(), rx, config),
            feed,
            tx,
        )
    }

    fn default_config() -> FeederConfig {
        FeederConfig {
            recommender_name: DEFAULT_RECOMMENDER_NAME.to_string(),
            namespace: String::new(),
        }
    }

    #[tokio::test]
    async fn test_load_vpas_filters_foreign_recommender() {
        let (feeder, feed, _tx) = feeder(default_config());
        feed.apply_vpa_event(crate::input::FeedEvent::Added(vpa_spec("mine", "")));
        feed.apply_vpa_event(crate::input::FeedEvent::Added(vpa_spec("also-mine", "default")));
        feed.apply_vpa_event(crate::input::FeedEvent::Added(vpa_spec("other", "custom")));

        let mut cluster = ClusterState::new(ClusterStateConfig::default());
        feeder.load_vpas(&feeder.snapshot(), &mut cluster);

        assert!(cluster.vpa(&VpaId::new("prod", "mine")).is_some());
        assert!(cluster.vpa(&VpaId::new("prod", "also-mine")).is_some());
        assert!(cluster.vpa(&VpaId::new("prod", "other")).is_none());
    }

    #[tokio::test]
    async fn test_vpa_absent_from_feed_is_deleted() {
        let (feeder, feed, _tx) = feeder(default_config());
        feed.apply_vpa_event(crate::input::FeedEvent::Added(vpa_spec("web", "")));

        let mut cluster = ClusterState::new(ClusterStateConfig::default());
        feeder.load_vpas(&feeder.snapshot(), &mut cluster);
        assert!(cluster.vpa(&VpaId::new("prod", "web")).is_some());

        feed.apply_vpa_event(crate::input::FeedEvent::Deleted(VpaId::new("prod", "web")));
        feeder.load_vpas(&feeder.snapshot(), &mut cluster);
        assert!(cluster.vpa(&VpaId::new("prod", "web")).is_none());
    }

    #[tokio::test]
    async fn test_observe_ooms_drains_channel() {
        let (mut feeder, feed, tx) = feeder(default_config());
        feed.apply_vpa_event(crate::input::FeedEvent::Added(vpa_spec("web", "")));
        feed.apply_pod_event(crate::input::FeedEvent::Added(pod_spec("web-0")));

        let mut cluster = ClusterState::new(ClusterStateConfig::default());
        let snapshot = feeder.snapshot();
        feeder.load_vpas(&snapshot, &mut cluster);
        feeder.load_pods(&snapshot, &mut cluster);

        tx.send(OomEvent {
            container_id: ContainerId::new(PodId::new("prod", "web-0"), "nginx"),
            timestamp: t0(),
            requested_memory: 100 * 1024 * 1024,
        })
        .await
        .unwrap();
        tx.send(OomEvent {
            container_id: ContainerId::new(PodId::new("prod", "ghost"), "nginx"),
            timestamp: t0(),
            requested_memory: 1,
        })
        .await
        .unwrap();

        // Both events drain; only the known pod produces a sample.
        assert_eq!(feeder.observe_ooms(&mut cluster), 1);
        assert_eq!(cluster.aggregate_state_count(), 1);
    }

    struct StaticSource {
        metrics: Vec<PodMetrics>,
    }

    #[async_trait]
    impl PodMetricsLister for StaticSource {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn list(
            &self,
            _namespace: &str,
            _vpas: &[VpaMetricsView],
        ) -> crate::error::Result<Vec<PodMetrics>> {
            Ok(self.metrics.clone())
        }
    }

    #[tokio::test]
    async fn test_load_metrics_into_cluster() {
        let (feeder, feed, _tx) = feeder(default_config());
        feed.apply_vpa_event(crate::input::FeedEvent::Added(vpa_spec("web", "")));
        feed.apply_pod_event(crate::input::FeedEvent::Added(pod_spec("web-0")));

        let mut cluster = ClusterState::new(ClusterStateConfig::default());
        let snapshot = feeder.snapshot();
        feeder.load_vpas(&snapshot, &mut cluster);
        feeder.load_pods(&snapshot, &mut cluster);

        let sources: Vec<Box<dyn PodMetricsLister>> = vec![Box::new(StaticSource {
            metrics: vec![PodMetrics {
                pod_id: PodId::new("prod", "web-0"),
                timestamp: t0(),
                window: Duration::seconds(60),
                containers: vec![ContainerMetrics {
                    name: "nginx".into(),
                    usage: Resources::from([
                        (ResourceName::Cpu, 120),
                        (ResourceName::Memory, 64 * 1024 * 1024),
                    ]),
                }],
            }],
        })];
        feeder.load_metrics_into_cluster(&sources, &mut cluster).await;

        let states = cluster.aggregate_states_for(&VpaId::new("prod", "web"));
        assert_eq!(states["nginx"].total_samples_count, 2);
    }

    #[tokio::test]
    async fn test_load_metrics_into_external_state() {
        let (feeder, feed, _tx) = feeder(default_config());
        feed.apply_vpa_event(crate::input::FeedEvent::Added(vpa_spec("web", "")));
        feed.apply_pod_event(crate::input::FeedEvent::Added(pod_spec("web-0")));

        let mut cluster = ClusterState::new(ClusterStateConfig::default());
        let snapshot = feeder.snapshot();
        feeder.load_vpas(&snapshot, &mut cluster);
        feeder.load_pods(&snapshot, &mut cluster);

        let mut external =
            ExternalRecommendationsState::new(Duration::hours(1), Duration::minutes(10));
        for vpa in cluster.vpas() {
            external.add_or_update_vpa(vpa);
        }

        let sources: Vec<Box<dyn PodMetricsLister>> = vec![Box::new(StaticSource {
            metrics: vec![PodMetrics {
                pod_id: PodId::new("prod", "web-0"),
                timestamp: t0(),
                window: Duration::seconds(60),
                containers: vec![ContainerMetrics {
                    name: "nginx".into(),
                    usage: Resources::from([(ResourceName::Cpu, 1500)]),
                }],
            }],
        })];
        feeder
            .load_metrics_into_external_state(&sources, &cluster, &mut external)
            .await;

        let recs = external.recommendations_for(&VpaId::new("prod", "web"));
        assert_eq!(recs["nginx"][&ResourceName::Cpu], 1500);
    }
}
