//! Aggregate state checkpoints (internal mode only)
//!
//! Histograms are periodically serialized into sidecar objects, one per
//! (workload, container), and restored on startup so a restarted
//! recommender does not begin from an empty history. Checkpoints older
//! than the retention are discarded on both ends.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::histogram::HistogramCheckpoint;
use crate::model::{AggregateStateKey, ClusterState, ControllerRef};
use crate::observability::RecommenderMetrics;

/// Serialized form of one aggregate container state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStateCheckpoint {
    pub namespace: String,
    pub controller_kind: String,
    pub controller_name: String,
    pub container_name: String,
    pub last_update_time: DateTime<Utc>,
    pub first_sample_time: Option<DateTime<Utc>>,
    pub last_sample_time: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
    pub cpu_histogram: HistogramCheckpoint,
    pub memory_histogram: HistogramCheckpoint,
}

impl AggregateStateCheckpoint {
    pub fn key(&self) -> AggregateStateKey {
        AggregateStateKey {
            namespace: self.namespace.clone(),
            controller: ControllerRef::new(
                self.controller_kind.clone(),
                self.controller_name.clone(),
            ),
            container_name: self.container_name.clone(),
        }
    }
}

/// Storage for checkpoint blobs; the orchestrator-object client lives
/// outside the core.
#[async_trait]
pub trait CheckpointClient: Send + Sync {
    async fn write(&self, checkpoint: &AggregateStateCheckpoint) -> Result<()>;
    async fn list(&self) -> Result<Vec<AggregateStateCheckpoint>>;
    async fn delete(&self, key: &AggregateStateKey) -> Result<()>;
}

/// Writes and restores checkpoints on the loop's cadence.
pub struct CheckpointManager {
    client: Box<dyn CheckpointClient>,
    retention: Duration,
    metrics: RecommenderMetrics,
}

impl CheckpointManager {
    pub fn new(client: Box<dyn CheckpointClient>, retention: Duration) -> Self {
        Self {
            client,
            retention,
            metrics: RecommenderMetrics::new(),
        }
    }

    /// Serializes every aggregation currently in the model. Write errors
    /// are logged per checkpoint and do not abort the pass.
    pub async fn write_checkpoints(&self, cluster: &ClusterState, now: DateTime<Utc>) -> usize {
        let mut written = 0;
        for (key, state) in cluster.aggregate_states() {
            let checkpoint = AggregateStateCheckpoint {
                namespace: key.namespace.clone(),
                controller_kind: key.controller.kind.clone(),
                controller_name: key.controller.name.clone(),
                container_name: key.container_name.clone(),
                last_update_time: now,
                first_sample_time: state.first_sample_time,
                last_sample_time: state.last_sample_time,
                total_samples_count: state.total_samples_count,
                cpu_histogram: state.cpu_histogram.checkpoint(),
                memory_histogram: state.memory_peaks_histogram.checkpoint(),
            };
            match self.client.write(&checkpoint).await {
                Ok(()) => {
                    written += 1;
                    self.metrics.inc_checkpoints_written();
                }
                Err(err) => {
                    warn!(container = %key.container_name, namespace = %key.namespace, error = %err, "Checkpoint write failed");
                }
            }
        }
        debug!(written, "Checkpoint pass complete");
        written
    }

    /// Restores histograms into the model before the first iteration.
    /// Stale checkpoints are deleted instead of loaded.
    pub async fn load_checkpoints(
        &self,
        cluster: &mut ClusterState,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let checkpoints = self.client.list().await?;
        let mut loaded = 0;
        for checkpoint in checkpoints {
            let key = checkpoint.key();
            if now - checkpoint.last_update_time > self.retention {
                info!(container = %key.container_name, namespace = %key.namespace, "Discarding expired checkpoint");
                if let Err(err) = self.client.delete(&key).await {
                    warn!(error = %err, "Failed to delete expired checkpoint");
                }
                continue;
            }
            let state = cluster.aggregate_state_mut(key.clone());
            let cpu = state.cpu_histogram.load_checkpoint(&checkpoint.cpu_histogram);
            let memory = state
                .memory_peaks_histogram
                .load_checkpoint(&checkpoint.memory_histogram);
            match (cpu, memory) {
                (Ok(()), Ok(())) => {
                    state.first_sample_time = checkpoint.first_sample_time;
                    state.last_sample_time = checkpoint.last_sample_time;
                    state.total_samples_count = checkpoint.total_samples_count;
                    loaded += 1;
                }
                (cpu, memory) => {
                    warn!(
                        container = %key.container_name,
                        namespace = %key.namespace,
                        cpu_error = ?cpu.err(),
                        memory_error = ?memory.err(),
                        "Corrupt checkpoint ignored"
                    );
                }
            }
        }
        info!(loaded, "Restored aggregate states from checkpoints");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ClusterStateConfig, ContainerId, ContainerSpec, LabelSelector, PodId, PodSpec,
        ResourceName, Resources, VpaId, VpaSpec,
    };
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct MemoryClient {
        store: Mutex<Vec<AggregateStateCheckpoint>>,
    }

    #[async_trait]
    impl CheckpointClient for MemoryClient {
        async fn write(&self, checkpoint: &AggregateStateCheckpoint) -> Result<()> {
            let mut store = self.store.lock().unwrap();
            store.retain(|c| c.key() != checkpoint.key());
            store.push(checkpoint.clone());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<AggregateStateCheckpoint>> {
            Ok(self.store.lock().unwrap().clone())
        }

        async fn delete(&self, key: &AggregateStateKey) -> Result<()> {
            self.store.lock().unwrap().retain(|c| &c.key() != key);
            Ok(())
        }
    }

    fn populated_cluster() -> ClusterState {
        let mut cluster = ClusterState::new(ClusterStateConfig::default());
        cluster
            .add_or_update_vpa(VpaSpec {
                id: VpaId::new("prod", "web"),
                selector: LabelSelector::from_labels([("app", "web")]),
                target_ref: None,
                resource_policy: None,
                update_mode: Default::default(),
                update_priority: 0,
                recommender_name: String::new(),
                annotations: BTreeMap::new(),
                created: t0(),
            })
            .unwrap();
        cluster.add_or_update_pod(PodSpec {
            id: PodId::new("prod", "web-0"),
            labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            controller_ref: None,
            containers: vec![ContainerSpec {
                name: "nginx".into(),
                requests: Resources::new(),
            }],
        });
        let id = ContainerId::new(PodId::new("prod", "web-0"), "nginx");
        for i in 0..50 {
            cluster
                .add_sample(&id, &ResourceName::Cpu, 100 + i, t0() + Duration::minutes(i))
                .unwrap();
        }
        cluster
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip_preserves_percentiles() {
        let cluster = populated_cluster();
        let manager = CheckpointManager::new(Box::<MemoryClient>::default(), Duration::days(7));
        assert_eq!(manager.write_checkpoints(&cluster, t0()).await, 1);

        let mut restored = ClusterState::new(ClusterStateConfig::default());
        let loaded = manager
            .load_checkpoints(&mut restored, t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(loaded, 1);

        let original = cluster
            .aggregate_states()
            .next()
            .map(|(_, s)| s)
            .unwrap();
        let roundtripped = restored
            .aggregate_states()
            .next()
            .map(|(_, s)| s)
            .unwrap();
        assert_eq!(
            roundtripped.total_samples_count,
            original.total_samples_count
        );
        for p in [0.5, 0.9, 0.95] {
            let orig = original.cpu_histogram.percentile(p);
            let round = roundtripped.cpu_histogram.percentile(p);
            assert!(
                (orig - round).abs() <= orig * 0.01,
                "p={}: {} vs {}",
                p,
                orig,
                round
            );
        }
    }

    #[tokio::test]
    async fn test_expired_checkpoints_are_discarded() {
        let cluster = populated_cluster();
        let manager = CheckpointManager::new(Box::<MemoryClient>::default(), Duration::days(7));
        manager.write_checkpoints(&cluster, t0()).await;

        let mut restored = ClusterState::new(ClusterStateConfig::default());
        let loaded = manager
            .load_checkpoints(&mut restored, t0() + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(loaded, 0);
        assert_eq!(restored.aggregate_state_count(), 0);
        // The expired checkpoint was deleted from the store as well.
        assert!(manager.client.list().await.unwrap().is_empty());
    }
}
