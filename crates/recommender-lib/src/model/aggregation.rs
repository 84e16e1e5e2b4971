//! Per-container rolling aggregation of usage samples
//!
//! Aggregations are keyed by (namespace, controller, container name) so a
//! respawned pod keeps accumulating into the same history.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::{ContainerId, ControllerRef, ResourceName};
use crate::error::{RecommenderError, Result};
use crate::histogram::{DecayingHistogram, HistogramOptions};

/// Stable key of an aggregation, shared by all pods of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateStateKey {
    pub namespace: String,
    pub controller: ControllerRef,
    pub container_name: String,
}

impl AggregateStateKey {
    /// Key for a container; pods without a controller fall back to the pod
    /// name so standalone pods still aggregate.
    pub fn for_container(container_id: &ContainerId, controller: Option<&ControllerRef>) -> Self {
        let controller = controller.cloned().unwrap_or_else(|| {
            ControllerRef::new("Pod", container_id.pod_id.pod_name.clone())
        });
        Self {
            namespace: container_id.pod_id.namespace.clone(),
            controller,
            container_name: container_id.container_name.clone(),
        }
    }
}

/// Container name to its aggregate state, handed to the estimation logic.
pub type ContainerNameToAggregateStateMap<'a> = HashMap<String, &'a AggregateContainerState>;

/// Sliding aggregation of one container's usage.
#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    pub cpu_histogram: DecayingHistogram,
    pub memory_peaks_histogram: DecayingHistogram,
    pub first_sample_time: Option<DateTime<Utc>>,
    pub last_sample_time: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
    pub controlled_resources: Option<Vec<ResourceName>>,
    pub last_oom: Option<DateTime<Utc>>,
}

impl AggregateContainerState {
    pub fn new(cpu_half_life: Duration, memory_half_life: Duration) -> Self {
        Self {
            cpu_histogram: DecayingHistogram::new(HistogramOptions::cpu(), cpu_half_life),
            memory_peaks_histogram: DecayingHistogram::new(
                HistogramOptions::memory(),
                memory_half_life,
            ),
            first_sample_time: None,
            last_sample_time: None,
            total_samples_count: 0,
            controlled_resources: None,
            last_oom: None,
        }
    }

    /// Routes a sample to the right histogram. CPU values are millicores,
    /// memory values bytes; the histograms store cores and bytes.
    pub fn add_sample(
        &mut self,
        resource: &ResourceName,
        value: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        match resource {
            ResourceName::Cpu => {
                self.cpu_histogram
                    .add_sample(value as f64 / 1000.0, 1.0, timestamp)?;
            }
            ResourceName::Memory => {
                self.memory_peaks_histogram
                    .add_sample(value as f64, 1.0, timestamp)?;
            }
            other => {
                return Err(RecommenderError::InvalidArgument(format!(
                    "no histogram for resource {}",
                    other
                )));
            }
        }
        self.observe_sample_time(timestamp);
        Ok(())
    }

    /// Injects a synthetic memory sample after an OOM kill so the next
    /// recommendation clears the level the container died at.
    pub fn record_oom(&mut self, inflated_bytes: i64, timestamp: DateTime<Utc>) -> Result<()> {
        self.memory_peaks_histogram
            .add_sample(inflated_bytes as f64, 1.0, timestamp)?;
        self.observe_sample_time(timestamp);
        self.last_oom = Some(timestamp);
        Ok(())
    }

    fn observe_sample_time(&mut self, timestamp: DateTime<Utc>) {
        if self.first_sample_time.is_none() {
            self.first_sample_time = Some(timestamp);
        }
        self.last_sample_time = Some(
            self.last_sample_time
                .map_or(timestamp, |last| last.max(timestamp)),
        );
        self.total_samples_count += 1;
    }

    /// Observed history length, used for confidence scaling.
    pub fn history(&self) -> Duration {
        match (self.first_sample_time, self.last_sample_time) {
            (Some(first), Some(last)) => last - first,
            _ => Duration::zero(),
        }
    }

    /// Whether no sample landed since `threshold` before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_sample_time {
            Some(last) => now - last > threshold,
            None => true,
        }
    }

    /// Folds another aggregation in, preserving decay semantics.
    pub fn merge(&mut self, other: &AggregateContainerState) -> Result<()> {
        self.cpu_histogram.merge(&other.cpu_histogram)?;
        self.memory_peaks_histogram
            .merge(&other.memory_peaks_histogram)?;
        self.first_sample_time = match (self.first_sample_time, other.first_sample_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_sample_time = match (self.last_sample_time, other.last_sample_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.total_samples_count += other.total_samples_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PodId;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn state() -> AggregateContainerState {
        AggregateContainerState::new(Duration::hours(24), Duration::hours(48))
    }

    #[test]
    fn test_key_falls_back_to_pod_name() {
        let id = ContainerId::new(PodId::new("prod", "standalone"), "main");
        let key = AggregateStateKey::for_container(&id, None);
        assert_eq!(key.controller, ControllerRef::new("Pod", "standalone"));

        let rs = ControllerRef::new("ReplicaSet", "web-abc");
        let keyed = AggregateStateKey::for_container(&id, Some(&rs));
        assert_eq!(keyed.controller, rs);
    }

    #[test]
    fn test_sample_routing_and_counters() {
        let mut s = state();
        s.add_sample(&ResourceName::Cpu, 250, t0()).unwrap();
        s.add_sample(&ResourceName::Memory, 100 * 1024 * 1024, t0() + Duration::minutes(1))
            .unwrap();
        assert_eq!(s.total_samples_count, 2);
        assert_eq!(s.first_sample_time, Some(t0()));
        assert_eq!(s.last_sample_time, Some(t0() + Duration::minutes(1)));
        assert!(!s.cpu_histogram.is_empty());
        assert!(!s.memory_peaks_histogram.is_empty());
    }

    #[test]
    fn test_unknown_resource_rejected() {
        let mut s = state();
        let err = s.add_sample(&ResourceName::Other("gpu".into()), 1, t0());
        assert!(matches!(err, Err(RecommenderError::InvalidArgument(_))));
    }

    #[test]
    fn test_oom_inflates_memory_histogram() {
        let mut s = state();
        s.add_sample(&ResourceName::Memory, 100 * 1024 * 1024, t0()).unwrap();
        let before = s.memory_peaks_histogram.percentile(1.0);
        s.record_oom(500 * 1024 * 1024, t0() + Duration::minutes(5)).unwrap();
        assert!(s.memory_peaks_histogram.percentile(1.0) > before);
        assert_eq!(s.last_oom, Some(t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_expiry() {
        let mut s = state();
        assert!(s.is_expired(t0(), Duration::hours(8)));
        s.add_sample(&ResourceName::Cpu, 100, t0()).unwrap();
        assert!(!s.is_expired(t0() + Duration::hours(4), Duration::hours(8)));
        assert!(s.is_expired(t0() + Duration::hours(9), Duration::hours(8)));
    }
}
