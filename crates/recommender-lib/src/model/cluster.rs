//! In-memory cluster model
//!
//! Holds VPAs, pods and per-container aggregations, and maintains the
//! computed join between pods and VPAs via label selectors. The model is
//! owned by the recommender loop; feeds publish into it via snapshots.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, trace};

use super::{
    AggregateContainerState, AggregateStateKey, ContainerId, ContainerNameToAggregateStateMap,
    PodId, PodSpec, PodState, PodTemplateView, ResourceName, Vpa, VpaId, VpaSpec,
};
use crate::error::{RecommenderError, Result};

/// Tuning knobs for the cluster model.
#[derive(Debug, Clone)]
pub struct ClusterStateConfig {
    /// CPU histogram half-life.
    pub cpu_half_life: Duration,
    /// Memory histogram half-life; longer, memory spikes matter for days.
    pub memory_half_life: Duration,
    /// Multiplier applied to the requested memory of an OOM-killed container.
    pub oom_overshoot_factor: f64,
    /// Minimum absolute memory bump for an OOM sample.
    pub oom_bump_min_bytes: i64,
    /// How often garbage collection may run.
    pub gc_interval: Duration,
    /// Aggregations without samples for this long are evicted.
    pub obsolescence_threshold: Duration,
}

impl Default for ClusterStateConfig {
    fn default() -> Self {
        Self {
            cpu_half_life: Duration::hours(24),
            memory_half_life: Duration::hours(48),
            oom_overshoot_factor: 1.2,
            oom_bump_min_bytes: 100 * 1024 * 1024,
            gc_interval: Duration::hours(1),
            obsolescence_threshold: Duration::hours(24 * 8),
        }
    }
}

/// An OOM kill observed on the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OomEvent {
    pub container_id: ContainerId,
    pub timestamp: DateTime<Utc>,
    pub requested_memory: i64,
}

/// The in-memory truth about what exists and what each VPA targets.
pub struct ClusterState {
    config: ClusterStateConfig,
    vpas: HashMap<VpaId, Vpa>,
    pods: HashMap<PodId, PodState>,
    aggregate_states: HashMap<AggregateStateKey, AggregateContainerState>,
    last_gc: Option<DateTime<Utc>>,
}

impl ClusterState {
    pub fn new(config: ClusterStateConfig) -> Self {
        Self {
            config,
            vpas: HashMap::new(),
            pods: HashMap::new(),
            aggregate_states: HashMap::new(),
            last_gc: None,
        }
    }

    pub fn vpas(&self) -> impl Iterator<Item = &Vpa> {
        self.vpas.values()
    }

    pub fn vpa_ids(&self) -> Vec<VpaId> {
        self.vpas.keys().cloned().collect()
    }

    pub fn vpa(&self, id: &VpaId) -> Option<&Vpa> {
        self.vpas.get(id)
    }

    pub fn vpa_mut(&mut self, id: &VpaId) -> Option<&mut Vpa> {
        self.vpas.get_mut(id)
    }

    pub fn pod(&self, id: &PodId) -> Option<&PodState> {
        self.pods.get(id)
    }

    pub fn pod_ids(&self) -> Vec<PodId> {
        self.pods.keys().cloned().collect()
    }

    pub fn aggregate_state_count(&self) -> usize {
        self.aggregate_states.len()
    }

    /// Adds or replaces a VPA and re-links matching pods. Idempotent.
    pub fn add_or_update_vpa(&mut self, spec: VpaSpec) -> Result<()> {
        let mut vpa = Vpa::from_spec(spec)?;
        if let Some(existing) = self.vpas.get(&vpa.id) {
            // Keep the last computed recommendation so status diffing works
            // across feed refreshes.
            vpa.recommendation = existing.recommendation.clone();
        }
        let namespace = vpa.id.namespace.clone();
        self.vpas.insert(vpa.id.clone(), vpa);
        self.relink_namespace(&namespace);
        Ok(())
    }

    /// Removes a VPA together with the aggregations it owns.
    pub fn delete_vpa(&mut self, id: &VpaId) -> Result<()> {
        let vpa = self
            .vpas
            .remove(id)
            .ok_or_else(|| RecommenderError::NotFound(format!("vpa {}", id)))?;
        let owned: Vec<AggregateStateKey> = self
            .pods
            .values()
            .filter(|p| p.vpa_id.as_ref() == Some(id))
            .flat_map(|p| {
                p.containers.iter().map(|c| {
                    AggregateStateKey::for_container(
                        &ContainerId::new(p.id.clone(), c.name.clone()),
                        p.controller_ref.as_ref(),
                    )
                })
            })
            .collect();
        for key in owned {
            self.aggregate_states.remove(&key);
        }
        self.relink_namespace(&vpa.id.namespace);
        Ok(())
    }

    /// Adds or replaces a pod and re-links it to its controlling VPA.
    pub fn add_or_update_pod(&mut self, spec: PodSpec) {
        let namespace = spec.id.namespace.clone();
        self.pods.insert(spec.id.clone(), PodState::from_spec(spec));
        self.relink_namespace(&namespace);
    }

    /// Drops a pod; its aggregations stay behind until GC so a respawn
    /// keeps its history.
    pub fn delete_pod(&mut self, id: &PodId) {
        if let Some(pod) = self.pods.remove(id) {
            self.relink_namespace(&pod.id.namespace);
        }
    }

    /// Recomputes the pod -> VPA join for one namespace and refreshes the
    /// matched-pod counters.
    fn relink_namespace(&mut self, namespace: &str) {
        let mut counts: HashMap<VpaId, usize> = HashMap::new();
        for pod in self.pods.values_mut() {
            if pod.id.namespace != namespace {
                continue;
            }
            pod.vpa_id = Self::controlling_vpa(&self.vpas, pod);
            if let Some(vpa_id) = &pod.vpa_id {
                *counts.entry(vpa_id.clone()).or_default() += 1;
            }
        }
        for (id, vpa) in self.vpas.iter_mut() {
            if id.namespace == namespace {
                vpa.pod_count = counts.get(id).copied().unwrap_or(0);
            }
        }
    }

    /// Picks the single controlling VPA for a pod: selector match, then
    /// highest update priority, ties broken by lexicographic id.
    fn controlling_vpa(vpas: &HashMap<VpaId, Vpa>, pod: &PodState) -> Option<VpaId> {
        vpas.values()
            .filter(|v| v.id.namespace == pod.id.namespace && v.selector.matches(&pod.labels))
            .max_by(|a, b| {
                a.update_priority
                    .cmp(&b.update_priority)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|v| v.id.clone())
    }

    /// Feeds a usage sample into the aggregation of a controlled container.
    /// Samples for unknown pods fail with `NotFound`; samples for pods
    /// without a controlling VPA are dropped.
    pub fn add_sample(
        &mut self,
        container_id: &ContainerId,
        resource: &ResourceName,
        value: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let Some((key, controlled)) = self.aggregation_target(container_id) else {
            return Err(RecommenderError::NotFound(format!(
                "pod {}",
                container_id.pod_id
            )));
        };
        let Some(controlled) = controlled else {
            trace!(container = %container_id, "Dropping sample for uncontrolled container");
            return Ok(());
        };
        let (cpu_half_life, memory_half_life) =
            (self.config.cpu_half_life, self.config.memory_half_life);
        let state = self.aggregate_states.entry(key).or_insert_with(|| {
            let mut s = AggregateContainerState::new(cpu_half_life, memory_half_life);
            s.controlled_resources = Some(controlled);
            s
        });
        state.add_sample(resource, value, timestamp)
    }

    /// Injects a synthesized memory sample after an OOM kill:
    /// `max(requested * overshoot, requested + bump_minimum)`.
    pub fn record_oom(&mut self, event: &OomEvent) -> Result<()> {
        let Some((key, controlled)) = self.aggregation_target(&event.container_id) else {
            return Err(RecommenderError::NotFound(format!(
                "pod {}",
                event.container_id.pod_id
            )));
        };
        let Some(controlled) = controlled else {
            trace!(container = %event.container_id, "Dropping OOM for uncontrolled container");
            return Ok(());
        };
        let inflated = ((event.requested_memory as f64 * self.config.oom_overshoot_factor) as i64)
            .max(event.requested_memory.saturating_add(self.config.oom_bump_min_bytes));
        let (cpu_half_life, memory_half_life) =
            (self.config.cpu_half_life, self.config.memory_half_life);
        let state = self.aggregate_states.entry(key).or_insert_with(|| {
            let mut s = AggregateContainerState::new(cpu_half_life, memory_half_life);
            s.controlled_resources = Some(controlled);
            s
        });
        debug!(container = %event.container_id, inflated_bytes = inflated, "Recording OOM sample");
        state.record_oom(inflated, event.timestamp)
    }

    /// Resolves the aggregation key and controlled-resource set for a
    /// container. `None` when the pod is unknown; inner `None` when no VPA
    /// controls the pod.
    fn aggregation_target(
        &self,
        container_id: &ContainerId,
    ) -> Option<(AggregateStateKey, Option<Vec<ResourceName>>)> {
        let pod = self.pods.get(&container_id.pod_id)?;
        let key = AggregateStateKey::for_container(container_id, pod.controller_ref.as_ref());
        let controlled = pod
            .vpa_id
            .as_ref()
            .and_then(|id| self.vpas.get(id))
            .map(|vpa| vpa.controlled_resources(&container_id.container_name));
        Some((key, controlled))
    }

    /// The aggregations backing one VPA, keyed by container name.
    pub fn aggregate_states_for(&self, vpa_id: &VpaId) -> ContainerNameToAggregateStateMap<'_> {
        let mut map = ContainerNameToAggregateStateMap::new();
        for pod in self.pods.values() {
            if pod.vpa_id.as_ref() != Some(vpa_id) {
                continue;
            }
            for container in &pod.containers {
                let key = AggregateStateKey::for_container(
                    &ContainerId::new(pod.id.clone(), container.name.clone()),
                    pod.controller_ref.as_ref(),
                );
                if let Some(state) = self.aggregate_states.get(&key) {
                    map.entry(container.name.clone()).or_insert(state);
                }
            }
        }
        map
    }

    /// Current per-container requests of the workload behind a VPA, taken
    /// from the lexicographically last matched pod for determinism.
    pub fn pod_template_view(&self, vpa_id: &VpaId) -> PodTemplateView {
        let mut pods: Vec<&PodState> = self
            .pods
            .values()
            .filter(|p| p.vpa_id.as_ref() == Some(vpa_id))
            .collect();
        pods.sort_by(|a, b| a.id.cmp(&b.id));
        let mut view = PodTemplateView::new();
        for pod in pods {
            for container in &pod.containers {
                view.insert(container.name.clone(), container.requests.clone());
            }
        }
        view
    }

    /// Direct access to an aggregation, used by the checkpoint loader.
    pub fn aggregate_state_mut(
        &mut self,
        key: AggregateStateKey,
    ) -> &mut AggregateContainerState {
        let (cpu_half_life, memory_half_life) =
            (self.config.cpu_half_life, self.config.memory_half_life);
        self.aggregate_states
            .entry(key)
            .or_insert_with(|| AggregateContainerState::new(cpu_half_life, memory_half_life))
    }

    pub fn aggregate_states(
        &self,
    ) -> impl Iterator<Item = (&AggregateStateKey, &AggregateContainerState)> {
        self.aggregate_states.iter()
    }

    /// Evicts aggregations without recent samples and VPAs that are old
    /// and no longer back any aggregation. Runs at most every
    /// `gc_interval`; returns whether a collection happened.
    pub fn rate_limited_garbage_collect(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_gc {
            if now - last < self.config.gc_interval {
                return false;
            }
        }
        self.garbage_collect(now);
        self.last_gc = Some(now);
        true
    }

    fn garbage_collect(&mut self, now: DateTime<Utc>) {
        let threshold = self.config.obsolescence_threshold;
        let before = self.aggregate_states.len();
        self.aggregate_states
            .retain(|_, state| !state.is_expired(now, threshold));
        let evicted = before - self.aggregate_states.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired aggregations");
        }

        let backed: Vec<VpaId> = self
            .vpas
            .keys()
            .filter(|id| !self.aggregate_states_for(id).is_empty())
            .cloned()
            .collect();
        let stale: Vec<VpaId> = self
            .vpas
            .values()
            .filter(|v| now - v.created > threshold && !backed.contains(&v.id))
            .map(|v| v.id.clone())
            .collect();
        for id in stale {
            debug!(vpa = %id, "Evicting idle VPA");
            let _ = self.delete_vpa(&id);
        }
    }
}
