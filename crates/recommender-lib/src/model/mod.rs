//! Core data model for the recommender
//!
//! Identifiers, resource amounts and the recommendation payloads shared by
//! the cluster model, the estimation logic and the post-processing chain.

mod aggregation;
mod cluster;
mod external;
mod pod;
mod selector;
mod vpa;

pub use aggregation::{AggregateContainerState, AggregateStateKey, ContainerNameToAggregateStateMap};
pub use cluster::{ClusterState, ClusterStateConfig, OomEvent};
pub use external::{ContainerNameToRecommendation, ExternalRecommendationsState};
pub use pod::{ContainerSpec, ControllerRef, PodSpec, PodState, PodTemplateView};
pub use selector::{LabelSelector, SelectorOperator, SelectorRequirement};
pub use vpa::{
    ContainerResourcePolicy, PodResourcePolicy, ScalingMode, TargetRef, UpdateMode, Vpa, VpaSpec,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Uniquely identifies a VPA object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VpaId {
    pub namespace: String,
    pub name: String,
}

impl VpaId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VpaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Uniquely identifies a pod.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub pod_name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

/// Uniquely identifies a container within a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId {
    pub pod_id: PodId,
    pub container_name: String,
}

impl ContainerId {
    pub fn new(pod_id: PodId, container_name: impl Into<String>) -> Self {
        Self {
            pod_id,
            container_name: container_name.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.container_name)
    }
}

/// A resource tracked or recommended for a container.
///
/// CPU and memory are first-class; anything else (ephemeral storage,
/// extended resources) is carried verbatim so filters and capping can pass
/// it through.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceName {
    Cpu,
    Memory,
    Other(String),
}

impl From<String> for ResourceName {
    fn from(s: String) -> Self {
        match s.as_str() {
            "cpu" => ResourceName::Cpu,
            "memory" => ResourceName::Memory,
            _ => ResourceName::Other(s),
        }
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        ResourceName::from(s.to_string())
    }
}

impl From<ResourceName> for String {
    fn from(r: ResourceName) -> Self {
        r.to_string()
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceName::Cpu => write!(f, "cpu"),
            ResourceName::Memory => write!(f, "memory"),
            ResourceName::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Amount of a single resource: millicores for CPU, bytes for memory.
pub type ResourceAmount = i64;

/// Resource name to amount, ordered for deterministic iteration.
pub type Resources = BTreeMap<ResourceName, ResourceAmount>;

/// Converts cores to the canonical millicore amount.
pub fn cpu_amount_from_cores(cores: f64) -> ResourceAmount {
    (cores * 1000.0).round() as ResourceAmount
}

/// Converts bytes to the canonical memory amount.
pub fn memory_amount_from_bytes(bytes: f64) -> ResourceAmount {
    bytes.round() as ResourceAmount
}

/// Scales an amount by a factor, rounding to the nearest unit.
pub fn scale_resource(amount: ResourceAmount, factor: f64) -> ResourceAmount {
    (amount as f64 * factor).round() as ResourceAmount
}

/// An amount in milli-units regardless of resource: CPU amounts are already
/// milli, memory bytes are scaled up. Ratio arithmetic happens in this space
/// so cross-resource ratios stay integral.
pub fn to_milli_units(resource: &ResourceName, amount: ResourceAmount) -> i64 {
    match resource {
        ResourceName::Cpu => amount,
        _ => amount.saturating_mul(1000),
    }
}

/// Inverse of [`to_milli_units`].
pub fn from_milli_units(resource: &ResourceName, milli: i64) -> ResourceAmount {
    match resource {
        ResourceName::Cpu => milli,
        _ => milli / 1000,
    }
}

/// Recommended amounts for a single container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedContainerResources {
    pub container_name: String,
    pub target: Resources,
    pub lower_bound: Resources,
    pub upper_bound: Resources,
    pub uncapped_target: Resources,
}

impl RecommendedContainerResources {
    pub fn new(container_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            ..Default::default()
        }
    }
}

/// Recommended amounts for every container matched by a VPA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedPodResources {
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

impl RecommendedPodResources {
    pub fn is_empty(&self) -> bool {
        self.container_recommendations.is_empty()
    }

    /// Looks up the recommendation for a named container.
    pub fn container(&self, name: &str) -> Option<&RecommendedContainerResources> {
        self.container_recommendations
            .iter()
            .find(|c| c.container_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name_round_trip() {
        assert_eq!(ResourceName::from("cpu"), ResourceName::Cpu);
        assert_eq!(ResourceName::from("memory"), ResourceName::Memory);
        assert_eq!(
            ResourceName::from("ephemeral-storage"),
            ResourceName::Other("ephemeral-storage".to_string())
        );
        assert_eq!(ResourceName::Cpu.to_string(), "cpu");
        assert_eq!(
            ResourceName::Other("hugepages-2Mi".into()).to_string(),
            "hugepages-2Mi"
        );
    }

    #[test]
    fn test_milli_unit_conversion() {
        // CPU amounts are already milli.
        assert_eq!(to_milli_units(&ResourceName::Cpu, 1500), 1500);
        assert_eq!(from_milli_units(&ResourceName::Cpu, 1500), 1500);
        // Memory bytes scale by 1000.
        assert_eq!(to_milli_units(&ResourceName::Memory, 3000), 3_000_000);
        assert_eq!(from_milli_units(&ResourceName::Memory, 3_000_000), 3000);
    }

    #[test]
    fn test_cpu_amount_from_cores() {
        assert_eq!(cpu_amount_from_cores(1.0), 1000);
        assert_eq!(cpu_amount_from_cores(0.1), 100);
        assert_eq!(scale_resource(1000, 1.2), 1200);
    }

    #[test]
    fn test_ids_display() {
        let id = ContainerId::new(PodId::new("prod", "web-0"), "nginx");
        assert_eq!(id.to_string(), "prod/web-0/nginx");
        assert_eq!(VpaId::new("prod", "web").to_string(), "prod/web");
    }
}
