//! VPA-side model: the autoscaler objects driving recommendations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{LabelSelector, RecommendedPodResources, ResourceName, Resources, VpaId};
use crate::error::{RecommenderError, Result};

/// Reference to the workload a VPA controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: String,
    pub api_version: String,
    pub name: String,
}

/// Whether the updater may actuate a recommendation. The recommender only
/// reads this; the replica guard is limited to the passive modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    Off,
    Initial,
    Recreate,
    Auto,
    Trigger,
}

impl Default for UpdateMode {
    fn default() -> Self {
        UpdateMode::Auto
    }
}

/// Per-container scaling switch in the resource policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingMode {
    Auto,
    Off,
}

/// Bounds and controlled resources for one container (or `*` for all).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    pub mode: Option<ScalingMode>,
    #[serde(default)]
    pub min_allowed: Resources,
    #[serde(default)]
    pub max_allowed: Resources,
    pub controlled_resources: Option<Vec<ResourceName>>,
}

/// Resource policy of a VPA object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

impl PodResourcePolicy {
    /// Resolves the effective policy for a container: the `*` entry is the
    /// default, a named entry overrides it.
    pub fn for_container(&self, name: &str) -> Option<&ContainerResourcePolicy> {
        self.container_policies
            .iter()
            .find(|p| p.container_name == name)
            .or_else(|| {
                self.container_policies
                    .iter()
                    .find(|p| p.container_name == "*")
            })
    }

    fn validate(&self) -> Result<()> {
        for policy in &self.container_policies {
            for (resource, min) in &policy.min_allowed {
                if let Some(max) = policy.max_allowed.get(resource) {
                    if max < min {
                        return Err(RecommenderError::ConfigInvalid(format!(
                            "container {:?}: max allowed {} for {} is below min {}",
                            policy.container_name, max, resource, min
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A VPA object as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpaSpec {
    pub id: VpaId,
    pub selector: LabelSelector,
    pub target_ref: Option<TargetRef>,
    pub resource_policy: Option<PodResourcePolicy>,
    #[serde(default)]
    pub update_mode: UpdateMode,
    /// Higher wins when several VPAs match the same pod.
    #[serde(default)]
    pub update_priority: i32,
    /// Empty means "the default recommender".
    #[serde(default)]
    pub recommender_name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

/// A VPA tracked in the cluster model.
#[derive(Debug, Clone)]
pub struct Vpa {
    pub id: VpaId,
    pub selector: LabelSelector,
    pub target_ref: Option<TargetRef>,
    pub resource_policy: Option<PodResourcePolicy>,
    pub update_mode: UpdateMode,
    pub update_priority: i32,
    pub recommender_name: String,
    pub annotations: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    /// Number of pods currently matched by the selector.
    pub pod_count: usize,
    /// The recommendation from the most recent loop iteration.
    pub recommendation: Option<RecommendedPodResources>,
}

impl Vpa {
    /// Validates the spec and builds the tracked object. Fails with
    /// `ConfigInvalid` on a broken selector or an inverted policy bound.
    pub fn from_spec(spec: VpaSpec) -> Result<Self> {
        spec.selector.validate()?;
        if let Some(policy) = &spec.resource_policy {
            policy.validate()?;
        }
        Ok(Self {
            id: spec.id,
            selector: spec.selector,
            target_ref: spec.target_ref,
            resource_policy: spec.resource_policy,
            update_mode: spec.update_mode,
            update_priority: spec.update_priority,
            recommender_name: spec.recommender_name,
            annotations: spec.annotations,
            created: spec.created,
            pod_count: 0,
            recommendation: None,
        })
    }

    pub fn has_recommendation(&self) -> bool {
        self.recommendation
            .as_ref()
            .map_or(false, |r| !r.is_empty())
    }

    /// The controlled-resource set for a container, defaulting to CPU and
    /// memory when the policy is silent.
    pub fn controlled_resources(&self, container_name: &str) -> Vec<ResourceName> {
        self.resource_policy
            .as_ref()
            .and_then(|p| p.for_container(container_name))
            .and_then(|p| p.controlled_resources.clone())
            .unwrap_or_else(|| vec![ResourceName::Cpu, ResourceName::Memory])
    }
}
