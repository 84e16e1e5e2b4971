//! Pod-side model: observed pods, their containers and resource requests

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{PodId, Resources, VpaId};

/// Reference to the controller owning a pod (ReplicaSet, StatefulSet, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControllerRef {
    pub kind: String,
    pub name: String,
}

impl ControllerRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// A container as observed on the pod feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    /// Current resource requests from the pod spec.
    #[serde(default)]
    pub requests: Resources,
}

/// A pod as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: PodId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub controller_ref: Option<ControllerRef>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// A pod tracked in the cluster model, linked to at most one VPA.
#[derive(Debug, Clone)]
pub struct PodState {
    pub id: PodId,
    pub labels: BTreeMap<String, String>,
    pub controller_ref: Option<ControllerRef>,
    pub containers: Vec<ContainerSpec>,
    /// The controlling VPA, recomputed on every pod or VPA update.
    pub vpa_id: Option<VpaId>,
}

impl PodState {
    pub fn from_spec(spec: PodSpec) -> Self {
        Self {
            id: spec.id,
            labels: spec.labels,
            controller_ref: spec.controller_ref,
            containers: spec.containers,
            vpa_id: None,
        }
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }
}

/// Container name to current requests, as seen on the workload's pods.
///
/// Stands in for the controller's pod template: the post-processors that
/// need template requests (ratios, replica guard) read the same values off
/// the most recently observed matching pod.
pub type PodTemplateView = BTreeMap<String, Resources>;
