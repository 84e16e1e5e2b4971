//! VPA status writing
//!
//! The recommender's only write path: the computed recommendation plus
//! conditions go back onto the VPA object. Writes are skipped when the
//! status matches what was last written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{RecommendedPodResources, Vpa, VpaId};

/// Condition types surfaced on the VPA object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpaConditionType {
    RecommendationProvided,
    NoPodsMatched,
    LowConfidence,
    ConfigDeprecated,
}

/// One status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpaCondition {
    pub condition_type: VpaConditionType,
    pub status: bool,
    pub last_transition: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// The status payload written back to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VpaStatus {
    pub recommendation: Option<RecommendedPodResources>,
    pub conditions: Vec<VpaCondition>,
}

impl Eq for VpaStatus {}

impl VpaStatus {
    /// Builds the status for a VPA from the freshly computed
    /// recommendation and what the iteration observed about it.
    pub fn build(
        vpa: &Vpa,
        recommendation: &RecommendedPodResources,
        low_confidence: bool,
        config_deprecated: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut conditions = vec![VpaCondition {
            condition_type: VpaConditionType::RecommendationProvided,
            status: !recommendation.is_empty(),
            last_transition: now,
            message: String::new(),
        }];
        if vpa.pod_count == 0 {
            conditions.push(VpaCondition {
                condition_type: VpaConditionType::NoPodsMatched,
                status: true,
                last_transition: now,
                message: "Pod selector matches no pods".to_string(),
            });
        }
        if low_confidence {
            conditions.push(VpaCondition {
                condition_type: VpaConditionType::LowConfidence,
                status: true,
                last_transition: now,
                message: "Not enough history to trust the bounds".to_string(),
            });
        }
        if config_deprecated {
            conditions.push(VpaCondition {
                condition_type: VpaConditionType::ConfigDeprecated,
                status: true,
                last_transition: now,
                message: "Some annotations could not be parsed".to_string(),
            });
        }
        Self {
            recommendation: if recommendation.is_empty() {
                None
            } else {
                Some(recommendation.clone())
            },
            conditions,
        }
    }

    /// Whether a write is needed given what was last written. Transition
    /// timestamps are ignored so an otherwise identical status does not
    /// churn the object.
    pub fn differs_from(&self, previous: Option<&VpaStatus>) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        if self.recommendation != previous.recommendation {
            return true;
        }
        let strip = |status: &VpaStatus| {
            status
                .conditions
                .iter()
                .map(|c| (c.condition_type, c.status, c.message.clone()))
                .collect::<Vec<_>>()
        };
        strip(self) != strip(previous)
    }
}

/// Write interface to the orchestrator.
#[async_trait]
pub trait VpaStatusWriter: Send + Sync {
    async fn update_vpa_status(&self, vpa_id: &VpaId, status: &VpaStatus) -> Result<()>;
}
