//! Label selectors used to link pods to VPA objects
//!
//! Supports equality matches plus the set-based operators. A selector that
//! fails to parse matches nothing; the recommender never panics on a
//! user-supplied selector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{RecommenderError, Result};

/// Operator of a single selector requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One set-based requirement of a selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.map_or(false, |v| self.values.iter().any(|x| x == v)),
            SelectorOperator::NotIn => value.map_or(true, |v| !self.values.iter().any(|x| x == v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// A pod label selector: all match-labels and all requirements must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    /// A selector that matches every pod.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Builds an equality selector from key/value pairs.
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Validates the selector: set operators require or forbid values.
    pub fn validate(&self) -> Result<()> {
        for req in &self.match_expressions {
            match req.operator {
                SelectorOperator::In | SelectorOperator::NotIn if req.values.is_empty() => {
                    return Err(RecommenderError::ConfigInvalid(format!(
                        "selector requirement on {:?} needs at least one value",
                        req.key
                    )));
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !req.values.is_empty() =>
                {
                    return Err(RecommenderError::ConfigInvalid(format!(
                        "selector requirement on {:?} must not carry values",
                        req.key
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (k, v) in &self.match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
        self.match_expressions.iter().all(|r| r.matches(labels))
    }
}
