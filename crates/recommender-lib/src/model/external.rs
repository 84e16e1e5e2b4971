//! Raw recommendations supplied by an external time series
//!
//! In external mode the engine bypasses histograms entirely and reads
//! per-container raw resources from this state. Entries age out so a
//! silent upstream stops driving recommendations within the threshold.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use super::{Resources, Vpa, VpaId};
use crate::error::{RecommenderError, Result};

/// Container name to its raw externally supplied resources.
pub type ContainerNameToRecommendation = HashMap<String, Resources>;

#[derive(Debug, Clone)]
struct ContainerRecommendation {
    raw: Resources,
    received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct VpaRecommendations {
    containers: HashMap<String, ContainerRecommendation>,
    /// Creation time of the VPA object these entries belong to; a recreated
    /// object with the same name starts from scratch.
    created: DateTime<Utc>,
}

/// Per-VPA raw external recommendations with rate-limited expiry.
pub struct ExternalRecommendationsState {
    vpas: HashMap<VpaId, VpaRecommendations>,
    obsolescence_threshold: Duration,
    gc_interval: Duration,
    last_gc: Option<DateTime<Utc>>,
}

impl ExternalRecommendationsState {
    pub fn new(obsolescence_threshold: Duration, gc_interval: Duration) -> Self {
        Self {
            vpas: HashMap::new(),
            obsolescence_threshold,
            gc_interval,
            last_gc: None,
        }
    }

    pub fn size(&self) -> usize {
        self.vpas.len()
    }

    pub fn vpa_ids(&self) -> Vec<VpaId> {
        self.vpas.keys().cloned().collect()
    }

    /// Tracks a VPA, dropping accumulated entries when the object was
    /// recreated under the same name.
    pub fn add_or_update_vpa(&mut self, vpa: &Vpa) {
        match self.vpas.get(&vpa.id) {
            Some(existing) if existing.created == vpa.created => {}
            _ => {
                self.vpas.insert(
                    vpa.id.clone(),
                    VpaRecommendations {
                        containers: HashMap::new(),
                        created: vpa.created,
                    },
                );
            }
        }
    }

    pub fn delete_vpa(&mut self, id: &VpaId) {
        self.vpas.remove(id);
    }

    /// Stores the raw resources for one container of a tracked VPA.
    pub fn add_container_recommendation(
        &mut self,
        vpa_id: &VpaId,
        container_name: &str,
        raw: Resources,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let vpa = self
            .vpas
            .get_mut(vpa_id)
            .ok_or_else(|| RecommenderError::NotFound(format!("vpa {}", vpa_id)))?;
        vpa.containers.insert(
            container_name.to_string(),
            ContainerRecommendation {
                raw,
                received_at: now,
            },
        );
        Ok(())
    }

    /// The current raw recommendations for a VPA.
    pub fn recommendations_for(&self, vpa_id: &VpaId) -> ContainerNameToRecommendation {
        self.vpas
            .get(vpa_id)
            .map(|v| {
                v.containers
                    .iter()
                    .map(|(name, rec)| (name.clone(), rec.raw.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evicts entries older than the obsolescence threshold; runs at most
    /// every `gc_interval`.
    pub fn rate_limited_garbage_collect(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_gc {
            if now - last < self.gc_interval {
                return false;
            }
        }
        self.garbage_collect(now);
        self.last_gc = Some(now);
        true
    }

    fn garbage_collect(&mut self, now: DateTime<Utc>) {
        let threshold = self.obsolescence_threshold;
        for (id, vpa) in self.vpas.iter_mut() {
            let before = vpa.containers.len();
            vpa.containers
                .retain(|_, rec| now - rec.received_at <= threshold);
            if vpa.containers.len() < before {
                debug!(vpa = %id, evicted = before - vpa.containers.len(), "Evicted obsolete external recommendations");
            }
        }
        // Young VPAs are kept even when empty; they may not have produced
        // a recommendation yet.
        self.vpas
            .retain(|_, vpa| !vpa.containers.is_empty() || now - vpa.created < threshold);
    }
}
