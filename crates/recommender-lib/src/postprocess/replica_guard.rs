//! Replica-restrictions post-processor
//!
//! Reverts vertical scaling that would fight horizontal scaling:
//! `vpa-post-processor.<domain>/replicaRestrictedRange = "[low,high]"`
//! blocks upscales while the workload runs `high` or fewer replicas and
//! blocks downscales while it runs `low` or more. Only targets change;
//! bounds pass through. Active only in the passive update modes.

use tracing::{debug, error};

use super::{PostProcessContext, RecommendationPostProcessor};
use crate::annotations::{POST_PROCESSOR_PREFIX, REPLICA_RESTRICTED_RANGE_KEY};
use crate::model::{
    to_milli_units, RecommendedPodResources, Resources, UpdateMode, Vpa,
};

/// The parsed `[low, high]` band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReplicaBand {
    low: i64,
    high: i64,
}

fn read_band(vpa: &Vpa) -> Option<ReplicaBand> {
    let key = format!("{}{}", POST_PROCESSOR_PREFIX, REPLICA_RESTRICTED_RANGE_KEY);
    let value = vpa.annotations.get(&key)?;
    let parsed: Vec<i64> = match serde_json::from_str(value) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(vpa = %vpa.id, value = %value, error = %err, "Malformed replica range annotation");
            return None;
        }
    };
    let [low, high] = parsed.as_slice() else {
        error!(vpa = %vpa.id, value = %value, "Replica range must be [low, high]");
        return None;
    };
    if low >= high {
        error!(vpa = %vpa.id, low, high, "Replica range is inverted");
        return None;
    }
    Some(ReplicaBand {
        low: *low,
        high: *high,
    })
}

/// Reverts per-resource target changes that the replica count forbids.
fn restrict_target(target: &mut Resources, requests: &Resources, band: ReplicaBand, replicas: i64) {
    for (resource, amount) in target.iter_mut() {
        let Some(request) = requests.get(resource) else {
            continue;
        };
        let recommended = to_milli_units(resource, *amount);
        let current = to_milli_units(resource, *request);
        let upscale_blocked = recommended > current && replicas <= band.high;
        let downscale_blocked = recommended < current && replicas >= band.low;
        if upscale_blocked || downscale_blocked {
            *amount = *request;
        }
    }
}

/// Guards vertical scaling with the replica-count band.
pub struct ReplicaRestrictionsPostProcessor;

impl RecommendationPostProcessor for ReplicaRestrictionsPostProcessor {
    fn name(&self) -> &'static str {
        "replica-restrictions"
    }

    fn process(
        &self,
        ctx: &PostProcessContext<'_>,
        mut recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources {
        let Some(band) = read_band(ctx.vpa) else {
            return recommendation;
        };
        if !matches!(ctx.vpa.update_mode, UpdateMode::Off | UpdateMode::Trigger) {
            debug!(
                vpa = %ctx.vpa.id,
                mode = ?ctx.vpa.update_mode,
                "Replica restrictions only apply in passive update modes"
            );
            return recommendation;
        }
        let replicas = ctx.vpa.pod_count as i64;

        for container in &mut recommendation.container_recommendations {
            let Some(requests) = ctx.pod_template.get(&container.container_name) else {
                continue;
            };
            restrict_target(&mut container.target, requests, band, replicas);
        }
        recommendation
    }
}
