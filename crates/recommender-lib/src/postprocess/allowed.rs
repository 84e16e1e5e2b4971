//! Allowed-resource filter
//!
//! Drops any resource outside the configured allow-list from all four
//! fields of every container recommendation.

use super::{PostProcessContext, RecommendationPostProcessor};
use crate::model::{RecommendedPodResources, ResourceName, Resources};

pub struct AllowedResourceFilter {
    allowed: Vec<ResourceName>,
}

impl AllowedResourceFilter {
    pub fn new(allowed: Vec<ResourceName>) -> Self {
        Self { allowed }
    }

    fn filter(&self, resources: &mut Resources) {
        resources.retain(|name, _| self.allowed.contains(name));
    }
}

impl RecommendationPostProcessor for AllowedResourceFilter {
    fn name(&self) -> &'static str {
        "allowed-resources"
    }

    fn process(
        &self,
        _ctx: &PostProcessContext<'_>,
        mut recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources {
        for container in &mut recommendation.container_recommendations {
            self.filter(&mut container.target);
            self.filter(&mut container.lower_bound);
            self.filter(&mut container.upper_bound);
            self.filter(&mut container.uncapped_target);
        }
        recommendation
    }
}
