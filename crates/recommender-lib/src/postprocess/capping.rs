//! Terminal capping stage
//!
//! Clamps target, lower bound and upper bound into the per-container
//! [min, max] range from the VPA resource policy and restores
//! `lower <= target <= upper`, with the target dominating when capping
//! collapses the interval. Resources unknown to the policy pass through;
//! the uncapped target is never touched.

use super::{PostProcessContext, RecommendationPostProcessor};
use crate::model::{ContainerResourcePolicy, RecommendedPodResources, Resources};

fn clamp_to_policy(resources: &mut Resources, policy: &ContainerResourcePolicy) {
    for (resource, amount) in resources.iter_mut() {
        if let Some(min) = policy.min_allowed.get(resource) {
            *amount = (*amount).max(*min);
        }
        if let Some(max) = policy.max_allowed.get(resource) {
            *amount = (*amount).min(*max);
        }
    }
}

pub struct CappingPostProcessor;

impl RecommendationPostProcessor for CappingPostProcessor {
    fn name(&self) -> &'static str {
        "capping"
    }

    fn process(
        &self,
        ctx: &PostProcessContext<'_>,
        mut recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources {
        for container in &mut recommendation.container_recommendations {
            if let Some(policy) = ctx
                .vpa
                .resource_policy
                .as_ref()
                .and_then(|p| p.for_container(&container.container_name))
            {
                clamp_to_policy(&mut container.target, policy);
                clamp_to_policy(&mut container.lower_bound, policy);
                clamp_to_policy(&mut container.upper_bound, policy);
            }
            // The target dominates the bounds.
            for (resource, target) in &container.target {
                if let Some(lower) = container.lower_bound.get_mut(resource) {
                    *lower = (*lower).min(*target);
                }
                if let Some(upper) = container.upper_bound.get_mut(resource) {
                    *upper = (*upper).max(*target);
                }
            }
        }
        recommendation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        LabelSelector, PodResourcePolicy, PodTemplateView, RecommendedContainerResources,
        ResourceName, UpdateMode, Vpa, VpaId, VpaSpec,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn vpa(policy: Option<PodResourcePolicy>) -> Vpa {
        Vpa::from_spec(VpaSpec {
            id: VpaId::new("prod", "web"),
            selector: LabelSelector::everything(),
            target_ref: None,
            resource_policy: policy,
            update_mode: UpdateMode::Off,
            update_priority: 0,
            recommender_name: String::new(),
            annotations: BTreeMap::new(),
            created: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        })
        .unwrap()
    }

    fn policy(min_cpu: i64, max_cpu: i64) -> PodResourcePolicy {
        PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "*".into(),
                mode: None,
                min_allowed: Resources::from([(ResourceName::Cpu, min_cpu)]),
                max_allowed: Resources::from([(ResourceName::Cpu, max_cpu)]),
                controlled_resources: None,
            }],
        }
    }

    fn rec(target: i64, lower: i64, upper: i64) -> RecommendedPodResources {
        RecommendedPodResources {
            container_recommendations: vec![RecommendedContainerResources {
                container_name: "web".into(),
                target: Resources::from([(ResourceName::Cpu, target)]),
                lower_bound: Resources::from([(ResourceName::Cpu, lower)]),
                upper_bound: Resources::from([(ResourceName::Cpu, upper)]),
                uncapped_target: Resources::from([(ResourceName::Cpu, target)]),
            }],
        }
    }

    fn apply(vpa: &Vpa, rec: RecommendedPodResources) -> RecommendedContainerResources {
        let template = PodTemplateView::new();
        let ctx = PostProcessContext {
            vpa,
            pod_template: &template,
        };
        CappingPostProcessor
            .process(&ctx, rec)
            .container_recommendations
            .remove(0)
    }

    #[test]
    fn test_clamps_into_policy_range() {
        let vpa = vpa(Some(policy(500, 2000)));
        let c = apply(&vpa, rec(3000, 100, 4000));
        assert_eq!(c.target[&ResourceName::Cpu], 2000);
        assert_eq!(c.lower_bound[&ResourceName::Cpu], 500);
        assert_eq!(c.upper_bound[&ResourceName::Cpu], 2000);
        // The uncapped target keeps the pre-cap value.
        assert_eq!(c.uncapped_target[&ResourceName::Cpu], 3000);
    }

    #[test]
    fn test_target_dominates_collapsed_interval() {
        // Max caps the upper bound below the (also capped) target: the
        // target wins and drags the upper bound back up to itself.
        let vpa = vpa(Some(policy(0, 1500)));
        let c = apply(&vpa, rec(3000, 2000, 2500));
        assert_eq!(c.target[&ResourceName::Cpu], 1500);
        assert_eq!(c.lower_bound[&ResourceName::Cpu], 1500);
        assert_eq!(c.upper_bound[&ResourceName::Cpu], 1500);
    }

    #[test]
    fn test_resources_outside_policy_pass_through() {
        let vpa = vpa(Some(policy(500, 2000)));
        let mut input = rec(1000, 800, 1200);
        input.container_recommendations[0]
            .target
            .insert(ResourceName::Other("ephemeral-storage".into()), 7);
        let c = apply(&vpa, input);
        assert_eq!(
            c.target[&ResourceName::Other("ephemeral-storage".into())],
            7
        );
    }

    #[test]
    fn test_no_policy_only_restores_ordering() {
        let vpa = vpa(None);
        let c = apply(&vpa, rec(1000, 1200, 900));
        assert_eq!(c.target[&ResourceName::Cpu], 1000);
        assert_eq!(c.lower_bound[&ResourceName::Cpu], 1000);
        assert_eq!(c.upper_bound[&ResourceName::Cpu], 1000);
    }
}
