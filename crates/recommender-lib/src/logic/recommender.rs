//! The two recommendation engines
//!
//! Histogram mode derives amounts from percentiles of the aggregated
//! usage; external mode passes raw upstream resources through the same
//! margin, floor and filter pipeline. Both emit the same shape so
//! post-processing is uniform.

use tracing::debug;

use super::estimator::EstimatorConfig;
use crate::model::{
    cpu_amount_from_cores, memory_amount_from_bytes, scale_resource,
    ContainerNameToAggregateStateMap, ContainerNameToRecommendation,
    RecommendedContainerResources, RecommendedPodResources, ResourceName, Resources,
    ScalingMode, Vpa,
};

/// Derives recommendations from aggregated usage histograms.
pub struct HistogramRecommender {
    config: EstimatorConfig,
}

impl HistogramRecommender {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn recommend(
        &self,
        vpa: &Vpa,
        states: &ContainerNameToAggregateStateMap<'_>,
    ) -> RecommendedPodResources {
        let minimums = self.config.min_resources(states.len());
        let mut recommendations = Vec::new();

        let mut names: Vec<&String> = states.keys().collect();
        names.sort();
        for name in names {
            if scaling_disabled(vpa, name) {
                debug!(vpa = %vpa.id, container = %name, "Scaling is off for container");
                continue;
            }
            let state = states[name];
            if state.total_samples_count == 0 {
                continue;
            }
            let history = state.history();
            let lower_factor = self.config.confidence_lower.factor(history);
            let upper_factor = self.config.confidence_upper.factor(history);

            let cpu = |p: f64| cpu_amount_from_cores(state.cpu_histogram.percentile(p));
            let memory =
                |p: f64| memory_amount_from_bytes(state.memory_peaks_histogram.percentile(p));

            let mut target = Resources::from([
                (ResourceName::Cpu, cpu(self.config.target_percentile)),
                (ResourceName::Memory, memory(self.config.target_percentile)),
            ]);
            let mut lower = Resources::from([
                (
                    ResourceName::Cpu,
                    scale_resource(cpu(self.config.lower_bound_percentile), lower_factor),
                ),
                (
                    ResourceName::Memory,
                    scale_resource(memory(self.config.lower_bound_percentile), lower_factor),
                ),
            ]);
            let mut upper = Resources::from([
                (
                    ResourceName::Cpu,
                    scale_resource(cpu(self.config.upper_bound_percentile), upper_factor),
                ),
                (
                    ResourceName::Memory,
                    scale_resource(memory(self.config.upper_bound_percentile), upper_factor),
                ),
            ]);

            self.config.adjust(&mut target, &minimums);
            self.config.adjust(&mut lower, &minimums);
            self.config.adjust(&mut upper, &minimums);

            let uncapped_target = target.clone();
            let controlled = vpa.controlled_resources(name);
            recommendations.push(RecommendedContainerResources {
                container_name: name.clone(),
                target: filter_controlled(target, &controlled),
                lower_bound: filter_controlled(lower, &controlled),
                upper_bound: filter_controlled(upper, &controlled),
                uncapped_target,
            });
        }
        RecommendedPodResources {
            container_recommendations: recommendations,
        }
    }
}

/// Passes externally supplied raw recommendations through margins, floors
/// and the controlled-resource filter.
pub struct ExternalRecommender {
    config: EstimatorConfig,
}

impl ExternalRecommender {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn recommend(
        &self,
        vpa: &Vpa,
        raw: &ContainerNameToRecommendation,
    ) -> RecommendedPodResources {
        if raw.is_empty() {
            return RecommendedPodResources::default();
        }
        let minimums = self.config.min_resources(raw.len());
        let mut recommendations = Vec::new();

        let mut names: Vec<&String> = raw.keys().collect();
        names.sort();
        for name in names {
            if scaling_disabled(vpa, name) {
                continue;
            }
            // Missing resources stay missing; the floor only lifts amounts
            // the upstream actually supplied.
            let mut resources = raw[name].clone();
            self.config.adjust(&mut resources, &minimums);

            let uncapped_target = resources.clone();
            let controlled = vpa.controlled_resources(name);
            let filtered = filter_controlled(resources, &controlled);
            recommendations.push(RecommendedContainerResources {
                container_name: name.clone(),
                target: filtered.clone(),
                lower_bound: filtered.clone(),
                upper_bound: filtered,
                uncapped_target,
            });
        }
        RecommendedPodResources {
            container_recommendations: recommendations,
        }
    }
}

fn scaling_disabled(vpa: &Vpa, container_name: &str) -> bool {
    vpa.resource_policy
        .as_ref()
        .and_then(|p| p.for_container(container_name))
        .map_or(false, |p| p.mode == Some(ScalingMode::Off))
}

fn filter_controlled(resources: Resources, controlled: &[ResourceName]) -> Resources {
    resources
        .into_iter()
        .filter(|(name, _)| controlled.contains(name))
        .collect()
}
