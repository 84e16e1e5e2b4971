//! Post-processing chain over recommendations
//!
//! Ordered, composable transformations applied after the engine: safety
//! margin modifiers, resource ratios, replica-count guards, CPU rounding,
//! the allowed-resource filter, and the terminal capping stage. The chain
//! is assembled at startup from configuration; capping is always last.

mod allowed;
mod capping;
mod cpu_rounding;
mod replica_guard;
mod resource_ratio;
mod safety_margin;

pub use allowed::AllowedResourceFilter;
pub use capping::CappingPostProcessor;
pub use cpu_rounding::CpuIntegerRoundingPostProcessor;
pub use replica_guard::ReplicaRestrictionsPostProcessor;
pub use resource_ratio::ResourceRatioPostProcessor;
pub use safety_margin::SafetyMarginModifierPostProcessor;

use crate::model::{PodTemplateView, RecommendedPodResources, ResourceName, Vpa};

/// Everything a post-processor may look at besides the recommendation.
pub struct PostProcessContext<'a> {
    pub vpa: &'a Vpa,
    /// Current per-container requests of the targeted workload.
    pub pod_template: &'a PodTemplateView,
}

/// A single transformation step. Implementations must never turn a valid
/// recommendation into an invalid one; on any config problem they degrade
/// to identity for the affected container or VPA.
pub trait RecommendationPostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(
        &self,
        ctx: &PostProcessContext<'_>,
        recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources;
}

/// Which optional processors to enable and how.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub enable_safety_margin_modifier: bool,
    /// The default margin the modifier formulas undo first.
    pub default_safety_margin_factor: f64,
    pub enable_resource_ratios: bool,
    pub enable_replica_guard: bool,
    pub enable_cpu_rounding: bool,
    /// When set, resources outside this list are dropped from every field.
    pub allowed_resources: Option<Vec<ResourceName>>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enable_safety_margin_modifier: false,
            default_safety_margin_factor: 1.15,
            enable_resource_ratios: false,
            enable_replica_guard: false,
            enable_cpu_rounding: false,
            allowed_resources: None,
        }
    }
}

/// The ordered chain; built once at startup.
pub struct PostProcessorChain {
    processors: Vec<Box<dyn RecommendationPostProcessor>>,
}

impl PostProcessorChain {
    /// Assembles the chain in its fixed order and appends capping.
    pub fn from_config(config: &ChainConfig) -> Self {
        let mut processors: Vec<Box<dyn RecommendationPostProcessor>> = Vec::new();
        if config.enable_safety_margin_modifier {
            processors.push(Box::new(SafetyMarginModifierPostProcessor::new(
                config.default_safety_margin_factor,
            )));
        }
        if config.enable_resource_ratios {
            processors.push(Box::new(ResourceRatioPostProcessor));
        }
        if config.enable_replica_guard {
            processors.push(Box::new(ReplicaRestrictionsPostProcessor));
        }
        if config.enable_cpu_rounding {
            processors.push(Box::new(CpuIntegerRoundingPostProcessor));
        }
        if let Some(allowed) = &config.allowed_resources {
            processors.push(Box::new(AllowedResourceFilter::new(allowed.clone())));
        }
        processors.push(Box::new(CappingPostProcessor));
        Self { processors }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn apply(
        &self,
        ctx: &PostProcessContext<'_>,
        mut recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources {
        for processor in &self.processors {
            recommendation = processor.process(ctx, recommendation);
        }
        recommendation
    }
}
