//! Safety-margin modifier post-processor
//!
//! Lets a user replace the default multiplicative safety margin with a
//! per-container, per-resource function declared on the VPA object:
//! `vpa-post-processor.<domain>/<container>_safetyMarginModifier = <json>`.
//! The value is either one modifier object applied to both resources or a
//! map of resource to modifier; a `*` key duplicates to cpu and memory.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{error, warn};

use super::{PostProcessContext, RecommendationPostProcessor};
use crate::annotations::{
    extract_container_name, POST_PROCESSOR_PREFIX, SAFETY_MARGIN_MODIFIER_SUFFIX,
};
use crate::model::{
    RecommendedContainerResources, RecommendedPodResources, ResourceName, Resources,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModifierFunction {
    Linear,
    Affine,
    Log,
    Exponential,
}

impl ModifierFunction {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "linear" => Some(Self::Linear),
            "affine" => Some(Self::Affine),
            "log" => Some(Self::Log),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }

    fn required_parameters(&self) -> usize {
        match self {
            Self::Linear | Self::Log => 1,
            Self::Affine | Self::Exponential => 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawModifier {
    function: String,
    #[serde(default)]
    parameters: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Modifier {
    function: ModifierFunction,
    parameters: Vec<f64>,
}

impl Modifier {
    fn from_raw(raw: RawModifier) -> Option<Self> {
        let function = ModifierFunction::parse(&raw.function)?;
        if raw.parameters.len() != function.required_parameters() {
            return None;
        }
        Some(Self {
            function,
            parameters: raw.parameters,
        })
    }

    /// Applies the modifier to one amount. `r` is the recommendation with
    /// the default margin undone; CPU amounts arrive in millicores.
    fn apply(&self, amount: i64, default_margin: f64) -> i64 {
        let r = amount as f64 / default_margin;
        let result = match self.function {
            ModifierFunction::Linear => r * self.parameters[0],
            ModifierFunction::Affine => r * self.parameters[1] + self.parameters[0],
            ModifierFunction::Log => r + self.parameters[0] * r.log10(),
            ModifierFunction::Exponential => r + self.parameters[1] * r.powf(self.parameters[0]),
        };
        result as i64
    }
}

type ContainerModifiers = BTreeMap<ResourceName, Modifier>;

/// Parses the annotation value. `None` means the annotation is malformed
/// and the container must be left untouched.
fn parse_modifier_annotation(value: &str) -> Option<ContainerModifiers> {
    let json: Value = serde_json::from_str(value).ok()?;
    let mut modifiers = ContainerModifiers::new();
    let object = json.as_object()?;

    if object.contains_key("function") {
        // Single modifier form: applies to both histogram-backed resources.
        let raw: RawModifier = serde_json::from_value(json.clone()).ok()?;
        let modifier = Modifier::from_raw(raw)?;
        modifiers.insert(ResourceName::Cpu, modifier.clone());
        modifiers.insert(ResourceName::Memory, modifier);
        return Some(modifiers);
    }

    for (key, raw_value) in object {
        let raw: RawModifier = serde_json::from_value(raw_value.clone()).ok()?;
        let modifier = Modifier::from_raw(raw)?;
        if key == "*" {
            modifiers.insert(ResourceName::Cpu, modifier.clone());
            modifiers.insert(ResourceName::Memory, modifier);
        } else {
            modifiers.insert(ResourceName::from(key.as_str()), modifier);
        }
    }
    if modifiers.is_empty() {
        None
    } else {
        Some(modifiers)
    }
}

/// Applies user-declared margin functions on top of raw recommendations.
pub struct SafetyMarginModifierPostProcessor {
    default_safety_margin_factor: f64,
}

impl SafetyMarginModifierPostProcessor {
    pub fn new(default_safety_margin_factor: f64) -> Self {
        Self {
            default_safety_margin_factor,
        }
    }

    fn modify_list(&self, resources: &mut Resources, modifiers: &ContainerModifiers) {
        for (resource, amount) in resources.iter_mut() {
            if let Some(modifier) = modifiers.get(resource) {
                *amount = modifier.apply(*amount, self.default_safety_margin_factor);
            }
        }
    }

    fn modify_container(
        &self,
        container: &mut RecommendedContainerResources,
        modifiers: &ContainerModifiers,
    ) {
        self.modify_list(&mut container.lower_bound, modifiers);
        self.modify_list(&mut container.target, modifiers);
        self.modify_list(&mut container.upper_bound, modifiers);
        self.modify_list(&mut container.uncapped_target, modifiers);
    }
}

impl RecommendationPostProcessor for SafetyMarginModifierPostProcessor {
    fn name(&self) -> &'static str {
        "safety-margin-modifier"
    }

    fn process(
        &self,
        ctx: &PostProcessContext<'_>,
        mut recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources {
        let mut per_container: BTreeMap<String, ContainerModifiers> = BTreeMap::new();
        for (key, value) in &ctx.vpa.annotations {
            let Some(container) = extract_container_name(
                key,
                POST_PROCESSOR_PREFIX,
                SAFETY_MARGIN_MODIFIER_SUFFIX,
            ) else {
                continue;
            };
            match parse_modifier_annotation(value) {
                Some(modifiers) => {
                    per_container.insert(container.to_string(), modifiers);
                }
                None => {
                    error!(
                        vpa = %ctx.vpa.id,
                        container = %container,
                        value = %value,
                        "Skipping malformed safety margin modifier"
                    );
                }
            }
        }
        if per_container.is_empty() {
            return recommendation;
        }

        for container in &mut recommendation.container_recommendations {
            let Some(modifiers) = per_container.get(&container.container_name) else {
                continue;
            };
            warn!(
                vpa = %ctx.vpa.id,
                container = %container.container_name,
                "Applying safety margin modifier"
            );
            self.modify_container(container, modifiers);
        }
        recommendation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LabelSelector, UpdateMode, Vpa, VpaId, VpaSpec};
    use crate::model::PodTemplateView;
    use chrono::{TimeZone, Utc};

    fn vpa(annotation_value: &str) -> Vpa {
        Vpa::from_spec(VpaSpec {
            id: VpaId::new("prod", "web"),
            selector: LabelSelector::everything(),
            target_ref: None,
            resource_policy: None,
            update_mode: UpdateMode::Off,
            update_priority: 0,
            recommender_name: String::new(),
            annotations: BTreeMap::from([(
                "vpa-post-processor.scalewise.dev/web_safetyMarginModifier".to_string(),
                annotation_value.to_string(),
            )]),
            created: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        })
        .unwrap()
    }

    fn recommendation(cpu: i64, memory: i64) -> RecommendedPodResources {
        let resources = Resources::from([
            (ResourceName::Cpu, cpu),
            (ResourceName::Memory, memory),
        ]);
        RecommendedPodResources {
            container_recommendations: vec![RecommendedContainerResources {
                container_name: "web".into(),
                target: resources.clone(),
                lower_bound: resources.clone(),
                upper_bound: resources.clone(),
                uncapped_target: resources,
            }],
        }
    }

    fn apply(annotation: &str, cpu: i64, memory: i64) -> RecommendedPodResources {
        let vpa = vpa(annotation);
        let template = PodTemplateView::new();
        let ctx = PostProcessContext {
            vpa: &vpa,
            pod_template: &template,
        };
        SafetyMarginModifierPostProcessor::new(1.0).process(&ctx, recommendation(cpu, memory))
    }

    #[test]
    fn test_linear_modifier_scales_cpu_and_memory() {
        // 1 core, 200Mi with a 1.2 linear margin: 1.2 cores, 240Mi.
        let out = apply(
            r#"{"function":"Linear","parameters":[1.20]}"#,
            1000,
            200 * 1024 * 1024,
        );
        let c = &out.container_recommendations[0];
        assert_eq!(c.target[&ResourceName::Cpu], 1200);
        assert_eq!(c.target[&ResourceName::Memory], 240 * 1024 * 1024);
        // All four lists are modified.
        assert_eq!(c.lower_bound, c.target);
        assert_eq!(c.upper_bound, c.target);
        assert_eq!(c.uncapped_target, c.target);
    }

    #[test]
    fn test_affine_modifier_per_resource() {
        // CPU: 1000m * 1.1 + 100m = 1200m. Memory: 200Mi * 1.1 + 100Mi = 320Mi.
        let out = apply(
            r#"{"cpu":{"function":"Affine","parameters":[100,1.1]},"memory":{"function":"Affine","parameters":[104857600,1.1]}}"#,
            1000,
            200 * 1024 * 1024,
        );
        let c = &out.container_recommendations[0];
        assert_eq!(c.target[&ResourceName::Cpu], 1200);
        assert_eq!(c.target[&ResourceName::Memory], 320 * 1024 * 1024);
    }

    #[test]
    fn test_log_modifier() {
        // r + a*log10(r) with r=1000m, a=100: 1000 + 300 = 1300m, modulo
        // the truncating integer conversion.
        let out = apply(
            r#"{"cpu":{"function":"log","parameters":[100]}}"#,
            1000,
            1024,
        );
        let c = &out.container_recommendations[0];
        assert!((1299..=1300).contains(&c.target[&ResourceName::Cpu]));
        assert_eq!(c.target[&ResourceName::Memory], 1024);
    }

    #[test]
    fn test_exponential_modifier() {
        // r + a*r^b with r=100, b=2, a=0.01: 100 + 100 = 200.
        let out = apply(
            r#"{"cpu":{"function":"Exponential","parameters":[2,0.01]}}"#,
            100,
            1024,
        );
        assert_eq!(
            out.container_recommendations[0].target[&ResourceName::Cpu],
            200
        );
    }

    #[test]
    fn test_wildcard_key_covers_both_resources() {
        let out = apply(
            r#"{"*":{"function":"linear","parameters":[2.0]}}"#,
            500,
            1000,
        );
        let c = &out.container_recommendations[0];
        assert_eq!(c.target[&ResourceName::Cpu], 1000);
        assert_eq!(c.target[&ResourceName::Memory], 2000);
    }

    #[test]
    fn test_malformed_annotation_is_identity() {
        for bad in [
            "not json",
            r#"{"function":"Linear","parameters":[1.0,2.0]}"#,
            r#"{"function":"sqrt","parameters":[1.0]}"#,
            r#"{"cpu":{"function":"Affine","parameters":[1.0]}}"#,
        ] {
            let out = apply(bad, 1000, 2000);
            let c = &out.container_recommendations[0];
            assert_eq!(c.target[&ResourceName::Cpu], 1000, "annotation {:?}", bad);
            assert_eq!(c.target[&ResourceName::Memory], 2000);
        }
    }

    #[test]
    fn test_undoes_default_margin_first() {
        let vpa = vpa(r#"{"function":"Linear","parameters":[1.0]}"#);
        let template = PodTemplateView::new();
        let ctx = PostProcessContext {
            vpa: &vpa,
            pod_template: &template,
        };
        // Default margin 1.15 is divided out: 1150m becomes 1000m.
        let out = SafetyMarginModifierPostProcessor::new(1.15)
            .process(&ctx, recommendation(1150, 1150));
        assert_eq!(
            out.container_recommendations[0].target[&ResourceName::Cpu],
            1000
        );
    }
}
