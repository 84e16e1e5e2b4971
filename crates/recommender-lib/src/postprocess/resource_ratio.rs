//! Resource-ratio post-processor
//!
//! Maintains declared ratios between resources of one container:
//! `vpa-post-processor.<domain>/<container>_resourceRatios =
//! {"cpu":{"resource":"memory","ratio":3000}}` derives the memory
//! recommendation from the CPU one. Without an explicit ratio the current
//! pod-template ratio is used. Edges form a graph that must be acyclic
//! with at most one predecessor per resource; the edges are applied in
//! topological order.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, error};

use super::{PostProcessContext, RecommendationPostProcessor};
use crate::annotations::{extract_container_name, POST_PROCESSOR_PREFIX, RESOURCE_RATIOS_SUFFIX};
use crate::error::{RecommenderError, Result};
use crate::model::{
    from_milli_units, to_milli_units, RecommendedContainerResources, RecommendedPodResources,
    ResourceName, Resources,
};

#[derive(Debug, Clone, Deserialize)]
struct RatioDefinition {
    resource: String,
    ratio: Option<f64>,
}

/// One dependency edge: `target = original * ratio`.
#[derive(Debug, Clone, PartialEq)]
struct RatioEdge {
    original: ResourceName,
    target: ResourceName,
    ratio: Option<f64>,
}

fn parse_ratio_annotation(value: &str) -> Option<Vec<RatioEdge>> {
    let parsed: BTreeMap<String, RatioDefinition> = serde_json::from_str(value).ok()?;
    Some(
        parsed
            .into_iter()
            .map(|(original, def)| RatioEdge {
                original: ResourceName::from(original.as_str()),
                target: ResourceName::from(def.resource.as_str()),
                ratio: def.ratio,
            })
            .collect(),
    )
}

/// Validates the edge graph and returns the edges in application order:
/// an edge computing X always precedes edges reading X. Fails with
/// `Internal` on a cycle or a resource with several predecessors.
fn ordered_edges(edges: &[RatioEdge]) -> Result<Vec<RatioEdge>> {
    let mut predecessors: HashMap<&ResourceName, Vec<&RatioEdge>> = HashMap::new();
    let mut children: HashMap<&ResourceName, Vec<&ResourceName>> = HashMap::new();
    let mut in_degree: HashMap<&ResourceName, usize> = HashMap::new();

    for edge in edges {
        predecessors.entry(&edge.target).or_default().push(edge);
        children.entry(&edge.original).or_default().push(&edge.target);
        in_degree.entry(&edge.original).or_default();
        *in_degree.entry(&edge.target).or_default() += 1;
    }
    for (resource, preds) in &predecessors {
        if preds.len() > 1 {
            return Err(RecommenderError::Internal(format!(
                "resource {} has more than one predecessor in ratio graph",
                resource
            )));
        }
    }

    let mut queue: VecDeque<&ResourceName> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(r, _)| *r)
        .collect();
    let mut ordered = Vec::new();
    let mut visited = 0usize;
    while let Some(resource) = queue.pop_front() {
        visited += 1;
        if let Some(preds) = predecessors.get(resource) {
            ordered.push(preds[0].clone());
        }
        if let Some(next) = children.get(resource) {
            for child in next {
                let degree = in_degree.get_mut(child).expect("child was registered");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }
    if visited != in_degree.len() {
        return Err(RecommenderError::Internal(
            "ratio graph contains a cycle".to_string(),
        ));
    }
    Ok(ordered)
}

/// Applies the ordered edges to one resource list in place.
fn apply_edges(resources: &mut Resources, edges: &[RatioEdge], template_requests: &Resources) {
    for edge in edges {
        let ratio = match edge.ratio {
            Some(ratio) => ratio,
            None => {
                let original_request = template_requests
                    .get(&edge.original)
                    .map(|v| to_milli_units(&edge.original, *v))
                    .unwrap_or(0);
                if original_request == 0 {
                    // Nothing to derive the template ratio from.
                    continue;
                }
                let target_request = template_requests
                    .get(&edge.target)
                    .map(|v| to_milli_units(&edge.target, *v))
                    .unwrap_or(0);
                target_request as f64 / original_request as f64
            }
        };
        let original_milli = resources
            .get(&edge.original)
            .map(|v| to_milli_units(&edge.original, *v))
            .unwrap_or(0);
        let derived_milli = (original_milli as f64 * ratio) as i64;
        resources.insert(
            edge.target.clone(),
            from_milli_units(&edge.target, derived_milli),
        );
    }
}

/// Enforces declared ratio constraints between container resources.
pub struct ResourceRatioPostProcessor;

impl ResourceRatioPostProcessor {
    fn apply_to_container(
        &self,
        container: &mut RecommendedContainerResources,
        edges: &[RatioEdge],
        template_requests: &Resources,
    ) {
        apply_edges(&mut container.target, edges, template_requests);
        apply_edges(&mut container.lower_bound, edges, template_requests);
        apply_edges(&mut container.upper_bound, edges, template_requests);
    }
}

impl RecommendationPostProcessor for ResourceRatioPostProcessor {
    fn name(&self) -> &'static str {
        "resource-ratio"
    }

    fn process(
        &self,
        ctx: &PostProcessContext<'_>,
        mut recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources {
        let mut per_container: BTreeMap<String, Vec<RatioEdge>> = BTreeMap::new();
        for (key, value) in &ctx.vpa.annotations {
            let Some(container) =
                extract_container_name(key, POST_PROCESSOR_PREFIX, RESOURCE_RATIOS_SUFFIX)
            else {
                continue;
            };
            match parse_ratio_annotation(value) {
                Some(edges) => {
                    per_container.insert(container.to_string(), edges);
                }
                None => {
                    error!(
                        vpa = %ctx.vpa.id,
                        container = %container,
                        value = %value,
                        "Skipping malformed resource ratio definition"
                    );
                }
            }
        }
        if per_container.is_empty() {
            return recommendation;
        }

        for container in &mut recommendation.container_recommendations {
            let Some(edges) = per_container.get(&container.container_name) else {
                continue;
            };
            let ordered = match ordered_edges(edges) {
                Ok(ordered) => ordered,
                Err(err) => {
                    error!(
                        vpa = %ctx.vpa.id,
                        container = %container.container_name,
                        error = %err,
                        "Invalid ratio graph, leaving recommendation unchanged"
                    );
                    continue;
                }
            };
            let template_requests = ctx
                .pod_template
                .get(&container.container_name)
                .cloned()
                .unwrap_or_default();
            debug!(
                vpa = %ctx.vpa.id,
                container = %container.container_name,
                edges = ordered.len(),
                "Applying resource ratios"
            );
            self.apply_to_container(container, &ordered, &template_requests);
        }
        recommendation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LabelSelector, PodTemplateView, UpdateMode, Vpa, VpaId, VpaSpec};
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
                "vpa-post-processor.scalewise.dev/web_resourceRatios".to_string(),
                annotation_value.to_string(),
            )]),
            created: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        })
        .unwrap()
    }

    fn recommendation(resources: Resources) -> RecommendedPodResources {
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

    fn apply(
        annotation: &str,
        template: PodTemplateView,
        resources: Resources,
    ) -> RecommendedPodResources {
        let vpa = vpa(annotation);
        let ctx = PostProcessContext {
            vpa: &vpa,
            pod_template: &template,
        };
        ResourceRatioPostProcessor.process(&ctx, recommendation(resources))
    }

    #[test]
    fn test_cpu_drives_memory_from_template_ratio() {
        // Template: 1 core, 3000 bytes. The template ratio in milli-units
        // is 3000; a 1-core recommendation yields 3000 bytes of memory.
        let template = PodTemplateView::from([(
            "web".to_string(),
            Resources::from([
                (ResourceName::Cpu, 1000),
                (ResourceName::Memory, 3000),
            ]),
        )]);
        let out = apply(
            r#"{"cpu":{"resource":"memory"}}"#,
            template,
            Resources::from([(ResourceName::Cpu, 1000), (ResourceName::Memory, 1)]),
        );
        let c = &out.container_recommendations[0];
        assert_eq!(c.target[&ResourceName::Cpu], 1000);
        assert_eq!(c.target[&ResourceName::Memory], 3000);
        // Bounds follow the same edges; the uncapped target never changes.
        assert_eq!(c.lower_bound[&ResourceName::Memory], 3000);
        assert_eq!(c.upper_bound[&ResourceName::Memory], 3000);
        assert_eq!(c.uncapped_target[&ResourceName::Memory], 1);
    }

    #[test]
    fn test_explicit_ratio_wins_over_template() {
        let template = PodTemplateView::from([(
            "web".to_string(),
            Resources::from([
                (ResourceName::Cpu, 1000),
                (ResourceName::Memory, 3000),
            ]),
        )]);
        // 15e9 bytes of memory per core = 15e6 milli-bytes per millicore.
        let out = apply(
            r#"{"cpu":{"resource":"memory","ratio":15000000}}"#,
            template,
            Resources::from([(ResourceName::Cpu, 2000)]),
        );
        let c = &out.container_recommendations[0];
        assert_eq!(c.target[&ResourceName::Memory], 30_000_000_000);
    }

    #[test]
    fn test_zero_template_request_skips_edge() {
        let template = PodTemplateView::from([(
            "web".to_string(),
            Resources::from([(ResourceName::Memory, 3000)]),
        )]);
        let out = apply(
            r#"{"cpu":{"resource":"memory"}}"#,
            template,
            Resources::from([(ResourceName::Cpu, 1000), (ResourceName::Memory, 7)]),
        );
        assert_eq!(
            out.container_recommendations[0].target[&ResourceName::Memory],
            7
        );
    }

    #[test]
    fn test_cycle_is_identity() {
        let template = PodTemplateView::from([(
            "web".to_string(),
            Resources::from([
                (ResourceName::Cpu, 1000),
                (ResourceName::Memory, 3000),
            ]),
        )]);
        let input = Resources::from([
            (ResourceName::Cpu, 1000),
            (ResourceName::Memory, 42),
        ]);
        let out = apply(
            r#"{"cpu":{"resource":"memory"},"memory":{"resource":"cpu"}}"#,
            template,
            input.clone(),
        );
        assert_eq!(out.container_recommendations[0].target, input);
    }

    #[test]
    fn test_multiple_predecessors_is_identity() {
        let template = PodTemplateView::from([(
            "web".to_string(),
            Resources::from([
                (ResourceName::Cpu, 1000),
                (ResourceName::Memory, 3000),
                (ResourceName::Other("ephemeral-storage".into()), 10),
            ]),
        )]);
        let input = Resources::from([
            (ResourceName::Cpu, 1000),
            (ResourceName::Memory, 42),
            (ResourceName::Other("ephemeral-storage".into()), 10),
        ]);
        let out = apply(
            r#"{"cpu":{"resource":"memory"},"ephemeral-storage":{"resource":"memory"}}"#,
            template,
            input.clone(),
        );
        assert_eq!(out.container_recommendations[0].target, input);
    }

    #[test]
    fn test_chained_edges_apply_in_order() {
        // cpu -> memory -> ephemeral-storage with explicit ratios; the
        // second edge must observe the memory value the first computed.
        let out = apply(
            r#"{"cpu":{"resource":"memory","ratio":2},"memory":{"resource":"ephemeral-storage","ratio":3}}"#,
            PodTemplateView::new(),
            Resources::from([(ResourceName::Cpu, 1000)]),
        );
        let c = &out.container_recommendations[0];
        // cpu 1000m -> memory 2000 milli-units = 2 bytes; memory 2 bytes ->
        // storage 6000 milli-units = 6 bytes.
        assert_eq!(c.target[&ResourceName::Memory], 2);
        assert_eq!(
            c.target[&ResourceName::Other("ephemeral-storage".into())],
            6
        );
    }

    #[test]
    fn test_malformed_annotation_is_identity() {
        let input = Resources::from([(ResourceName::Cpu, 1000)]);
        let out = apply("not json", PodTemplateView::new(), input.clone());
        assert_eq!(out.container_recommendations[0].target, input);
    }
}
