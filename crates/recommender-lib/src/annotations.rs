//! Annotation syntax on VPA objects
//!
//! External metric mappings and post-processor opt-ins ride on VPA
//! annotations. Parsing here never fails hard: a malformed annotation is
//! reported to the caller, which degrades to identity for that VPA or
//! container.

use std::collections::BTreeMap;

use crate::error::{RecommenderError, Result};
use crate::model::ResourceName;

/// Prefix of external metric mapping annotations:
/// `vpa.scalewise.dev/metric-<resource>-<container> = <metric-or-selector>`.
pub const METRIC_ANNOTATION_PREFIX: &str = "vpa.scalewise.dev/metric-";

/// Prefix of all post-processor annotations.
pub const POST_PROCESSOR_PREFIX: &str = "vpa-post-processor.scalewise.dev/";

/// Suffix of the per-container safety margin modifier annotation.
pub const SAFETY_MARGIN_MODIFIER_SUFFIX: &str = "_safetyMarginModifier";

/// Suffix of the per-container resource ratio annotation.
pub const RESOURCE_RATIOS_SUFFIX: &str = "_resourceRatios";

/// VPA-level replica restriction annotation key (no container component).
pub const REPLICA_RESTRICTED_RANGE_KEY: &str = "replicaRestrictedRange";

/// VPA-level CPU rounding annotation keys.
pub const INTEGER_CPU_KEY: &str = "integerCpu";
pub const CORE_DIVISOR_KEY: &str = "coreDivisor";
pub const RAM_PER_CORE_KEY: &str = "ramPerCore";

/// Extracts the container name from `<prefix><container><suffix>`.
/// Returns `None` for keys of any other shape.
pub fn extract_container_name<'a>(key: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let name = rest.strip_suffix(suffix)?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Decodes the `~2` escape used for `.` inside label keys carried in
/// annotation-derived maps.
pub fn unescape_label_key(key: &str) -> String {
    key.replace("~2", ".")
}

/// A parsed external metric reference: a metric name plus an optional
/// label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub name: String,
    pub selector: BTreeMap<String, String>,
}

impl MetricSpec {
    /// Parses `name` or `name{key:value,key2:value2}`. Label keys may use
    /// the `~2` escape for dots.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RecommenderError::ConfigInvalid(
                "empty metric reference".to_string(),
            ));
        }
        let Some(open) = raw.find('{') else {
            return Ok(Self {
                name: raw.to_string(),
                selector: BTreeMap::new(),
            });
        };
        if !raw.ends_with('}') {
            return Err(RecommenderError::ConfigInvalid(format!(
                "unterminated selector in metric reference {:?}",
                raw
            )));
        }
        let name = raw[..open].trim();
        if name.is_empty() {
            return Err(RecommenderError::ConfigInvalid(format!(
                "metric reference {:?} has no name",
                raw
            )));
        }
        let mut selector = BTreeMap::new();
        let body = &raw[open + 1..raw.len() - 1];
        for pair in body.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair.split_once(':').ok_or_else(|| {
                RecommenderError::ConfigInvalid(format!(
                    "selector entry {:?} is not key:value",
                    pair
                ))
            })?;
            selector.insert(
                unescape_label_key(key.trim()),
                value.trim().to_string(),
            );
        }
        Ok(Self {
            name: name.to_string(),
            selector,
        })
    }
}

/// One external metric mapping extracted from a VPA's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricMapping {
    pub resource: ResourceName,
    pub container_name: String,
    pub metric: MetricSpec,
}

/// Collects all well-formed external metric mappings from a VPA's
/// annotations. Malformed values are returned separately so the caller can
/// log and flag the config without dropping the good entries.
pub fn metric_mappings(
    annotations: &BTreeMap<String, String>,
) -> (Vec<MetricMapping>, Vec<String>) {
    let mut mappings = Vec::new();
    let mut bad_keys = Vec::new();
    for (key, value) in annotations {
        let Some(rest) = key.strip_prefix(METRIC_ANNOTATION_PREFIX) else {
            continue;
        };
        let Some((resource_str, container)) = rest.split_once('-') else {
            bad_keys.push(key.clone());
            continue;
        };
        let resource = match resource_str {
            "cpu" => ResourceName::Cpu,
            "memory" => ResourceName::Memory,
            _ => {
                bad_keys.push(key.clone());
                continue;
            }
        };
        if container.is_empty() {
            bad_keys.push(key.clone());
            continue;
        }
        match MetricSpec::parse(value) {
            Ok(metric) => mappings.push(MetricMapping {
                resource,
                container_name: container.to_string(),
                metric,
            }),
            Err(_) => bad_keys.push(key.clone()),
        }
    }
    (mappings, bad_keys)
}

/// Returns the keys of recommender-owned annotations whose values are
/// structurally malformed. Used to surface the `ConfigDeprecated`
/// condition; the post-processors re-parse and degrade on their own.
pub fn malformed_recommender_annotations(annotations: &BTreeMap<String, String>) -> Vec<String> {
    let (_, mut bad_keys) = metric_mappings(annotations);
    for (key, value) in annotations {
        if extract_container_name(key, POST_PROCESSOR_PREFIX, SAFETY_MARGIN_MODIFIER_SUFFIX)
            .is_some()
            || extract_container_name(key, POST_PROCESSOR_PREFIX, RESOURCE_RATIOS_SUFFIX).is_some()
        {
            let parsed: std::result::Result<serde_json::Value, _> = serde_json::from_str(value);
            if !parsed.map(|v| v.is_object()).unwrap_or(false) {
                bad_keys.push(key.clone());
            }
        } else if key == &format!("{}{}", POST_PROCESSOR_PREFIX, REPLICA_RESTRICTED_RANGE_KEY) {
            let parsed: std::result::Result<Vec<i64>, _> = serde_json::from_str(value);
            match parsed {
                Ok(range) if range.len() == 2 && range[0] < range[1] => {}
                _ => bad_keys.push(key.clone()),
            }
        }
    }
    bad_keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_container_name() {
        let key = "vpa-post-processor.scalewise.dev/nginx_safetyMarginModifier";
        assert_eq!(
            extract_container_name(key, POST_PROCESSOR_PREFIX, SAFETY_MARGIN_MODIFIER_SUFFIX),
            Some("nginx")
        );
        assert_eq!(
            extract_container_name(key, POST_PROCESSOR_PREFIX, RESOURCE_RATIOS_SUFFIX),
            None
        );
        assert_eq!(
            extract_container_name(
                "vpa-post-processor.scalewise.dev/_safetyMarginModifier",
                POST_PROCESSOR_PREFIX,
                SAFETY_MARGIN_MODIFIER_SUFFIX
            ),
            None
        );
    }

    #[test]
    fn test_metric_spec_plain_name() {
        let spec = MetricSpec::parse("container.cpu.usage").unwrap();
        assert_eq!(spec.name, "container.cpu.usage");
        assert!(spec.selector.is_empty());
    }

    #[test]
    fn test_metric_spec_with_selector_and_escape() {
        let spec = MetricSpec::parse("requests{service~2name:web,env:prod}").unwrap();
        assert_eq!(spec.name, "requests");
        assert_eq!(spec.selector["service.name"], "web");
        assert_eq!(spec.selector["env"], "prod");
    }

    #[test]
    fn test_metric_spec_malformed() {
        assert!(MetricSpec::parse("").is_err());
        assert!(MetricSpec::parse("m{unterminated").is_err());
        assert!(MetricSpec::parse("m{novalue}").is_err());
        assert!(MetricSpec::parse("{k:v}").is_err());
    }

    #[test]
    fn test_metric_mappings() {
        let annotations = BTreeMap::from([
            (
                "vpa.scalewise.dev/metric-cpu-nginx".to_string(),
                "cpu.usage{env:prod}".to_string(),
            ),
            (
                "vpa.scalewise.dev/metric-memory-nginx".to_string(),
                "mem.usage".to_string(),
            ),
            (
                "vpa.scalewise.dev/metric-disk-nginx".to_string(),
                "disk.usage".to_string(),
            ),
            ("unrelated/annotation".to_string(), "x".to_string()),
        ]);
        let (mappings, bad) = metric_mappings(&annotations);
        assert_eq!(mappings.len(), 2);
        assert!(mappings.iter().any(|m| m.resource == ResourceName::Cpu
            && m.container_name == "nginx"
            && m.metric.name == "cpu.usage"));
        assert_eq!(bad, vec!["vpa.scalewise.dev/metric-disk-nginx".to_string()]);
    }

    #[test]
    fn test_malformed_recommender_annotations() {
        let annotations = BTreeMap::from([
            (
                "vpa-post-processor.scalewise.dev/web_safetyMarginModifier".to_string(),
                r#"{"function":"Linear","parameters":[1.2]}"#.to_string(),
            ),
            (
                "vpa-post-processor.scalewise.dev/api_safetyMarginModifier".to_string(),
                "not json".to_string(),
            ),
            (
                "vpa-post-processor.scalewise.dev/replicaRestrictedRange".to_string(),
                "[100,10]".to_string(),
            ),
            ("unrelated/key".to_string(), "whatever".to_string()),
        ]);
        let bad = malformed_recommender_annotations(&annotations);
        assert_eq!(bad.len(), 2);
        assert!(bad.contains(&"vpa-post-processor.scalewise.dev/api_safetyMarginModifier".to_string()));
        assert!(bad.contains(&"vpa-post-processor.scalewise.dev/replicaRestrictedRange".to_string()));
    }
}
