//! Estimation parameters and shared post-estimation adjustments

use chrono::Duration;

use crate::model::{ResourceAmount, ResourceName, Resources};

/// Parameters of the time-dependent confidence multiplier
/// `(1 + multiplier / t)^exponent` with t in days of observed history.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceParams {
    pub multiplier: f64,
    pub exponent: f64,
}

impl ConfidenceParams {
    /// The multiplier for a history of the given length. Histories shorter
    /// than one minute are treated as one minute so the factor stays finite.
    pub fn factor(&self, history: Duration) -> f64 {
        let days = (history.num_seconds() as f64 / 86_400.0).max(1.0 / (24.0 * 60.0));
        (1.0 + self.multiplier / days).powf(self.exponent)
    }
}

/// Tuning of the estimation pipeline, shared by both modes.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub target_percentile: f64,
    pub lower_bound_percentile: f64,
    pub upper_bound_percentile: f64,
    /// Shrinks the lower bound while history is sparse.
    pub confidence_lower: ConfidenceParams,
    /// Inflates the upper bound while history is sparse.
    pub confidence_upper: ConfidenceParams,
    /// Multiplicative cushion on every estimated amount.
    pub safety_margin_factor: f64,
    /// Per-pod floors, split evenly across the pod's containers.
    pub pod_min_cpu_millicores: i64,
    pub pod_min_memory_mb: i64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            target_percentile: 0.90,
            lower_bound_percentile: 0.50,
            upper_bound_percentile: 0.95,
            confidence_lower: ConfidenceParams {
                multiplier: 0.001,
                exponent: -2.0,
            },
            confidence_upper: ConfidenceParams {
                multiplier: 1.0,
                exponent: 1.0,
            },
            safety_margin_factor: 1.15,
            pod_min_cpu_millicores: 25,
            pod_min_memory_mb: 250,
        }
    }
}

impl EstimatorConfig {
    /// Per-container minimum amounts given how many containers share the
    /// pod-level floor.
    pub fn min_resources(&self, container_count: usize) -> Resources {
        let fraction = 1.0 / container_count.max(1) as f64;
        Resources::from([
            (
                ResourceName::Cpu,
                (self.pod_min_cpu_millicores as f64 * fraction).round() as ResourceAmount,
            ),
            (
                ResourceName::Memory,
                (self.pod_min_memory_mb as f64 * 1024.0 * 1024.0 * fraction).round()
                    as ResourceAmount,
            ),
        ])
    }

    /// Applies the safety margin and the per-container floors in place.
    pub fn adjust(&self, resources: &mut Resources, minimums: &Resources) {
        for (resource, amount) in resources.iter_mut() {
            let with_margin = (*amount as f64 * self.safety_margin_factor).round() as i64;
            let floor = minimums.get(resource).copied().unwrap_or(0);
            *amount = with_margin.max(floor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_factor_converges_to_one() {
        let upper = ConfidenceParams {
            multiplier: 1.0,
            exponent: 1.0,
        };
        let sparse = upper.factor(Duration::hours(1));
        let rich = upper.factor(Duration::days(30));
        assert!(sparse > rich);
        assert!((rich - 1.0).abs() < 0.05, "rich={}", rich);

        let lower = ConfidenceParams {
            multiplier: 0.001,
            exponent: -2.0,
        };
        assert!(lower.factor(Duration::hours(1)) < 1.0);
        assert!((lower.factor(Duration::days(30)) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_confidence_factor_finite_for_empty_history() {
        let upper = ConfidenceParams {
            multiplier: 1.0,
            exponent: 1.0,
        };
        assert!(upper.factor(Duration::zero()).is_finite());
    }

    #[test]
    fn test_min_resources_split_across_containers() {
        let config = EstimatorConfig {
            pod_min_cpu_millicores: 100,
            pod_min_memory_mb: 200,
            ..Default::default()
        };
        let minimums = config.min_resources(4);
        assert_eq!(minimums[&ResourceName::Cpu], 25);
        assert_eq!(minimums[&ResourceName::Memory], 50 * 1024 * 1024);
    }

    #[test]
    fn test_adjust_applies_margin_then_floor() {
        let config = EstimatorConfig {
            safety_margin_factor: 1.10,
            ..Default::default()
        };
        let minimums = Resources::from([(ResourceName::Cpu, 500)]);
        let mut resources = Resources::from([(ResourceName::Cpu, 100)]);
        config.adjust(&mut resources, &minimums);
        // 100 * 1.1 = 110, floored to 500.
        assert_eq!(resources[&ResourceName::Cpu], 500);

        let mut big = Resources::from([(ResourceName::Cpu, 1000)]);
        config.adjust(&mut big, &minimums);
        assert_eq!(big[&ResourceName::Cpu], 1100);
    }
}
