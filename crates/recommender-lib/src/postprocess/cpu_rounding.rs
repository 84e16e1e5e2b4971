//! CPU integer rounding post-processor
//!
//! Opt-in via VPA annotations: `integerCpu = "true"` rounds the target CPU
//! up to the next whole core, `coreDivisor = "<n>"` to the next multiple
//! of n cores, and `ramPerCore = "<bytes>"` additionally couples memory to
//! the rounded core count, taking the higher of the CPU-implied and
//! memory-implied points on the line.

use tracing::warn;

use super::{PostProcessContext, RecommendationPostProcessor};
use crate::annotations::{
    CORE_DIVISOR_KEY, INTEGER_CPU_KEY, POST_PROCESSOR_PREFIX, RAM_PER_CORE_KEY,
};
use crate::model::{RecommendedPodResources, ResourceName, Resources, Vpa};

#[derive(Debug, Clone, Copy, Default)]
struct RoundingPolicy {
    integer_cpu: bool,
    core_divisor: Option<i64>,
    ram_per_core: Option<i64>,
}

fn read_policy(vpa: &Vpa) -> RoundingPolicy {
    let mut policy = RoundingPolicy::default();
    let get = |suffix: &str| {
        vpa.annotations
            .get(&format!("{}{}", POST_PROCESSOR_PREFIX, suffix))
    };
    policy.integer_cpu = get(INTEGER_CPU_KEY).map(|v| v == "true").unwrap_or(false);
    if let Some(value) = get(CORE_DIVISOR_KEY) {
        match value.parse::<i64>() {
            Ok(divisor) if divisor > 1 => policy.core_divisor = Some(divisor),
            _ => warn!(vpa = %vpa.id, value = %value, "Ignoring invalid core divisor"),
        }
    }
    if let Some(value) = get(RAM_PER_CORE_KEY) {
        match value.parse::<i64>() {
            Ok(bytes) if bytes > 0 => policy.ram_per_core = Some(bytes),
            _ => warn!(vpa = %vpa.id, value = %value, "Ignoring invalid ram per core"),
        }
    }
    policy
}

/// Rounds millicores up to the next whole core, then to the next divisor
/// multiple when one is configured.
fn round_cores(policy: RoundingPolicy, millicores: i64) -> i64 {
    let mut rounded = ((millicores + 999) / 1000) * 1000;
    if let Some(divisor) = policy.core_divisor {
        let divisor_millis = divisor * 1000;
        let modulus = rounded % divisor_millis;
        if modulus > 0 {
            rounded += divisor_millis - modulus;
        }
    }
    rounded
}

fn round_target(policy: RoundingPolicy, target: &mut Resources) {
    let cpu = target.get(&ResourceName::Cpu).copied();
    let memory = target.get(&ResourceName::Memory).copied();

    if let (Some(bytes_per_core), Some(cpu), Some(memory)) =
        (policy.ram_per_core, cpu, memory)
    {
        // Place the workload on the (cores, ram) line: whichever of CPU or
        // memory implies the higher core count wins, then both resources
        // are set from that point.
        let cpu_point = round_cores(policy, cpu);
        let memory_point = round_cores(policy, (memory / bytes_per_core) * 1000);
        let higher = cpu_point.max(memory_point);
        target.insert(ResourceName::Cpu, higher);
        target.insert(
            ResourceName::Memory,
            (higher as f64 / 1000.0 * bytes_per_core as f64) as i64,
        );
        return;
    }

    if let Some(cpu) = cpu {
        target.insert(ResourceName::Cpu, round_cores(policy, cpu));
    }
}

/// Rounds target CPU to whole cores for workloads that opt in.
pub struct CpuIntegerRoundingPostProcessor;

impl RecommendationPostProcessor for CpuIntegerRoundingPostProcessor {
    fn name(&self) -> &'static str {
        "cpu-integer-rounding"
    }

    fn process(
        &self,
        ctx: &PostProcessContext<'_>,
        mut recommendation: RecommendedPodResources,
    ) -> RecommendedPodResources {
        let policy = read_policy(ctx.vpa);
        if !policy.integer_cpu {
            return recommendation;
        }
        for container in &mut recommendation.container_recommendations {
            round_target(policy, &mut container.target);
        }
        recommendation
    }
}
