//! Weight-decaying usage histograms
//!
//! Aggregates CPU and memory samples into exponentially spaced buckets and
//! answers weighted percentile queries. Sample weights decay with a
//! configurable half-life so old usage fades out of the recommendation.
//! Histograms are restartable: a checkpoint fully determines future
//! percentiles for the same inputs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{RecommenderError, Result};

/// Decay exponents past this are folded into the reference timestamp to
/// keep bucket weights inside f64 range.
const MAX_DECAY_EXPONENT: f64 = 100.0;

/// Largest integer weight written into a checkpoint bucket.
const MAX_CHECKPOINT_WEIGHT: f64 = 10_000.0;

/// Bucket layout: boundary(i) = first * ratio^i. Values below the first
/// boundary land in bucket 0, values past the last in the final bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramOptions {
    num_buckets: usize,
    first_bucket: f64,
    ratio: f64,
    epsilon: f64,
}

impl HistogramOptions {
    /// Exponential layout covering [min_value, max_value].
    pub fn exponential(min_value: f64, max_value: f64, ratio: f64, epsilon: f64) -> Result<Self> {
        if min_value <= 0.0 || max_value <= min_value || ratio <= 1.0 || epsilon <= 0.0 {
            return Err(RecommenderError::InvalidArgument(format!(
                "invalid histogram layout: min={} max={} ratio={} epsilon={}",
                min_value, max_value, ratio, epsilon
            )));
        }
        let num_buckets = ((max_value / min_value).ln() / ratio.ln()).ceil() as usize + 1;
        Ok(Self {
            num_buckets,
            first_bucket: min_value,
            ratio,
            epsilon,
        })
    }

    /// CPU layout: 0.01 core to 1000 cores, 5% relative bucket error.
    pub fn cpu() -> Self {
        Self::exponential(0.01, 1000.0, 1.05, 1e-4).expect("static cpu layout is valid")
    }

    /// Memory layout: 10 MiB to 1 TiB, 5% relative bucket error.
    pub fn memory() -> Self {
        Self::exponential(10.0 * 1024.0 * 1024.0, 1024.0 * 1024.0 * 1024.0 * 1024.0, 1.05, 1e-4)
            .expect("static memory layout is valid")
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    fn find_bucket(&self, value: f64) -> usize {
        if value < self.first_bucket {
            return 0;
        }
        let bucket = ((value / self.first_bucket).ln() / self.ratio.ln()).floor() as usize;
        bucket.min(self.num_buckets - 1)
    }

    fn bucket_start(&self, bucket: usize) -> f64 {
        self.first_bucket * self.ratio.powi(bucket as i32)
    }
}

/// A histogram whose sample weights halve every `half_life`.
///
/// Weights are stored relative to `reference_time`: a sample at time t is
/// added with weight `w * 2^((t - reference) / half_life)`, so percentile
/// queries never need to rescan buckets. When the exponent grows too large
/// the reference shifts forward and all weights rescale once.
#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    options: HistogramOptions,
    bucket_weights: Vec<f64>,
    total_weight: f64,
    min_bucket: usize,
    max_bucket: usize,
    half_life: Duration,
    reference_time: Option<DateTime<Utc>>,
}

impl DecayingHistogram {
    pub fn new(options: HistogramOptions, half_life: Duration) -> Self {
        let buckets = options.num_buckets;
        Self {
            options,
            bucket_weights: vec![0.0; buckets],
            total_weight: 0.0,
            min_bucket: buckets - 1,
            max_bucket: 0,
            half_life,
            reference_time: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_weight < self.options.epsilon
            || self.bucket_weights[self.max_bucket] < self.options.epsilon
    }

    /// Adds a weighted sample observed at `time`.
    pub fn add_sample(&mut self, value: f64, weight: f64, time: DateTime<Utc>) -> Result<()> {
        if value < 0.0 {
            return Err(RecommenderError::InvalidArgument(format!(
                "negative sample value {}",
                value
            )));
        }
        if weight <= 0.0 {
            return Err(RecommenderError::InvalidArgument(format!(
                "non-positive sample weight {}",
                weight
            )));
        }

        let decayed = weight * self.decay_factor(time);
        let bucket = self.options.find_bucket(value);
        self.bucket_weights[bucket] += decayed;
        self.total_weight += decayed;
        self.min_bucket = self.min_bucket.min(bucket);
        self.max_bucket = self.max_bucket.max(bucket);
        Ok(())
    }

    /// Relative weight of a sample at `time`, shifting the reference
    /// forward first when the exponent would overflow.
    fn decay_factor(&mut self, time: DateTime<Utc>) -> f64 {
        let reference = match self.reference_time {
            Some(r) => r,
            None => {
                self.reference_time = Some(time);
                return 1.0;
            }
        };
        let mut exponent = self.half_lives_between(reference, time);
        if exponent > MAX_DECAY_EXPONENT {
            let shift_halves = (exponent - MAX_DECAY_EXPONENT / 2.0).ceil();
            self.shift_reference(shift_halves);
            exponent -= shift_halves;
        }
        2f64.powf(exponent)
    }

    fn half_lives_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let elapsed = (to - from).num_milliseconds() as f64;
        elapsed / self.half_life.num_milliseconds() as f64
    }

    /// Moves the reference forward by whole half-lives and rescales every
    /// bucket so relative weights are preserved.
    fn shift_reference(&mut self, half_lives: f64) {
        let scale = 2f64.powf(-half_lives);
        self.total_weight = 0.0;
        for weight in &mut self.bucket_weights {
            *weight *= scale;
            if *weight < self.options.epsilon {
                *weight = 0.0;
            }
            self.total_weight += *weight;
        }
        if let Some(reference) = self.reference_time {
            let shift_ms = (half_lives * self.half_life.num_milliseconds() as f64) as i64;
            self.reference_time = Some(reference + Duration::milliseconds(shift_ms));
        }
        self.recompute_extent();
    }

    fn recompute_extent(&mut self) {
        self.min_bucket = self.bucket_weights.len() - 1;
        self.max_bucket = 0;
        for (i, w) in self.bucket_weights.iter().enumerate() {
            if *w >= self.options.epsilon {
                self.min_bucket = self.min_bucket.min(i);
                self.max_bucket = self.max_bucket.max(i);
            }
        }
    }

    /// Value at the weighted percentile p in [0, 1]. An empty histogram
    /// yields 0.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile.clamp(0.0, 1.0) * self.total_weight;
        let mut partial = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial += self.bucket_weights[bucket];
            if partial >= threshold {
                break;
            }
            bucket += 1;
        }
        // Report the upper boundary of the matched bucket.
        if bucket + 1 < self.options.num_buckets {
            self.options.bucket_start(bucket + 1)
        } else {
            self.options.bucket_start(bucket)
        }
    }

    /// Merges another histogram into this one, aligning decay references so
    /// time semantics carry over.
    pub fn merge(&mut self, other: &DecayingHistogram) -> Result<()> {
        if self.options != other.options || self.half_life != other.half_life {
            return Err(RecommenderError::InvalidArgument(
                "cannot merge histograms with different layouts".to_string(),
            ));
        }
        let (Some(self_ref), Some(other_ref)) = (self.reference_time, other.reference_time) else {
            if other.reference_time.is_some() {
                *self = other.clone();
            }
            return Ok(());
        };
        let mut reference = self_ref;
        if other_ref > self_ref {
            self.shift_reference(self.half_lives_between(self_ref, other_ref));
            reference = other_ref;
        }
        // Weights on the other side decay forward onto our reference.
        let scale = 2f64.powf(self.half_lives_between(reference, other_ref));
        for (i, w) in other.bucket_weights.iter().enumerate() {
            let added = w * scale;
            if added > 0.0 {
                self.bucket_weights[i] += added;
                self.total_weight += added;
                self.min_bucket = self.min_bucket.min(i);
                self.max_bucket = self.max_bucket.max(i);
            }
        }
        Ok(())
    }

    /// Serializable snapshot: bucket weights normalized to an integer grid
    /// so the blob stays small and stable.
    pub fn checkpoint(&self) -> HistogramCheckpoint {
        let mut buckets = BTreeMap::new();
        let max_weight = self
            .bucket_weights
            .iter()
            .cloned()
            .fold(0.0f64, f64::max);
        if max_weight > 0.0 {
            let ratio = MAX_CHECKPOINT_WEIGHT / max_weight;
            for (i, w) in self.bucket_weights.iter().enumerate() {
                let normalized = (w * ratio).round() as u32;
                if normalized > 0 {
                    buckets.insert(i, normalized);
                }
            }
        }
        HistogramCheckpoint {
            total_weight: self.total_weight,
            bucket_weights: buckets,
            reference_time: self.reference_time,
        }
    }

    /// Restores bucket weights from a checkpoint; percentiles after the
    /// round trip match the original within the normalization grid.
    pub fn load_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> Result<()> {
        if checkpoint.total_weight < 0.0 {
            return Err(RecommenderError::InvalidArgument(format!(
                "negative total weight {} in checkpoint",
                checkpoint.total_weight
            )));
        }
        let sum: u64 = checkpoint.bucket_weights.values().map(|w| *w as u64).sum();
        self.bucket_weights = vec![0.0; self.options.num_buckets];
        self.total_weight = 0.0;
        if sum > 0 {
            for (bucket, weight) in &checkpoint.bucket_weights {
                if *bucket >= self.options.num_buckets {
                    return Err(RecommenderError::InvalidArgument(format!(
                        "checkpoint bucket {} out of range",
                        bucket
                    )));
                }
                let restored = *weight as f64 / sum as f64 * checkpoint.total_weight;
                self.bucket_weights[*bucket] = restored;
                self.total_weight += restored;
            }
        }
        self.reference_time = checkpoint.reference_time;
        self.recompute_extent();
        Ok(())
    }
}

/// Persisted form of a decaying histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramCheckpoint {
    pub total_weight: f64,
    #[serde(default)]
    pub bucket_weights: BTreeMap<usize, u32>,
    pub reference_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn cpu_histogram() -> DecayingHistogram {
        DecayingHistogram::new(HistogramOptions::cpu(), Duration::hours(24))
    }

    #[test]
    fn test_empty_percentile_is_zero() {
        let h = cpu_histogram();
        assert_eq!(h.percentile(0.5), 0.0);
        assert!(h.is_empty());
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let mut h = cpu_histogram();
        assert!(h.add_sample(-1.0, 1.0, t0()).is_err());
        assert!(h.add_sample(1.0, 0.0, t0()).is_err());
        assert!(h.add_sample(1.0, -2.0, t0()).is_err());
    }

    #[test]
    fn test_single_value_percentiles() {
        let mut h = cpu_histogram();
        for _ in 0..100 {
            h.add_sample(0.1, 1.0, t0()).unwrap();
        }
        // All mass in one bucket: every percentile reports its upper edge,
        // within one 5% bucket of the true value.
        let p50 = h.percentile(0.5);
        let p90 = h.percentile(0.9);
        assert_eq!(p50, p90);
        assert!(p90 >= 0.1 && p90 <= 0.11, "p90={}", p90);
    }

    #[test]
    fn test_percentile_ordering() {
        let mut h = cpu_histogram();
        for i in 1..=100 {
            h.add_sample(i as f64 / 100.0, 1.0, t0()).unwrap();
        }
        let p50 = h.percentile(0.5);
        let p90 = h.percentile(0.9);
        let p99 = h.percentile(0.99);
        assert!(p50 <= p90 && p90 <= p99);
        assert!(p50 >= 0.45 && p50 <= 0.60, "p50={}", p50);
        assert!(p90 >= 0.85 && p90 <= 1.0, "p90={}", p90);
    }

    #[test]
    fn test_decay_prefers_recent_samples() {
        let mut h = cpu_histogram();
        // Old heavy usage at 1.0 cores, then two days of idle at 0.05.
        for _ in 0..100 {
            h.add_sample(1.0, 1.0, t0()).unwrap();
        }
        let later = t0() + Duration::hours(96);
        for _ in 0..100 {
            h.add_sample(0.05, 1.0, later).unwrap();
        }
        // 96h = 4 half-lives: the old samples carry 1/16 the weight.
        let p50 = h.percentile(0.5);
        assert!(p50 < 0.1, "p50={}", p50);
        let p99 = h.percentile(0.99);
        assert!(p99 >= 1.0, "p99={}", p99);
    }

    #[test]
    fn test_reference_shift_preserves_distribution() {
        let mut h = cpu_histogram();
        h.add_sample(0.2, 1.0, t0()).unwrap();
        let before = h.percentile(0.9);
        // Far enough in the future to force a reference shift.
        let far = t0() + Duration::days(24 * 150);
        h.add_sample(0.2, 1.0, far).unwrap();
        assert_eq!(h.percentile(0.9), before);
        assert!(h.total_weight.is_finite());
    }

    #[test]
    fn test_merge_matches_combined_history() {
        let mut a = cpu_histogram();
        let mut b = cpu_histogram();
        let mut combined = cpu_histogram();
        for i in 0..50 {
            let at = t0() + Duration::minutes(i);
            a.add_sample(0.1, 1.0, at).unwrap();
            combined.add_sample(0.1, 1.0, at).unwrap();
        }
        for i in 0..50 {
            let at = t0() + Duration::hours(30) + Duration::minutes(i);
            b.add_sample(0.8, 1.0, at).unwrap();
            combined.add_sample(0.8, 1.0, at).unwrap();
        }
        a.merge(&b).unwrap();
        for p in [0.1, 0.5, 0.9, 0.99] {
            let merged = a.percentile(p);
            let expected = combined.percentile(p);
            assert!(
                (merged - expected).abs() <= expected * 0.01,
                "p={}: merged={} expected={}",
                p,
                merged,
                expected
            );
        }
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut h = cpu_histogram();
        for i in 1..=200 {
            h.add_sample(0.02 * i as f64, 1.0, t0() + Duration::minutes(i)).unwrap();
        }
        let checkpoint = h.checkpoint();
        let mut restored = cpu_histogram();
        restored.load_checkpoint(&checkpoint).unwrap();
        for p in [0.05, 0.5, 0.9, 0.95, 0.99] {
            let orig = h.percentile(p);
            let round = restored.percentile(p);
            assert!(
                (orig - round).abs() <= orig * 0.01,
                "p={}: orig={} restored={}",
                p,
                orig,
                round
            );
        }
    }

    #[test]
    fn test_checkpoint_survives_serde() {
        let mut h = cpu_histogram();
        h.add_sample(0.5, 3.0, t0()).unwrap();
        let blob = serde_json::to_string(&h.checkpoint()).unwrap();
        let parsed: HistogramCheckpoint = serde_json::from_str(&blob).unwrap();
        let mut restored = cpu_histogram();
        restored.load_checkpoint(&parsed).unwrap();
        assert_eq!(restored.percentile(0.9), h.percentile(0.9));
    }

    #[test]
    fn test_rejects_out_of_range_checkpoint() {
        let checkpoint = HistogramCheckpoint {
            total_weight: 1.0,
            bucket_weights: BTreeMap::from([(100_000, 10u32)]),
            reference_time: None,
        };
        let mut h = cpu_histogram();
        assert!(h.load_checkpoint(&checkpoint).is_err());
    }
}
