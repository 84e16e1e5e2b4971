//! Recommendation estimation
//!
//! Turns aggregated histograms (internal mode) or raw external resources
//! (external mode) into per-container recommended amounts.

mod estimator;
mod recommender;

pub use estimator::{ConfidenceParams, EstimatorConfig};
pub use recommender::{ExternalRecommender, HistogramRecommender};
