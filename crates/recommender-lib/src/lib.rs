//! Recommender library for vertical pod autoscaling
//!
//! This crate provides the core functionality for:
//! - An in-memory cluster model with decaying usage histograms
//! - Pluggable metrics sources (resource metrics, external metrics, time series)
//! - Recommendation estimation with confidence scaling
//! - A post-processing chain (safety margins, ratios, replica guards, capping)
//! - The periodic recommender loop, status writing and checkpoints

pub mod annotations;
pub mod checkpoint;
pub mod error;
pub mod health;
pub mod histogram;
pub mod input;
pub mod logic;
pub mod model;
pub mod observability;
pub mod postprocess;
pub mod retry;
pub mod routines;
pub mod status;

pub use error::{RecommenderError, Result};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse};
pub use observability::RecommenderMetrics;
