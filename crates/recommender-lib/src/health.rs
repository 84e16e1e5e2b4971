//! Health tracking for the recommender process
//!
//! Components report their status into a shared registry backing the
//! liveness and readiness probes. The registry also tracks the last
//! successful loop iteration; a stale timestamp degrades the whole
//! process even when no component reported a failure outright.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Information about a component's health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            last_check_timestamp: Utc::now().timestamp(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            message: Some(message.into()),
            last_check_timestamp: Utc::now().timestamp(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: Some(message.into()),
            last_check_timestamp: Utc::now().timestamp(),
        }
    }
}

/// Overall health response served on the probe endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_iteration: Option<DateTime<Utc>>,
}

/// Component names used by the recommender.
pub mod components {
    pub const FEEDER: &str = "feeder";
    pub const METRICS_SOURCE: &str = "metrics_source";
    pub const RECOMMENDER_LOOP: &str = "recommender_loop";
    pub const STATUS_WRITER: &str = "status_writer";
    pub const CHECKPOINT_WRITER: &str = "checkpoint_writer";
}

struct HealthState {
    components: HashMap<String, ComponentHealth>,
    last_iteration: Option<DateTime<Utc>>,
}

/// Shared registry of component health.
#[derive(Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
    /// An iteration older than this degrades the process.
    staleness_threshold: Duration,
}

impl HealthRegistry {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(HealthState {
                components: HashMap::new(),
                last_iteration: None,
            })),
            staleness_threshold,
        }
    }

    pub async fn register(&self, name: &str) {
        let mut state = self.state.write().await;
        state
            .components
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    async fn update(&self, name: &str, health: ComponentHealth) {
        let mut state = self.state.write().await;
        state.components.insert(name.to_string(), health);
    }

    /// Marks a completed loop iteration. Loop-wide failures simply skip
    /// this call and the timestamp regresses into staleness.
    pub async fn record_iteration(&self, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.last_iteration = Some(at);
    }

    /// Overall health, degraded when the last iteration is stale.
    pub async fn health(&self, now: DateTime<Utc>) -> HealthResponse {
        let state = self.state.read().await;
        let mut status = ComponentStatus::Healthy;
        for health in state.components.values() {
            match health.status {
                ComponentStatus::Unhealthy => {
                    status = ComponentStatus::Unhealthy;
                    break;
                }
                ComponentStatus::Degraded => status = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        if status == ComponentStatus::Healthy {
            if let Some(last) = state.last_iteration {
                if now - last > self.staleness_threshold {
                    status = ComponentStatus::Degraded;
                }
            }
        }
        HealthResponse {
            status,
            components: state.components.clone(),
            last_iteration: state.last_iteration,
        }
    }

    /// Readiness: the loop has completed at least one iteration and no
    /// component is down.
    pub async fn ready(&self, now: DateTime<Utc>) -> bool {
        let health = self.health(now).await;
        health.last_iteration.is_some() && health.status != ComponentStatus::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HealthRegistry {
        HealthRegistry::new(Duration::minutes(2))
    }

    #[tokio::test]
    async fn test_initial_state_is_healthy_but_not_ready() {
        let r = registry();
        r.register(components::FEEDER).await;
        let now = Utc::now();
        assert_eq!(r.health(now).await.status, ComponentStatus::Healthy);
        assert!(!r.ready(now).await);
    }

    #[tokio::test]
    async fn test_unhealthy_component_dominates() {
        let r = registry();
        r.register(components::FEEDER).await;
        r.register(components::STATUS_WRITER).await;
        r.set_unhealthy(components::STATUS_WRITER, "write failed").await;
        let now = Utc::now();
        assert_eq!(r.health(now).await.status, ComponentStatus::Unhealthy);
        assert!(!r.ready(now).await);
    }

    #[tokio::test]
    async fn test_stale_iteration_degrades() {
        let r = registry();
        r.register(components::RECOMMENDER_LOOP).await;
        let now = Utc::now();
        r.record_iteration(now - Duration::minutes(5)).await;
        assert_eq!(r.health(now).await.status, ComponentStatus::Degraded);

        r.record_iteration(now).await;
        assert_eq!(r.health(now).await.status, ComponentStatus::Healthy);
        assert!(r.ready(now).await);
    }
}
