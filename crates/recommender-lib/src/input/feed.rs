//! Change feeds into the recommender
//!
//! Informer-style watchers live outside the core; they publish VPA and pod
//! events into a lock-protected feed that the loop reads as an atomic
//! snapshot at iteration start. OOM events ride a bounded channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::model::{OomEvent, PodId, PodSpec, VpaId, VpaSpec};

/// A change event on one of the object feeds.
#[derive(Debug, Clone)]
pub enum FeedEvent<T, I> {
    Added(T),
    Updated(T),
    Deleted(I),
}

/// Everything the feeds currently know, taken atomically.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    pub vpas: Vec<VpaSpec>,
    pub pods: Vec<PodSpec>,
}

#[derive(Default)]
struct FeedState {
    vpas: HashMap<VpaId, VpaSpec>,
    pods: HashMap<PodId, PodSpec>,
}

/// Sender half of the OOM event stream.
pub type OomSender = mpsc::Sender<OomEvent>;

/// Lock-protected aggregation point for the watcher tasks. One coarse
/// mutex is enough: writers touch single entries, the loop reads a clone.
pub struct ClusterFeed {
    state: Mutex<FeedState>,
}

impl ClusterFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FeedState::default()),
        })
    }

    pub fn apply_vpa_event(&self, event: FeedEvent<VpaSpec, VpaId>) {
        let mut state = self.state.lock().expect("feed lock poisoned");
        match event {
            FeedEvent::Added(spec) | FeedEvent::Updated(spec) => {
                state.vpas.insert(spec.id.clone(), spec);
            }
            FeedEvent::Deleted(id) => {
                state.vpas.remove(&id);
            }
        }
    }

    pub fn apply_pod_event(&self, event: FeedEvent<PodSpec, PodId>) {
        let mut state = self.state.lock().expect("feed lock poisoned");
        match event {
            FeedEvent::Added(spec) | FeedEvent::Updated(spec) => {
                state.pods.insert(spec.id.clone(), spec);
            }
            FeedEvent::Deleted(id) => {
                state.pods.remove(&id);
            }
        }
    }

    /// Replaces both feeds wholesale. Used by poll-based watchers that
    /// re-list instead of streaming deltas.
    pub fn replace(&self, snapshot: FeedSnapshot) {
        let mut state = self.state.lock().expect("feed lock poisoned");
        state.vpas = snapshot
            .vpas
            .into_iter()
            .map(|v| (v.id.clone(), v))
            .collect();
        state.pods = snapshot
            .pods
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
    }

    /// The current state of both feeds, observed atomically.
    pub fn snapshot(&self) -> FeedSnapshot {
        let state = self.state.lock().expect("feed lock poisoned");
        FeedSnapshot {
            vpas: state.vpas.values().cloned().collect(),
            pods: state.pods.values().cloned().collect(),
        }
    }
}
