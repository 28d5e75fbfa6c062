use std::collections::HashMap;

use super::snapshot::OperationSnapshot;
use super::tracker::{OperationTracker, TrackerConfig};

/// A named set of trackers with aggregate queries.
#[derive(Debug, Default)]
pub struct BatchTracker {
  trackers: HashMap<String, OperationTracker>,
  config: TrackerConfig,
}

impl BatchTracker {
  pub fn new(config: TrackerConfig) -> Self {
    Self {
      trackers: HashMap::new(),
      config,
    }
  }

  /// Register a tracker under `id`, replacing (and resetting) any previous
  /// one. Returns a handle to it.
  pub fn add(&mut self, id: impl Into<String>) -> OperationTracker {
    let tracker = OperationTracker::new(self.config);
    if let Some(previous) = self.trackers.insert(id.into(), tracker.clone()) {
      previous.reset();
    }
    tracker
  }

  pub fn get(&self, id: &str) -> Option<&OperationTracker> {
    self.trackers.get(id)
  }

  /// Set progress on one member. Unknown ids are ignored.
  pub fn update(&self, id: &str, progress: f64) {
    if let Some(tracker) = self.trackers.get(id) {
      tracker.set_progress(progress);
    }
  }

  /// Drop a member, resetting it first. Returns its last snapshot.
  pub fn remove(&mut self, id: &str) -> Option<OperationSnapshot> {
    self.trackers.remove(id).map(|tracker| {
      let last = tracker.snapshot();
      tracker.reset();
      last
    })
  }

  pub fn clear(&mut self) {
    for (_, tracker) in self.trackers.drain() {
      tracker.reset();
    }
  }

  pub fn len(&self) -> usize {
    self.trackers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.trackers.is_empty()
  }

  pub fn is_any_loading(&self) -> bool {
    self.trackers.values().any(|t| t.snapshot().is_loading())
  }

  /// Mean progress across members, 0 when empty.
  pub fn overall_progress(&self) -> f64 {
    if self.trackers.is_empty() {
      return 0.0;
    }
    let total: f64 = self.trackers.values().map(|t| t.snapshot().progress).sum();
    total / self.trackers.len() as f64
  }

  /// Snapshots of every member, sorted by id.
  pub fn snapshots(&self) -> Vec<(String, OperationSnapshot)> {
    let mut all: Vec<_> = self
      .trackers
      .iter()
      .map(|(id, t)| (id.clone(), t.snapshot()))
      .collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    all
  }
}
