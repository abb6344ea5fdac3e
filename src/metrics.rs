//! Per-stage counters.
//!
//! Every stage owns a [`StageMetrics`]. The driver counts what it reads, the
//! sink counts what it delivers and what the Drop strategy discards. Counters
//! are relaxed atomics; snapshots are a consistent-enough view for tests and
//! dashboards, not a linearizable one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one stage.
#[derive(Debug, Default)]
pub struct StageMetrics {
  received: AtomicU64,
  emitted: AtomicU64,
  dropped: AtomicU64,
}

impl StageMetrics {
  /// Creates zeroed counters.
  pub fn new() -> Self {
    Self::default()
  }

  /// Counts one item read from upstream.
  pub fn record_received(&self) {
    self.received.fetch_add(1, Ordering::Relaxed);
  }

  /// Counts one item delivered downstream.
  pub fn record_emitted(&self) {
    self.emitted.fetch_add(1, Ordering::Relaxed);
  }

  /// Counts one item discarded by the Drop strategy.
  pub fn record_dropped(&self) {
    self.dropped.fetch_add(1, Ordering::Relaxed);
  }

  /// Items read from upstream so far.
  pub fn received(&self) -> u64 {
    self.received.load(Ordering::Relaxed)
  }

  /// Items delivered downstream so far.
  pub fn emitted(&self) -> u64 {
    self.emitted.load(Ordering::Relaxed)
  }

  /// Items discarded so far.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Takes a named point-in-time copy of the counters.
  pub fn snapshot(&self, stage: &str) -> MetricsSnapshot {
    MetricsSnapshot {
      stage: stage.to_string(),
      received: self.received(),
      emitted: self.emitted(),
      dropped: self.dropped(),
    }
  }
}

/// Point-in-time copy of a stage's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
  /// Stage name.
  pub stage: String,
  /// Items read from upstream.
  pub received: u64,
  /// Items delivered downstream.
  pub emitted: u64,
  /// Items discarded under the Drop strategy.
  pub dropped: u64,
}

/// Counters of every stage in one running pipeline, in assembly order.
///
/// Cheap to clone; clones observe the same counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
  stages: Arc<[(String, Arc<StageMetrics>)]>,
}

impl PipelineMetrics {
  pub(crate) fn from_stages(stages: Vec<(String, Arc<StageMetrics>)>) -> Self {
    Self {
      stages: stages.into(),
    }
  }

  /// Counters of the stage called `name`, if there is one.
  ///
  /// Stage names are not required to be unique; when several stages share
  /// `name` the most upstream one is returned.
  pub fn stage(&self, name: &str) -> Option<&StageMetrics> {
    self
      .stages
      .iter()
      .find(|(stage, _)| stage == name)
      .map(|(_, metrics)| metrics.as_ref())
  }

  /// Snapshots every stage, upstream first.
  pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
    self
      .stages
      .iter()
      .map(|(stage, metrics)| metrics.snapshot(stage))
      .collect()
  }

  /// Total items discarded across all stages.
  pub fn total_dropped(&self) -> u64 {
    self.stages.iter().map(|(_, m)| m.dropped()).sum()
  }
}
