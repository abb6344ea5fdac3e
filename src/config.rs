//! # Pipeline Configuration
//!
//! [`PipelineConfig`] holds the settings every stage of a pipeline starts
//! from. [`StageOptions`] overrides a few of them for a single stage.
//!
//! Backpressure is chosen per pipeline and may be overridden per stage: a
//! lossy stage can sit in an otherwise lossless pipeline, and vice versa.
//!
//! ```rust
//! use rxweave::backpressure::BackpressureStrategy;
//! use rxweave::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json(r#"{ "buffer_capacity": 8, "backpressure": "drop" }"#)
//!   .unwrap();
//! assert_eq!(config.buffer_capacity, 8);
//! assert_eq!(config.backpressure, BackpressureStrategy::Drop);
//! assert_eq!(config.workers, 4);
//! ```

use crate::backpressure::BackpressureStrategy;
use crate::error::{ErrorStrategy, PipelineError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

/// Default capacity of the channel between two stages.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// Default worker count for parallel operators.
pub const DEFAULT_WORKERS: usize = 4;

/// Settings shared by every stage of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
  /// Capacity of each inter-stage channel. Must be greater than zero.
  pub buffer_capacity: usize,
  /// Write discipline for every stage without its own override.
  pub backpressure: BackpressureStrategy,
  /// How built-in operators react to error items.
  pub error_strategy: ErrorStrategy,
  /// Worker count for parallel operators. Must be greater than zero.
  pub workers: usize,
  /// Pipeline name attached to log lines.
  pub name: Option<String>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      buffer_capacity: DEFAULT_BUFFER_CAPACITY,
      backpressure: BackpressureStrategy::Block,
      error_strategy: ErrorStrategy::Continue,
      workers: DEFAULT_WORKERS,
      name: None,
    }
  }
}

impl PipelineConfig {
  /// Parses and validates a JSON configuration document. Missing fields
  /// take their defaults.
  ///
  /// # Errors
  ///
  /// [`PipelineError::ConfigParse`] for malformed JSON or unknown fields,
  /// [`PipelineError::InvalidConfig`] for out-of-range values.
  pub fn from_json(json: &str) -> Result<Self, PipelineError> {
    let config: PipelineConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Checks value ranges.
  ///
  /// # Errors
  ///
  /// [`PipelineError::InvalidConfig`] naming the first offending field.
  pub fn validate(&self) -> Result<(), PipelineError> {
    if self.buffer_capacity == 0 {
      return Err(PipelineError::InvalidConfig(
        "buffer_capacity must be greater than zero".to_string(),
      ));
    }
    if self.workers == 0 {
      return Err(PipelineError::InvalidConfig(
        "workers must be greater than zero".to_string(),
      ));
    }
    Ok(())
  }

  /// Sets the inter-stage channel capacity.
  #[must_use]
  pub fn with_buffer_capacity(mut self, capacity: NonZeroUsize) -> Self {
    self.buffer_capacity = capacity.get();
    self
  }

  /// Sets the default backpressure strategy.
  #[must_use]
  pub fn with_backpressure(mut self, strategy: BackpressureStrategy) -> Self {
    self.backpressure = strategy;
    self
  }

  /// Sets the error strategy for built-in operators.
  #[must_use]
  pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
    self.error_strategy = strategy;
    self
  }

  /// Sets the worker count for parallel operators.
  #[must_use]
  pub fn with_workers(mut self, workers: NonZeroUsize) -> Self {
    self.workers = workers.get();
    self
  }

  /// Sets the pipeline name.
  #[must_use]
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }
}

/// Per-stage overrides. Unset fields fall back to the [`PipelineConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOptions {
  /// Stage name for logs and metrics.
  pub name: Option<String>,
  /// Write discipline for this stage's output channel.
  pub backpressure: Option<BackpressureStrategy>,
  /// Capacity of this stage's output channel.
  pub buffer_capacity: Option<NonZeroUsize>,
}

impl StageOptions {
  /// Options with nothing overridden.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the stage name.
  #[must_use]
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Overrides the backpressure strategy.
  #[must_use]
  pub fn with_backpressure(mut self, strategy: BackpressureStrategy) -> Self {
    self.backpressure = Some(strategy);
    self
  }

  /// Overrides the output channel capacity.
  #[must_use]
  pub fn with_buffer_capacity(mut self, capacity: NonZeroUsize) -> Self {
    self.buffer_capacity = Some(capacity);
    self
  }

  /// Fields set in `self`, falling back to `earlier` for the rest.
  #[must_use]
  pub fn or(self, earlier: StageOptions) -> Self {
    Self {
      name: self.name.or(earlier.name),
      backpressure: self.backpressure.or(earlier.backpressure),
      buffer_capacity: self.buffer_capacity.or(earlier.buffer_capacity),
    }
  }

  /// Effective strategy and capacity under `config`.
  pub fn resolve(&self, config: &PipelineConfig) -> (BackpressureStrategy, usize) {
    let strategy = self.backpressure.unwrap_or(config.backpressure);
    let capacity = self
      .buffer_capacity
      .map_or(config.buffer_capacity, NonZeroUsize::get)
      .max(1);
    (strategy, capacity)
  }
}
