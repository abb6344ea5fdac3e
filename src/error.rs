//! # Error Handling
//!
//! Errors in rxweave come in three flavours and are kept apart on purpose:
//!
//! - **Item-level errors** travel through the pipeline as error
//!   [`Item`](crate::item::Item)s and end up in the subscriber's `on_error`.
//!   [`ErrorStrategy`] decides whether built-in operators keep going after one.
//! - **Cancellation** is a cooperative shutdown signal, never an error item.
//!   Inside a stage it shows up as [`SendError::Canceled`] when a write is
//!   abandoned.
//! - **Pipeline errors** ([`PipelineError`]) are assembly or supervision
//!   failures: invalid configuration, or a task that panicked.
//!
//! Serialization hooks fail with [`MarshalError`] / [`UnmarshalError`]; the
//! stage that invoked them converts those into error items.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error used as the source of serialization failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// How built-in operators react to an error item.
///
/// The operator driver itself never filters errors; this policy is applied by
/// the operators shipped in [`crate::operators`].
///
/// # Example
///
/// ```rust
/// use rxweave::error::ErrorStrategy;
///
/// assert_eq!(ErrorStrategy::default(), ErrorStrategy::Continue);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
  /// Forward the error item downstream and keep processing.
  #[default]
  Continue,
  /// Forward the first error item downstream, then stop the stage.
  Stop,
}

/// Errors raised while assembling or supervising a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
  /// A configuration value is out of range.
  #[error("invalid pipeline configuration: {0}")]
  InvalidConfig(String),

  /// A configuration document could not be parsed.
  #[error("failed to parse pipeline configuration: {0}")]
  ConfigParse(#[from] serde_json::Error),

  /// A stage, worker or subscriber task panicked.
  #[error("task '{task}' panicked: {message}")]
  Panicked {
    /// Name of the task that panicked.
    task: String,
    /// Panic payload rendered as text, when it was a string.
    message: String,
  },
}

/// Why a write to a [`Sink`](crate::sink::Sink) was abandoned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
  /// The cancellation context fired while the write was pending.
  #[error("pipeline canceled")]
  Canceled,
  /// The downstream receiver is gone.
  #[error("downstream closed")]
  Closed,
}

/// A value could not be encoded to bytes.
#[derive(Error, Debug)]
#[error("marshal failed: {source}")]
pub struct MarshalError {
  #[source]
  source: BoxError,
}

impl MarshalError {
  /// Wraps the underlying encoder error.
  pub fn new<E>(source: E) -> Self
  where
    E: Into<BoxError>,
  {
    Self {
      source: source.into(),
    }
  }
}

/// Bytes could not be decoded into a value.
#[derive(Error, Debug)]
#[error("unmarshal failed: {source}")]
pub struct UnmarshalError {
  #[source]
  source: BoxError,
}

impl UnmarshalError {
  /// Wraps the underlying decoder error.
  pub fn new<E>(source: E) -> Self
  where
    E: Into<BoxError>,
  {
    Self {
      source: source.into(),
    }
  }
}

/// A simple error type that wraps a string message.
///
/// Handy for turning plain messages into error items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringError(pub String);

impl std::fmt::Display for StringError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl StdError for StringError {}

impl From<&str> for StringError {
  fn from(message: &str) -> Self {
    StringError(message.to_string())
  }
}

/// Renders a task panic payload for [`PipelineError::Panicked`].
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_strategy_serde_names() {
    let json = serde_json::to_string(&ErrorStrategy::Stop).unwrap();
    assert_eq!(json, "\"stop\"");
    let parsed: ErrorStrategy = serde_json::from_str("\"continue\"").unwrap();
    assert_eq!(parsed, ErrorStrategy::Continue);
  }

  #[test]
  fn test_marshal_error_keeps_source() {
    let err = MarshalError::new(StringError("cyclic value".to_string()));
    assert_eq!(err.to_string(), "marshal failed: cyclic value");
    assert!(err.source().is_some());
  }

  #[test]
  fn test_unmarshal_error_from_str() {
    let err = UnmarshalError::new("truncated frame");
    assert_eq!(err.to_string(), "unmarshal failed: truncated frame");
  }

  #[test]
  fn test_panic_message_variants() {
    let static_payload: Box<dyn std::any::Any + Send> = Box::new("static");
    let owned_payload: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
    let other_payload: Box<dyn std::any::Any + Send> = Box::new(5u8);
    assert_eq!(panic_message(static_payload.as_ref()), "static");
    assert_eq!(panic_message(owned_payload.as_ref()), "owned");
    assert_eq!(
      panic_message(other_payload.as_ref()),
      "non-string panic payload"
    );
  }
}
