//! Backpressure strategies.
//!
//! A strategy decides what a stage does when the channel to the next stage is
//! full. It is chosen once, when the stage is wired, and never renegotiated.

use serde::{Deserialize, Serialize};

/// What a producer does when its downstream buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
  /// Suspend the writer until the consumer drains capacity. No item is lost.
  #[default]
  Block,
  /// Try to write without waiting; discard the item if there is no room.
  Drop,
}

impl BackpressureStrategy {
  /// Returns `true` for [`BackpressureStrategy::Drop`].
  pub fn is_lossy(self) -> bool {
    matches!(self, BackpressureStrategy::Drop)
  }
}

impl std::fmt::Display for BackpressureStrategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BackpressureStrategy::Block => write!(f, "block"),
      BackpressureStrategy::Drop => write!(f, "drop"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_is_block() {
    assert_eq!(BackpressureStrategy::default(), BackpressureStrategy::Block);
    assert!(!BackpressureStrategy::Block.is_lossy());
    assert!(BackpressureStrategy::Drop.is_lossy());
  }

  #[test]
  fn test_serde_round_names() {
    let parsed: BackpressureStrategy = serde_json::from_str("\"drop\"").unwrap();
    assert_eq!(parsed, BackpressureStrategy::Drop);
    assert_eq!(BackpressureStrategy::Block.to_string(), "block");
  }
}
