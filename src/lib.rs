//! # rxweave
//!
//! Reactive stream pipelines in pure Rust, with explicit backpressure and
//! cooperative cancellation.
//!
//! A pipeline moves [`Item`](item::Item)s (values or errors) from a source
//! through a chain of concurrently running stages to a subscriber. Every link
//! is a bounded channel whose write discipline is a
//! [`BackpressureStrategy`](backpressure::BackpressureStrategy): *Block* never
//! loses an item, *Drop* sheds items when the consumer falls behind.
//!
//! ## Key Features
//!
//! - **Stage contract**: every operator is a [`Stage`](stage::Stage) built by
//!   the [`Operator`](driver::Operator) driver from per-item logic
//! - **Ordering**: linear chains preserve item order; fan-out via
//!   [`Scatter`](scatter::Scatter) explicitly does not
//! - **Exactly-once completion**: `on_complete` fires once, last, even when
//!   the pipeline is canceled mid-stream
//! - **Cancellation**: one shared token; no stage is left blocked on a write
//!
//! ## Quick Start
//!
//! ```rust
//! use rxweave::pipeline::Pipeline;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), rxweave::error::PipelineError> {
//! let out = Pipeline::from_iter(vec![1, 2, 3]).map(|x| x * 2).collect().await?;
//! assert_eq!(format!("{:?}", out), "[Value(2), Value(4), Value(6)]");
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Block and Drop write disciplines.
pub mod backpressure;
/// Marshaler and Unmarshaler hooks.
pub mod codec;
/// Pipeline and per-stage configuration.
pub mod config;
/// Operator driver turning item handlers into stages.
pub mod driver;
/// Error types and strategies.
pub mod error;
/// The unit of data flowing through a pipeline.
pub mod item;
/// Per-stage counters.
pub mod metrics;
/// Built-in item handlers.
pub mod operators;
/// Pipeline assembly API.
pub mod pipeline;
/// Fan-out of a producer across a worker pool.
pub mod scatter;
/// Backpressure-aware channel writer.
pub mod sink;
/// Pipeline sources.
pub mod source;
/// Stage contract and role traits.
pub mod stage;
/// Terminal consumers.
pub mod subscription;

pub use backpressure::BackpressureStrategy;
pub use error::{ErrorStrategy, PipelineError};
pub use item::{Item, ItemError};
pub use pipeline::Pipeline;
pub use subscription::{Subscriber, Subscription};
