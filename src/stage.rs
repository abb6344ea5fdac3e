//! # Stage Contract
//!
//! A [`Stage`] reads items from an upstream channel, writes items through a
//! [`Sink`], and watches a cancellation token. Every operator, source adapter
//! and fan-out pool plugs into the pipeline through this contract.
//!
//! Most stages are not written by hand. The [`Operator`](crate::driver::Operator)
//! driver turns an [`ItemHandler`] (called once per item) and an
//! [`EndHandler`] (called once when upstream is exhausted) into a stage and
//! takes care of cancellation, early stop and closing the downstream channel.
//!
//! ## Roles
//!
//! | Trait | Called with | Purpose |
//! |---|---|---|
//! | [`Stage`] | token, upstream, sink | whole-stage logic |
//! | [`ItemHandler`] | item, sink, stop | per-item logic |
//! | [`EndHandler`] | sink | flush trailing output |
//! | [`Predicate`] | `&T` | keep or discard a value |
//! | [`Func`] | `T` | fallible value transformation |

use crate::error::SendError;
use crate::item::{Item, ItemError};
use crate::sink::Sink;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Receiving half of the channel between two stages.
pub type Upstream<T> = mpsc::Receiver<Item<T>>;

/// A concurrently running unit of pipeline work.
///
/// `run` must return once upstream is exhausted or `ctx` is canceled. The
/// downstream channel closes when `downstream` (and every clone of it) is
/// dropped, so returning is enough to signal end-of-stream.
#[async_trait]
pub trait Stage<I, O>: Send + 'static
where
  I: Send + 'static,
  O: Send + 'static,
{
  /// Runs the stage to completion.
  async fn run(self, ctx: CancellationToken, upstream: Upstream<I>, downstream: Sink<O>);

  /// Name used in logs and metrics when the pipeline does not override it.
  fn name(&self) -> &str {
    "stage"
  }
}

/// Per-item logic of an operator.
///
/// Errors are handed over like values; it is up to the handler to forward,
/// swallow or recover them. Returning `Err` means a write was abandoned
/// because the pipeline was canceled or the consumer went away, and ends the
/// stage.
#[async_trait]
pub trait ItemHandler<I, O>: Send + 'static
where
  I: Send + 'static,
  O: Send + 'static,
{
  /// Handles one upstream item.
  async fn on_item(
    &mut self,
    item: Item<I>,
    sink: &Sink<O>,
    stop: &StopToken,
  ) -> Result<(), SendError>;
}

/// End-of-stream logic of an operator.
///
/// Called exactly once, only when upstream was exhausted normally. It is not
/// called after cancellation or after the handler requested a stop.
#[async_trait]
pub trait EndHandler<O>: Send + 'static
where
  O: Send + 'static,
{
  /// Flushes trailing output, e.g. an aggregate.
  async fn on_end(&mut self, sink: &Sink<O>) -> Result<(), SendError>;
}

/// End handler that emits nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnd;

#[async_trait]
impl<O: Send + 'static> EndHandler<O> for NoEnd {
  async fn on_end(&mut self, _sink: &Sink<O>) -> Result<(), SendError> {
    Ok(())
  }
}

/// Decides whether a value is kept.
pub trait Predicate<T>: Send + Sync + 'static {
  /// Returns `true` to keep `value`.
  fn test(&self, value: &T) -> bool;
}

impl<T, F> Predicate<T> for F
where
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn test(&self, value: &T) -> bool {
    self(value)
  }
}

/// Fallible value transformation.
///
/// An `Err` becomes an error item downstream. Use
/// [`item_error`](crate::item::item_error) to convert concrete errors.
pub trait Func<T, U>: Send + Sync + 'static {
  /// Transforms one value.
  fn call(&self, value: T) -> Result<U, ItemError>;
}

impl<T, U, F> Func<T, U> for F
where
  F: Fn(T) -> Result<U, ItemError> + Send + Sync + 'static,
{
  fn call(&self, value: T) -> Result<U, ItemError> {
    self(value)
  }
}

/// Single-use stop request scoped to one stage invocation.
///
/// It is a child of the pipeline token: canceling the pipeline also stops the
/// stage, but stopping the stage never cancels anything upstream or
/// downstream of it.
#[derive(Debug, Clone)]
pub struct StopToken {
  token: CancellationToken,
}

impl StopToken {
  /// Creates a stop token nested under `ctx`.
  pub fn child_of(ctx: &CancellationToken) -> Self {
    Self {
      token: ctx.child_token(),
    }
  }

  /// Requests that the stage finish after the current item.
  pub fn stop(&self) {
    self.token.cancel();
  }

  /// `true` once a stop was requested or the pipeline was canceled.
  pub fn is_stopped(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Resolves once a stop was requested or the pipeline was canceled.
  pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}
