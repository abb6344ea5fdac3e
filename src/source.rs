//! # Sources
//!
//! A [`Source`] is the head of a pipeline. It writes items into the first
//! channel, observes cancellation, and returns when it is exhausted. The
//! pipeline closes the channel when `emit` returns.
//!
//! Connectors for files, sockets and the like live outside this crate and
//! plug in by implementing [`Source`].

use crate::error::SendError;
use crate::item::Item;
use crate::scatter::{Producer, Scatter};
use crate::sink::Sink;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Producer of the items that enter a pipeline.
#[async_trait]
pub trait Source<T>: Send + 'static
where
  T: Send + 'static,
{
  /// Writes every item into `sink`, stopping early once `ctx` fires.
  ///
  /// # Errors
  ///
  /// The [`SendError`] of the write that was abandoned.
  async fn emit(self, ctx: CancellationToken, sink: Sink<T>) -> Result<(), SendError>;

  /// Name used in logs and metrics.
  fn name(&self) -> &str {
    "source"
  }
}

/// Source over an iterator of items.
#[derive(Debug)]
pub struct IterSource<I> {
  iter: I,
}

impl<I> IterSource<I> {
  /// Wraps `iter`.
  pub fn new(iter: I) -> Self {
    Self { iter }
  }
}

#[async_trait]
impl<T, I> Source<T> for IterSource<I>
where
  T: Send + 'static,
  I: Iterator<Item = Item<T>> + Send + 'static,
{
  async fn emit(self, ctx: CancellationToken, sink: Sink<T>) -> Result<(), SendError> {
    for item in self.iter {
      if ctx.is_cancelled() {
        return Err(SendError::Canceled);
      }
      sink.send(item).await?;
    }
    Ok(())
  }

  fn name(&self) -> &str {
    "iter"
  }
}

/// Source over an asynchronous stream of items.
pub struct StreamSource<S> {
  stream: S,
}

impl<S> StreamSource<S> {
  /// Wraps `stream`.
  pub fn new(stream: S) -> Self {
    Self { stream }
  }
}

#[async_trait]
impl<T, S> Source<T> for StreamSource<S>
where
  T: Send + 'static,
  S: Stream<Item = Item<T>> + Send + 'static,
{
  async fn emit(self, ctx: CancellationToken, sink: Sink<T>) -> Result<(), SendError> {
    let mut stream = Box::pin(self.stream);
    loop {
      let next = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(SendError::Canceled),
        next = stream.next() => next,
      };
      match next {
        Some(item) => sink.send(item).await?,
        None => return Ok(()),
      }
    }
  }

  fn name(&self) -> &str {
    "stream"
  }
}

/// Source that fans a [`Producer`] out over a [`Scatter`] pool.
pub struct ScatterSource<P> {
  scatter: Scatter<P>,
}

impl<P> ScatterSource<P> {
  /// Wraps a configured pool.
  pub fn new(scatter: Scatter<P>) -> Self {
    Self { scatter }
  }
}

#[async_trait]
impl<T, P> Source<T> for ScatterSource<P>
where
  T: Send + 'static,
  P: Producer<T>,
{
  async fn emit(self, ctx: CancellationToken, sink: Sink<T>) -> Result<(), SendError> {
    let report = self.scatter.run(ctx, &sink).await;
    debug!(
      workers = report.workers,
      panicked = report.panicked,
      "scatter source exhausted"
    );
    Ok(())
  }

  fn name(&self) -> &str {
    "scatter"
  }
}
