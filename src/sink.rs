//! # Backpressure-aware Sink
//!
//! [`Sink`] is the only way a stage writes downstream. It binds the sending
//! half of a bounded channel to a [`BackpressureStrategy`] and to the
//! pipeline's cancellation token:
//!
//! - **Block**: `send` waits for capacity. The wait races the cancellation
//!   token, so a canceled pipeline never leaves a writer parked forever. A
//!   receiver that goes away also ends the wait.
//! - **Drop**: `send` tries once. A full channel discards the item, counts it
//!   in [`StageMetrics`] and reports success after yielding to the scheduler.
//!
//! Dropping every clone of a sink closes the channel, which is how stages
//! signal end-of-stream to the next stage.

use crate::backpressure::BackpressureStrategy;
use crate::error::SendError;
use crate::item::Item;
use crate::metrics::StageMetrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Strategy-bound writer for the channel feeding the next stage.
#[derive(Debug)]
pub struct Sink<T> {
  tx: mpsc::Sender<Item<T>>,
  strategy: BackpressureStrategy,
  cancel: CancellationToken,
  metrics: Arc<StageMetrics>,
}

impl<T> Clone for Sink<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      strategy: self.strategy,
      cancel: self.cancel.clone(),
      metrics: Arc::clone(&self.metrics),
    }
  }
}

impl<T: Send> Sink<T> {
  /// Binds `tx` to a strategy and a cancellation token.
  pub fn new(
    tx: mpsc::Sender<Item<T>>,
    strategy: BackpressureStrategy,
    cancel: CancellationToken,
  ) -> Self {
    Self::with_metrics(tx, strategy, cancel, Arc::new(StageMetrics::new()))
  }

  /// Like [`new`](Self::new) but records into existing counters.
  pub fn with_metrics(
    tx: mpsc::Sender<Item<T>>,
    strategy: BackpressureStrategy,
    cancel: CancellationToken,
    metrics: Arc<StageMetrics>,
  ) -> Self {
    Self {
      tx,
      strategy,
      cancel,
      metrics,
    }
  }

  /// Writes one item according to the strategy.
  ///
  /// # Errors
  ///
  /// - [`SendError::Canceled`] if the token fired before the write completed
  ///   (checked before any attempt, and raced against a Block wait).
  /// - [`SendError::Closed`] if the receiver is gone.
  ///
  /// An item discarded under Drop is not an error.
  ///
  /// # Example
  ///
  /// ```rust
  /// use rxweave::backpressure::BackpressureStrategy;
  /// use rxweave::item::Item;
  /// use rxweave::sink::Sink;
  /// use tokio::sync::mpsc;
  /// use tokio_util::sync::CancellationToken;
  ///
  /// # #[tokio::main]
  /// # async fn main() {
  /// let (tx, mut rx) = mpsc::channel(1);
  /// let sink = Sink::new(tx, BackpressureStrategy::Drop, CancellationToken::new());
  /// sink.send(Item::from_value(1)).await.unwrap();
  /// // full: discarded and counted
  /// sink.send(Item::from_value(2)).await.unwrap();
  ///
  /// assert_eq!(sink.metrics().dropped(), 1);
  /// assert_eq!(rx.recv().await.and_then(|i| i.into_result().ok()), Some(1));
  /// # }
  /// ```
  pub async fn send(&self, item: Item<T>) -> Result<(), SendError> {
    if self.cancel.is_cancelled() {
      return Err(SendError::Canceled);
    }

    match self.strategy {
      BackpressureStrategy::Block => {
        tokio::select! {
          biased;
          _ = self.cancel.cancelled() => Err(SendError::Canceled),
          sent = self.tx.send(item) => match sent {
            Ok(()) => {
              self.metrics.record_emitted();
              Ok(())
            }
            Err(_) => Err(SendError::Closed),
          },
        }
      }
      BackpressureStrategy::Drop => match self.tx.try_send(item) {
        Ok(()) => {
          self.metrics.record_emitted();
          Ok(())
        }
        Err(TrySendError::Full(_)) => {
          trace!("downstream full, dropping item");
          self.metrics.record_dropped();
          // a writer that only ever drops would otherwise never yield
          tokio::task::yield_now().await;
          Ok(())
        }
        Err(TrySendError::Closed(_)) => Err(SendError::Closed),
      },
    }
  }

  /// Writes a value item.
  pub async fn send_value(&self, value: T) -> Result<(), SendError> {
    self.send(Item::from_value(value)).await
  }

  /// Writes an error item.
  pub async fn send_error<E>(&self, error: E) -> Result<(), SendError>
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    self.send(Item::from_error(error)).await
  }

  /// The strategy this sink was built with.
  pub fn strategy(&self) -> BackpressureStrategy {
    self.strategy
  }

  /// `true` once the downstream receiver has been dropped.
  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// The cancellation token writes race against.
  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Counters shared with the owning stage.
  pub fn metrics(&self) -> &Arc<StageMetrics> {
    &self.metrics
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::StringError;
  use std::time::Duration;

  #[tokio::test]
  async fn test_block_waits_for_capacity() {
    let (tx, mut rx) = mpsc::channel(1);
    let sink = Sink::new(tx, BackpressureStrategy::Block, CancellationToken::new());

    sink.send_value(1).await.unwrap();

    let writer = {
      let sink = sink.clone();
      tokio::spawn(async move { sink.send_value(2).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!writer.is_finished());

    assert_eq!(rx.recv().await.unwrap().value(), Some(&1));
    writer.await.unwrap().unwrap();
    assert_eq!(rx.recv().await.unwrap().value(), Some(&2));
    assert_eq!(sink.metrics().emitted(), 2);
  }

  #[tokio::test]
  async fn test_block_wait_is_cancellable() {
    let (tx, _rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let sink = Sink::new(tx, BackpressureStrategy::Block, cancel.clone());
    sink.send_value(1).await.unwrap();

    let writer = {
      let sink = sink.clone();
      tokio::spawn(async move { sink.send_value(2).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), writer)
      .await
      .expect("writer stayed blocked after cancellation")
      .unwrap();
    assert_eq!(result, Err(SendError::Canceled));
  }

  #[tokio::test]
  async fn test_block_reports_closed_receiver() {
    let (tx, rx) = mpsc::channel(1);
    let sink = Sink::new(tx, BackpressureStrategy::Block, CancellationToken::new());
    drop(rx);
    assert!(sink.is_closed());
    assert_eq!(sink.send_value(1).await, Err(SendError::Closed));
  }

  #[tokio::test]
  async fn test_drop_discards_when_full() {
    let (tx, mut rx) = mpsc::channel(2);
    let sink = Sink::new(tx, BackpressureStrategy::Drop, CancellationToken::new());

    for i in 0..5 {
      sink.send_value(i).await.unwrap();
    }

    assert_eq!(rx.recv().await.unwrap().value(), Some(&0));
    assert_eq!(rx.recv().await.unwrap().value(), Some(&1));
    assert!(rx.try_recv().is_err());
    assert_eq!(sink.metrics().emitted(), 2);
    assert_eq!(sink.metrics().dropped(), 3);
  }

  #[tokio::test]
  async fn test_canceled_sink_refuses_writes() {
    let (tx, mut rx) = mpsc::channel::<Item<i32>>(4);
    let cancel = CancellationToken::new();
    let sink = Sink::new(tx, BackpressureStrategy::Drop, cancel.clone());
    cancel.cancel();

    assert_eq!(
      sink.send_error(StringError("late".to_string())).await,
      Err(SendError::Canceled)
    );
    drop(sink);
    assert!(rx.recv().await.is_none());
  }
}
