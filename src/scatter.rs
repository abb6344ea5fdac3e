//! # Scatter
//!
//! Fan-out execution: one [`Producer`] runs on `N` concurrent workers that all
//! write into the same downstream [`Sink`]. Scatter only tracks liveness. When
//! the last worker returns, the run resolves with a [`ScatterReport`], and
//! [`Scatter::spawn`] invokes its completion callback exactly once.
//!
//! Items from different workers interleave in whatever order the scheduler
//! produces; nothing is re-sequenced.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rxweave::error::SendError;
//! use rxweave::scatter::{Producer, Scatter};
//! use rxweave::sink::Sink;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Ticks;
//!
//! #[async_trait]
//! impl Producer<usize> for Ticks {
//!   async fn produce(
//!     &self,
//!     worker: usize,
//!     _ctx: &CancellationToken,
//!     sink: &Sink<usize>,
//!   ) -> Result<(), SendError> {
//!     sink.send_value(worker).await
//!   }
//! }
//!
//! # async fn example(sink: Sink<usize>) -> Result<(), rxweave::error::PipelineError> {
//! let handle = Scatter::new(Ticks, 4)?.spawn(CancellationToken::new(), sink, |report| {
//!   println!("{} workers done", report.workers);
//! });
//! let _report = handle.await;
//! # Ok(())
//! # }
//! ```

use crate::error::{PipelineError, SendError, StringError, panic_message};
use crate::sink::Sink;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Logic executed by every Scatter worker.
///
/// Implementations should check `ctx` (or rely on [`Sink::send`], which does)
/// at each item boundary so that cancellation is observed promptly. Failures
/// are reported as error items through `sink`.
#[async_trait]
pub trait Producer<T>: Send + Sync + 'static
where
  T: Send + 'static,
{
  /// Runs one worker. `worker` is the worker index in `0..workers`.
  async fn produce(
    &self,
    worker: usize,
    ctx: &CancellationToken,
    sink: &Sink<T>,
  ) -> Result<(), SendError>;
}

/// Outcome of a Scatter run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterReport {
  /// Number of workers that were started.
  pub workers: usize,
  /// Workers that panicked instead of returning.
  pub panicked: usize,
}

/// A fixed-size worker pool sharing one producer and one downstream sink.
pub struct Scatter<P> {
  producer: Arc<P>,
  workers: usize,
  name: String,
}

impl<P> Scatter<P> {
  /// Creates a pool of `workers` workers running `producer`.
  ///
  /// # Errors
  ///
  /// Returns [`PipelineError::InvalidConfig`] if `workers` is zero.
  pub fn new(producer: P, workers: usize) -> Result<Self, PipelineError> {
    if workers == 0 {
      return Err(PipelineError::InvalidConfig(
        "scatter needs at least one worker".to_string(),
      ));
    }
    Ok(Self::unchecked(producer, workers))
  }

  pub(crate) fn unchecked(producer: P, workers: usize) -> Self {
    Self {
      producer: Arc::new(producer),
      workers,
      name: "scatter".to_string(),
    }
  }

  /// Sets the name used in log lines.
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Number of workers in the pool.
  pub fn workers(&self) -> usize {
    self.workers
  }

  /// Runs every worker and waits for all of them.
  ///
  /// The caller keeps ownership of `sink`; the downstream channel stays open
  /// until the caller drops it.
  pub async fn run<T>(self, ctx: CancellationToken, sink: &Sink<T>) -> ScatterReport
  where
    T: Send + 'static,
    P: Producer<T>,
  {
    let mut set = JoinSet::new();
    for worker in 0..self.workers {
      let producer = Arc::clone(&self.producer);
      let ctx = ctx.clone();
      let sink = sink.clone();
      set.spawn(async move {
        if let Err(err) = producer.produce(worker, &ctx, &sink).await {
          trace!(worker, %err, "scatter worker stopped writing");
        }
      });
    }
    debug!(scatter = %self.name, workers = self.workers, "scatter started");

    let mut panicked = 0;
    while let Some(joined) = set.join_next().await {
      let Err(join_err) = joined else {
        continue;
      };
      if !join_err.is_panic() {
        continue;
      }
      panicked += 1;
      let message = panic_message(join_err.into_panic().as_ref());
      error!(scatter = %self.name, %message, "scatter worker panicked");
      let _ = sink
        .send_error(StringError(format!(
          "{} worker panicked: {}",
          self.name, message
        )))
        .await;
    }

    debug!(scatter = %self.name, panicked, "scatter finished");
    ScatterReport {
      workers: self.workers,
      panicked,
    }
  }

  /// Runs the pool on its own task.
  ///
  /// `sink` is dropped once every worker has returned, which closes the
  /// downstream channel, and `on_done` is then invoked exactly once.
  pub fn spawn<T, F>(self, ctx: CancellationToken, sink: Sink<T>, on_done: F) -> JoinHandle<ScatterReport>
  where
    T: Send + 'static,
    P: Producer<T>,
    F: FnOnce(&ScatterReport) + Send + 'static,
  {
    tokio::spawn(async move {
      let report = self.run(ctx, &sink).await;
      drop(sink);
      on_done(&report);
      report
    })
  }
}

impl<P> std::fmt::Debug for Scatter<P> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Scatter")
      .field("name", &self.name)
      .field("workers", &self.workers)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backpressure::BackpressureStrategy;
  use crate::item::Item;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio::sync::mpsc;

  struct Counted {
    per_worker: usize,
    finished: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl Producer<usize> for Counted {
    async fn produce(
      &self,
      worker: usize,
      _ctx: &CancellationToken,
      sink: &Sink<usize>,
    ) -> Result<(), SendError> {
      for i in 0..self.per_worker {
        if i % 3 == 0 {
          tokio::task::yield_now().await;
        }
        sink.send_value(worker * 1000 + i).await?;
      }
      self.finished.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  struct Endless;

  #[async_trait]
  impl Producer<u64> for Endless {
    async fn produce(
      &self,
      _worker: usize,
      _ctx: &CancellationToken,
      sink: &Sink<u64>,
    ) -> Result<(), SendError> {
      let mut n = 0;
      loop {
        sink.send_value(n).await?;
        n += 1;
      }
    }
  }

  struct Panicky;

  #[async_trait]
  impl Producer<i32> for Panicky {
    async fn produce(
      &self,
      worker: usize,
      _ctx: &CancellationToken,
      sink: &Sink<i32>,
    ) -> Result<(), SendError> {
      if worker == 1 {
        panic!("worker one gave up");
      }
      sink.send_value(worker as i32).await
    }
  }

  fn block_sink<T: Send>(capacity: usize) -> (Sink<T>, mpsc::Receiver<Item<T>>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
      Sink::new(tx, BackpressureStrategy::Block, CancellationToken::new()),
      rx,
    )
  }

  #[test]
  fn test_zero_workers_rejected() {
    let finished = Arc::new(AtomicUsize::new(0));
    let result = Scatter::new(
      Counted {
        per_worker: 1,
        finished,
      },
      0,
    );
    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_completion_fires_once_after_all_workers() {
    let finished = Arc::new(AtomicUsize::new(0));
    let callbacks = Arc::new(AtomicUsize::new(0));
    let (sink, mut rx) = block_sink(4);

    let scatter = Scatter::new(
      Counted {
        per_worker: 50,
        finished: Arc::clone(&finished),
      },
      8,
    )
    .unwrap();

    let seen_finished = Arc::new(AtomicUsize::new(0));
    let handle = {
      let callbacks = Arc::clone(&callbacks);
      let finished = Arc::clone(&finished);
      let seen_finished = Arc::clone(&seen_finished);
      scatter.spawn(CancellationToken::new(), sink, move |_| {
        callbacks.fetch_add(1, Ordering::SeqCst);
        seen_finished.store(finished.load(Ordering::SeqCst), Ordering::SeqCst);
      })
    };

    let mut received = Vec::new();
    while let Some(item) = rx.recv().await {
      received.push(item.into_result().unwrap());
    }

    let report = handle.await.unwrap();
    assert_eq!(report, ScatterReport { workers: 8, panicked: 0 });
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert_eq!(seen_finished.load(Ordering::SeqCst), 8);
    assert_eq!(received.len(), 400);

    received.sort_unstable();
    received.dedup();
    assert_eq!(received.len(), 400);
  }

  #[tokio::test]
  async fn test_cancellation_unblocks_workers() {
    let ctx = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(2);
    let sink = Sink::new(tx, BackpressureStrategy::Block, ctx.clone());

    let handle = Scatter::new(Endless, 3)
      .unwrap()
      .spawn(ctx.clone(), sink, |_| {});

    for _ in 0..5 {
      assert!(rx.recv().await.is_some());
    }
    ctx.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), handle)
      .await
      .expect("scatter did not shut down after cancellation")
      .unwrap();
    assert_eq!(report.workers, 3);

    while rx.recv().await.is_some() {}
  }

  #[tokio::test]
  async fn test_panicked_worker_surfaces_as_error_item() {
    let (sink, mut rx) = block_sink(8);
    let report = Scatter::new(Panicky, 3)
      .unwrap()
      .with_name("panicky")
      .run(CancellationToken::new(), &sink)
      .await;
    drop(sink);

    assert_eq!(report.panicked, 1);
    let mut values = Vec::new();
    let mut errors = Vec::new();
    while let Some(item) = rx.recv().await {
      match item {
        Item::Value(v) => values.push(v),
        Item::Error(e) => errors.push(e.to_string()),
      }
    }
    values.sort_unstable();
    assert_eq!(values, vec![0, 2]);
    assert_eq!(errors, vec!["panicky worker panicked: worker one gave up"]);
  }
}
