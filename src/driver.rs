//! # Operator Driver
//!
//! Generic runner that turns per-item logic into a [`Stage`]. The driver owns
//! the loop every operator needs:
//!
//! 1. Wait for the next upstream item, racing the cancellation token.
//! 2. Hand the item to the [`ItemHandler`] together with the downstream
//!    [`Sink`] and a [`StopToken`].
//! 3. End the stage if the handler asked to stop, a write was abandoned, or
//!    the consumer went away.
//! 4. When upstream is exhausted (and only then) call the [`EndHandler`].
//! 5. Close the downstream channel on every exit path.
//!
//! A panic inside a handler ends the stage, but not silently: it is logged
//! and written downstream as an error item, as [`Scatter`] does for its
//! workers.
//!
//! [`Operator`] runs the loop on a single task so item order is preserved.
//! [`ParallelOperator`] runs it on a [`Scatter`] pool of workers that share
//! one upstream; ordering across workers is not preserved.

use crate::error::{PipelineError, SendError, StringError, panic_message};
use crate::item::Item;
use crate::scatter::{Producer, Scatter};
use crate::sink::Sink;
use crate::stage::{EndHandler, ItemHandler, NoEnd, Stage, StopToken, Upstream};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Pairs an item handler with a separate end handler.
#[derive(Debug, Clone)]
pub struct Handlers<H, E>(pub H, pub E);

#[async_trait]
impl<I, O, H, E> ItemHandler<I, O> for Handlers<H, E>
where
  I: Send + 'static,
  O: Send + 'static,
  H: ItemHandler<I, O>,
  E: Send + 'static,
{
  async fn on_item(
    &mut self,
    item: Item<I>,
    sink: &Sink<O>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    self.0.on_item(item, sink, stop).await
  }
}

#[async_trait]
impl<O, H, E> EndHandler<O> for Handlers<H, E>
where
  O: Send + 'static,
  H: Send + 'static,
  E: EndHandler<O>,
{
  async fn on_end(&mut self, sink: &Sink<O>) -> Result<(), SendError> {
    self.1.on_end(sink).await
  }
}

/// Sequential operator stage.
///
/// `P` implements both [`ItemHandler`] and [`EndHandler`]; the constructors
/// cover the common shapes.
#[derive(Debug)]
pub struct Operator<P> {
  name: String,
  logic: P,
}

impl<H> Operator<Handlers<H, NoEnd>> {
  /// Operator with per-item logic only.
  ///
  /// # Arguments
  ///
  /// * `name` - Base name used in logs and metrics.
  /// * `handler` - Logic invoked once for every upstream item, values and
  ///   errors alike.
  ///
  /// # Example
  ///
  /// ```rust
  /// use async_trait::async_trait;
  /// use rxweave::driver::Operator;
  /// use rxweave::error::SendError;
  /// use rxweave::item::Item;
  /// use rxweave::pipeline::Pipeline;
  /// use rxweave::sink::Sink;
  /// use rxweave::stage::{ItemHandler, StopToken};
  ///
  /// struct Label;
  ///
  /// #[async_trait]
  /// impl ItemHandler<i32, String> for Label {
  ///   async fn on_item(
  ///     &mut self,
  ///     item: Item<i32>,
  ///     sink: &Sink<String>,
  ///     _stop: &StopToken,
  ///   ) -> Result<(), SendError> {
  ///     sink.send(item.map(|x| format!("#{x}"))).await
  ///   }
  /// }
  ///
  /// # #[tokio::main]
  /// # async fn main() {
  /// let labels: Vec<String> = Pipeline::from_iter(vec![1, 2])
  ///   .stage(Operator::new("label", Label))
  ///   .collect()
  ///   .await
  ///   .unwrap()
  ///   .into_iter()
  ///   .filter_map(|item| item.into_result().ok())
  ///   .collect();
  /// assert_eq!(labels, vec!["#1", "#2"]);
  /// # }
  /// ```
  pub fn new(name: impl Into<String>, handler: H) -> Self {
    Self::fused(name, Handlers(handler, NoEnd))
  }
}

impl<H, E> Operator<Handlers<H, E>> {
  /// Operator with separate per-item and end-of-stream logic.
  pub fn with_end(name: impl Into<String>, handler: H, end: E) -> Self {
    Self::fused(name, Handlers(handler, end))
  }
}

impl<P> Operator<P> {
  /// Operator whose logic implements both handler traits itself, e.g. an
  /// aggregate that needs its state in `on_end`.
  pub fn fused(name: impl Into<String>, logic: P) -> Self {
    Self {
      name: name.into(),
      logic,
    }
  }
}

#[async_trait]
impl<I, O, P> Stage<I, O> for Operator<P>
where
  I: Send + 'static,
  O: Send + 'static,
  P: ItemHandler<I, O> + EndHandler<O>,
{
  async fn run(mut self, ctx: CancellationToken, mut upstream: Upstream<I>, downstream: Sink<O>) {
    let stop = StopToken::child_of(&ctx);
    let metrics = std::sync::Arc::clone(downstream.metrics());
    debug!(stage = %self.name, "stage started");

    loop {
      let next = tokio::select! {
        biased;
        _ = ctx.cancelled() => {
          debug!(stage = %self.name, "stage canceled");
          break;
        }
        next = upstream.recv() => next,
      };

      let Some(item) = next else {
        match AssertUnwindSafe(self.logic.on_end(&downstream))
          .catch_unwind()
          .await
        {
          Ok(Ok(())) => {}
          Ok(Err(err)) => debug!(stage = %self.name, %err, "end-of-stream output abandoned"),
          Err(payload) => report_panic(&self.name, payload, &downstream).await,
        }
        debug!(stage = %self.name, "upstream exhausted");
        break;
      };

      metrics.record_received();
      match AssertUnwindSafe(self.logic.on_item(item, &downstream, &stop))
        .catch_unwind()
        .await
      {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
          debug!(stage = %self.name, %err, "stage stopped writing");
          break;
        }
        Err(payload) => {
          report_panic(&self.name, payload, &downstream).await;
          break;
        }
      }
      if stop.is_stopped() {
        debug!(stage = %self.name, "stage requested stop");
        break;
      }
      if downstream.is_closed() {
        debug!(stage = %self.name, "downstream gone");
        break;
      }
    }

    drop(upstream);
    drop(downstream);
    debug!(stage = %self.name, "stage finished");
  }

  fn name(&self) -> &str {
    &self.name
  }
}

/// Operator stage whose per-item logic runs on a pool of workers.
///
/// Each worker owns a clone of the handler and pulls from the shared upstream.
/// The end handler runs once after every worker has returned, unless the
/// pipeline was canceled or a worker requested a stop.
#[derive(Debug)]
pub struct ParallelOperator<H, E = NoEnd> {
  name: String,
  workers: usize,
  handler: H,
  end: E,
}

impl<H> ParallelOperator<H, NoEnd> {
  /// Runs `handler` on `workers` concurrent workers.
  ///
  /// # Errors
  ///
  /// Returns [`PipelineError::InvalidConfig`] if `workers` is zero.
  pub fn new(name: impl Into<String>, workers: usize, handler: H) -> Result<Self, PipelineError> {
    if workers == 0 {
      return Err(PipelineError::InvalidConfig(
        "parallel operator needs at least one worker".to_string(),
      ));
    }
    Ok(Self::unchecked(name, workers, handler))
  }
}

impl<H> ParallelOperator<H, NoEnd> {
  pub(crate) fn unchecked(name: impl Into<String>, workers: usize, handler: H) -> Self {
    Self {
      name: name.into(),
      workers: workers.max(1),
      handler,
      end: NoEnd,
    }
  }
}

impl<H, E> ParallelOperator<H, E> {
  /// Replaces the end handler.
  pub fn with_end<E2>(self, end: E2) -> ParallelOperator<H, E2> {
    ParallelOperator {
      name: self.name,
      workers: self.workers,
      handler: self.handler,
      end,
    }
  }
}

/// Logs a handler panic and forwards it as an error item.
async fn report_panic<O>(name: &str, payload: Box<dyn Any + Send>, sink: &Sink<O>)
where
  O: Send + 'static,
{
  let message = panic_message(payload.as_ref());
  error!(stage = %name, %message, "stage panicked");
  let _ = sink
    .send_error(StringError(format!("{} panicked: {}", name, message)))
    .await;
}

struct PoolWorker<I, H> {
  upstream: Mutex<Upstream<I>>,
  handler: H,
  stop: StopToken,
}

#[async_trait]
impl<I, O, H> Producer<O> for PoolWorker<I, H>
where
  I: Send + 'static,
  O: Send + 'static,
  H: ItemHandler<I, O> + Clone + Sync,
{
  async fn produce(
    &self,
    _worker: usize,
    _ctx: &CancellationToken,
    sink: &Sink<O>,
  ) -> Result<(), SendError> {
    let mut handler = self.handler.clone();
    loop {
      let next = {
        let mut upstream = tokio::select! {
          biased;
          _ = self.stop.stopped() => return Ok(()),
          guard = self.upstream.lock() => guard,
        };
        tokio::select! {
          biased;
          _ = self.stop.stopped() => return Ok(()),
          next = upstream.recv() => next,
        }
      };

      let Some(item) = next else {
        return Ok(());
      };
      sink.metrics().record_received();
      handler.on_item(item, sink, &self.stop).await?;
      if self.stop.is_stopped() || sink.is_closed() {
        return Ok(());
      }
    }
  }
}

#[async_trait]
impl<I, O, H, E> Stage<I, O> for ParallelOperator<H, E>
where
  I: Send + 'static,
  O: Send + 'static,
  H: ItemHandler<I, O> + Clone + Sync,
  E: EndHandler<O>,
{
  async fn run(self, ctx: CancellationToken, upstream: Upstream<I>, downstream: Sink<O>) {
    let ParallelOperator {
      name,
      workers,
      handler,
      mut end,
    } = self;
    let stop = StopToken::child_of(&ctx);
    let worker = PoolWorker {
      upstream: Mutex::new(upstream),
      handler,
      stop: stop.clone(),
    };
    debug!(stage = %name, workers, "parallel stage started");

    let report = Scatter::unchecked(worker, workers)
      .with_name(name.clone())
      .run(ctx.clone(), &downstream)
      .await;

    if !stop.is_stopped() {
      match AssertUnwindSafe(end.on_end(&downstream)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(stage = %name, %err, "end-of-stream output abandoned"),
        Err(payload) => report_panic(&name, payload, &downstream).await,
      }
    }

    drop(downstream);
    debug!(
      stage = %name,
      workers = report.workers,
      panicked = report.panicked,
      "parallel stage finished"
    );
  }

  fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backpressure::BackpressureStrategy;
  use crate::error::StringError;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio::sync::mpsc;

  #[derive(Clone)]
  struct Double;

  #[async_trait]
  impl ItemHandler<i32, i32> for Double {
    async fn on_item(
      &mut self,
      item: Item<i32>,
      sink: &Sink<i32>,
      _stop: &StopToken,
    ) -> Result<(), SendError> {
      sink.send(item.map(|x| x * 2)).await
    }
  }

  struct FirstTwo {
    seen: usize,
  }

  #[async_trait]
  impl ItemHandler<i32, i32> for FirstTwo {
    async fn on_item(
      &mut self,
      item: Item<i32>,
      sink: &Sink<i32>,
      stop: &StopToken,
    ) -> Result<(), SendError> {
      self.seen += 1;
      sink.send(item).await?;
      if self.seen == 2 {
        stop.stop();
      }
      Ok(())
    }
  }

  struct Fragile;

  #[async_trait]
  impl ItemHandler<i32, i32> for Fragile {
    async fn on_item(
      &mut self,
      item: Item<i32>,
      sink: &Sink<i32>,
      _stop: &StopToken,
    ) -> Result<(), SendError> {
      if matches!(item, Item::Value(2)) {
        panic!("cannot handle two");
      }
      sink.send(item).await
    }
  }

  struct Trailer(Arc<AtomicUsize>);

  #[async_trait]
  impl EndHandler<i32> for Trailer {
    async fn on_end(&mut self, sink: &Sink<i32>) -> Result<(), SendError> {
      self.0.fetch_add(1, Ordering::SeqCst);
      sink.send_value(-1).await
    }
  }

  fn wire(capacity: usize, ctx: &CancellationToken) -> (Sink<i32>, Upstream<i32>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Sink::new(tx, BackpressureStrategy::Block, ctx.clone()), rx)
  }

  async fn feed(sink: Sink<i32>, items: Vec<Item<i32>>) {
    for item in items {
      sink.send(item).await.unwrap();
    }
  }

  async fn drain(mut rx: Upstream<i32>) -> Vec<Item<i32>> {
    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
      out.push(item);
    }
    out
  }

  #[tokio::test]
  async fn test_operator_passes_errors_and_runs_end_once() {
    let ctx = CancellationToken::new();
    let (in_sink, in_rx) = wire(4, &ctx);
    let (out_sink, out_rx) = wire(4, &ctx);
    let ends = Arc::new(AtomicUsize::new(0));

    let op = Operator::with_end("double", Double, Trailer(Arc::clone(&ends)));
    let stage = tokio::spawn(op.run(ctx.clone(), in_rx, out_sink));
    tokio::spawn(feed(
      in_sink,
      vec![
        Item::from_value(1),
        Item::from_error(StringError("bad".to_string())),
        Item::from_value(3),
      ],
    ));

    let out = drain(out_rx).await;
    stage.await.unwrap();

    assert_eq!(format!("{:?}", out), "[Value(2), Error(\"bad\"), Value(6), Value(-1)]");
    assert_eq!(ends.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stop_skips_end_handler_and_closes_downstream() {
    let ctx = CancellationToken::new();
    let (in_sink, in_rx) = wire(16, &ctx);
    let (out_sink, out_rx) = wire(16, &ctx);
    let ends = Arc::new(AtomicUsize::new(0));

    let op = Operator::with_end("first-two", FirstTwo { seen: 0 }, Trailer(Arc::clone(&ends)));
    let stage = tokio::spawn(op.run(ctx.clone(), in_rx, out_sink));

    let writer = tokio::spawn(async move {
      let mut sent = 0;
      for i in 0..100 {
        if in_sink.send_value(i).await.is_err() {
          break;
        }
        sent += 1;
      }
      sent
    });

    let out = drain(out_rx).await;
    stage.await.unwrap();

    let values: Vec<i32> = out.into_iter().filter_map(|i| i.into_result().ok()).collect();
    assert_eq!(values, vec![0, 1]);
    assert_eq!(ends.load(Ordering::SeqCst), 0);
    assert!(!ctx.is_cancelled());
    assert!(writer.await.unwrap() < 100);
  }

  #[tokio::test]
  async fn test_cancellation_ends_idle_stage_without_end_handler() {
    let ctx = CancellationToken::new();
    let (_in_sink, in_rx) = wire(4, &ctx);
    let (out_sink, out_rx) = wire(4, &ctx);
    let ends = Arc::new(AtomicUsize::new(0));

    let op = Operator::with_end("idle", Double, Trailer(Arc::clone(&ends)));
    let stage = tokio::spawn(op.run(ctx.clone(), in_rx, out_sink));

    tokio::time::sleep(Duration::from_millis(10)).await;
    ctx.cancel();

    tokio::time::timeout(Duration::from_secs(1), stage)
      .await
      .expect("stage ignored cancellation")
      .unwrap();
    assert!(drain(out_rx).await.is_empty());
    assert_eq!(ends.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_parallel_operator_processes_everything() {
    let ctx = CancellationToken::new();
    let (in_sink, in_rx) = wire(8, &ctx);
    let (out_sink, out_rx) = wire(8, &ctx);
    let ends = Arc::new(AtomicUsize::new(0));

    let op = ParallelOperator::new("par-double", 4, Double)
      .unwrap()
      .with_end(Trailer(Arc::clone(&ends)));
    let stage = tokio::spawn(op.run(ctx.clone(), in_rx, out_sink));
    tokio::spawn(feed(in_sink, (1..=200).map(Item::from_value).collect()));

    let out = drain(out_rx).await;
    stage.await.unwrap();

    let mut values: Vec<i32> = out.into_iter().filter_map(|i| i.into_result().ok()).collect();
    values.sort_unstable();
    let mut expected: Vec<i32> = (1..=200).map(|x| x * 2).collect();
    expected.insert(0, -1);
    assert_eq!(values, expected);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_parallel_operator_rejects_zero_workers() {
    assert!(matches!(
      ParallelOperator::new("none", 0, Double),
      Err(PipelineError::InvalidConfig(_))
    ));
  }

  #[tokio::test]
  async fn test_handler_panic_becomes_error_item() {
    let ctx = CancellationToken::new();
    let (in_sink, in_rx) = wire(4, &ctx);
    let (out_sink, out_rx) = wire(4, &ctx);
    let ends = Arc::new(AtomicUsize::new(0));

    let op = Operator::with_end("fragile", Fragile, Trailer(Arc::clone(&ends)));
    let stage = tokio::spawn(op.run(ctx.clone(), in_rx, out_sink));
    tokio::spawn(feed(in_sink, (1..=3).map(Item::from_value).collect()));

    let out = drain(out_rx).await;
    assert!(stage.await.is_ok());

    assert_eq!(out.len(), 2);
    assert!(matches!(out[0], Item::Value(1)));
    let err = out[1].error().expect("panic should be forwarded").to_string();
    assert_eq!(err, "fragile panicked: cannot handle two");
    assert_eq!(ends.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_parallel_operator_observes_cancellation_mid_stream() {
    let ctx = CancellationToken::new();
    let (in_sink, in_rx) = wire(8, &ctx);
    let (out_sink, mut out_rx) = wire(8, &ctx);
    let ends = Arc::new(AtomicUsize::new(0));

    let op = ParallelOperator::new("par-double", 3, Double)
      .unwrap()
      .with_end(Trailer(Arc::clone(&ends)));
    let stage = tokio::spawn(op.run(ctx.clone(), in_rx, out_sink));
    let writer = tokio::spawn(async move {
      let mut i = 0;
      while in_sink.send_value(i).await.is_ok() {
        i += 1;
      }
    });

    for _ in 0..50 {
      assert!(out_rx.recv().await.is_some());
    }
    ctx.cancel();

    tokio::time::timeout(Duration::from_secs(1), stage)
      .await
      .expect("parallel stage ignored cancellation")
      .unwrap();
    tokio::time::timeout(Duration::from_secs(1), writer)
      .await
      .expect("writer ignored cancellation")
      .unwrap();
    assert_eq!(ends.load(Ordering::SeqCst), 0);
  }
}
