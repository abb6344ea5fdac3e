//! # Subscription
//!
//! The exit point of a pipeline. A [`Subscriber`] receives every item in
//! arrival order: values go to `on_next`, errors to `on_error`. `on_complete`
//! fires exactly once, last, either when the final channel closes or when the
//! pipeline is canceled. Nothing is delivered after it.
//!
//! [`Subscription`] is the handle returned by
//! [`Pipeline::subscribe`](crate::pipeline::Pipeline::subscribe). It can
//! cancel the pipeline, expose its metrics, and hand the subscriber back once
//! every task has finished.
//!
//! ## Example
//!
//! ```rust
//! use rxweave::pipeline::Pipeline;
//! use rxweave::subscription::Callbacks;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), rxweave::error::PipelineError> {
//! let subscription = Pipeline::from_iter(vec![1, 2, 3])
//!   .map(|x| x * 2)
//!   .subscribe(Callbacks::new(|x: i32| println!("next {x}")).on_complete(|| println!("done")));
//!
//! subscription.join().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{PipelineError, panic_message};
use crate::item::{Item, ItemError};
use crate::metrics::PipelineMetrics;
use crate::stage::Upstream;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Terminal consumer of a pipeline.
///
/// Callbacks run on the subscription task, one at a time, never concurrently.
pub trait Subscriber<T>: Send + 'static {
  /// Called for each value item.
  fn on_next(&mut self, value: T);

  /// Called for each error item. The default logs and ignores it.
  fn on_error(&mut self, error: ItemError) {
    warn!(%error, "unhandled error item");
  }

  /// Called exactly once after the last item, or after cancellation.
  fn on_complete(&mut self) {}
}

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(ItemError) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;

/// [`Subscriber`] assembled from closures.
pub struct Callbacks<T> {
  next: NextFn<T>,
  error: Option<ErrorFn>,
  complete: Option<CompleteFn>,
}

impl<T> Callbacks<T> {
  /// Subscriber that forwards values to `next`.
  pub fn new<F>(next: F) -> Self
  where
    F: FnMut(T) + Send + 'static,
  {
    Self {
      next: Box::new(next),
      error: None,
      complete: None,
    }
  }

  /// Sets the error callback.
  #[must_use]
  pub fn on_error<F>(mut self, error: F) -> Self
  where
    F: FnMut(ItemError) + Send + 'static,
  {
    self.error = Some(Box::new(error));
    self
  }

  /// Sets the completion callback.
  #[must_use]
  pub fn on_complete<F>(mut self, complete: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    self.complete = Some(Box::new(complete));
    self
  }
}

impl<T: Send + 'static> Subscriber<T> for Callbacks<T> {
  fn on_next(&mut self, value: T) {
    (self.next)(value);
  }

  fn on_error(&mut self, error: ItemError) {
    match self.error.as_mut() {
      Some(callback) => callback(error),
      None => warn!(%error, "unhandled error item"),
    }
  }

  fn on_complete(&mut self) {
    if let Some(complete) = self.complete.take() {
      complete();
    }
  }
}

/// Subscriber that keeps every item, used by
/// [`Pipeline::collect`](crate::pipeline::Pipeline::collect).
#[derive(Debug)]
pub struct Collector<T> {
  items: Vec<Item<T>>,
  completed: bool,
}

impl<T> Collector<T> {
  /// Creates an empty collector.
  pub fn new() -> Self {
    Self {
      items: Vec::new(),
      completed: false,
    }
  }

  /// Items received so far, in arrival order.
  pub fn items(&self) -> &[Item<T>] {
    &self.items
  }

  /// Whether `on_complete` has fired.
  pub fn is_completed(&self) -> bool {
    self.completed
  }

  /// Consumes the collector, returning its items.
  pub fn into_items(self) -> Vec<Item<T>> {
    self.items
  }
}

impl<T> Default for Collector<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Send + 'static> Subscriber<T> for Collector<T> {
  fn on_next(&mut self, value: T) {
    self.items.push(Item::Value(value));
  }

  fn on_error(&mut self, error: ItemError) {
    self.items.push(Item::Error(error));
  }

  fn on_complete(&mut self) {
    self.completed = true;
  }
}

/// Drains the final channel into `subscriber`.
///
/// Returns the subscriber after `on_complete`. `run` is canceled on the way
/// out so any stage still running upstream winds down.
pub(crate) async fn dispatch<T, S>(run: CancellationToken, mut upstream: Upstream<T>, mut subscriber: S) -> S
where
  T: Send + 'static,
  S: Subscriber<T>,
{
  let mut delivered = 0u64;
  loop {
    let next = tokio::select! {
      biased;
      _ = run.cancelled() => {
        debug!(delivered, "subscription canceled");
        break;
      }
      next = upstream.recv() => next,
    };
    match next {
      Some(Item::Value(value)) => subscriber.on_next(value),
      Some(Item::Error(error)) => subscriber.on_error(error),
      None => {
        debug!(delivered, "subscription completed");
        break;
      }
    }
    delivered += 1;
  }

  drop(upstream);
  subscriber.on_complete();
  run.cancel();
  subscriber
}

/// Handle to a running pipeline.
///
/// Dropping the handle detaches it: the pipeline keeps running until its
/// source is exhausted. Call [`cancel`](Self::cancel) to stop it early.
#[derive(Debug)]
pub struct Subscription<S> {
  scope: CancellationToken,
  run: CancellationToken,
  subscriber: JoinHandle<S>,
  stages: Vec<(String, JoinHandle<()>)>,
  metrics: PipelineMetrics,
}

impl<S> Subscription<S> {
  pub(crate) fn new(
    scope: CancellationToken,
    run: CancellationToken,
    subscriber: JoinHandle<S>,
    stages: Vec<(String, JoinHandle<()>)>,
    metrics: PipelineMetrics,
  ) -> Self {
    Self {
      scope,
      run,
      subscriber,
      stages,
      metrics,
    }
  }

  /// Cancels the pipeline. Every stage terminates promptly and the
  /// subscriber's `on_complete` fires once. Idempotent.
  pub fn cancel(&self) {
    self.scope.cancel();
  }

  /// Alias of [`cancel`](Self::cancel).
  pub fn dispose(&self) {
    self.cancel();
  }

  /// `true` once [`cancel`](Self::cancel) was called or the context the
  /// pipeline was built with fired.
  pub fn is_canceled(&self) -> bool {
    self.scope.is_cancelled()
  }

  /// `true` once the subscriber has seen `on_complete`.
  pub fn is_finished(&self) -> bool {
    self.subscriber.is_finished()
  }

  /// Live counters for every stage.
  pub fn metrics(&self) -> PipelineMetrics {
    self.metrics.clone()
  }

  /// Waits for the subscriber and every stage task to finish.
  ///
  /// # Errors
  ///
  /// Returns [`PipelineError::Panicked`] for the first task that panicked.
  /// The rest of the pipeline is canceled and still awaited before
  /// returning.
  ///
  /// # Example
  ///
  /// ```rust
  /// use rxweave::pipeline::Pipeline;
  /// use rxweave::subscription::Collector;
  ///
  /// # #[tokio::main]
  /// # async fn main() {
  /// let subscription = Pipeline::from_iter(vec![1, 2, 3]).subscribe(Collector::new());
  /// let collector = subscription.join().await.unwrap();
  ///
  /// assert!(collector.is_completed());
  /// assert_eq!(collector.items().len(), 3);
  /// # }
  /// ```
  pub async fn join(self) -> Result<S, PipelineError> {
    let mut failure = None;

    let subscriber = match self.subscriber.await {
      Ok(subscriber) => Some(subscriber),
      Err(err) => {
        self.run.cancel();
        failure = Some(task_failure("subscriber", err));
        None
      }
    };

    for (name, handle) in self.stages {
      if let Err(err) = handle.await {
        self.run.cancel();
        let err = task_failure(&name, err);
        failure.get_or_insert(err);
      }
    }

    match (subscriber, failure) {
      (Some(subscriber), None) => Ok(subscriber),
      (_, Some(err)) => Err(err),
      (None, None) => Err(PipelineError::Panicked {
        task: "subscriber".to_string(),
        message: "subscriber did not return".to_string(),
      }),
    }
  }
}

fn task_failure(task: &str, err: JoinError) -> PipelineError {
  let message = if err.is_panic() {
    panic_message(err.into_panic().as_ref())
  } else {
    "task was aborted".to_string()
  };
  error!(task, %message, "pipeline task failed");
  PipelineError::Panicked {
    task: task.to_string(),
    message,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::StringError;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio::sync::mpsc;

  #[derive(Default)]
  struct Journal {
    events: Vec<String>,
  }

  impl Subscriber<i32> for Journal {
    fn on_next(&mut self, value: i32) {
      self.events.push(format!("next {value}"));
    }

    fn on_error(&mut self, error: ItemError) {
      self.events.push(format!("error {error}"));
    }

    fn on_complete(&mut self) {
      self.events.push("complete".to_string());
    }
  }

  #[tokio::test]
  async fn test_dispatch_preserves_arrival_order() {
    let (tx, rx) = mpsc::channel(8);
    tx.send(Item::from_value(1)).await.unwrap();
    tx.send(Item::from_error(StringError("E".to_string()))).await.unwrap();
    tx.send(Item::from_value(2)).await.unwrap();
    drop(tx);

    let journal = dispatch(CancellationToken::new(), rx, Journal::default()).await;
    assert_eq!(journal.events, vec!["next 1", "error E", "next 2", "complete"]);
  }

  #[tokio::test]
  async fn test_cancel_completes_once_and_stops_delivery() {
    let (tx, rx) = mpsc::channel(8);
    let run = CancellationToken::new();
    let completions = Arc::new(AtomicUsize::new(0));
    let nexts = Arc::new(AtomicUsize::new(0));

    let subscriber = {
      let completions = Arc::clone(&completions);
      let nexts = Arc::clone(&nexts);
      Callbacks::new(move |_: i32| {
        nexts.fetch_add(1, Ordering::SeqCst);
      })
      .on_complete(move || {
        completions.fetch_add(1, Ordering::SeqCst);
      })
    };
    let task = tokio::spawn(dispatch(run.clone(), rx, subscriber));

    tx.send(Item::from_value(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    run.cancel();

    let mut subscriber = tokio::time::timeout(Duration::from_secs(1), task)
      .await
      .expect("subscription ignored cancellation")
      .unwrap();
    assert!(tx.send(Item::from_value(2)).await.is_err());
    Subscriber::on_complete(&mut subscriber);

    assert_eq!(nexts.load(Ordering::SeqCst), 1);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_join_reports_panicked_stage() {
    let scope = CancellationToken::new();
    let run = scope.child_token();
    let (tx, rx) = mpsc::channel::<Item<i32>>(1);
    drop(tx);
    let subscriber = tokio::spawn(dispatch(run.clone(), rx, Collector::new()));
    let stage = tokio::spawn(async {
      panic!("stage blew up");
    });

    let subscription = Subscription::new(
      scope,
      run,
      subscriber,
      vec![("exploder".to_string(), stage)],
      PipelineMetrics::default(),
    );
    match subscription.join().await {
      Err(PipelineError::Panicked { task, message }) => {
        assert_eq!(task, "exploder");
        assert_eq!(message, "stage blew up");
      }
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn test_collector_records_everything() {
    let mut collector = Collector::new();
    collector.on_next(5);
    collector.on_error(Arc::new(StringError("x".to_string())));
    collector.on_complete();
    assert!(collector.is_completed());
    assert_eq!(format!("{:?}", collector.items()), "[Value(5), Error(\"x\")]");
  }
}
