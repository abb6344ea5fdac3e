//! # Pipeline Assembly
//!
//! [`Pipeline`] chains a source, any number of stages and a terminal
//! consumer. Channel wiring stays internal: every stage reads from the channel
//! of the stage before it and writes through a [`Sink`] bound to the active
//! backpressure strategy.
//!
//! Assembly is lazy. Nothing is spawned until [`Pipeline::subscribe`] (or one
//! of the terminals built on it, or [`Pipeline::into_stream`]) is called, so
//! no item is produced or dropped before a consumer exists. All stages then
//! share one cancellation context, a child of the one given to
//! [`Pipeline::with_context`].
//!
//! ## Example
//!
//! ```rust
//! use rxweave::backpressure::BackpressureStrategy;
//! use rxweave::pipeline::Pipeline;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), rxweave::error::PipelineError> {
//! let items = Pipeline::from_iter(1..=10)
//!   .with_backpressure(BackpressureStrategy::Block)
//!   .filter(|x: &i32| x % 2 == 0)
//!   .map(|x| x * 10)
//!   .collect()
//!   .await?;
//!
//! let values: Vec<i32> = items.into_iter().filter_map(|item| item.into_result().ok()).collect();
//! assert_eq!(values, vec![20, 40, 60, 80, 100]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Stage names
//!
//! Every stage gets a name for logs and metrics: the one set with
//! [`Pipeline::named`] / [`StageOptions::with_name`], or else the operator
//! name followed by the stage position, e.g. `map-2`.

use crate::backpressure::BackpressureStrategy;
use crate::codec::{Marshaler, Unmarshaler};
use crate::config::{PipelineConfig, StageOptions};
use crate::driver::{Handlers, Operator, ParallelOperator};
use crate::error::{ErrorStrategy, PipelineError};
use crate::item::{Item, ItemError};
use crate::metrics::{PipelineMetrics, StageMetrics};
use crate::operators::{
  Count, Filter, Map, Marshal, OnErrorReturn, ParMap, Reduce, Take, TryMap, Unmarshal,
};
use crate::scatter::{Producer, Scatter};
use crate::sink::Sink;
use crate::source::{IterSource, ScatterSource, Source, StreamSource};
use crate::stage::{EndHandler, Func, ItemHandler, NoEnd, Predicate, Stage, Upstream};
use crate::subscription::{self, Callbacks, Collector, Subscriber, Subscription};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use pin_project::pin_project;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

type Launch<T> = Box<dyn FnOnce(&mut Assembly, StageOptions) -> Upstream<T> + Send>;

/// Spawn-time state shared by every stage of one run.
pub(crate) struct Assembly {
  run: CancellationToken,
  config: PipelineConfig,
  tasks: Vec<(String, JoinHandle<()>)>,
  metrics: Vec<(String, Arc<StageMetrics>)>,
}

impl Assembly {
  fn new(run: CancellationToken, config: PipelineConfig) -> Self {
    Self {
      run,
      config,
      tasks: Vec::new(),
      metrics: Vec::new(),
    }
  }

  fn stage_name(&self, base: &str, options: &StageOptions) -> String {
    match &options.name {
      Some(name) => name.clone(),
      None => format!("{}-{}", base, self.metrics.len()),
    }
  }

  fn channel<T: Send>(&mut self, name: &str, options: &StageOptions) -> (Sink<T>, Upstream<T>) {
    if self.metrics.iter().any(|(stage, _)| stage == name) {
      warn!(stage = %name, "duplicate stage name; metrics lookups return the first");
    }
    let (strategy, capacity) = options.resolve(&self.config);
    let (tx, rx) = mpsc::channel(capacity);
    let metrics = Arc::new(StageMetrics::new());
    self.metrics.push((name.to_string(), Arc::clone(&metrics)));
    (Sink::with_metrics(tx, strategy, self.run.clone(), metrics), rx)
  }

  fn spawn<F>(&mut self, name: String, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.tasks.push((name, tokio::spawn(task)));
  }
}

/// A lazily assembled chain of stages producing items of type `T`.
pub struct Pipeline<T> {
  ctx: CancellationToken,
  config: PipelineConfig,
  tail: StageOptions,
  launch: Launch<T>,
}

impl<T> std::fmt::Debug for Pipeline<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pipeline")
      .field("config", &self.config)
      .field("tail", &self.tail)
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> Pipeline<T> {
  /// Starts a pipeline from a custom [`Source`].
  pub fn from_source<S>(source: S) -> Self
  where
    S: Source<T>,
  {
    Self {
      ctx: CancellationToken::new(),
      config: PipelineConfig::default(),
      tail: StageOptions::default(),
      launch: Box::new(move |assembly: &mut Assembly, options: StageOptions| {
        let name = assembly.stage_name(source.name(), &options);
        let (sink, upstream) = assembly.channel(&name, &options);
        let run = assembly.run.clone();
        let task_name = name.clone();
        assembly.spawn(name, async move {
          debug!(stage = %task_name, "source started");
          match source.emit(run, sink).await {
            Ok(()) => debug!(stage = %task_name, "source exhausted"),
            Err(err) => debug!(stage = %task_name, %err, "source stopped"),
          }
        });
        upstream
      }),
    }
  }

  /// Emits every value of `iter`, then completes.
  #[allow(clippy::should_implement_trait)]
  pub fn from_iter<I>(iter: I) -> Self
  where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
  {
    Self::from_source(IterSource::new(iter.into_iter().map(Item::Value)))
  }

  /// Emits prepared items, errors included, then completes.
  pub fn from_items<I>(items: I) -> Self
  where
    I: IntoIterator<Item = Item<T>>,
    I::IntoIter: Send + 'static,
  {
    Self::from_source(IterSource::new(items.into_iter()))
  }

  /// Emits every value of an asynchronous stream.
  pub fn from_stream<S>(stream: S) -> Self
  where
    S: Stream<Item = T> + Send + 'static,
  {
    Self::from_source(StreamSource::new(stream.map(Item::Value)))
  }

  /// Forwards items written to an external channel. Completes once every
  /// sender is dropped.
  pub fn from_receiver(rx: mpsc::Receiver<Item<T>>) -> Self {
    Self::from_source(StreamSource::new(ReceiverStream::new(rx)))
  }

  /// Runs `producer` on `workers` concurrent workers feeding the first
  /// channel. Items from different workers interleave freely.
  ///
  /// # Errors
  ///
  /// [`PipelineError::InvalidConfig`] if `workers` is zero.
  pub fn from_producer<P>(producer: P, workers: usize) -> Result<Self, PipelineError>
  where
    P: Producer<T>,
  {
    let scatter = Scatter::new(producer, workers)?;
    Ok(Self::from_source(ScatterSource::new(scatter)))
  }

  /// Uses `ctx` as the parent cancellation context. Canceling it cancels the
  /// pipeline.
  #[must_use]
  pub fn with_context(mut self, ctx: CancellationToken) -> Self {
    self.ctx = ctx;
    self
  }

  /// Replaces the whole configuration.
  ///
  /// # Errors
  ///
  /// [`PipelineError::InvalidConfig`] if `config` fails validation.
  pub fn with_config(mut self, config: PipelineConfig) -> Result<Self, PipelineError> {
    config.validate()?;
    self.config = config;
    Ok(self)
  }

  /// Sets the backpressure strategy for every stage without an override.
  #[must_use]
  pub fn with_backpressure(mut self, strategy: BackpressureStrategy) -> Self {
    self.config.backpressure = strategy;
    self
  }

  /// Sets how built-in operators react to error items.
  #[must_use]
  pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
    self.config.error_strategy = strategy;
    self
  }

  /// Sets the default inter-stage channel capacity.
  #[must_use]
  pub fn with_buffer_capacity(mut self, capacity: NonZeroUsize) -> Self {
    self.config.buffer_capacity = capacity.get();
    self
  }

  /// The configuration stages will be launched with.
  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// Overrides options of the most recently added stage.
  ///
  /// Fields left unset in `options` keep whatever was set before, so a name
  /// given with [`Pipeline::named`] survives a later backpressure override.
  #[must_use]
  pub fn stage_options(mut self, options: StageOptions) -> Self {
    self.tail = options.or(self.tail);
    self
  }

  /// Names the most recently added stage.
  #[must_use]
  pub fn named(mut self, name: impl Into<String>) -> Self {
    self.tail.name = Some(name.into());
    self
  }

  /// Appends a custom stage.
  pub fn stage<U, S>(self, stage: S) -> Pipeline<U>
  where
    U: Send + 'static,
    S: Stage<T, U>,
  {
    let base = stage.name().to_string();
    self.chain(base, move |_, _| stage)
  }

  fn chain<U, S, B>(self, base: String, build: B) -> Pipeline<U>
  where
    U: Send + 'static,
    S: Stage<T, U>,
    B: FnOnce(&PipelineConfig, &str) -> S + Send + 'static,
  {
    let Pipeline {
      ctx,
      config,
      tail,
      launch,
    } = self;
    Pipeline {
      ctx,
      config,
      tail: StageOptions::default(),
      launch: Box::new(move |assembly: &mut Assembly, options: StageOptions| {
        let upstream = launch(assembly, tail);
        let name = assembly.stage_name(&base, &options);
        let stage = build(&assembly.config, &name);
        let (sink, rx) = assembly.channel(&name, &options);
        let run = assembly.run.clone();
        assembly.spawn(name, stage.run(run, upstream, sink));
        rx
      }),
    }
  }

  fn operator<U, H, B>(self, base: &str, build: B) -> Pipeline<U>
  where
    U: Send + 'static,
    H: ItemHandler<T, U>,
    B: FnOnce(ErrorStrategy) -> H + Send + 'static,
  {
    self.chain(base.to_string(), move |config, name| {
      Operator::fused(name, Handlers(build(config.error_strategy), NoEnd))
    })
  }

  fn fused_operator<U, P, B>(self, base: &str, build: B) -> Pipeline<U>
  where
    U: Send + 'static,
    P: ItemHandler<T, U> + EndHandler<U>,
    B: FnOnce(ErrorStrategy) -> P + Send + 'static,
  {
    self.chain(base.to_string(), move |config, name| {
      Operator::fused(name, build(config.error_strategy))
    })
  }

  /// Transforms every value with `f`.
  pub fn map<U, F>(self, f: F) -> Pipeline<U>
  where
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
  {
    self.operator("map", move |errors| Map::new(f, errors))
  }

  /// Transforms every value with a fallible [`Func`]; failures become error
  /// items.
  pub fn try_map<U, F>(self, f: F) -> Pipeline<U>
  where
    U: Send + 'static,
    F: Func<T, U>,
  {
    self.operator("try_map", move |errors| TryMap::new(f, errors))
  }

  /// Keeps values accepted by `predicate`.
  pub fn filter<P>(self, predicate: P) -> Pipeline<T>
  where
    P: Predicate<T>,
  {
    self.operator("filter", move |errors| Filter::new(predicate, errors))
  }

  /// Passes the first `n` values, then ends the stream.
  pub fn take(self, n: usize) -> Pipeline<T> {
    self.operator("take", move |errors| Take::new(n, errors))
  }

  /// Replaces error items with values produced by `recover`.
  pub fn on_error_return<F>(self, recover: F) -> Pipeline<T>
  where
    F: Fn(ItemError) -> T + Send + Sync + 'static,
  {
    self.operator("on_error_return", move |_| OnErrorReturn::new(recover))
  }

  /// Emits the number of values once upstream is exhausted.
  pub fn count(self) -> Pipeline<u64> {
    self.fused_operator("count", Count::new)
  }

  /// Folds values into `seed`; emits the result once upstream is exhausted.
  pub fn reduce<A, F>(self, seed: A, f: F) -> Pipeline<A>
  where
    A: Send + 'static,
    F: Fn(A, T) -> A + Send + 'static,
  {
    self.fused_operator("reduce", move |errors| Reduce::new(seed, f, errors))
  }

  /// Encodes values to bytes; encoding failures become error items.
  pub fn marshal<M>(self, marshaler: M) -> Pipeline<Bytes>
  where
    M: Marshaler<T>,
  {
    self.operator("marshal", move |errors| Marshal::new(marshaler, errors))
  }

  /// Decodes byte buffers into values; decoding failures become error items.
  pub fn unmarshal<U, M>(self, unmarshaler: M) -> Pipeline<U>
  where
    T: AsRef<[u8]>,
    U: Send + 'static,
    M: Unmarshaler<U>,
  {
    self.operator("unmarshal", move |errors| Unmarshal::new(unmarshaler, errors))
  }

  /// Like [`try_map`](Self::try_map) but on a pool of
  /// [`PipelineConfig::workers`] workers. Output order is not preserved.
  pub fn parallel_map<U, F>(self, f: F) -> Pipeline<U>
  where
    U: Send + 'static,
    F: Func<T, U>,
  {
    self.chain("parallel_map".to_string(), move |config, name| {
      ParallelOperator::unchecked(name, config.workers, ParMap::new(f, config.error_strategy))
    })
  }

  /// Like [`parallel_map`](Self::parallel_map) with an explicit worker count.
  pub fn parallel_map_n<U, F>(self, workers: NonZeroUsize, f: F) -> Pipeline<U>
  where
    U: Send + 'static,
    F: Func<T, U>,
  {
    self.chain("parallel_map".to_string(), move |config, name| {
      ParallelOperator::unchecked(name, workers.get(), ParMap::new(f, config.error_strategy))
    })
  }

  fn launch(self) -> (CancellationToken, CancellationToken, Upstream<T>, Assembly) {
    let scope = self.ctx.child_token();
    let run = scope.child_token();
    let mut assembly = Assembly::new(run.clone(), self.config);
    let upstream = (self.launch)(&mut assembly, self.tail);
    debug!(
      pipeline = assembly.config.name.as_deref().unwrap_or("pipeline"),
      stages = assembly.tasks.len(),
      backpressure = %assembly.config.backpressure,
      "pipeline launched"
    );
    (scope, run, upstream, assembly)
  }

  /// Spawns every stage and drains the final channel into `subscriber`.
  ///
  /// # Panics
  ///
  /// Must be called from within a Tokio runtime.
  pub fn subscribe<S>(self, subscriber: S) -> Subscription<S>
  where
    S: Subscriber<T>,
  {
    let (scope, run, upstream, assembly) = self.launch();
    let handle = tokio::spawn(subscription::dispatch(run.clone(), upstream, subscriber));
    Subscription::new(
      scope,
      run,
      handle,
      assembly.tasks,
      PipelineMetrics::from_stages(assembly.metrics),
    )
  }

  /// Subscribes with closures for values, errors and completion.
  pub fn for_each<N, E, C>(self, next: N, error: E, complete: C) -> Subscription<Callbacks<T>>
  where
    N: FnMut(T) + Send + 'static,
    E: FnMut(ItemError) + Send + 'static,
    C: FnOnce() + Send + 'static,
  {
    self.subscribe(Callbacks::new(next).on_error(error).on_complete(complete))
  }

  /// Runs the pipeline to completion and returns every item in arrival
  /// order.
  ///
  /// # Errors
  ///
  /// [`PipelineError::Panicked`] if a stage panicked.
  pub async fn collect(self) -> Result<Vec<Item<T>>, PipelineError> {
    let collector = self.subscribe(Collector::new()).join().await?;
    Ok(collector.into_items())
  }

  /// Spawns every stage and hands the final channel to the caller as a
  /// stream. Dropping the stream cancels the pipeline.
  ///
  /// # Panics
  ///
  /// Must be called from within a Tokio runtime.
  pub fn into_stream(self) -> PipelineStream<T> {
    let (scope, _run, upstream, assembly) = self.launch();
    PipelineStream {
      inner: ReceiverStream::new(upstream),
      metrics: PipelineMetrics::from_stages(assembly.metrics),
      scope: scope.clone(),
      _guard: scope.drop_guard(),
    }
  }
}

/// Item stream returned by [`Pipeline::into_stream`].
#[pin_project]
#[derive(Debug)]
pub struct PipelineStream<T> {
  #[pin]
  inner: ReceiverStream<Item<T>>,
  metrics: PipelineMetrics,
  scope: CancellationToken,
  _guard: DropGuard,
}

impl<T> PipelineStream<T> {
  /// Cancels the pipeline. Items already buffered are still yielded.
  pub fn cancel(&self) {
    self.scope.cancel();
  }

  /// Live counters for every stage.
  pub fn metrics(&self) -> PipelineMetrics {
    self.metrics.clone()
  }
}

impl<T> Stream for PipelineStream<T> {
  type Item = Item<T>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.project().inner.poll_next(cx)
  }
}
