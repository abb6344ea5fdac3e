//! # Operators
//!
//! Item handlers behind the chaining methods of
//! [`Pipeline`](crate::pipeline::Pipeline). Each one is plain per-item logic;
//! the [`Operator`](crate::driver::Operator) driver supplies the loop,
//! cancellation and channel wiring.
//!
//! Error items are forwarded by every operator except [`OnErrorReturn`],
//! which recovers them into values. Under [`ErrorStrategy::Stop`] the first
//! forwarded error also stops the stage.

use crate::codec::{Marshaler, Unmarshaler};
use crate::error::{ErrorStrategy, SendError};
use crate::item::{Item, ItemError, item_error};
use crate::sink::Sink;
use crate::stage::{EndHandler, Func, ItemHandler, Predicate, StopToken};
use async_trait::async_trait;
use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

/// Sends `error` downstream and applies the error strategy.
pub async fn forward_error<O>(
  error: ItemError,
  sink: &Sink<O>,
  stop: &StopToken,
  strategy: ErrorStrategy,
) -> Result<(), SendError>
where
  O: Send + 'static,
{
  sink.send(Item::Error(error)).await?;
  if strategy == ErrorStrategy::Stop {
    trace!("stopping after error item");
    stop.stop();
  }
  Ok(())
}

/// Infallible value transformation.
#[derive(Debug, Clone)]
pub struct Map<F> {
  f: F,
  errors: ErrorStrategy,
}

impl<F> Map<F> {
  /// Applies `f` to every value.
  pub fn new(f: F, errors: ErrorStrategy) -> Self {
    Self { f, errors }
  }
}

#[async_trait]
impl<I, O, F> ItemHandler<I, O> for Map<F>
where
  I: Send + 'static,
  O: Send + 'static,
  F: Fn(I) -> O + Send + Sync + 'static,
{
  async fn on_item(
    &mut self,
    item: Item<I>,
    sink: &Sink<O>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    match item {
      Item::Value(value) => sink.send_value((self.f)(value)).await,
      Item::Error(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

/// Fallible value transformation; failures become error items.
#[derive(Debug, Clone)]
pub struct TryMap<F> {
  f: F,
  errors: ErrorStrategy,
}

impl<F> TryMap<F> {
  /// Applies `f` to every value.
  pub fn new(f: F, errors: ErrorStrategy) -> Self {
    Self { f, errors }
  }
}

#[async_trait]
impl<I, O, F> ItemHandler<I, O> for TryMap<F>
where
  I: Send + 'static,
  O: Send + 'static,
  F: Func<I, O>,
{
  async fn on_item(
    &mut self,
    item: Item<I>,
    sink: &Sink<O>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    let result = match item {
      Item::Value(value) => self.f.call(value),
      Item::Error(error) => Err(error),
    };
    match result {
      Ok(value) => sink.send_value(value).await,
      Err(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

/// Keeps the values a predicate accepts.
#[derive(Debug, Clone)]
pub struct Filter<P> {
  predicate: P,
  errors: ErrorStrategy,
}

impl<P> Filter<P> {
  /// Keeps values for which `predicate` returns `true`.
  pub fn new(predicate: P, errors: ErrorStrategy) -> Self {
    Self { predicate, errors }
  }
}

#[async_trait]
impl<T, P> ItemHandler<T, T> for Filter<P>
where
  T: Send + 'static,
  P: Predicate<T>,
{
  async fn on_item(
    &mut self,
    item: Item<T>,
    sink: &Sink<T>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    match item {
      Item::Value(value) if self.predicate.test(&value) => sink.send_value(value).await,
      Item::Value(_) => Ok(()),
      Item::Error(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

/// Passes the first `n` values, then stops.
///
/// Error items are forwarded without counting against `n`.
#[derive(Debug, Clone)]
pub struct Take {
  remaining: usize,
  errors: ErrorStrategy,
}

impl Take {
  /// Passes at most `n` values.
  pub fn new(n: usize, errors: ErrorStrategy) -> Self {
    Self {
      remaining: n,
      errors,
    }
  }
}

#[async_trait]
impl<T> ItemHandler<T, T> for Take
where
  T: Send + 'static,
{
  async fn on_item(
    &mut self,
    item: Item<T>,
    sink: &Sink<T>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    if self.remaining == 0 {
      stop.stop();
      return Ok(());
    }
    match item {
      Item::Value(value) => {
        sink.send_value(value).await?;
        self.remaining -= 1;
        if self.remaining == 0 {
          trace!("take limit reached");
          stop.stop();
        }
        Ok(())
      }
      Item::Error(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

/// Replaces every error item with a value.
#[derive(Debug, Clone)]
pub struct OnErrorReturn<F> {
  recover: F,
}

impl<F> OnErrorReturn<F> {
  /// Converts errors with `recover`.
  pub fn new(recover: F) -> Self {
    Self { recover }
  }
}

#[async_trait]
impl<T, F> ItemHandler<T, T> for OnErrorReturn<F>
where
  T: Send + 'static,
  F: Fn(ItemError) -> T + Send + Sync + 'static,
{
  async fn on_item(
    &mut self,
    item: Item<T>,
    sink: &Sink<T>,
    _stop: &StopToken,
  ) -> Result<(), SendError> {
    match item {
      Item::Value(value) => sink.send_value(value).await,
      Item::Error(error) => sink.send_value((self.recover)(error)).await,
    }
  }
}

/// Counts values and emits the total when upstream is exhausted.
#[derive(Debug, Clone, Default)]
pub struct Count {
  count: u64,
  errors: ErrorStrategy,
}

impl Count {
  /// Starts counting from zero.
  pub fn new(errors: ErrorStrategy) -> Self {
    Self { count: 0, errors }
  }
}

#[async_trait]
impl<T> ItemHandler<T, u64> for Count
where
  T: Send + 'static,
{
  async fn on_item(
    &mut self,
    item: Item<T>,
    sink: &Sink<u64>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    match item {
      Item::Value(_) => {
        self.count += 1;
        Ok(())
      }
      Item::Error(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

#[async_trait]
impl EndHandler<u64> for Count {
  async fn on_end(&mut self, sink: &Sink<u64>) -> Result<(), SendError> {
    sink.send_value(self.count).await
  }
}

/// Folds values into an accumulator emitted when upstream is exhausted.
pub struct Reduce<A, F, T> {
  acc: Option<A>,
  f: F,
  errors: ErrorStrategy,
  _input: PhantomData<fn(T)>,
}

impl<A, F, T> Reduce<A, F, T> {
  /// Folds with `f` starting from `seed`.
  pub fn new(seed: A, f: F, errors: ErrorStrategy) -> Self {
    Self {
      acc: Some(seed),
      f,
      errors,
      _input: PhantomData,
    }
  }
}

#[async_trait]
impl<A, F, T> ItemHandler<T, A> for Reduce<A, F, T>
where
  A: Send + 'static,
  T: Send + 'static,
  F: Fn(A, T) -> A + Send + 'static,
{
  async fn on_item(
    &mut self,
    item: Item<T>,
    sink: &Sink<A>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    match item {
      Item::Value(value) => {
        if let Some(acc) = self.acc.take() {
          self.acc = Some((self.f)(acc, value));
        }
        Ok(())
      }
      Item::Error(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

#[async_trait]
impl<A, F, T> EndHandler<A> for Reduce<A, F, T>
where
  A: Send + 'static,
  T: Send + 'static,
  F: Fn(A, T) -> A + Send + 'static,
{
  async fn on_end(&mut self, sink: &Sink<A>) -> Result<(), SendError> {
    match self.acc.take() {
      Some(acc) => sink.send_value(acc).await,
      None => Ok(()),
    }
  }
}

/// Encodes values with a [`Marshaler`].
#[derive(Debug, Clone)]
pub struct Marshal<M> {
  marshaler: M,
  errors: ErrorStrategy,
}

impl<M> Marshal<M> {
  /// Encodes with `marshaler`.
  pub fn new(marshaler: M, errors: ErrorStrategy) -> Self {
    Self { marshaler, errors }
  }
}

#[async_trait]
impl<T, M> ItemHandler<T, Bytes> for Marshal<M>
where
  T: Send + 'static,
  M: Marshaler<T>,
{
  async fn on_item(
    &mut self,
    item: Item<T>,
    sink: &Sink<Bytes>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    let encoded = match item {
      Item::Value(value) => self.marshaler.marshal(&value).map_err(item_error),
      Item::Error(error) => Err(error),
    };
    match encoded {
      Ok(bytes) => sink.send_value(bytes).await,
      Err(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

/// Decodes byte buffers with an [`Unmarshaler`].
pub struct Unmarshal<U, T> {
  unmarshaler: U,
  errors: ErrorStrategy,
  _output: PhantomData<fn() -> T>,
}

impl<U, T> Unmarshal<U, T> {
  /// Decodes with `unmarshaler`.
  pub fn new(unmarshaler: U, errors: ErrorStrategy) -> Self {
    Self {
      unmarshaler,
      errors,
      _output: PhantomData,
    }
  }
}

#[async_trait]
impl<B, T, U> ItemHandler<B, T> for Unmarshal<U, T>
where
  B: AsRef<[u8]> + Send + 'static,
  T: Send + 'static,
  U: Unmarshaler<T>,
{
  async fn on_item(
    &mut self,
    item: Item<B>,
    sink: &Sink<T>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    let decoded = match item {
      Item::Value(bytes) => self.unmarshaler.unmarshal(bytes.as_ref()).map_err(item_error),
      Item::Error(error) => Err(error),
    };
    match decoded {
      Ok(value) => sink.send_value(value).await,
      Err(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}

/// Fallible transformation shared by the workers of a parallel stage.
pub struct ParMap<F> {
  f: Arc<F>,
  errors: ErrorStrategy,
}

impl<F> ParMap<F> {
  /// Shares `f` across workers.
  pub fn new(f: F, errors: ErrorStrategy) -> Self {
    Self {
      f: Arc::new(f),
      errors,
    }
  }
}

impl<F> Clone for ParMap<F> {
  fn clone(&self) -> Self {
    Self {
      f: Arc::clone(&self.f),
      errors: self.errors,
    }
  }
}

#[async_trait]
impl<I, O, F> ItemHandler<I, O> for ParMap<F>
where
  I: Send + 'static,
  O: Send + 'static,
  F: Func<I, O>,
{
  async fn on_item(
    &mut self,
    item: Item<I>,
    sink: &Sink<O>,
    stop: &StopToken,
  ) -> Result<(), SendError> {
    let result = match item {
      Item::Value(value) => self.f.call(value),
      Item::Error(error) => Err(error),
    };
    match result {
      Ok(value) => sink.send_value(value).await,
      Err(error) => forward_error(error, sink, stop, self.errors).await,
    }
  }
}
