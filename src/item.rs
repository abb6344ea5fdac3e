//! # Items
//!
//! An [`Item`] is one emission flowing through a pipeline: either a value or an
//! error. Errors are ordinary emissions. They travel downstream like values and
//! reach the subscriber's `on_error` callback unless an operator handles them.
//!
//! ```rust
//! use rxweave::item::Item;
//! use rxweave::error::StringError;
//!
//! let ok = Item::from_value(42);
//! let failed: Item<i32> = Item::from_error(StringError("boom".to_string()));
//!
//! assert!(!ok.is_error());
//! assert!(failed.is_error());
//! ```

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Error payload carried by an error item.
///
/// Shared so that items stay cheap to clone when an operator fans them out.
pub type ItemError = Arc<dyn Error + Send + Sync + 'static>;

/// Shares a concrete error as an [`ItemError`].
///
/// Meant for `map_err` inside [`Func`](crate::stage::Func) closures.
pub fn item_error<E>(error: E) -> ItemError
where
  E: Error + Send + Sync + 'static,
{
  Arc::new(error)
}

/// A single emission: a value or an error, never both and never neither.
#[derive(Clone)]
pub enum Item<T> {
  /// A successful emission.
  Value(T),
  /// A failed emission.
  Error(ItemError),
}

impl<T> Item<T> {
  /// Creates a value item.
  pub fn from_value(value: T) -> Self {
    Item::Value(value)
  }

  /// Creates an error item from any error type.
  pub fn from_error<E>(error: E) -> Self
  where
    E: Error + Send + Sync + 'static,
  {
    Item::Error(Arc::new(error))
  }

  /// Creates an error item from an already shared error.
  pub fn from_shared_error(error: ItemError) -> Self {
    Item::Error(error)
  }

  /// Returns `true` if this item carries an error.
  pub fn is_error(&self) -> bool {
    matches!(self, Item::Error(_))
  }

  /// Returns `true` if this item carries a value.
  pub fn is_value(&self) -> bool {
    matches!(self, Item::Value(_))
  }

  /// Borrows the value, if any.
  pub fn value(&self) -> Option<&T> {
    match self {
      Item::Value(value) => Some(value),
      Item::Error(_) => None,
    }
  }

  /// Borrows the error, if any.
  pub fn error(&self) -> Option<&ItemError> {
    match self {
      Item::Value(_) => None,
      Item::Error(error) => Some(error),
    }
  }

  /// Converts the item into a `Result`.
  pub fn into_result(self) -> Result<T, ItemError> {
    match self {
      Item::Value(value) => Ok(value),
      Item::Error(error) => Err(error),
    }
  }

  /// Maps the value with `f`, passing errors through unchanged.
  pub fn map<U, F>(self, f: F) -> Item<U>
  where
    F: FnOnce(T) -> U,
  {
    match self {
      Item::Value(value) => Item::Value(f(value)),
      Item::Error(error) => Item::Error(error),
    }
  }
}

impl<T, E> From<Result<T, E>> for Item<T>
where
  E: Error + Send + Sync + 'static,
{
  fn from(result: Result<T, E>) -> Self {
    match result {
      Ok(value) => Item::Value(value),
      Err(error) => Item::from_error(error),
    }
  }
}

impl<T: fmt::Debug> fmt::Debug for Item<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Item::Value(value) => f.debug_tuple("Value").field(value).finish(),
      Item::Error(error) => f.debug_tuple("Error").field(&error.to_string()).finish(),
    }
  }
}
