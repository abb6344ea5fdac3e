//! # Serialization Hooks
//!
//! [`Marshaler`] turns a value into bytes and [`Unmarshaler`] turns bytes back
//! into a value. The pipeline's `marshal` / `unmarshal` operators call them
//! and convert any failure into an error item, so a bad record never ends the
//! stream by itself.
//!
//! Closures of the right shape implement both traits. [`JsonCodec`] covers
//! any serde type.
//!
//! ```rust
//! use rxweave::codec::{JsonCodec, Marshaler, Unmarshaler};
//!
//! let bytes = JsonCodec.marshal(&vec![1, 2, 3]).unwrap();
//! assert_eq!(&bytes[..], b"[1,2,3]");
//!
//! let back: Vec<i32> = JsonCodec.unmarshal(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

use crate::error::{MarshalError, UnmarshalError};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encodes values to bytes.
pub trait Marshaler<T>: Send + Sync + 'static {
  /// Encodes one value.
  fn marshal(&self, value: &T) -> Result<Bytes, MarshalError>;
}

impl<T, F> Marshaler<T> for F
where
  F: Fn(&T) -> Result<Bytes, MarshalError> + Send + Sync + 'static,
{
  fn marshal(&self, value: &T) -> Result<Bytes, MarshalError> {
    self(value)
  }
}

/// Decodes values from bytes.
pub trait Unmarshaler<T>: Send + Sync + 'static {
  /// Decodes one value.
  fn unmarshal(&self, bytes: &[u8]) -> Result<T, UnmarshalError>;
}

impl<T, F> Unmarshaler<T> for F
where
  F: Fn(&[u8]) -> Result<T, UnmarshalError> + Send + Sync + 'static,
{
  fn unmarshal(&self, bytes: &[u8]) -> Result<T, UnmarshalError> {
    self(bytes)
  }
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: Serialize> Marshaler<T> for JsonCodec {
  fn marshal(&self, value: &T) -> Result<Bytes, MarshalError> {
    serde_json::to_vec(value)
      .map(Bytes::from)
      .map_err(MarshalError::new)
  }
}

impl<T: DeserializeOwned> Unmarshaler<T> for JsonCodec {
  fn unmarshal(&self, bytes: &[u8]) -> Result<T, UnmarshalError> {
    serde_json::from_slice(bytes).map_err(UnmarshalError::new)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Reading {
    sensor: String,
    celsius: f64,
  }

  #[test]
  fn test_json_codec_struct() {
    let reading = Reading {
      sensor: "probe-1".to_string(),
      celsius: 21.5,
    };
    let bytes = JsonCodec.marshal(&reading).unwrap();
    let back: Reading = JsonCodec.unmarshal(&bytes).unwrap();
    assert_eq!(back, reading);
  }

  #[test]
  fn test_json_codec_rejects_garbage() {
    let err = Unmarshaler::<Reading>::unmarshal(&JsonCodec, b"{not json").unwrap_err();
    assert!(err.to_string().starts_with("unmarshal failed:"));
  }

  #[test]
  fn test_closures_are_codecs() {
    let upper = |s: &String| -> Result<Bytes, MarshalError> { Ok(Bytes::from(s.to_uppercase())) };
    let utf8 = |b: &[u8]| -> Result<String, UnmarshalError> {
      String::from_utf8(b.to_vec()).map_err(UnmarshalError::new)
    };

    let bytes = upper.marshal(&"abc".to_string()).unwrap();
    assert_eq!(utf8.unmarshal(&bytes).unwrap(), "ABC");
    assert!(utf8.unmarshal(&[0xff, 0xfe]).is_err());
  }
}
