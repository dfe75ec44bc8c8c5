//! Error types

use crate::cache::ValueKind;

/// Errors surfaced to callers of the accessor and preset APIs
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
  /// Transient connection failure (worker-internal, reported by `init`)
  #[error("connection error: {0}")]
  Connection(String),

  /// Malformed reply for one request
  #[error("protocol error: {0}")]
  Protocol(String),

  #[error("type mismatch for {key}: bound as {bound}, requested {requested}")]
  TypeMismatch {
    key: String,
    bound: ValueKind,
    requested: ValueKind,
  },

  #[error("value of {key} cannot be read as {kind}")]
  Undecodable { key: String, kind: ValueKind },

  #[error("timed out waiting for {0}")]
  Timeout(String),

  #[error("preset table for {family} is full ({capacity} entries)")]
  Capacity { family: String, capacity: usize },

  #[error("config error: {0}")]
  Config(String),

  #[error("invalid key {0:?}")]
  InvalidKey(String),

  #[error("{0} not found")]
  NotFound(String),

  #[error("cache is shutting down")]
  ShuttingDown,
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Errors reported by a [`RemoteStore`](crate::remote::RemoteStore)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// The connection is gone or unusable; the worker reconnects
  #[error("connection lost: {0}")]
  Connection(String),

  /// The store answered with something we cannot use
  #[error("bad reply: {0}")]
  Protocol(String),
}

impl RemoteError {
  pub fn is_connection(&self) -> bool {
    matches!(self, RemoteError::Connection(_))
  }
}

impl From<RemoteError> for CacheError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Connection(msg) => CacheError::Connection(msg),
      RemoteError::Protocol(msg) => CacheError::Protocol(msg),
    }
  }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for RemoteError {
  fn from(err: redis::RedisError) -> Self {
    if err.is_io_error()
      || err.is_connection_dropped()
      || err.is_connection_refusal()
      || err.is_timeout()
    {
      RemoteError::Connection(err.to_string())
    } else {
      RemoteError::Protocol(err.to_string())
    }
  }
}
