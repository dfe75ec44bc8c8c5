//! Capability interface to the remote key/value store
//!
//! The worker only talks to the store through [`Connector`] and
//! [`RemoteStore`]. Values live in hashes under the `VALUE` field; writes are
//! announced on the writer's publisher channel.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RemoteError;

pub use memory::{MemoryConnector, MemoryStore};
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisConnector;

/// Hash field holding a key's value
pub const VALUE_FIELD: &str = "VALUE";

/// Command side of one connection
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Read one hash field; `None` when the key or field does not exist
  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, RemoteError>;

  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, RemoteError>;

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, RemoteError>;

  /// Atomically store `raw` under `key` and announce `key` on `publisher`
  async fn publish_set(&self, key: &str, raw: &str, publisher: &str) -> Result<(), RemoteError>;

  async fn ping(&self) -> Result<(), RemoteError>;
}

/// Connections opened by one bootstrap
#[derive(Clone)]
pub struct Session {
  pub reader: Arc<dyn RemoteStore>,
  pub publisher: Arc<dyn RemoteStore>,
}

/// One message received on the subscription connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
  pub channel: String,
  pub payload: String,
}

/// Key named by a notification and who changed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedKey {
  pub key: String,
  /// `None` for keyspace events, which do not say who wrote
  pub publisher: Option<String>,
}

impl KeyChange {
  pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
    Self {
      channel: channel.into(),
      payload: payload.into(),
    }
  }

  /// `__keyspace@<db>__:<key>` names the key in the channel; any other
  /// channel is a publisher name carrying the key as payload.
  pub fn changed_key(&self) -> Option<ChangedKey> {
    if let Some(rest) = self.channel.strip_prefix("__keyspace@") {
      let (_, key) = rest.split_once("__:")?;
      if key.is_empty() {
        return None;
      }
      return Some(ChangedKey {
        key: key.to_string(),
        publisher: None,
      });
    }
    if self.payload.is_empty() {
      return None;
    }
    Some(ChangedKey {
      key: self.payload.clone(),
      publisher: Some(self.channel.clone()),
    })
  }
}

pub type NotificationStream = BoxStream<'static, Result<KeyChange, RemoteError>>;

/// Opens connections; called again on every reconnect
#[async_trait]
pub trait Connector: Send + Sync + 'static {
  async fn connect(&self) -> Result<Session, RemoteError>;

  /// Pattern-subscribe on a dedicated connection. The stream ends when that
  /// connection is lost.
  async fn subscribe(&self, patterns: &[String]) -> Result<NotificationStream, RemoteError>;
}
