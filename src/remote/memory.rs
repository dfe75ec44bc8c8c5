//! In-process store with Redis-like hashes and keyspace notifications.
//!
//! Used by the test suite and for offline runs. Counts fetches and writes per
//! key, can hold fetches, drop every subscription to simulate a lost
//! connection, refuse connects, and apply writes from a foreign publisher.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::{Connector, KeyChange, NotificationStream, RemoteStore, Session, VALUE_FIELD};
use crate::error::RemoteError;

struct Subscriber {
  patterns: Vec<String>,
  tx: mpsc::UnboundedSender<Result<KeyChange, RemoteError>>,
}

struct MemoryInner {
  hashes: Mutex<HashMap<String, HashMap<String, String>>>,
  subscribers: Mutex<Vec<Subscriber>>,
  fetches: Mutex<HashMap<String, u64>>,
  writes: Mutex<HashMap<String, u64>>,
  hold: watch::Sender<bool>,
  /// Bumped by `disconnect`; sessions opened under an older epoch fail
  epoch: AtomicU64,
  refuse_connects: AtomicUsize,
  connects: AtomicU64,
  fail_writes: AtomicUsize,
  database: u8,
}

/// Shared handle; clones see the same data
#[derive(Clone)]
pub struct MemoryStore {
  inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    let (hold, _) = watch::channel(false);
    Self {
      inner: Arc::new(MemoryInner {
        hashes: Mutex::new(HashMap::new()),
        subscribers: Mutex::new(Vec::new()),
        fetches: Mutex::new(HashMap::new()),
        writes: Mutex::new(HashMap::new()),
        hold,
        epoch: AtomicU64::new(0),
        refuse_connects: AtomicUsize::new(0),
        connects: AtomicU64::new(0),
        fail_writes: AtomicUsize::new(0),
        database: 0,
      }),
    }
  }

  pub fn connector(&self) -> MemoryConnector {
    MemoryConnector {
      store: self.clone(),
    }
  }

  /// Store a value without notifying anyone (fixture setup)
  pub fn seed(&self, key: &str, raw: &str) {
    self.seed_field(key, VALUE_FIELD, raw);
  }

  pub fn seed_field(&self, key: &str, field: &str, value: &str) {
    self
      .inner
      .hashes
      .lock()
      .entry(key.to_string())
      .or_default()
      .insert(field.to_string(), value.to_string());
  }

  /// Write as another process would: store, keyspace event, then publish
  pub fn external_set(&self, key: &str, raw: &str, publisher: &str) {
    self.store_and_notify(key, raw, publisher);
  }

  pub fn value(&self, key: &str) -> Option<String> {
    self
      .inner
      .hashes
      .lock()
      .get(key)
      .and_then(|h| h.get(VALUE_FIELD).cloned())
  }

  pub fn fetch_count(&self, key: &str) -> u64 {
    self.inner.fetches.lock().get(key).copied().unwrap_or(0)
  }

  pub fn write_count(&self, key: &str) -> u64 {
    self.inner.writes.lock().get(key).copied().unwrap_or(0)
  }

  pub fn connect_count(&self) -> u64 {
    self.inner.connects.load(Ordering::SeqCst)
  }

  pub fn subscriber_count(&self) -> usize {
    let mut subs = self.inner.subscribers.lock();
    subs.retain(|s| !s.tx.is_closed());
    subs.len()
  }

  /// Park every `hget` and `hgetall` until `release_fetches`
  pub fn hold_fetches(&self) {
    self.inner.hold.send_replace(true);
  }

  pub fn release_fetches(&self) {
    self.inner.hold.send_replace(false);
  }

  /// Refuse the next `n` connects
  pub fn refuse_connects(&self, n: usize) {
    self.inner.refuse_connects.store(n, Ordering::SeqCst);
  }

  /// Fail the next `n` writes with a protocol error
  pub fn fail_writes(&self, n: usize) {
    self.inner.fail_writes.store(n, Ordering::SeqCst);
  }

  /// Drop every subscription and invalidate open sessions
  pub fn disconnect(&self) {
    self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    self.inner.subscribers.lock().clear();
    tracing::debug!("Memory store dropped all connections");
  }

  fn store_and_notify(&self, key: &str, raw: &str, publisher: &str) {
    self.seed(key, raw);
    *self.inner.writes.lock().entry(key.to_string()).or_default() += 1;
    let keyspace = format!("__keyspace@{}__:{}", self.inner.database, key);
    self.deliver(KeyChange::new(keyspace, "hset"));
    self.deliver(KeyChange::new(publisher, key));
  }

  fn deliver(&self, change: KeyChange) {
    let mut subs = self.inner.subscribers.lock();
    subs.retain(|s| !s.tx.is_closed());
    for sub in subs.iter() {
      if sub.patterns.iter().any(|p| glob_match(p, &change.channel)) {
        let _ = sub.tx.send(Ok(change.clone()));
      }
    }
  }
}

/// Connection handle bound to the epoch it was opened in
struct MemorySession {
  store: MemoryStore,
  epoch: u64,
}

impl MemorySession {
  fn check(&self) -> Result<(), RemoteError> {
    if self.store.inner.epoch.load(Ordering::SeqCst) != self.epoch {
      return Err(RemoteError::Connection("connection reset".into()));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteStore for MemorySession {
  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, RemoteError> {
    self.check()?;
    *self.store.inner.fetches.lock().entry(key.to_string()).or_default() += 1;
    let mut hold = self.store.inner.hold.subscribe();
    let _ = hold.wait_for(|held| !*held).await;
    self.check()?;
    Ok(
      self
        .store
        .inner
        .hashes
        .lock()
        .get(key)
        .and_then(|h| h.get(field).cloned()),
    )
  }

  async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, RemoteError> {
    self.check()?;
    let mut hold = self.store.inner.hold.subscribe();
    let _ = hold.wait_for(|held| !*held).await;
    self.check()?;
    Ok(self.store.inner.hashes.lock().get(key).cloned().unwrap_or_default())
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
    self.check()?;
    let mut keys: Vec<String> = self
      .store
      .inner
      .hashes
      .lock()
      .keys()
      .filter(|k| glob_match(pattern, k))
      .cloned()
      .collect();
    keys.sort();
    Ok(keys)
  }

  async fn publish_set(&self, key: &str, raw: &str, publisher: &str) -> Result<(), RemoteError> {
    self.check()?;
    let failing = self
      .store
      .inner
      .fail_writes
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failing {
      return Err(RemoteError::Protocol(format!("write to {} rejected", key)));
    }
    self.store.store_and_notify(key, raw, publisher);
    Ok(())
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    self.check()
  }
}

#[derive(Clone)]
pub struct MemoryConnector {
  store: MemoryStore,
}

impl MemoryConnector {
  pub fn store(&self) -> &MemoryStore {
    &self.store
  }
}

#[async_trait]
impl Connector for MemoryConnector {
  async fn connect(&self) -> Result<Session, RemoteError> {
    let refused = self
      .store
      .inner
      .refuse_connects
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if refused {
      return Err(RemoteError::Connection("connection refused".into()));
    }
    self.store.inner.connects.fetch_add(1, Ordering::SeqCst);
    let epoch = self.store.inner.epoch.load(Ordering::SeqCst);
    let open = || -> Arc<dyn RemoteStore> {
      Arc::new(MemorySession {
        store: self.store.clone(),
        epoch,
      })
    };
    Ok(Session {
      reader: open(),
      publisher: open(),
    })
  }

  async fn subscribe(&self, patterns: &[String]) -> Result<NotificationStream, RemoteError> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.store.inner.subscribers.lock().push(Subscriber {
      patterns: patterns.to_vec(),
      tx,
    });
    Ok(
      futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
      })
      .boxed(),
    )
  }
}

/// Glob matching as Redis applies it to channel and key patterns
fn glob_match(pattern: &str, text: &str) -> bool {
  let mut p_chars = pattern.chars().peekable();
  let mut t_chars = text.chars().peekable();

  while let Some(p) = p_chars.next() {
    match p {
      '*' => {
        while p_chars.peek() == Some(&'*') {
          p_chars.next();
        }
        if p_chars.peek().is_none() {
          return true;
        }
        let rest: String = p_chars.collect();
        loop {
          let remaining: String = t_chars.clone().collect();
          if glob_match(&rest, &remaining) {
            return true;
          }
          if t_chars.next().is_none() {
            return false;
          }
        }
      }
      '?' => {
        if t_chars.next().is_none() {
          return false;
        }
      }
      c => {
        if t_chars.next() != Some(c) {
          return false;
        }
      }
    }
  }

  t_chars.next().is_none()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_glob_match() {
    assert!(glob_match("__keyspace@*__:*", "__keyspace@0__:stns.2.omega"));
    assert!(glob_match("*", ""));
    assert!(glob_match("stns.?.omega", "stns.2.omega"));
    assert!(!glob_match("__keyspace@*__:*", "MD2"));
    assert!(!glob_match("stns.*.x", "stns.2.y"));
  }

  #[tokio::test]
  async fn test_publish_set_notifies_matching_subscribers() {
    let store = MemoryStore::new();
    let connector = store.connector();
    let session = connector.connect().await.unwrap();
    let mut stream = connector
      .subscribe(&["__keyspace@*__:*".to_string()])
      .await
      .unwrap();

    session.publisher.publish_set("a.b", "1", "me").await.unwrap();
    let change = stream.next().await.unwrap().unwrap();
    assert_eq!(change, KeyChange::new("__keyspace@0__:a.b", "hset"));
    assert_eq!(store.value("a.b").as_deref(), Some("1"));
    assert_eq!(store.write_count("a.b"), 1);
  }

  #[tokio::test]
  async fn test_disconnect_ends_streams_and_sessions() {
    let store = MemoryStore::new();
    let connector = store.connector();
    let session = connector.connect().await.unwrap();
    let mut stream = connector.subscribe(&["*".to_string()]).await.unwrap();

    store.disconnect();
    assert!(stream.next().await.is_none());
    assert!(session.reader.ping().await.unwrap_err().is_connection());
  }

  #[tokio::test]
  async fn test_refused_connects() {
    let store = MemoryStore::new();
    store.refuse_connects(1);
    let connector = store.connector();
    assert!(connector.connect().await.is_err());
    assert!(connector.connect().await.is_ok());
  }
}
