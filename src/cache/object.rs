//! Cached value objects and their wait discipline

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::value::{Value, ValueKind};
use crate::error::{CacheError, CacheResult};

/// Synchronization state of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  /// Never fetched, or the last fetch failed
  Unresolved,
  /// A fetch is in flight
  Syncing,
  /// Value mirrors the store (or a local write not yet acknowledged)
  Synced,
  /// Known out of date; a fetch is queued until the connection returns
  Stale,
  /// The store has no value; the next accessor initializes it
  Missing,
}

impl SyncState {
  /// States in which a waiter stops waiting
  pub fn is_settled(self) -> bool {
    matches!(self, SyncState::Synced | SyncState::Missing)
  }
}

/// Hook run after every update of a key, with the new raw text
pub type ChangeHook = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) struct ObjectState {
  pub raw: String,
  pub kind: Option<ValueKind>,
  pub state: SyncState,
  pub subscribed: bool,
  /// Own publications not yet seen on the subscription
  pub wait_for_me: u32,
  /// Error of the last failed fetch, reported to waiters
  pub error: Option<String>,
  pub closed: bool,
  pub hook: Option<ChangeHook>,
}

impl std::fmt::Debug for ObjectState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ObjectState")
      .field("raw", &self.raw)
      .field("kind", &self.kind)
      .field("state", &self.state)
      .field("subscribed", &self.subscribed)
      .field("wait_for_me", &self.wait_for_me)
      .field("error", &self.error)
      .field("closed", &self.closed)
      .field("hook", &self.hook.is_some())
      .finish()
  }
}

/// One mirrored key
pub struct ValueObject {
  key: String,
  short_name: String,
  pub(crate) inner: Mutex<ObjectState>,
  cond: Condvar,
}

/// How long an accessor is willing to wait for a key to settle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
  Forever,
  Timeout(Duration),
}

impl Wait {
  pub(crate) fn deadline(self) -> Option<Instant> {
    match self {
      Wait::Forever => None,
      Wait::Timeout(d) => Some(Instant::now() + d),
    }
  }
}

impl ValueObject {
  pub(crate) fn new(key: String, short_name: String) -> Self {
    Self {
      key,
      short_name,
      inner: Mutex::new(ObjectState {
        raw: String::new(),
        kind: None,
        state: SyncState::Unresolved,
        subscribed: false,
        wait_for_me: 0,
        error: None,
        closed: false,
        hook: None,
      }),
      cond: Condvar::new(),
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Name used in events and logs (capture group of the key filter, or the key)
  pub fn short_name(&self) -> &str {
    &self.short_name
  }

  pub fn state(&self) -> SyncState {
    self.inner.lock().state
  }

  pub fn kind(&self) -> Option<ValueKind> {
    self.inner.lock().kind
  }

  pub fn is_subscribed(&self) -> bool {
    self.inner.lock().subscribed
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, ObjectState> {
    self.inner.lock()
  }

  pub(crate) fn notify(&self) {
    self.cond.notify_all();
  }

  /// Block until the object settles (SYNCED or MISSING), fails, closes or
  /// the deadline passes. Returns the held guard on success.
  pub(crate) fn wait_settled(
    &self,
    deadline: Option<Instant>,
  ) -> CacheResult<MutexGuard<'_, ObjectState>> {
    let mut guard = self.inner.lock();
    loop {
      if guard.closed {
        return Err(CacheError::ShuttingDown);
      }
      if guard.state.is_settled() {
        return Ok(guard);
      }
      if guard.state == SyncState::Unresolved {
        if let Some(err) = guard.error.clone() {
          return Err(CacheError::Protocol(format!("{}: {}", self.key, err)));
        }
      }
      match deadline {
        None => self.cond.wait(&mut guard),
        Some(deadline) => {
          if self.cond.wait_until(&mut guard, deadline).timed_out() && !guard.state.is_settled() {
            if guard.closed {
              return Err(CacheError::ShuttingDown);
            }
            return Err(CacheError::Timeout(self.key.clone()));
          }
        }
      }
    }
  }

  /// Bind the kind on first typed use, or check the binding
  pub(crate) fn bind_kind(&self, state: &mut ObjectState, requested: ValueKind) -> CacheResult<()> {
    match state.kind {
      None => {
        state.kind = Some(requested);
        Ok(())
      }
      Some(bound) if bound.accepts(requested) => Ok(()),
      Some(bound) => Err(CacheError::TypeMismatch {
        key: self.key.clone(),
        bound,
        requested,
      }),
    }
  }

  pub(crate) fn decode(&self, state: &ObjectState, kind: ValueKind) -> CacheResult<Value> {
    Value::decode(kind, &state.raw).ok_or_else(|| CacheError::Undecodable {
      key: self.key.clone(),
      kind,
    })
  }

  /// Apply a value delivered by the store. Ignored while our own writes are
  /// still being published, since the local value is newer. Returns the hook
  /// to run once the lock is released.
  pub(crate) fn apply_remote(&self, raw: String) -> Option<(ChangeHook, String)> {
    let mut guard = self.inner.lock();
    if guard.closed {
      return None;
    }
    if guard.wait_for_me > 0 {
      if guard.state != SyncState::Synced {
        guard.state = SyncState::Synced;
        self.cond.notify_all();
      }
      return None;
    }
    guard.raw = raw;
    guard.state = SyncState::Synced;
    guard.error = None;
    self.cond.notify_all();
    guard.hook.clone().map(|hook| (hook, guard.raw.clone()))
  }

  /// The store has no value for this key
  pub(crate) fn mark_missing(&self) {
    let mut guard = self.inner.lock();
    if guard.wait_for_me > 0 {
      if guard.state != SyncState::Synced {
        guard.state = SyncState::Synced;
        self.cond.notify_all();
      }
      return;
    }
    if guard.state != SyncState::Synced {
      guard.state = SyncState::Missing;
      guard.error = None;
      self.cond.notify_all();
    }
  }

  /// A fetch failed with a non-connection error
  pub(crate) fn mark_failed(&self, err: String) {
    let mut guard = self.inner.lock();
    if guard.state == SyncState::Synced {
      return;
    }
    guard.state = SyncState::Unresolved;
    guard.error = Some(err);
    self.cond.notify_all();
  }

  /// Wake every waiter with `ShuttingDown`
  pub(crate) fn close(&self) {
    let mut guard = self.inner.lock();
    guard.closed = true;
    self.cond.notify_all();
  }
}

impl std::fmt::Debug for ValueObject {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let guard = self.inner.lock();
    f.debug_struct("ValueObject")
      .field("key", &self.key)
      .field("raw", &guard.raw)
      .field("kind", &guard.kind)
      .field("state", &guard.state)
      .field("subscribed", &guard.subscribed)
      .field("wait_for_me", &guard.wait_for_me)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn test_waiter_wakes_on_remote_value() {
    let obj = Arc::new(ValueObject::new("k".into(), "k".into()));
    obj.lock().state = SyncState::Syncing;

    let waiter = {
      let obj = obj.clone();
      thread::spawn(move || {
        let guard = obj.wait_settled(Wait::Timeout(Duration::from_secs(5)).deadline()).unwrap();
        guard.raw.clone()
      })
    };

    thread::sleep(Duration::from_millis(20));
    obj.apply_remote("3.5".into());
    assert_eq!(waiter.join().unwrap(), "3.5");
  }

  #[test]
  fn test_wait_times_out() {
    let obj = ValueObject::new("k".into(), "k".into());
    obj.lock().state = SyncState::Syncing;
    let err = obj
      .wait_settled(Wait::Timeout(Duration::from_millis(30)).deadline())
      .unwrap_err();
    assert_eq!(err, CacheError::Timeout("k".into()));
  }

  #[test]
  fn test_close_releases_waiters() {
    let obj = Arc::new(ValueObject::new("k".into(), "k".into()));
    obj.lock().state = SyncState::Stale;
    let waiter = {
      let obj = obj.clone();
      thread::spawn(move || obj.wait_settled(None).map(|_| ()))
    };
    thread::sleep(Duration::from_millis(20));
    obj.close();
    assert_eq!(waiter.join().unwrap(), Err(CacheError::ShuttingDown));
  }

  #[test]
  fn test_remote_value_ignored_while_own_write_pending() {
    let obj = ValueObject::new("k".into(), "k".into());
    {
      let mut guard = obj.lock();
      guard.raw = "local".into();
      guard.state = SyncState::Synced;
      guard.wait_for_me = 1;
    }
    obj.apply_remote("older".into());
    assert_eq!(obj.lock().raw, "local");
  }

  #[test]
  fn test_kind_binding() {
    let obj = ValueObject::new("k".into(), "k".into());
    let mut guard = obj.lock();
    obj.bind_kind(&mut guard, ValueKind::Integer).unwrap();
    obj.bind_kind(&mut guard, ValueKind::Double).unwrap();
    let err = obj.bind_kind(&mut guard, ValueKind::String).unwrap_err();
    assert!(matches!(err, CacheError::TypeMismatch { .. }));
  }

  #[test]
  fn test_failed_fetch_reported_to_waiter() {
    let obj = ValueObject::new("k".into(), "k".into());
    obj.lock().state = SyncState::Syncing;
    obj.mark_failed("WRONGTYPE".into());
    let err = obj.wait_settled(None).unwrap_err();
    assert!(matches!(err, CacheError::Protocol(_)));
  }
}
