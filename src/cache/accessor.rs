//! Typed get / set / get-or-set, callable from any thread

use parking_lot::MutexGuard;
use regex::Regex;
use std::sync::Arc;

use super::object::{ChangeHook, ObjectState, SyncState, ValueObject, Wait};
use super::registry::validate_key;
use super::value::{Value, ValueKind};
use crate::error::{CacheError, CacheResult};
use crate::lifecycle::ConfigCache;
use crate::worker::Request;

impl ConfigCache {
  /// Full store key for an accessor name (`head.name` when a head is set)
  pub fn qualify(&self, name: &str) -> String {
    self.shared.effective.read().qualify(name)
  }

  /// Object for `name`, created if needed. Does not fetch.
  fn object(&self, name: &str) -> CacheResult<Arc<ValueObject>> {
    self.shared.ensure_open()?;
    let key = self.qualify(name);
    validate_key(&key)?;
    let (obj, _) = self.shared.registry.get_or_insert(&key, || {
      self.shared.effective.read().filter.short_name(&key)
    });
    Ok(obj)
  }

  /// Object for `name`; an UNRESOLVED object moves to SYNCING and exactly
  /// one fetch is queued
  pub fn resolve(&self, name: &str) -> CacheResult<Arc<ValueObject>> {
    let obj = self.object(name)?;
    let send = {
      let mut state = obj.lock();
      if state.state == SyncState::Unresolved && !state.closed {
        state.state = SyncState::Syncing;
        state.error = None;
        true
      } else {
        false
      }
    };
    if send {
      self.shared.send(Request::Fetch(obj.key().to_string()));
    }
    Ok(obj)
  }

  pub fn sync_state(&self, name: &str) -> Option<SyncState> {
    self
      .shared
      .registry
      .get(&self.qualify(name))
      .map(|obj| obj.state())
  }

  /// `cache.default_wait_ms` as a [`Wait`]
  pub(crate) fn default_wait(&self) -> Wait {
    match self.shared.settings.cache.default_wait() {
      Some(d) => Wait::Timeout(d),
      None => Wait::Forever,
    }
  }

  /// Apply `raw` locally and queue it for the store. Caller holds the lock.
  fn write_locked(
    &self,
    obj: &ValueObject,
    state: &mut MutexGuard<'_, ObjectState>,
    raw: String,
  ) -> Option<(ChangeHook, String)> {
    state.raw = raw.clone();
    state.state = SyncState::Synced;
    state.error = None;
    state.wait_for_me += 1;
    obj.notify();
    self.shared.send(Request::Write {
      key: obj.key().to_string(),
      raw: raw.clone(),
    });
    state.hook.clone().map(|hook| (hook, raw))
  }

  /// Wait for the value and read it as `kind`. A key the store does not
  /// have is initialized with the kind's zero value.
  pub fn get(&self, name: &str, kind: ValueKind, wait: Wait) -> CacheResult<Value> {
    let obj = self.resolve(name)?;
    let mut state = obj.wait_settled(wait.deadline())?;
    obj.bind_kind(&mut state, kind)?;
    if state.state == SyncState::Missing {
      let zero = Value::zero(kind);
      tracing::debug!("Initializing {} to {:?}", obj.key(), zero);
      let hook = self.write_locked(&obj, &mut state, zero.encode());
      drop(state);
      if let Some((hook, raw)) = hook {
        hook(&raw);
      }
      return Ok(zero);
    }
    obj.decode(&state, kind)
  }

  pub fn get_bool(&self, name: &str) -> CacheResult<bool> {
    match self.get(name, ValueKind::Bool, self.default_wait())? {
      Value::Bool(b) => Ok(b),
      other => Err(self.undecodable(name, other.kind())),
    }
  }

  pub fn get_char(&self, name: &str) -> CacheResult<char> {
    match self.get(name, ValueKind::Char, self.default_wait())? {
      Value::Char(c) => Ok(c),
      other => Err(self.undecodable(name, other.kind())),
    }
  }

  pub fn get_double(&self, name: &str) -> CacheResult<f64> {
    let value = self.get(name, ValueKind::Double, self.default_wait())?;
    value
      .as_f64()
      .ok_or_else(|| self.undecodable(name, ValueKind::Double))
  }

  pub fn get_integer(&self, name: &str) -> CacheResult<i64> {
    let value = self.get(name, ValueKind::Integer, self.default_wait())?;
    value
      .as_i64()
      .ok_or_else(|| self.undecodable(name, ValueKind::Integer))
  }

  pub fn get_string(&self, name: &str) -> CacheResult<String> {
    match self.get(name, ValueKind::String, self.default_wait())? {
      Value::String(s) => Ok(s),
      other => Err(self.undecodable(name, other.kind())),
    }
  }

  pub fn get_string_array(&self, name: &str) -> CacheResult<Vec<String>> {
    match self.get(name, ValueKind::StringArray, self.default_wait())? {
      Value::StringArray(items) => Ok(items),
      other => Err(self.undecodable(name, other.kind())),
    }
  }

  fn undecodable(&self, name: &str, kind: ValueKind) -> CacheError {
    CacheError::Undecodable {
      key: self.qualify(name),
      kind,
    }
  }

  /// Raw store text without binding a kind. `NotFound` if the store has none.
  pub fn get_raw(&self, name: &str, wait: Wait) -> CacheResult<String> {
    let obj = self.resolve(name)?;
    let state = obj.wait_settled(wait.deadline())?;
    if state.state == SyncState::Missing {
      return Err(CacheError::NotFound(obj.key().to_string()));
    }
    Ok(state.raw.clone())
  }

  /// Write a value. Applied locally at once; the store write is queued.
  pub fn set(&self, name: &str, value: impl Into<Value>) -> CacheResult<()> {
    let value = value.into();
    let obj = self.object(name)?;
    let mut state = obj.lock();
    if state.closed {
      return Err(CacheError::ShuttingDown);
    }
    obj.bind_kind(&mut state, value.kind())?;
    let raw = value.encode();
    if state.state == SyncState::Synced && state.raw == raw {
      return Ok(());
    }
    let hook = self.write_locked(&obj, &mut state, raw);
    drop(state);
    if let Some((hook, raw)) = hook {
      hook(&raw);
    }
    Ok(())
  }

  /// The store's value if it has one; otherwise `default`, written once no
  /// matter how many callers race
  pub fn get_or_set(&self, name: &str, default: impl Into<Value>, wait: Wait) -> CacheResult<Value> {
    let default = default.into();
    let kind = default.kind();
    let obj = self.resolve(name)?;
    let mut state = obj.wait_settled(wait.deadline())?;
    obj.bind_kind(&mut state, kind)?;
    if state.state == SyncState::Missing {
      let hook = self.write_locked(&obj, &mut state, default.encode());
      drop(state);
      if let Some((hook, raw)) = hook {
        hook(&raw);
      }
      return Ok(default);
    }
    obj.decode(&state, kind)
  }

  /// Whether the raw text equals `expected`
  pub fn eq_str(&self, name: &str, expected: &str) -> CacheResult<bool> {
    Ok(self.get_raw(name, self.default_wait())? == expected)
  }

  pub fn matches(&self, name: &str, re: &Regex) -> CacheResult<bool> {
    Ok(re.is_match(&self.get_raw(name, self.default_wait())?))
  }

  /// Run `hook` with the new raw text after every update of `name`
  pub fn on_change<F>(&self, name: &str, hook: F) -> CacheResult<()>
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    let obj = self.resolve(name)?;
    obj.lock().hook = Some(Arc::new(hook));
    Ok(())
  }
}
