//! Key → value object map

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::object::{SyncState, ValueObject};
use crate::error::{CacheError, CacheResult};

/// Keys must be non-empty and free of whitespace
pub fn validate_key(key: &str) -> CacheResult<()> {
  if key.is_empty() || key.chars().any(char::is_whitespace) {
    return Err(CacheError::InvalidKey(key.to_string()));
  }
  Ok(())
}

#[derive(Default)]
struct Objects {
  map: HashMap<String, Arc<ValueObject>>,
  closed: bool,
}

/// Objects are only ever inserted. The lock guards the map's structure and
/// is never held while waiting on an object.
#[derive(Default)]
pub struct Registry {
  objects: RwLock<Objects>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<Arc<ValueObject>> {
    self.objects.read().map.get(key).cloned()
  }

  /// Existing object for `key`, or a new UNRESOLVED one. The flag is true
  /// when this call created it. Once the registry is closed, new objects
  /// start out closed.
  pub fn get_or_insert(
    &self,
    key: &str,
    short_name: impl FnOnce() -> String,
  ) -> (Arc<ValueObject>, bool) {
    if let Some(obj) = self.get(key) {
      return (obj, false);
    }
    let mut objects = self.objects.write();
    if let Some(obj) = objects.map.get(key) {
      return (obj.clone(), false);
    }
    let obj = Arc::new(ValueObject::new(key.to_string(), short_name()));
    if objects.closed {
      obj.close();
    }
    objects.map.insert(key.to_string(), obj.clone());
    tracing::trace!("Registered {}", key);
    (obj, true)
  }

  pub fn snapshot(&self) -> Vec<Arc<ValueObject>> {
    self.objects.read().map.values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.objects.read().map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.objects.read().map.is_empty()
  }

  pub fn count_in(&self, state: SyncState) -> usize {
    self
      .objects
      .read()
      .map
      .values()
      .filter(|obj| obj.state() == state)
      .count()
  }

  /// Close every object; blocked accessors return `ShuttingDown`
  pub fn close_all(&self) {
    let objects = {
      let mut objects = self.objects.write();
      objects.closed = true;
      objects.map.values().cloned().collect::<Vec<_>>()
    };
    for obj in objects {
      obj.close();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn test_validate_key() {
    assert!(validate_key("stns.2.omega.position").is_ok());
    assert_eq!(validate_key(""), Err(CacheError::InvalidKey(String::new())));
    assert!(validate_key("has space").is_err());
    assert!(validate_key("tab\there").is_err());
  }

  #[test]
  fn test_concurrent_insert_creates_one_object() {
    let registry = Arc::new(Registry::new());
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let registry = registry.clone();
        thread::spawn(move || registry.get_or_insert("k", || "k".into()).1)
      })
      .collect();
    let created: usize = handles
      .into_iter()
      .map(|h| h.join().unwrap() as usize)
      .sum();
    assert_eq!(created, 1);
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn test_close_all() {
    let registry = Registry::new();
    let (obj, _) = registry.get_or_insert("a", || "a".into());
    registry.close_all();
    assert!(obj.lock().closed);
  }

  #[test]
  fn test_insert_after_close_is_closed() {
    let registry = Registry::new();
    registry.close_all();
    let (obj, created) = registry.get_or_insert("late", || "late".into());
    assert!(created);
    assert!(matches!(obj.wait_settled(None), Err(CacheError::ShuttingDown)));
  }
}
