use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub keys: usize,
  pub synced: usize,
  pub fetches: u64,
  pub writes: u64,
  pub failed_writes: u64,
  pub notifications: u64,
  pub reconnects: u64,
}

impl CacheStats {
  pub fn synced_ratio(&self) -> f64 {
    if self.keys == 0 {
      0.0
    } else {
      self.synced as f64 / self.keys as f64
    }
  }
}

/// Counters bumped by the worker
#[derive(Debug, Default)]
pub(crate) struct Counters {
  pub fetches: AtomicU64,
  pub writes: AtomicU64,
  pub failed_writes: AtomicU64,
  pub notifications: AtomicU64,
  pub reconnects: AtomicU64,
}

impl Counters {
  pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self, keys: usize, synced: usize) -> CacheStats {
    CacheStats {
      keys,
      synced,
      fetches: self.fetches.load(Ordering::Relaxed),
      writes: self.writes.load(Ordering::Relaxed),
      failed_writes: self.failed_writes.load(Ordering::Relaxed),
      notifications: self.notifications.load(Ordering::Relaxed),
      reconnects: self.reconnects.load(Ordering::Relaxed),
    }
  }
}
