#![allow(dead_code)]

use kvmirror::remote::MemoryStore;
use kvmirror::{ConfigCache, Settings};
use std::time::{Duration, Instant};

pub const HOST: &str = "testhost";

/// Settings tuned for fast tests against the memory store
pub fn settings() -> Settings {
  let mut settings = Settings::default();
  settings.cache.host_name = HOST.into();
  settings.cache.default_wait_ms = 2000;
  settings.cache.connect_timeout_ms = 2000;
  settings.worker.heartbeat_ms = 50;
  settings.worker.backoff_initial_ms = 10;
  settings.worker.backoff_max_ms = 50;
  settings.status.heartbeat_key = String::new();
  settings
}

pub fn start(store: &MemoryStore) -> ConfigCache {
  start_with(store, settings())
}

pub fn start_with(store: &MemoryStore, settings: Settings) -> ConfigCache {
  ConfigCache::init(settings, store.connector()).unwrap()
}

/// Poll `f` until it holds or three seconds pass
pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + Duration::from_secs(3);
  while Instant::now() < deadline {
    if f() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(5));
  }
  f()
}
