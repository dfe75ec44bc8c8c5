//! Connection loss and recovery

mod common;

use common::{settings, start, start_with, wait_until};
use kvmirror::remote::MemoryStore;
use kvmirror::{CacheError, ConfigCache, LifecycleState};
use std::time::Duration;

#[test]
fn test_resubscribes_and_refetches_after_disconnect() {
  let store = MemoryStore::new();
  store.seed("omega.speed", "1");
  let cache = start(&store);
  assert_eq!(cache.get_integer("omega.speed").unwrap(), 1);
  assert_eq!(store.connect_count(), 1);

  // Changed while nobody was listening
  store.seed("omega.speed", "2");
  store.disconnect();

  assert!(wait_until(|| store.connect_count() >= 2));
  assert!(wait_until(|| cache.get_integer("omega.speed").unwrap() == 2));
  assert!(wait_until(|| store.subscriber_count() == 1));
  assert!(cache.stats().reconnects >= 1);
  assert!(cache.resolve("omega.speed").unwrap().is_subscribed());

  // Notifications flow again on the new subscription
  store.external_set("omega.speed", "3", "other");
  assert!(wait_until(|| cache.get_integer("omega.speed").unwrap() == 3));
}

#[test]
fn test_writes_during_outage_are_replayed() {
  let store = MemoryStore::new();
  let cache = start(&store);
  store.refuse_connects(6);
  store.disconnect();
  assert!(wait_until(|| cache.state() == LifecycleState::Connecting));

  cache.set("omega.target", 3i64).unwrap();
  cache.set("omega.target", 4i64).unwrap();
  assert_eq!(cache.get_integer("omega.target").unwrap(), 4);

  assert!(wait_until(|| store.value("omega.target").as_deref() == Some("4")));
  assert!(wait_until(|| cache.state() == LifecycleState::Running));
  assert_eq!(store.write_count("omega.target"), 1);

  // The replayed echo is consumed; a later foreign change still applies
  store.external_set("omega.target", "9", "other");
  assert!(wait_until(|| cache.get_integer("omega.target").unwrap() == 9));
}

#[test]
fn test_startup_retries_refused_connects() {
  let store = MemoryStore::new();
  store.seed("omega.speed", "5");
  store.refuse_connects(2);
  let cache = start(&store);
  assert_eq!(store.connect_count(), 1);
  assert_eq!(cache.get_integer("omega.speed").unwrap(), 5);
}

#[test]
fn test_connect_timeout() {
  let store = MemoryStore::new();
  store.refuse_connects(usize::MAX);
  let mut settings = settings();
  settings.cache.connect_timeout_ms = 100;
  let err = ConfigCache::init(settings, store.connector()).unwrap_err();
  assert_eq!(err, CacheError::Timeout("initial connection".into()));
}

#[test]
fn test_reader_blocked_by_outage_resumes() {
  let store = MemoryStore::new();
  let cache = std::sync::Arc::new(start(&store));
  store.seed("omega.late", "8");
  store.hold_fetches();

  let reader = {
    let cache = cache.clone();
    std::thread::spawn(move || cache.get_integer("omega.late"))
  };
  assert!(wait_until(|| store.fetch_count("omega.late") == 1));

  store.disconnect();
  store.release_fetches();
  std::thread::sleep(Duration::from_millis(20));

  assert_eq!(reader.join().unwrap().unwrap(), 8);
  assert!(store.fetch_count("omega.late") >= 2);
}

#[test]
fn test_unanswered_bootstrap_reconnects() {
  let store = MemoryStore::new();
  store.seed("omega.speed", "5");
  store.hold_fetches();
  let mut settings = settings();
  settings.worker.stall_after_ms = 100;

  let release = {
    let store = store.clone();
    std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(350));
      store.release_fetches();
    })
  };
  let cache = start_with(&store, settings);
  release.join().unwrap();

  assert!(store.connect_count() >= 2);
  assert_eq!(cache.get_integer("omega.speed").unwrap(), 5);
}

#[test]
fn test_shutdown_while_bootstrap_unanswered() {
  let store = MemoryStore::new();
  store.hold_fetches();
  let mut settings = settings();
  settings.worker.stall_after_ms = 100;
  settings.cache.connect_timeout_ms = 250;

  let started = std::time::Instant::now();
  let err = ConfigCache::init(settings, store.connector()).unwrap_err();
  assert_eq!(err, CacheError::Timeout("initial connection".into()));
  assert!(started.elapsed() < Duration::from_secs(2));
}
