//! Preset index tests against the in-memory store

mod common;

use common::{settings, start, start_with, wait_until};
use kvmirror::remote::MemoryStore;
use kvmirror::{CacheError, LoadReport, TieBreak};
use std::sync::Arc;
use std::thread;

fn seed_family(store: &MemoryStore, family: &str, presets: &[(&str, &str)]) {
  store.seed(&format!("{}.presets.length", family), &presets.len().to_string());
  for (i, (name, position)) in presets.iter().enumerate() {
    store.seed(&format!("{}.presets.{}.name", family, i), name);
    store.seed(&format!("{}.presets.{}.position", family, i), position);
  }
}

// =============================================================================
// Loading and lookup
// =============================================================================

#[test]
fn test_load_and_lookup() {
  let store = MemoryStore::new();
  seed_family(&store, "omega", &[("in", "0.0"), ("light", "5.0"), ("out", "5.2")]);
  let cache = start(&store);

  assert_eq!(
    cache.load_presets("omega").unwrap(),
    LoadReport {
      loaded: 3,
      skipped: 0
    }
  );
  assert_eq!(
    cache.find_preset_index_by_position("omega", 5.1, 0.5).unwrap(),
    Some(1)
  );
  assert_eq!(
    cache.find_preset_index_by_position("omega", 2.5, 0.5).unwrap(),
    None
  );
  assert_eq!(cache.find_preset("omega", "out").unwrap(), 5.2);
  assert_eq!(cache.find_preset_index_by_name("omega", "light").unwrap(), 1);
  assert_eq!(cache.find_preset_prefix("omega", "lightfield", 5).unwrap(), 5.0);
}

#[test]
fn test_nearest_tie_break() {
  let store = MemoryStore::new();
  seed_family(&store, "omega", &[("in", "0.0"), ("light", "5.0"), ("out", "5.2")]);
  let mut settings = settings();
  settings.presets.tie_break = TieBreak::Nearest;
  let cache = start_with(&store, settings);

  assert_eq!(
    cache.find_preset_index_by_position("omega", 5.15, 0.5).unwrap(),
    Some(2)
  );
}

#[test]
fn test_malformed_entries_are_skipped() {
  let store = MemoryStore::new();
  seed_family(
    &store,
    "kappa",
    &[("in", "1"), ("", "2"), ("park", "3.5"), ("broken", "abc")],
  );
  let cache = start(&store);

  assert_eq!(
    cache.load_presets("kappa").unwrap(),
    LoadReport {
      loaded: 2,
      skipped: 2
    }
  );
  let names: Vec<String> = cache
    .presets("kappa")
    .unwrap()
    .into_iter()
    .map(|p| p.name)
    .collect();
  assert_eq!(names, vec!["in", "park"]);
}

#[test]
fn test_unknown_preset_is_not_found() {
  let store = MemoryStore::new();
  seed_family(&store, "omega", &[("in", "0.0")]);
  let cache = start(&store);
  assert!(matches!(
    cache.find_preset("omega", "nowhere"),
    Err(CacheError::NotFound(_))
  ));
  assert!(matches!(
    cache.find_preset("omega", "IN"),
    Err(CacheError::NotFound(_))
  ));
}

#[test]
fn test_miss_reloads_family() {
  let store = MemoryStore::new();
  seed_family(&store, "omega", &[("in", "0.0")]);
  let cache = start(&store);
  cache.load_presets("omega").unwrap();

  store.external_set("omega.presets.1.name", "out", "other");
  store.external_set("omega.presets.1.position", "7.5", "other");
  store.external_set("omega.presets.length", "2", "other");
  assert!(wait_until(|| {
    cache.get_integer("omega.presets.length").unwrap() == 2
      && cache.sync_state("omega.presets.1.position") == Some(kvmirror::SyncState::Synced)
  }));

  assert_eq!(cache.find_preset("omega", "out").unwrap(), 7.5);
}

// =============================================================================
// Updates
// =============================================================================

#[test]
fn test_set_preset_appends_and_writes() {
  let store = MemoryStore::new();
  let cache = start(&store);

  assert_eq!(cache.set_preset("kappa", "in", 1.0).unwrap(), 0);
  assert_eq!(cache.set_preset("kappa", "out", 2.5).unwrap(), 1);
  assert_eq!(cache.set_preset("kappa", "in", 1.25).unwrap(), 0);

  assert!(wait_until(|| {
    store.value("kappa.presets.length").as_deref() == Some("2")
      && store.value("kappa.presets.0.name").as_deref() == Some("in")
      && store.value("kappa.presets.0.position").as_deref() == Some("1.25")
      && store.value("kappa.presets.1.position").as_deref() == Some("2.5")
  }));
  assert_eq!(cache.find_preset("kappa", "in").unwrap(), 1.25);
}

#[test]
fn test_skipped_entry_keeps_store_slots() {
  let store = MemoryStore::new();
  seed_family(&store, "omega", &[("in", "0.0"), ("broken", "abc"), ("out", "5.0")]);
  let cache = start(&store);

  assert_eq!(
    cache.load_presets("omega").unwrap(),
    LoadReport {
      loaded: 2,
      skipped: 1
    }
  );
  assert_eq!(
    cache.find_preset_index_by_position("omega", 5.0, 0.1).unwrap(),
    Some(2)
  );
  assert_eq!(cache.find_preset_index_by_name("omega", "out").unwrap(), 2);

  assert_eq!(cache.set_preset("omega", "out", 6.0).unwrap(), 2);
  assert_eq!(cache.set_preset("omega", "park", 7.0).unwrap(), 3);
  assert!(wait_until(|| {
    store.value("omega.presets.2.position").as_deref() == Some("6")
      && store.value("omega.presets.3.name").as_deref() == Some("park")
      && store.value("omega.presets.length").as_deref() == Some("4")
  }));
  assert_eq!(store.value("omega.presets.1.name").as_deref(), Some("broken"));
  assert_eq!(store.value("omega.presets.1.position").as_deref(), Some("abc"));
  assert_eq!(store.value("omega.presets.2.name").as_deref(), Some("out"));
}

#[test]
fn test_concurrent_appends_keep_every_entry() {
  let store = MemoryStore::new();
  let cache = Arc::new(start(&store));

  let writers: Vec<_> = (0..4)
    .map(|t| {
      let cache = cache.clone();
      thread::spawn(move || {
        for i in 0..5 {
          cache
            .set_preset("sigma", &format!("p{}-{}", t, i), (t * 10 + i) as f64)
            .unwrap();
        }
      })
    })
    .collect();
  for writer in writers {
    writer.join().unwrap();
  }

  assert!(wait_until(|| store.value("sigma.presets.length").as_deref() == Some("20")));
  let mut names: Vec<String> = (0..20)
    .filter_map(|i| store.value(&format!("sigma.presets.{}.name", i)))
    .collect();
  names.sort();
  names.dedup();
  assert_eq!(names.len(), 20);
  assert_eq!(cache.presets("sigma").unwrap().len(), 20);
}

#[test]
fn test_set_preset_at_capacity() {
  let store = MemoryStore::new();
  let mut settings = settings();
  settings.presets.capacity = 2;
  let cache = start_with(&store, settings);

  cache.set_preset("phi", "a", 1.0).unwrap();
  cache.set_preset("phi", "b", 2.0).unwrap();
  let err = cache.set_preset("phi", "c", 3.0).unwrap_err();
  assert_eq!(
    err,
    CacheError::Capacity {
      family: "phi".into(),
      capacity: 2
    }
  );

  let presets = cache.presets("phi").unwrap();
  assert_eq!(presets.len(), 2);
  assert_eq!(presets[1].name, "b");
  assert!(wait_until(|| store.value("phi.presets.length").as_deref() == Some("2")));
  assert_eq!(store.value("phi.presets.2.name"), None);

  // Updating an existing entry still works when full
  assert_eq!(cache.set_preset("phi", "a", 1.5).unwrap(), 0);
}

#[test]
fn test_set_preset_rejects_empty_name() {
  let store = MemoryStore::new();
  let cache = start(&store);
  assert!(matches!(
    cache.set_preset("phi", "", 1.0),
    Err(CacheError::InvalidKey(_))
  ));
  assert!(cache.set_preset("phi", "nan", f64::NAN).is_err());
}
