//! Named positions per device family.
//!
//! A family (typically a motor) keeps an ordered list of presets stored
//! under `{family}.presets.length`, `{family}.presets.{i}.name` and
//! `{family}.presets.{i}.position`. Position lookup turns a continuous
//! coordinate into a preset index. Indices are store slots: a malformed
//! slot is skipped on load but keeps its number.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cache::{ValueKind, Wait};
use crate::config::TieBreak;
use crate::error::{CacheError, CacheResult};
use crate::lifecycle::ConfigCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
  /// Slot `i` of `{family}.presets.{i}.*`
  pub slot: usize,
  pub name: String,
  pub position: f64,
}

/// Presets of one family in slot order, bounded by `capacity` slots
#[derive(Debug, Clone, PartialEq)]
pub struct PresetList {
  entries: Vec<Preset>,
  /// Store `length`: the slot the next append takes
  slots: usize,
  capacity: usize,
}

impl PresetList {
  pub fn new(capacity: usize) -> Self {
    Self::with_slots(capacity, 0)
  }

  /// Empty list for a family whose store table has `slots` slots
  pub fn with_slots(capacity: usize, slots: usize) -> Self {
    Self {
      entries: Vec::new(),
      slots,
      capacity,
    }
  }

  pub fn entries(&self) -> &[Preset] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn slots(&self) -> usize {
    self.slots
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  fn entry(&self, name: &str) -> Option<&Preset> {
    self.entries.iter().find(|p| p.name == name)
  }

  /// Exact, case-sensitive
  pub fn find(&self, name: &str) -> Option<f64> {
    self.entry(name).map(|p| p.position)
  }

  pub fn index_of(&self, name: &str) -> Option<usize> {
    self.entry(name).map(|p| p.slot)
  }

  /// Compare at most the first `n` characters of each name
  pub fn find_prefix(&self, name: &str, n: usize) -> Option<f64> {
    let wanted: String = name.chars().take(n).collect();
    self
      .entries
      .iter()
      .find(|p| p.name.chars().take(n).eq(wanted.chars()))
      .map(|p| p.position)
  }

  pub fn index_by_position(&self, position: f64, tolerance: f64, tie: TieBreak) -> Option<usize> {
    let within = self
      .entries
      .iter()
      .map(|p| (p.slot, (p.position - position).abs()))
      .filter(|(_, d)| *d <= tolerance);
    match tie {
      TieBreak::LowestIndex => within.map(|(i, _)| i).next(),
      TieBreak::Nearest => within
        .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
          Some((_, bd)) if bd <= d => best,
          _ => Some((i, d)),
        })
        .map(|(i, _)| i),
    }
  }

  /// Record the entry read from `slot`. The first slot holding a name wins.
  fn insert_loaded(&mut self, preset: Preset) -> Result<(), String> {
    if preset.slot >= self.capacity {
      return Err(format!("slot beyond capacity {}", self.capacity));
    }
    if let Some(first) = self.entry(&preset.name) {
      return Err(format!("duplicate of slot {}", first.slot));
    }
    self.slots = self.slots.max(preset.slot + 1);
    self.entries.push(preset);
    Ok(())
  }

  /// Update the position of `name`, or append it in the next free slot.
  /// Returns the slot and whether the list grew. A full list is left
  /// unchanged.
  pub fn upsert(&mut self, family: &str, name: &str, position: f64) -> CacheResult<(usize, bool)> {
    if let Some(entry) = self.entries.iter_mut().find(|p| p.name == name) {
      entry.position = position;
      return Ok((entry.slot, false));
    }
    if self.slots >= self.capacity {
      return Err(CacheError::Capacity {
        family: family.to_string(),
        capacity: self.capacity,
      });
    }
    let slot = self.slots;
    self.entries.push(Preset {
      slot,
      name: name.to_string(),
      position,
    });
    self.slots += 1;
    Ok((slot, true))
  }
}

/// Preset lists by family, behind their own lock
pub struct PresetIndex {
  families: RwLock<HashMap<String, PresetList>>,
  /// Held across a load or an update and its store writes
  mutation: Mutex<()>,
  capacity: usize,
  tie_break: TieBreak,
}

impl PresetIndex {
  pub fn new(capacity: usize, tie_break: TieBreak) -> Self {
    Self {
      families: RwLock::new(HashMap::new()),
      mutation: Mutex::new(()),
      capacity,
      tie_break,
    }
  }

  pub fn contains(&self, family: &str) -> bool {
    self.families.read().contains_key(family)
  }

  pub fn with<R>(&self, family: &str, f: impl FnOnce(&PresetList) -> R) -> Option<R> {
    self.families.read().get(family).map(f)
  }

  fn replace(&self, family: &str, list: PresetList) {
    self.families.write().insert(family.to_string(), list);
  }

  /// Returns the slot, whether it was appended, and the family's slot count
  fn upsert(&self, family: &str, name: &str, position: f64) -> CacheResult<(usize, bool, usize)> {
    let mut families = self.families.write();
    let list = families
      .entry(family.to_string())
      .or_insert_with(|| PresetList::new(self.capacity));
    let (slot, appended) = list.upsert(family, name, position)?;
    Ok((slot, appended, list.slots()))
  }
}

/// Outcome of [`ConfigCache::load_presets`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
  pub loaded: usize,
  pub skipped: usize,
}

fn length_key(family: &str) -> String {
  format!("{}.presets.length", family)
}

fn name_key(family: &str, i: usize) -> String {
  format!("{}.presets.{}.name", family, i)
}

fn position_key(family: &str, i: usize) -> String {
  format!("{}.presets.{}.position", family, i)
}

impl ConfigCache {
  /// (Re)read the presets of `family` from the store. Malformed entries
  /// are skipped and the load continues.
  pub fn load_presets(&self, family: &str) -> CacheResult<LoadReport> {
    let _mutation = self.shared.presets.mutation.lock();
    self.load_presets_locked(family)
  }

  fn load_presets_locked(&self, family: &str) -> CacheResult<LoadReport> {
    let wait = self.default_wait();
    let length = self
      .get_or_set(&length_key(family), 0i64, wait)?
      .as_i64()
      .unwrap_or(0)
      .max(0) as usize;

    let capacity = self.shared.presets.capacity;
    let mut list = PresetList::with_slots(capacity, length.min(capacity));
    let mut report = LoadReport::default();
    for slot in 0..length {
      let loaded = self
        .read_preset(family, slot, wait)
        .and_then(|preset| list.insert_loaded(preset));
      match loaded {
        Ok(()) => report.loaded += 1,
        Err(reason) => {
          tracing::warn!("Skipping preset {} of {}: {}", slot, family, reason);
          report.skipped += 1;
        }
      }
    }

    tracing::debug!(
      "Loaded {} presets for {} ({} skipped)",
      report.loaded,
      family,
      report.skipped
    );
    self.shared.presets.replace(family, list);
    Ok(report)
  }

  fn read_preset(&self, family: &str, slot: usize, wait: Wait) -> Result<Preset, String> {
    let name = self
      .get_raw(&name_key(family, slot), wait)
      .map_err(|e| e.to_string())?;
    if name.is_empty() {
      return Err("empty name".into());
    }
    let raw = self
      .get_raw(&position_key(family, slot), wait)
      .map_err(|e| e.to_string())?;
    let position: f64 = raw
      .trim()
      .parse()
      .map_err(|_| format!("position {:?} is not a number", raw))?;
    if !position.is_finite() {
      return Err(format!("position {} is not finite", position));
    }
    Ok(Preset {
      slot,
      name,
      position,
    })
  }

  fn ensure_presets(&self, family: &str) -> CacheResult<()> {
    if !self.shared.presets.contains(family) {
      self.load_presets(family)?;
    }
    Ok(())
  }

  pub fn presets(&self, family: &str) -> CacheResult<Vec<Preset>> {
    self.ensure_presets(family)?;
    Ok(
      self
        .shared
        .presets
        .with(family, |list| list.entries().to_vec())
        .unwrap_or_default(),
    )
  }

  /// Position of the preset called `name`. A miss reloads the family once.
  pub fn find_preset(&self, family: &str, name: &str) -> CacheResult<f64> {
    self.ensure_presets(family)?;
    let found = self.shared.presets.with(family, |list| list.find(name)).flatten();
    if let Some(position) = found {
      return Ok(position);
    }
    self.load_presets(family)?;
    self
      .shared
      .presets
      .with(family, |list| list.find(name))
      .flatten()
      .ok_or_else(|| CacheError::NotFound(format!("preset {} of {}", name, family)))
  }

  pub fn find_preset_prefix(&self, family: &str, name: &str, n: usize) -> CacheResult<f64> {
    self.ensure_presets(family)?;
    self
      .shared
      .presets
      .with(family, |list| list.find_prefix(name, n))
      .flatten()
      .ok_or_else(|| CacheError::NotFound(format!("preset {} of {}", name, family)))
  }

  pub fn find_preset_index_by_name(&self, family: &str, name: &str) -> CacheResult<usize> {
    self.ensure_presets(family)?;
    self
      .shared
      .presets
      .with(family, |list| list.index_of(name))
      .flatten()
      .ok_or_else(|| CacheError::NotFound(format!("preset {} of {}", name, family)))
  }

  /// Index of the preset within `tolerance` of `position`, by the configured
  /// tie-break
  pub fn find_preset_index_by_position(
    &self,
    family: &str,
    position: f64,
    tolerance: f64,
  ) -> CacheResult<Option<usize>> {
    self.ensure_presets(family)?;
    let tie = self.shared.presets.tie_break;
    Ok(
      self
        .shared
        .presets
        .with(family, |list| list.index_by_position(position, tolerance, tie))
        .flatten(),
    )
  }

  /// Update or append a preset and write it to the store. Returns its slot.
  pub fn set_preset(&self, family: &str, name: &str, position: f64) -> CacheResult<usize> {
    if name.is_empty() {
      return Err(CacheError::InvalidKey(format!("{}.presets: empty name", family)));
    }
    if !position.is_finite() {
      return Err(CacheError::Undecodable {
        key: format!("{}.presets.{}", family, name),
        kind: ValueKind::Double,
      });
    }
    let _mutation = self.shared.presets.mutation.lock();
    if !self.shared.presets.contains(family) {
      self.load_presets_locked(family)?;
    }
    let (slot, appended, slots) = self.shared.presets.upsert(family, name, position)?;
    self.set(&name_key(family, slot), name)?;
    self.set(&position_key(family, slot), position)?;
    if appended {
      self.set(&length_key(family), slots as i64)?;
    }
    tracing::debug!("Preset {} of {} = {} (slot {})", name, family, position, slot);
    Ok(slot)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> PresetList {
    let mut list = PresetList::new(3);
    list.upsert("omega", "in", 0.0).unwrap();
    list.upsert("omega", "light", 5.0).unwrap();
    list.upsert("omega", "out", 5.2).unwrap();
    list
  }

  #[test]
  fn test_index_by_position_lowest_index() {
    let list = sample();
    assert_eq!(list.index_by_position(5.1, 0.5, TieBreak::LowestIndex), Some(1));
    assert_eq!(list.index_by_position(0.3, 0.5, TieBreak::LowestIndex), Some(0));
    assert_eq!(list.index_by_position(2.5, 0.5, TieBreak::LowestIndex), None);
  }

  #[test]
  fn test_index_by_position_nearest() {
    let list = sample();
    assert_eq!(list.index_by_position(5.15, 0.5, TieBreak::Nearest), Some(2));
    assert_eq!(list.index_by_position(5.15, 0.5, TieBreak::LowestIndex), Some(1));
  }

  #[test]
  fn test_nearest_prefers_lowest_index_on_equal_distance() {
    let mut list = PresetList::new(4);
    list.upsert("x", "a", 1.0).unwrap();
    list.upsert("x", "b", 3.0).unwrap();
    assert_eq!(list.index_by_position(2.0, 1.0, TieBreak::Nearest), Some(0));
  }

  #[test]
  fn test_upsert_updates_in_place() {
    let mut list = sample();
    assert_eq!(list.upsert("omega", "light", 4.9).unwrap(), (1, false));
    assert_eq!(list.find("light"), Some(4.9));
    assert_eq!(list.len(), 3);
  }

  #[test]
  fn test_capacity_leaves_entries_unchanged() {
    let mut list = sample();
    let before = list.clone();
    let err = list.upsert("omega", "extra", 9.0).unwrap_err();
    assert_eq!(
      err,
      CacheError::Capacity {
        family: "omega".into(),
        capacity: 3
      }
    );
    assert_eq!(list, before);
  }

  #[test]
  fn test_find_is_case_sensitive() {
    let list = sample();
    assert_eq!(list.find("in"), Some(0.0));
    assert_eq!(list.find("In"), None);
  }

  #[test]
  fn test_find_prefix() {
    let list = sample();
    assert_eq!(list.find_prefix("lightning", 5), Some(5.0));
    assert_eq!(list.find_prefix("ou", 2), Some(5.2));
    assert_eq!(list.find_prefix("lightning", 6), None);
  }

  #[test]
  fn test_loaded_entries_keep_their_slots() {
    let mut list = PresetList::with_slots(8, 4);
    let loaded = |slot: usize, name: &str, position: f64| Preset {
      slot,
      name: name.into(),
      position,
    };
    list.insert_loaded(loaded(0, "in", 0.0)).unwrap();
    list.insert_loaded(loaded(2, "out", 5.0)).unwrap();
    assert!(list.insert_loaded(loaded(3, "in", 9.0)).is_err());

    assert_eq!(list.index_of("out"), Some(2));
    assert_eq!(list.index_by_position(5.0, 0.1, TieBreak::LowestIndex), Some(2));
    assert_eq!(list.find("in"), Some(0.0));
    assert_eq!(list.upsert("omega", "out", 6.0).unwrap(), (2, false));
    assert_eq!(list.upsert("omega", "park", 7.0).unwrap(), (4, true));
    assert_eq!(list.slots(), 5);
  }
}
