//! Status reporting through the store: log ring, status report, heartbeat

use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

use crate::error::{CacheError, CacheResult};
use crate::lifecycle::ConfigCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
  pub severity: i32,
  pub msg: String,
}

/// Local time as written to the heartbeat key
pub fn heartbeat_stamp() -> String {
  chrono::Local::now()
    .format("%Y-%m-%d %H:%M:%S%.6f")
    .to_string()
}

impl ConfigCache {
  /// Append `msg` to the `log.message.{i}` ring
  pub fn log_remote(&self, msg: &str) -> CacheResult<()> {
    let slots = self.shared.settings.status.log_slots.max(1);
    let slot = self.shared.log_slot.fetch_add(1, Ordering::Relaxed) % slots;
    self.set(&format!("log.message.{}", slot), msg)
  }

  /// Write `{"severity": n, "msg": "..."}` to the status key
  pub fn status_report(&self, severity: i32, msg: &str) -> CacheResult<()> {
    let report = StatusReport {
      severity,
      msg: msg.to_string(),
    };
    let json = serde_json::to_string(&report)
      .map_err(|e| CacheError::Protocol(format!("cannot encode status: {}", e)))?;
    let key = self.shared.settings.status.status_key.clone();
    self.set(&key, json)
  }
}
