//! Cache context: startup, readiness, shutdown

use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::cache::Registry;
use crate::config::{Effective, KeyFilter, RemoteConfig, Settings};
use crate::error::{CacheError, CacheResult};
use crate::presets::PresetIndex;
use crate::remote::Connector;
use crate::stats::{CacheStats, Counters};
use crate::worker::{Request, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
  Init = 0,
  Connecting = 1,
  Running = 2,
  Draining = 3,
  Stopped = 4,
}

impl LifecycleState {
  fn from_u8(v: u8) -> Self {
    match v {
      0 => LifecycleState::Init,
      1 => LifecycleState::Connecting,
      2 => LifecycleState::Running,
      3 => LifecycleState::Draining,
      _ => LifecycleState::Stopped,
    }
  }

  pub fn is_closing(self) -> bool {
    self >= LifecycleState::Draining
  }
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      LifecycleState::Init => write!(f, "init"),
      LifecycleState::Connecting => write!(f, "connecting"),
      LifecycleState::Running => write!(f, "running"),
      LifecycleState::Draining => write!(f, "draining"),
      LifecycleState::Stopped => write!(f, "stopped"),
    }
  }
}

/// State shared between caller threads and the worker
pub(crate) struct Shared {
  pub settings: Settings,
  pub registry: Registry,
  pub presets: PresetIndex,
  pub remote: RwLock<RemoteConfig>,
  pub effective: RwLock<Effective>,
  pub counters: Counters,
  pub requests: mpsc::UnboundedSender<Request>,
  pub log_slot: AtomicUsize,
  state: AtomicU8,
  ready: Mutex<bool>,
  ready_cond: Condvar,
}

impl Shared {
  pub fn lifecycle(&self) -> LifecycleState {
    LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
  }

  /// Move `from` → `to`; false if the state was something else
  pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
    let moved = self
      .state
      .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok();
    if moved {
      tracing::debug!("Cache {} -> {}", from, to);
    }
    moved
  }

  fn set_lifecycle(&self, to: LifecycleState) {
    self.state.store(to as u8, Ordering::SeqCst);
  }

  pub fn ensure_open(&self) -> CacheResult<()> {
    if self.lifecycle().is_closing() {
      return Err(CacheError::ShuttingDown);
    }
    Ok(())
  }

  pub fn send(&self, request: Request) {
    if self.requests.send(request).is_err() {
      tracing::debug!("Worker gone, request dropped");
    }
  }

  pub fn set_ready(&self) {
    let mut ready = self.ready.lock();
    if !*ready {
      *ready = true;
      tracing::info!("Initial load complete, {} keys", self.registry.len());
    }
    self.ready_cond.notify_all();
  }

  fn wake_ready_waiters(&self) {
    let _guard = self.ready.lock();
    self.ready_cond.notify_all();
  }
}

/// A running mirror of the remote configuration store.
///
/// Accessors may be called from any thread; they block only the calling
/// thread. Dropping the cache shuts it down.
pub struct ConfigCache {
  pub(crate) shared: Arc<Shared>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigCache {
  /// Start the worker and block until the first bootstrap succeeded, a fatal
  /// error occurred, or `cache.connect_timeout_ms` passed.
  pub fn init<C: Connector>(settings: Settings, connector: C) -> CacheResult<Self> {
    let effective = Effective::resolve(&settings.cache, &RemoteConfig::default())?;
    let (tx, rx) = mpsc::unbounded_channel();
    let connect_timeout = settings.cache.connect_timeout();

    let shared = Arc::new(Shared {
      presets: PresetIndex::new(settings.presets.capacity, settings.presets.tie_break),
      settings,
      registry: Registry::new(),
      remote: RwLock::new(RemoteConfig::default()),
      effective: RwLock::new(effective),
      counters: Counters::default(),
      requests: tx,
      log_slot: AtomicUsize::new(0),
      state: AtomicU8::new(LifecycleState::Init as u8),
      ready: Mutex::new(false),
      ready_cond: Condvar::new(),
    });

    let (startup_tx, startup_rx) = std::sync::mpsc::channel();
    shared.set_lifecycle(LifecycleState::Connecting);
    let worker = Worker::new(shared.clone(), connector, rx, startup_tx.clone());
    let handle = std::thread::Builder::new()
      .name("kvmirror-worker".into())
      .spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
          .enable_all()
          .build();
        match runtime {
          Ok(rt) => rt.block_on(worker.run()),
          Err(e) => {
            let _ = startup_tx.send(Err(CacheError::Connection(format!(
              "cannot build worker runtime: {}",
              e
            ))));
          }
        }
      })
      .map_err(|e| CacheError::Connection(format!("cannot spawn worker: {}", e)))?;

    let cache = Self {
      shared,
      worker: Mutex::new(Some(handle)),
    };

    let outcome = match connect_timeout {
      Some(timeout) => startup_rx
        .recv_timeout(timeout)
        .unwrap_or_else(|_| Err(CacheError::Timeout("initial connection".into()))),
      None => startup_rx
        .recv()
        .unwrap_or_else(|_| Err(CacheError::Connection("worker exited".into()))),
    };

    match outcome {
      Ok(()) => {
        tracing::info!("Config cache running");
        Ok(cache)
      }
      Err(e) => {
        tracing::warn!("Config cache failed to start: {}", e);
        cache.shutdown();
        Err(e)
      }
    }
  }

  /// Connect to the Redis server named in `settings.redis`
  #[cfg(feature = "redis-backend")]
  pub fn connect(settings: Settings) -> CacheResult<Self> {
    let connector = crate::remote::RedisConnector::new(&settings.redis)?;
    Self::init(settings, connector)
  }

  pub fn state(&self) -> LifecycleState {
    self.shared.lifecycle()
  }

  pub fn settings(&self) -> &Settings {
    &self.shared.settings
  }

  /// Remote config fetched at the last bootstrap
  pub fn remote_config(&self) -> RemoteConfig {
    self.shared.remote.read().clone()
  }

  pub fn key_filter(&self) -> KeyFilter {
    self.shared.effective.read().filter.clone()
  }

  /// True once the initial enumeration of the store has been loaded
  pub fn is_ready(&self) -> bool {
    *self.shared.ready.lock()
  }

  /// Wait for readiness; false on timeout or shutdown
  pub fn wait_ready(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut ready = self.shared.ready.lock();
    while !*ready {
      if self.shared.lifecycle().is_closing() {
        return false;
      }
      if self
        .shared
        .ready_cond
        .wait_until(&mut ready, deadline)
        .timed_out()
      {
        return *ready;
      }
    }
    true
  }

  pub fn stats(&self) -> CacheStats {
    let registry = &self.shared.registry;
    self.shared.counters.snapshot(
      registry.len(),
      registry.count_in(crate::cache::SyncState::Synced),
    )
  }

  /// Stop the worker. Blocked accessors return `ShuttingDown`; queued writes
  /// get `cache.drain_timeout_ms` to reach the store. Idempotent.
  pub fn shutdown(&self) {
    let Some(handle) = self.worker.lock().take() else {
      return;
    };
    self.shared.set_lifecycle(LifecycleState::Draining);
    tracing::info!("Shutting down config cache");
    self.shared.registry.close_all();
    self.shared.wake_ready_waiters();
    self.shared.send(Request::Shutdown);
    if handle.join().is_err() {
      tracing::warn!("Worker thread panicked");
    }
    self.shared.set_lifecycle(LifecycleState::Stopped);
    tracing::info!("Config cache stopped");
  }
}

impl Drop for ConfigCache {
  fn drop(&mut self) {
    self.shutdown();
  }
}

impl std::fmt::Debug for ConfigCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConfigCache")
      .field("state", &self.state())
      .field("ready", &self.is_ready())
      .field("keys", &self.shared.registry.len())
      .finish()
  }
}
