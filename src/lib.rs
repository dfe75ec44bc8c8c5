//! Thread-safe local mirror of configuration held in Redis.
//!
//! Values live in the store as hashes (`VALUE` field) and are kept current
//! through keyspace notifications and publisher announcements. Any number of
//! threads read and write through [`ConfigCache`]; a single worker thread
//! owns every connection.
//!
//! ```no_run
//! use kvmirror::{ConfigCache, Settings};
//!
//! let cache = ConfigCache::connect(Settings::default())?;
//! let speed = cache.get_double("omega.speed")?;
//! cache.set("omega.speed", speed * 2.0)?;
//! # Ok::<(), kvmirror::CacheError>(())
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod presets;
pub mod remote;
pub mod stats;
pub mod status;
mod worker;

pub use cache::{SyncState, Value, ValueKind, ValueObject, Wait};
pub use config::{KeyFilter, RemoteConfig, Settings, TieBreak};
pub use error::{CacheError, CacheResult, RemoteError};
pub use lifecycle::{ConfigCache, LifecycleState};
pub use presets::{LoadReport, Preset, PresetList};
pub use stats::CacheStats;
pub use status::StatusReport;
