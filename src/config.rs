use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Expand `$VAR_NAME` and `${VAR_NAME}` from the environment. Unset
/// variables expand to nothing.
fn expand_env_vars(input: &str) -> String {
  let Ok(re) = Regex::new(r"\$\{([^}]*)\}|\$([A-Za-z0-9_]+)") else {
    return input.to_string();
  };
  re.replace_all(input, |caps: &regex::Captures<'_>| {
    let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
    std::env::var(name).unwrap_or_default()
  })
  .into_owned()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
  #[serde(default)]
  pub redis: RedisSection,
  #[serde(default)]
  pub cache: CacheSection,
  #[serde(default)]
  pub worker: WorkerSection,
  #[serde(default)]
  pub presets: PresetsSection,
  #[serde(default)]
  pub status: StatusSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

/// Connection to the Redis server holding the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSection {
  #[serde(default = "default_redis_host")]
  pub host: String,
  #[serde(default = "default_redis_port")]
  pub port: u16,
  #[serde(default)]
  pub password: Option<String>,
  #[serde(default)]
  pub database: u8,
}

fn default_redis_host() -> String {
  "localhost".into()
}
fn default_redis_port() -> u16 {
  6379
}

impl Default for RedisSection {
  fn default() -> Self {
    Self {
      host: default_redis_host(),
      port: default_redis_port(),
      password: None,
      database: 0,
    }
  }
}

impl RedisSection {
  pub fn connection_url(&self) -> String {
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.database)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
  /// Prefix joined to accessor names; overrides the remote `HEAD`
  #[serde(default)]
  pub head: Option<String>,

  /// Channel announcing our writes; overrides the remote `PUB`
  #[serde(default)]
  pub publisher: Option<String>,

  /// Name used to locate the remote config hash
  #[serde(default = "default_host_name")]
  pub host_name: String,

  /// Hash holding the remote config (default `config.<host_name>`)
  #[serde(default)]
  pub config_key: Option<String>,

  /// Key filter regex; overrides the remote `RE`
  #[serde(default)]
  pub key_filter: Option<String>,

  #[serde(default = "default_subscribe_patterns")]
  pub subscribe_patterns: Vec<String>,

  /// Wait applied by the typed getters (0 = wait forever)
  #[serde(default = "default_wait_ms")]
  pub default_wait_ms: u64,

  /// Bound on `init` reaching RUNNING (0 = wait forever)
  #[serde(default)]
  pub connect_timeout_ms: u64,

  /// Time given to outstanding writes at shutdown
  #[serde(default = "default_drain_timeout_ms")]
  pub drain_timeout_ms: u64,
}

fn default_host_name() -> String {
  std::env::var("HOSTNAME")
    .ok()
    .filter(|h| !h.is_empty())
    .or_else(|| {
      std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
    })
    .unwrap_or_else(|| "localhost".into())
}
fn default_subscribe_patterns() -> Vec<String> {
  vec!["__keyspace@*__:*".into()]
}
fn default_wait_ms() -> u64 {
  5000
}
fn default_drain_timeout_ms() -> u64 {
  2000
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      head: None,
      publisher: None,
      host_name: default_host_name(),
      config_key: None,
      key_filter: None,
      subscribe_patterns: default_subscribe_patterns(),
      default_wait_ms: default_wait_ms(),
      connect_timeout_ms: 0,
      drain_timeout_ms: default_drain_timeout_ms(),
    }
  }
}

impl CacheSection {
  pub fn config_key(&self) -> String {
    self
      .config_key
      .clone()
      .unwrap_or_else(|| format!("config.{}", self.host_name))
  }

  pub fn default_wait(&self) -> Option<Duration> {
    (self.default_wait_ms > 0).then(|| Duration::from_millis(self.default_wait_ms))
  }

  pub fn connect_timeout(&self) -> Option<Duration> {
    (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
  }

  pub fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.drain_timeout_ms)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
  #[serde(default = "default_heartbeat_ms")]
  pub heartbeat_ms: u64,
  /// Outstanding interest without progress for this long forces a reconnect
  #[serde(default = "default_stall_after_ms")]
  pub stall_after_ms: u64,
  #[serde(default = "default_backoff_initial_ms")]
  pub backoff_initial_ms: u64,
  #[serde(default = "default_backoff_max_ms")]
  pub backoff_max_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
  1000
}
fn default_stall_after_ms() -> u64 {
  10_000
}
fn default_backoff_initial_ms() -> u64 {
  100
}
fn default_backoff_max_ms() -> u64 {
  5000
}

impl Default for WorkerSection {
  fn default() -> Self {
    Self {
      heartbeat_ms: default_heartbeat_ms(),
      stall_after_ms: default_stall_after_ms(),
      backoff_initial_ms: default_backoff_initial_ms(),
      backoff_max_ms: default_backoff_max_ms(),
    }
  }
}

/// Which entry wins when several presets lie within tolerance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
  #[default]
  LowestIndex,
  Nearest,
}

impl std::fmt::Display for TieBreak {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TieBreak::LowestIndex => write!(f, "lowest_index"),
      TieBreak::Nearest => write!(f, "nearest"),
    }
  }
}

impl std::str::FromStr for TieBreak {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "lowest_index" | "lowest-index" | "first" => Ok(TieBreak::LowestIndex),
      "nearest" | "closest" => Ok(TieBreak::Nearest),
      _ => Err(format!("Unknown tie break: {}", s)),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetsSection {
  #[serde(default = "default_preset_capacity")]
  pub capacity: usize,
  #[serde(default)]
  pub tie_break: TieBreak,
}

fn default_preset_capacity() -> usize {
  64
}

impl Default for PresetsSection {
  fn default() -> Self {
    Self {
      capacity: default_preset_capacity(),
      tie_break: TieBreak::default(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSection {
  /// Size of the `log.message.{i}` ring
  #[serde(default = "default_log_slots")]
  pub log_slots: usize,
  #[serde(default = "default_status_key")]
  pub status_key: String,
  /// Key receiving the heartbeat timestamp; empty disables it
  #[serde(default = "default_heartbeat_key")]
  pub heartbeat_key: String,
}

fn default_log_slots() -> usize {
  32
}
fn default_status_key() -> String {
  "status".into()
}
fn default_heartbeat_key() -> String {
  "time".into()
}

impl Default for StatusSection {
  fn default() -> Self {
    Self {
      log_slots: default_log_slots(),
      status_key: default_status_key(),
      heartbeat_key: default_heartbeat_key(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}
fn default_level() -> String {
  "info".into()
}
impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl Settings {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    let expanded = expand_env_vars(content);
    Ok(serde_yaml::from_str(&expanded)?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["kvmirror.yaml", "kvmirror.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }
}

/// Per-host settings read from the `config.<hostname>` hash at every bootstrap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteConfig {
  pub head: Option<String>,
  pub publisher: Option<String>,
  pub key_filter: Option<String>,
  /// Every other field, kept verbatim
  pub flags: HashMap<String, String>,
}

impl RemoteConfig {
  pub fn from_fields(fields: HashMap<String, String>) -> Self {
    let mut config = RemoteConfig::default();
    for (field, value) in fields {
      let value = value.trim().to_string();
      match field.as_str() {
        "HEAD" => config.head = Some(value).filter(|v| !v.is_empty()),
        "PUB" => config.publisher = Some(value).filter(|v| !v.is_empty()),
        "RE" => config.key_filter = Some(value).filter(|v| !v.is_empty()),
        _ => {
          config.flags.insert(field, value);
        }
      }
    }
    config
  }
}

/// Values in effect after merging local settings over the remote config
#[derive(Debug, Clone)]
pub struct Effective {
  pub head: Option<String>,
  pub publisher: String,
  pub filter: KeyFilter,
}

impl Effective {
  pub fn resolve(section: &CacheSection, remote: &RemoteConfig) -> CacheResult<Self> {
    let head = section.head.clone().or_else(|| remote.head.clone());
    let publisher = section
      .publisher
      .clone()
      .or_else(|| remote.publisher.clone())
      .unwrap_or_else(|| section.host_name.clone());
    let pattern = section.key_filter.as_deref().or(remote.key_filter.as_deref());
    let filter = KeyFilter::new(pattern, head.as_deref())?;
    Ok(Self {
      head,
      publisher,
      filter,
    })
  }

  /// Full key for an accessor name
  pub fn qualify(&self, name: &str) -> String {
    match &self.head {
      Some(head) => format!("{}.{}", head, name),
      None => name.to_string(),
    }
  }
}

/// Selects which keys are mirrored proactively
#[derive(Debug, Clone)]
pub struct KeyFilter {
  regex: Option<Regex>,
  head_prefix: Option<String>,
}

impl KeyFilter {
  /// Without a pattern, keys under `head.` are accepted (all keys if no head)
  pub fn new(pattern: Option<&str>, head: Option<&str>) -> CacheResult<Self> {
    let regex = match pattern {
      Some(p) => Some(
        Regex::new(p).map_err(|e| CacheError::Config(format!("bad key filter {:?}: {}", p, e)))?,
      ),
      None => None,
    };
    Ok(Self {
      regex,
      head_prefix: head.map(|h| format!("{}.", h)),
    })
  }

  pub fn accepts(&self, key: &str) -> bool {
    match (&self.regex, &self.head_prefix) {
      (Some(re), _) => re.is_match(key),
      (None, Some(prefix)) => key.starts_with(prefix.as_str()),
      (None, None) => true,
    }
  }

  /// Capture group 1 of the filter, or the key itself
  pub fn short_name(&self, key: &str) -> String {
    self
      .regex
      .as_ref()
      .and_then(|re| re.captures(key))
      .and_then(|caps| caps.get(1))
      .map(|m| m.as_str().to_string())
      .unwrap_or_else(|| key.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let settings = Settings::from_yaml("{}").unwrap();
    assert_eq!(settings.redis.port, 6379);
    assert_eq!(settings.worker.heartbeat_ms, 1000);
    assert_eq!(settings.worker.backoff_initial_ms, 100);
    assert_eq!(settings.worker.backoff_max_ms, 5000);
    assert_eq!(settings.presets.capacity, 64);
    assert_eq!(settings.presets.tie_break, TieBreak::LowestIndex);
    assert_eq!(settings.status.log_slots, 32);
    assert_eq!(settings.status.heartbeat_key, "time");
    assert_eq!(settings.cache.subscribe_patterns, vec!["__keyspace@*__:*"]);
  }

  #[test]
  fn test_from_file_with_env_expansion() {
    std::env::set_var("KVMIRROR_TEST_REDIS_HOST", "redis.internal");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "redis:\n  host: ${{KVMIRROR_TEST_REDIS_HOST}}\n  database: 2\ncache:\n  host_name: beamline\npresets:\n  tie_break: nearest"
    )
    .unwrap();

    let settings = Settings::from_file(file.path()).unwrap();
    assert_eq!(settings.redis.host, "redis.internal");
    assert_eq!(settings.redis.connection_url(), "redis://redis.internal:6379/2");
    assert_eq!(settings.cache.config_key(), "config.beamline");
    assert_eq!(settings.presets.tie_break, TieBreak::Nearest);
  }

  #[test]
  fn test_non_ascii_text_survives_expansion() {
    std::env::set_var("KVMIRROR_TEST_HEAD", "stns.2");
    let settings = Settings::from_yaml(
      "logging:\n  level: info # café, Grüße\ncache:\n  head: $KVMIRROR_TEST_HEAD\n  host_name: é-$KVMIRROR_TEST_UNSET_VAR\n",
    )
    .unwrap();
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.cache.head.as_deref(), Some("stns.2"));
    assert_eq!(settings.cache.host_name, "é-");
  }

  #[test]
  fn test_connection_url_with_password() {
    let section = RedisSection {
      password: Some("secret".into()),
      ..Default::default()
    };
    assert_eq!(section.connection_url(), "redis://:secret@localhost:6379/0");
  }

  #[test]
  fn test_remote_config_fields() {
    let fields = HashMap::from([
      ("HEAD".to_string(), "stns.2".to_string()),
      ("PUB".to_string(), "MD2".to_string()),
      ("RE".to_string(), r"^stns\.2\.(.+)$".to_string()),
      ("UI".to_string(), "1".to_string()),
    ]);
    let remote = RemoteConfig::from_fields(fields);
    assert_eq!(remote.head.as_deref(), Some("stns.2"));
    assert_eq!(remote.publisher.as_deref(), Some("MD2"));
    assert_eq!(remote.flags.get("UI").map(String::as_str), Some("1"));
  }

  #[test]
  fn test_local_settings_override_remote() {
    let section = CacheSection {
      publisher: Some("local".into()),
      ..Default::default()
    };
    let remote = RemoteConfig {
      head: Some("stns.2".into()),
      publisher: Some("MD2".into()),
      ..Default::default()
    };
    let effective = Effective::resolve(&section, &remote).unwrap();
    assert_eq!(effective.publisher, "local");
    assert_eq!(effective.head.as_deref(), Some("stns.2"));
    assert!(effective.filter.accepts("stns.2.omega.position"));
    assert!(!effective.filter.accepts("stns.1.omega.position"));
  }

  #[test]
  fn test_key_filter_short_name() {
    let filter = KeyFilter::new(Some(r"^stns\.2\.(.+)$"), None).unwrap();
    assert!(filter.accepts("stns.2.omega.position"));
    assert_eq!(filter.short_name("stns.2.omega.position"), "omega.position");
    assert_eq!(filter.short_name("other"), "other");
  }

  #[test]
  fn test_bad_key_filter_is_config_error() {
    let err = KeyFilter::new(Some("(unclosed"), None).unwrap_err();
    assert!(matches!(err, CacheError::Config(_)));
  }
}
