//! Connection worker.
//!
//! One thread owns every connection to the store. A single cooperative loop
//! multiplexes caller requests, command replies, subscription messages and a
//! heartbeat tick. Callers never touch the network; they queue [`Request`]s
//! and wait on the value object's condition variable.

mod backoff;
mod interest;

pub use backoff::Backoff;
pub use interest::{Channel, InterestTable};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::cache::{validate_key, SyncState, ValueObject};
use crate::config::{Effective, RemoteConfig};
use crate::error::{CacheError, CacheResult, RemoteError};
use crate::lifecycle::{LifecycleState, Shared};
use crate::remote::{Connector, KeyChange, NotificationStream, Session, VALUE_FIELD};
use crate::stats::Counters;

/// Work queued by caller threads
#[derive(Debug)]
pub(crate) enum Request {
  /// The object moved to SYNCING; read its value
  Fetch(String),
  /// Store and announce a value already applied locally
  Write { key: String, raw: String },
  Shutdown,
}

/// Completed command, matched back to the state it belongs to
enum Reply {
  Field {
    key: String,
    result: Result<Option<String>, RemoteError>,
  },
  Keys(Result<Vec<String>, RemoteError>),
  Ack {
    key: String,
    result: Result<(), RemoteError>,
  },
  Stamp(Result<(), RemoteError>),
  Pong(Result<(), RemoteError>),
}

enum Exit {
  Shutdown,
  Disconnected(String),
  Fatal(CacheError),
}

/// State of one connected session. Dropped on disconnect.
struct Link {
  session: Session,
  notifications: NotificationStream,
  inflight: FuturesUnordered<BoxFuture<'static, Reply>>,
  fetching: HashSet<String>,
  /// Keys changed while their fetch was in flight
  refetch: HashSet<String>,
  /// Writes in flight, by key
  writing: HashMap<String, String>,
  /// Keys of the initial enumeration still awaiting their value
  initial: Option<HashSet<String>>,
  interest: InterestTable,
  stamping: bool,
  pinging: bool,
}

impl Link {
  fn new(session: Session, notifications: NotificationStream) -> Self {
    let mut interest = InterestTable::new(Instant::now());
    interest.add_read(Channel::Subscriber);
    Self {
      session,
      notifications,
      inflight: FuturesUnordered::new(),
      fetching: HashSet::new(),
      refetch: HashSet::new(),
      writing: HashMap::new(),
      initial: None,
      interest,
      stamping: false,
      pinging: false,
    }
  }
}

pub(crate) struct Worker<C: Connector> {
  shared: Arc<Shared>,
  connector: C,
  requests: mpsc::UnboundedReceiver<Request>,
  startup: Option<std::sync::mpsc::Sender<CacheResult<()>>>,
  /// Latest value per key not yet handed to the store
  pending_writes: HashMap<String, String>,
  backoff: Backoff,
}

impl<C: Connector> Worker<C> {
  pub fn new(
    shared: Arc<Shared>,
    connector: C,
    requests: mpsc::UnboundedReceiver<Request>,
    startup: std::sync::mpsc::Sender<CacheResult<()>>,
  ) -> Self {
    let worker = &shared.settings.worker;
    let backoff = Backoff::new(
      Duration::from_millis(worker.backoff_initial_ms),
      Duration::from_millis(worker.backoff_max_ms),
    );
    Self {
      shared,
      connector,
      requests,
      startup: Some(startup),
      pending_writes: HashMap::new(),
      backoff,
    }
  }

  pub async fn run(mut self) {
    loop {
      if self.shared.lifecycle().is_closing() {
        break;
      }

      let exit = match self.bootstrap().await {
        Ok(mut link) => {
          self.backoff.reset();
          let exit = self.serve(&mut link).await;
          self.requeue_writes(&mut link);
          exit
        }
        Err(exit) => exit,
      };

      match exit {
        Exit::Shutdown => break,
        Exit::Fatal(err) => {
          tracing::error!("Worker stopped: {}", err);
          self.report_startup(Err(err));
          break;
        }
        Exit::Disconnected(reason) => {
          tracing::warn!("Store connection lost: {}", reason);
          self.mark_disconnected();
        }
      }

      let delay = self.backoff.next_delay();
      tracing::info!(
        "Reconnecting in {:?} (attempt {})",
        delay,
        self.backoff.attempts()
      );
      if !self.idle(delay).await {
        break;
      }
      Counters::bump(&self.shared.counters.reconnects);
    }

    if !self.pending_writes.is_empty() {
      tracing::warn!(
        "Dropping {} unsent writes at shutdown",
        self.pending_writes.len()
      );
    }
    self.report_startup(Err(CacheError::ShuttingDown));
    tracing::debug!("Worker exited");
  }

  fn report_startup(&mut self, result: CacheResult<()>) {
    if let Some(tx) = self.startup.take() {
      let _ = tx.send(result);
    }
  }

  /// Connect, load the remote config, subscribe, enumerate and refetch
  async fn bootstrap(&mut self) -> Result<Link, Exit> {
    let shared = self.shared.clone();
    let settings = &shared.settings;
    let limit = Duration::from_millis(settings.worker.stall_after_ms);
    let first_start = self.startup.is_some();

    let session = tokio::time::timeout(limit, self.connector.connect())
      .await
      .map_err(|_| Exit::Disconnected("connect timed out".into()))?
      .map_err(|e| Exit::Disconnected(e.to_string()))?;

    let config_key = settings.cache.config_key();
    let fields = match tokio::time::timeout(limit, session.reader.hgetall(&config_key)).await {
      Err(_) => return Err(Exit::Disconnected(format!("no reply reading {}", config_key))),
      Ok(Ok(fields)) => fields,
      Ok(Err(e)) if e.is_connection() => return Err(Exit::Disconnected(e.to_string())),
      Ok(Err(e)) => {
        tracing::warn!("Cannot read {}: {}", config_key, e);
        HashMap::new()
      }
    };
    let remote = RemoteConfig::from_fields(fields);
    match Effective::resolve(&settings.cache, &remote) {
      Ok(effective) => {
        tracing::info!(
          "Remote config from {}: head={:?} publisher={}",
          config_key,
          effective.head,
          effective.publisher
        );
        *self.shared.effective.write() = effective;
      }
      Err(e) if first_start => return Err(Exit::Fatal(e)),
      Err(e) => tracing::warn!("Ignoring new remote config: {}", e),
    }
    *self.shared.remote.write() = remote;

    let notifications = tokio::time::timeout(
      limit,
      self.connector.subscribe(&settings.cache.subscribe_patterns),
    )
    .await
    .map_err(|_| Exit::Disconnected("subscribe timed out".into()))?
    .map_err(|e| Exit::Disconnected(e.to_string()))?;
    tracing::info!(
      "Subscribed to {}",
      settings.cache.subscribe_patterns.join(", ")
    );

    let mut link = Link::new(session, notifications);
    self.enumerate(&mut link);

    for obj in self.shared.registry.snapshot() {
      let replaying = self.pending_writes.contains_key(obj.key());
      let refetch = {
        let mut state = obj.lock();
        state.subscribed = true;
        state.wait_for_me = u32::from(replaying);
        if replaying || state.state == SyncState::Unresolved {
          false
        } else {
          if state.state == SyncState::Stale {
            state.state = SyncState::Syncing;
          }
          true
        }
      };
      if refetch {
        self.fetch(&mut link, obj.key().to_string());
      }
    }

    let keys: Vec<String> = self.pending_writes.keys().cloned().collect();
    for key in keys {
      self.pump_write(&mut link, &key);
    }

    if !self
      .shared
      .transition(LifecycleState::Connecting, LifecycleState::Running)
    {
      return Err(Exit::Shutdown);
    }
    self.report_startup(Ok(()));
    Ok(link)
  }

  async fn serve(&mut self, link: &mut Link) -> Exit {
    let period = Duration::from_millis(self.shared.settings.worker.heartbeat_ms.max(1));
    let stall = Duration::from_millis(self.shared.settings.worker.stall_after_ms);
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      if self.shared.lifecycle().is_closing() {
        return self.drain(link).await;
      }

      tokio::select! {
        biased;

        request = self.requests.recv() => match request {
          Some(Request::Fetch(key)) => self.on_fetch_request(link, key),
          Some(Request::Write { key, raw }) => {
            self.queue_write(key.clone(), raw);
            self.pump_write(link, &key);
          }
          Some(Request::Shutdown) | None => return self.drain(link).await,
        },

        Some(reply) = link.inflight.next(), if !link.inflight.is_empty() => {
          if let Err(reason) = self.on_reply(link, reply) {
            return Exit::Disconnected(reason);
          }
        }

        message = link.notifications.next() => match message {
          Some(Ok(change)) => self.on_notification(link, change),
          Some(Err(e)) if e.is_connection() => return Exit::Disconnected(e.to_string()),
          Some(Err(e)) => tracing::warn!("Bad notification: {}", e),
          None => return Exit::Disconnected("subscription closed".into()),
        },

        _ = heartbeat.tick() => {
          if let Some(channel) = link.interest.stalled(Instant::now(), stall) {
            return Exit::Disconnected(format!("{} connection stalled", channel));
          }
          self.on_heartbeat(link);
        }
      }
    }
  }

  /// Wait out a reconnect delay. False when shutdown was requested.
  async fn idle(&mut self, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
      if self.shared.lifecycle().is_closing() {
        return false;
      }
      tokio::select! {
        _ = &mut sleep => return true,
        request = self.requests.recv() => match request {
          // Bootstrap refetches every object that asked
          Some(Request::Fetch(_)) => {}
          Some(Request::Write { key, raw }) => self.queue_write(key, raw),
          Some(Request::Shutdown) | None => return false,
        },
      }
    }
  }

  /// Finish outstanding writes within the drain timeout
  async fn drain(&mut self, link: &mut Link) -> Exit {
    while let Ok(request) = self.requests.try_recv() {
      if let Request::Write { key, raw } = request {
        self.queue_write(key, raw);
      }
    }
    let keys: Vec<String> = self.pending_writes.keys().cloned().collect();
    for key in keys {
      self.pump_write(link, &key);
    }

    let deadline = tokio::time::Instant::now() + self.shared.settings.cache.drain_timeout();
    while !link.writing.is_empty() || !self.pending_writes.is_empty() {
      match tokio::time::timeout_at(deadline, link.inflight.next()).await {
        Ok(Some(reply @ Reply::Ack { .. })) => {
          if let Err(reason) = self.on_reply(link, reply) {
            tracing::warn!("Drain interrupted: {}", reason);
            break;
          }
        }
        Ok(Some(_)) => {}
        Ok(None) => break,
        Err(_) => {
          tracing::warn!("Drain timed out with {} writes in flight", link.writing.len());
          break;
        }
      }
    }
    Exit::Shutdown
  }

  /// Writes lost with the connection are sent again after the next bootstrap
  fn requeue_writes(&mut self, link: &mut Link) {
    for (key, raw) in link.writing.drain() {
      self.pending_writes.entry(key).or_insert(raw);
    }
  }

  /// Issue `KEYS *` for the initial load
  fn enumerate(&mut self, link: &mut Link) {
    let reader = link.session.reader.clone();
    link.interest.add_read(Channel::Reader);
    link
      .inflight
      .push(Box::pin(async move { Reply::Keys(reader.keys("*").await) }));
  }

  fn fetch(&mut self, link: &mut Link, key: String) {
    if link.fetching.contains(&key) {
      link.refetch.insert(key);
      return;
    }
    tracing::trace!("Fetching {}", key);
    link.fetching.insert(key.clone());
    link.interest.add_read(Channel::Reader);
    Counters::bump(&self.shared.counters.fetches);
    let reader = link.session.reader.clone();
    link.inflight.push(Box::pin(async move {
      let result = reader.hget(&key, VALUE_FIELD).await;
      Reply::Field { key, result }
    }));
  }

  fn on_fetch_request(&mut self, link: &mut Link, key: String) {
    if link.fetching.contains(&key) {
      return;
    }
    let wanted = self
      .shared
      .registry
      .get(&key)
      .map_or(false, |obj| obj.state() == SyncState::Syncing);
    if wanted {
      self.fetch(link, key);
    }
  }

  /// Keep only the latest value per key. A superseded write will never be
  /// published, so its echo must not be expected.
  fn queue_write(&mut self, key: String, raw: String) {
    if self.pending_writes.insert(key.clone(), raw).is_some() {
      if let Some(obj) = self.shared.registry.get(&key) {
        let mut state = obj.lock();
        state.wait_for_me = state.wait_for_me.saturating_sub(1);
      }
    }
  }

  /// Send the pending write for `key` unless one is already in flight
  fn pump_write(&mut self, link: &mut Link, key: &str) {
    if link.writing.contains_key(key) {
      return;
    }
    let Some(raw) = self.pending_writes.remove(key) else {
      return;
    };
    let publisher = self.shared.effective.read().publisher.clone();
    link.writing.insert(key.to_string(), raw.clone());
    link.interest.add_write(Channel::Publisher);
    let store = link.session.publisher.clone();
    let key = key.to_string();
    link.inflight.push(Box::pin(async move {
      let result = store.publish_set(&key, &raw, &publisher).await;
      Reply::Ack { key, result }
    }));
  }

  fn on_reply(&mut self, link: &mut Link, reply: Reply) -> Result<(), String> {
    let now = Instant::now();
    match reply {
      Reply::Field { key, result } => {
        link.interest.del_read(Channel::Reader);
        link.interest.progress(Channel::Reader, now);
        link.fetching.remove(&key);
        let obj = self.shared.registry.get(&key);
        match result {
          Err(e) if e.is_connection() => return Err(e.to_string()),
          Err(e) => {
            tracing::warn!("Fetch of {} failed: {}", key, e);
            if let Some(obj) = &obj {
              obj.mark_failed(e.to_string());
            }
          }
          Ok(Some(raw)) => {
            if let Some((hook, raw)) = obj.as_ref().and_then(|o| o.apply_remote(raw)) {
              hook(&raw);
            }
          }
          Ok(None) => {
            tracing::debug!("{} has no value in the store", key);
            if let Some(obj) = &obj {
              obj.mark_missing();
            }
          }
        }
        if link.refetch.remove(&key) {
          if let Some(obj) = &obj {
            mark_syncing(obj);
          }
          self.fetch(link, key.clone());
        }
        if let Some(initial) = &mut link.initial {
          initial.remove(&key);
          if initial.is_empty() {
            link.initial = None;
            self.shared.set_ready();
          }
        }
      }
      Reply::Keys(result) => {
        link.interest.del_read(Channel::Reader);
        link.interest.progress(Channel::Reader, now);
        match result {
          Ok(keys) => self.load_initial(link, keys),
          Err(e) if e.is_connection() => return Err(e.to_string()),
          Err(e) => {
            tracing::warn!("Key enumeration failed: {}", e);
            self.shared.set_ready();
          }
        }
      }
      Reply::Ack { key, result } => {
        link.interest.del_write(Channel::Publisher);
        link.interest.progress(Channel::Publisher, now);
        let raw = link.writing.remove(&key);
        match result {
          Ok(()) => Counters::bump(&self.shared.counters.writes),
          Err(e) if e.is_connection() => {
            if let Some(raw) = raw {
              self.pending_writes.entry(key).or_insert(raw);
            }
            return Err(e.to_string());
          }
          Err(e) => {
            tracing::warn!("Write of {} failed: {}", key, e);
            Counters::bump(&self.shared.counters.failed_writes);
            if let Some(obj) = self.shared.registry.get(&key) {
              let mut state = obj.lock();
              state.wait_for_me = state.wait_for_me.saturating_sub(1);
            }
          }
        }
        self.pump_write(link, &key);
      }
      Reply::Stamp(result) => {
        link.stamping = false;
        link.interest.del_write(Channel::Publisher);
        link.interest.progress(Channel::Publisher, now);
        match result {
          Err(e) if e.is_connection() => return Err(e.to_string()),
          Err(e) => tracing::debug!("Heartbeat stamp failed: {}", e),
          Ok(()) => {}
        }
      }
      Reply::Pong(result) => {
        link.pinging = false;
        link.interest.del_read(Channel::Reader);
        link.interest.progress(Channel::Reader, now);
        if let Err(e) = result {
          if e.is_connection() {
            return Err(e.to_string());
          }
        }
      }
    }
    Ok(())
  }

  fn load_initial(&mut self, link: &mut Link, keys: Vec<String>) {
    let (filter, config_key) = {
      let effective = self.shared.effective.read();
      (effective.filter.clone(), self.shared.settings.cache.config_key())
    };
    let mut initial = HashSet::new();
    for key in keys {
      if key == config_key || !filter.accepts(&key) || validate_key(&key).is_err() {
        continue;
      }
      let (obj, _) = self
        .shared
        .registry
        .get_or_insert(&key, || filter.short_name(&key));
      let needs_fetch = {
        let mut state = obj.lock();
        state.subscribed = true;
        if state.state == SyncState::Unresolved {
          state.state = SyncState::Syncing;
          state.error = None;
          true
        } else {
          false
        }
      };
      if needs_fetch {
        self.fetch(link, key.clone());
      }
      if link.fetching.contains(&key) {
        initial.insert(key);
      }
    }
    tracing::info!("Initial load: {} keys to fetch", initial.len());
    if initial.is_empty() {
      self.shared.set_ready();
    } else {
      link.initial = Some(initial);
    }
  }

  fn on_notification(&mut self, link: &mut Link, change: KeyChange) {
    Counters::bump(&self.shared.counters.notifications);
    link.interest.progress(Channel::Subscriber, Instant::now());
    let Some(changed) = change.changed_key() else {
      tracing::trace!("Ignoring message on {}", change.channel);
      return;
    };

    let (own_publisher, filter, stamp_key) = {
      let effective = self.shared.effective.read();
      (
        effective.publisher.clone(),
        effective.filter.clone(),
        effective.qualify(&self.shared.settings.status.heartbeat_key),
      )
    };
    if changed.key == stamp_key {
      return;
    }

    let obj = match self.shared.registry.get(&changed.key) {
      Some(obj) => obj,
      None => {
        if !filter.accepts(&changed.key) || validate_key(&changed.key).is_err() {
          return;
        }
        let (obj, _) = self
          .shared
          .registry
          .get_or_insert(&changed.key, || filter.short_name(&changed.key));
        obj.lock().subscribed = true;
        obj
      }
    };

    {
      let mut state = obj.lock();
      if state.closed {
        return;
      }
      let ours = changed.publisher.as_deref() == Some(own_publisher.as_str());
      if state.wait_for_me > 0 && (ours || changed.publisher.is_none()) {
        state.wait_for_me -= 1;
        return;
      }
      if ours {
        return;
      }
      if !link.fetching.contains(&changed.key) {
        state.state = SyncState::Stale;
      }
    }

    tracing::debug!(
      "{} changed by {}",
      obj.short_name(),
      changed.publisher.as_deref().unwrap_or("unknown")
    );
    mark_syncing(&obj);
    self.fetch(link, changed.key);
  }

  fn on_heartbeat(&mut self, link: &mut Link) {
    if !link.pinging && link.interest.read_interest(Channel::Reader) == 0 {
      link.pinging = true;
      link.interest.add_read(Channel::Reader);
      let reader = link.session.reader.clone();
      link
        .inflight
        .push(Box::pin(async move { Reply::Pong(reader.ping().await) }));
    }

    let status = &self.shared.settings.status;
    if status.heartbeat_key.is_empty() || link.stamping {
      return;
    }
    let (key, publisher) = {
      let effective = self.shared.effective.read();
      (
        effective.qualify(&status.heartbeat_key),
        effective.publisher.clone(),
      )
    };
    let stamp = crate::status::heartbeat_stamp();
    link.stamping = true;
    link.interest.add_write(Channel::Publisher);
    let store = link.session.publisher.clone();
    link.inflight.push(Box::pin(async move {
      Reply::Stamp(store.publish_set(&key, &stamp, &publisher).await)
    }));
  }

  /// Back to CONNECTING: in-flight reads become STALE, subscriptions lapse
  fn mark_disconnected(&mut self) {
    self
      .shared
      .transition(LifecycleState::Running, LifecycleState::Connecting);
    let mut stale = 0;
    for obj in self.shared.registry.snapshot() {
      let mut state = obj.lock();
      state.subscribed = false;
      if state.state == SyncState::Syncing {
        state.state = SyncState::Stale;
        stale += 1;
      }
    }
    tracing::debug!("{} fetches interrupted", stale);
  }
}

/// A follow-up fetch is coming; hold readers until it lands
fn mark_syncing(obj: &ValueObject) {
  let mut state = obj.lock();
  if state.wait_for_me == 0 && !state.closed {
    state.state = SyncState::Syncing;
  }
}
