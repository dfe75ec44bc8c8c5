//! Readiness bookkeeping for the worker's connections.
//!
//! Each logical channel carries reference-counted read and write interest.
//! A channel with interest outstanding that has made no progress within the
//! stall limit is considered hung.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
  Subscriber,
  Reader,
  Publisher,
}

impl Channel {
  const ALL: [Channel; 3] = [Channel::Subscriber, Channel::Reader, Channel::Publisher];

  fn index(self) -> usize {
    match self {
      Channel::Subscriber => 0,
      Channel::Reader => 1,
      Channel::Publisher => 2,
    }
  }
}

impl std::fmt::Display for Channel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Channel::Subscriber => write!(f, "subscriber"),
      Channel::Reader => write!(f, "reader"),
      Channel::Publisher => write!(f, "publisher"),
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Interest {
  read: u32,
  write: u32,
  last_progress: Instant,
}

#[derive(Debug, Clone)]
pub struct InterestTable {
  slots: [Interest; 3],
}

impl InterestTable {
  pub fn new(now: Instant) -> Self {
    let idle = Interest {
      read: 0,
      write: 0,
      last_progress: now,
    };
    Self { slots: [idle; 3] }
  }

  pub fn add_read(&mut self, channel: Channel) {
    self.slot(channel).read += 1;
  }

  pub fn add_write(&mut self, channel: Channel) {
    self.slot(channel).write += 1;
  }

  pub fn del_read(&mut self, channel: Channel) {
    let slot = self.slot(channel);
    match slot.read.checked_sub(1) {
      Some(n) => slot.read = n,
      None => tracing::warn!("Read interest underflow on {} channel", channel),
    }
  }

  pub fn del_write(&mut self, channel: Channel) {
    let slot = self.slot(channel);
    match slot.write.checked_sub(1) {
      Some(n) => slot.write = n,
      None => tracing::warn!("Write interest underflow on {} channel", channel),
    }
  }

  pub fn progress(&mut self, channel: Channel, now: Instant) {
    self.slot(channel).last_progress = now;
  }

  pub fn read_interest(&self, channel: Channel) -> u32 {
    self.slots[channel.index()].read
  }

  pub fn write_interest(&self, channel: Channel) -> u32 {
    self.slots[channel.index()].write
  }

  /// First command channel with interest outstanding and no progress for
  /// `limit`. The subscriber is exempt: it is legitimately quiet.
  pub fn stalled(&self, now: Instant, limit: Duration) -> Option<Channel> {
    Channel::ALL
      .into_iter()
      .filter(|c| *c != Channel::Subscriber)
      .find(|c| {
        let slot = &self.slots[c.index()];
        (slot.read > 0 || slot.write > 0) && now.duration_since(slot.last_progress) >= limit
      })
  }

  fn slot(&mut self, channel: Channel) -> &mut Interest {
    &mut self.slots[channel.index()]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_refcounts() {
    let mut table = InterestTable::new(Instant::now());
    table.add_read(Channel::Reader);
    table.add_read(Channel::Reader);
    table.del_read(Channel::Reader);
    assert_eq!(table.read_interest(Channel::Reader), 1);
    table.add_write(Channel::Publisher);
    assert_eq!(table.write_interest(Channel::Publisher), 1);
  }

  #[test]
  fn test_underflow_is_clamped() {
    let mut table = InterestTable::new(Instant::now());
    table.del_read(Channel::Reader);
    table.del_write(Channel::Publisher);
    assert_eq!(table.read_interest(Channel::Reader), 0);
    assert_eq!(table.write_interest(Channel::Publisher), 0);
    table.add_read(Channel::Reader);
    assert_eq!(table.read_interest(Channel::Reader), 1);
  }

  #[test]
  fn test_stall_detection() {
    let start = Instant::now();
    let limit = Duration::from_secs(5);
    let mut table = InterestTable::new(start);
    table.add_read(Channel::Subscriber);
    assert_eq!(table.stalled(start + Duration::from_secs(60), limit), None);

    table.add_read(Channel::Reader);
    assert_eq!(table.stalled(start + Duration::from_secs(1), limit), None);
    assert_eq!(
      table.stalled(start + Duration::from_secs(6), limit),
      Some(Channel::Reader)
    );

    table.progress(Channel::Reader, start + Duration::from_secs(6));
    assert_eq!(table.stalled(start + Duration::from_secs(7), limit), None);
  }

  #[test]
  fn test_idle_channel_never_stalls() {
    let start = Instant::now();
    let table = InterestTable::new(start);
    assert_eq!(
      table.stalled(start + Duration::from_secs(3600), Duration::from_secs(1)),
      None
    );
  }
}
