use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter for reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
  initial: Duration,
  max: Duration,
  attempt: u32,
}

impl Backoff {
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self {
      initial,
      max: max.max(initial),
      attempt: 0,
    }
  }

  /// Delay before the next attempt: the doubled base plus up to half of it
  /// again as jitter, never above `max`
  pub fn next_delay(&mut self) -> Duration {
    let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
    let base = self.initial.saturating_mul(factor).min(self.max);
    self.attempt = self.attempt.saturating_add(1);
    let jitter_ms = (base.as_millis() as u64) / 2;
    let jitter = if jitter_ms > 0 {
      Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
      Duration::ZERO
    };
    (base + jitter).min(self.max)
  }

  pub fn attempts(&self) -> u32 {
    self.attempt
  }

  pub fn reset(&mut self) {
    self.attempt = 0;
  }
}
