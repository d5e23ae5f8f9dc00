//! Exponential backoff
//!
//! Shared by the sync-stream reconnect loop and per-peer redials. Jitter
//! keeps a fleet of peers from thundering back in lockstep.

use std::time::Duration;

use rand::Rng;

/// Default initial delay.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Exponential backoff with a ceiling and ±20% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Next delay to wait; doubles up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        jitter(base)
    }

    /// Return to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn jitter(d: Duration) -> Duration {
    let millis = d.as_millis() as u64;
    if millis == 0 {
        return d;
    }
    let spread = millis / 5;
    if spread == 0 {
        return d;
    }
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(millis - spread + offset)
}
