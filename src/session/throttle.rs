use std::time::Duration;
use tokio::time::Instant;

/// Per-device rate limiter for forwarded input events.
///
/// A sample is forwarded only if at least `min_interval` has passed since the
/// last forwarded one. Rejected samples are dropped, never queued.
#[derive(Debug, Clone)]
pub struct InputThrottle {
    min_interval: Duration,
    last_forwarded: Option<Instant>,
}

impl InputThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_forwarded: None,
        }
    }

    pub fn should_forward(&mut self, now: Instant) -> bool {
        match self.last_forwarded {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_forwarded = Some(now);
                true
            }
        }
    }
}
