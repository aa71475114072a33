//! Exponential backoff with jitter for queue-service retries.

use std::time::Duration;

use rand::Rng;

/// Doubling backoff, capped, with optional 25% additive jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: true,
        }
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Receive-loop policy: base 1s, cap 30s.
    pub fn for_receive() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Settlement policy: quick retries while a batch settles.
    pub fn for_settle() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(5))
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let base_ms = self.base.as_millis() as u64;
        let capped_ms = base_ms
            .saturating_mul(1u64 << exp)
            .min(self.cap.as_millis() as u64);

        let final_ms = if self.jitter && capped_ms > 0 {
            let spread = capped_ms / 4;
            capped_ms.saturating_add(rand::rng().random_range(0..=spread))
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }
}

/// Maximum attempts for transient settlement failures (initial call plus
/// retries).
pub const SETTLE_ATTEMPTS: u32 = 3;

/// Uniformly random duration in `[0, max]`, used to de-synchronize idle
/// pollers.
pub fn idle_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::rng().random_range(0.0..=max.as_secs_f64()))
}
