//! Per-caller sliding-window rate limiting.
//!
//! Admission is measured over a rolling window of request timestamps; a
//! deque per caller is trimmed on every attempt.  Admin tool calls share
//! the caller's window — there is no exemption.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct RateLimiter {
    per_window: u32,
    window: Duration,
    admissions: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self::with_window(per_minute, Duration::from_secs(60))
    }

    fn with_window(per_window: u32, window: Duration) -> Self {
        Self {
            per_window: per_window.max(1),
            window,
            admissions: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `caller`, or report saturation.
    pub fn try_admit(&self, caller: &str) -> bool {
        let now = Instant::now();
        let mut admissions = self.admissions.lock();
        let window = admissions.entry(caller.to_string()).or_default();

        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.per_window as usize {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Requests currently counted against the caller's window.
    pub fn in_flight(&self, caller: &str) -> usize {
        self.admissions
            .lock()
            .get(caller)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}
