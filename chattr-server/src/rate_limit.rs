//! Per-user fixed-window send limiter.
//!
//! Keyed by user id, not connection, so a reconnect inside the window does
//! not reset the count. Thresholds are passed on every call so admin policy
//! changes apply to the next message.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, user_id: &str, max: u32, window: Duration) -> bool {
        self.allow_at(user_id, max, window, Instant::now())
    }

    /// `max == 0` disables limiting.
    pub fn allow_at(&self, user_id: &str, max: u32, window: Duration, now: Instant) -> bool {
        if max == 0 {
            return true;
        }
        let mut windows = self.windows.lock();
        match windows.get_mut(user_id) {
            Some(w) if now.duration_since(w.started) <= window => {
                w.count = w.count.saturating_add(1);
                w.count <= max
            }
            Some(w) => {
                *w = Window { count: 1, started: now };
                true
            }
            None => {
                windows.insert(user_id.to_string(), Window { count: 1, started: now });
                true
            }
        }
    }

    pub fn is_tracking(&self, user_id: &str) -> bool {
        self.windows.lock().contains_key(user_id)
    }

    /// Start a window for a user not seen by this process yet, pre-loaded
    /// with sends already on record. No-op if the user is tracked.
    pub fn seed(&self, user_id: &str, prior: u32) {
        self.seed_at(user_id, prior, Instant::now());
    }

    pub fn seed_at(&self, user_id: &str, prior: u32, now: Instant) {
        self.windows
            .lock()
            .entry(user_id.to_string())
            .or_insert(Window { count: prior, started: now });
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) <= window);
        before - windows.len()
    }
}
