//! Fixed-window rate limiting per user.
//!
//! A user's window opens with their first message and resets lazily on the
//! first message after it expires. Rejected messages do not count. Windows
//! outlive the user's connections, so reconnecting never resets a budget;
//! expired windows are pruned at most once per window length.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max: u32,
    windows: HashMap<String, Window>,
    last_prune: Option<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            windows: HashMap::new(),
            last_prune: None,
        }
    }

    /// Count one message. Returns false if it exceeds the limit.
    pub fn check(&mut self, user_id: &str) -> bool {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: &str, now: Instant) -> bool {
        let prune_due = self
            .last_prune
            .map_or(true, |last| now.saturating_duration_since(last) >= self.window);
        if prune_due {
            self.prune_expired(now);
        }

        if !self.windows.contains_key(user_id) {
            self.windows.insert(
                user_id.to_string(),
                Window {
                    started: now,
                    count: 0,
                },
            );
        }
        let Some(window) = self.windows.get_mut(user_id) else {
            return false;
        };

        if now.saturating_duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.max {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop windows that have fully elapsed at `now`.
    pub fn prune_expired(&mut self, now: Instant) {
        let window = self.window;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
        self.last_prune = Some(now);
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}
