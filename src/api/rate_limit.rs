//! Shared request budget: at most `cap` requests per fixed window.
//!
//! This is the single piece of state mutated by every concurrent worker,
//! so it is injected (`Arc<RateBudget>`) rather than ambient. The window
//! clock is `tokio::time`, which pauses under `start_paused` tests, so the
//! rate invariant is testable without wall-clock sleeps.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct Window {
    started: Instant,
    used: u32,
}

pub struct RateBudget {
    cap: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl RateBudget {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            cap: cap.max(1),
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Take one request slot, waiting for the next window when the current
    /// one is spent. The lock is never held across the sleep.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.state.lock();
                let now = Instant::now();
                if now.duration_since(window.started) >= self.window {
                    window.started = now;
                    window.used = 0;
                }
                if window.used < self.cap {
                    window.used += 1;
                    return;
                }
                self.window - now.duration_since(window.started)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
