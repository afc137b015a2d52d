//! Token-bucket pacing for upstream calls.
//!
//! The limiter never reads the wall clock directly; it goes through a
//! [`Clock`], so tests can drive it with [`ManualClock`] and observe every
//! pause without sleeping.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of monotonic time and blocking waits.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Real time: `Instant::now` and `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.elapsed += duration;
        }
    }

    /// Total virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().map(|s| s.elapsed).unwrap_or_default()
    }

    /// Every pause requested through `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .map(|s| s.sleeps.clone())
            .unwrap_or_default()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
    }
}

/// Configuration for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained rate (tokens refilled per second).
    pub requests_per_second: f64,
    /// Bucket capacity. With 1, consecutive acquires are spaced by `1 / rate`.
    pub burst_size: u32,
}

impl RateLimitConfig {
    pub fn per_second(requests_per_second: f64) -> Self {
        Self {
            requests_per_second,
            burst_size: 1,
        }
    }

    /// One token per `interval`, no bursting.
    pub fn every(interval: Duration) -> Self {
        let secs = interval.as_secs_f64();
        Self {
            requests_per_second: if secs > 0.0 { 1.0 / secs } else { f64::INFINITY },
            burst_size: 1,
        }
    }

    pub fn with_burst_size(mut self, burst: u32) -> Self {
        self.burst_size = burst.max(1);
        self
    }
}

/// Absorbs float drift so a wait of exactly `missing / rate` always suffices.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

impl Bucket {
    fn take(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter. A fresh bucket starts full, so the first
/// `burst_size` acquires never wait.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let bucket = Bucket {
            tokens: config.burst_size as f64,
            last_update: clock.now(),
        };
        Self {
            config,
            clock,
            bucket: Mutex::new(bucket),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.last_update = now;
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.requests_per_second).min(self.config.burst_size as f64);
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut bucket) = self.bucket.lock() else {
            return false;
        };
        self.refill(&mut bucket);
        bucket.take()
    }

    /// Block (through the clock) until a token is available, then take it.
    /// Returns how long the caller was held back.
    pub fn acquire(&self) -> Duration {
        if !self.config.requests_per_second.is_finite() {
            return Duration::ZERO;
        }

        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let Ok(mut bucket) = self.bucket.lock() else {
                    return waited;
                };
                self.refill(&mut bucket);
                if bucket.take() {
                    return waited;
                }
                let missing = 1.0 - bucket.tokens;
                Duration::from_secs_f64(missing / self.config.requests_per_second)
            };

            // lock is released before waiting
            self.clock.sleep(wait);
            waited += wait;
        }
    }
}
