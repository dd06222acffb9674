//! Sliding window rate limiter shared by all the dispatcher workers.
//!
//! The window keeps the time of every request admitted in the last `window`. A worker that finds
//! the window full sleeps until the oldest request ages out and then tries again. The lock is only
//! held while the window is inspected and updated, never while sleeping, so a waiting worker
//! doesn't stop the others from checking in.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Source of time for the rate limiter and retry back-off. Swapping this out lets the timing
/// logic be tested without real sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

#[derive(Debug)]
pub struct RateWindow<C: Clock = SystemClock> {
    /// `None` means unlimited
    limit: Option<usize>,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
    clock: C,
}

impl RateWindow<SystemClock> {
    /// At most `limit` requests in any trailing `window`. A limit of zero disables limiting.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self::with_clock(limit, window, SystemClock)
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

impl<C: Clock> RateWindow<C> {
    pub fn with_clock(limit: usize, window: Duration, clock: C) -> Self {
        let limit = (limit > 0 && !window.is_zero()).then_some(limit);
        Self {
            limit,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(limit.unwrap_or_default())),
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Blocks until a request may be made and records it. Returns how long the caller was made to
    /// wait.
    pub fn acquire(&self) -> Duration {
        let Some(limit) = self.limit else {
            return Duration::ZERO;
        };
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock();
                let now = self.clock.now();
                self.prune(&mut timestamps, now);
                if timestamps.len() < limit {
                    timestamps.push_back(now);
                    return waited;
                }
                match timestamps.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };
            self.clock.sleep(wait);
            waited += wait;
        }
    }

    /// Number of requests admitted within the current window.
    pub fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock();
        self.prune(&mut timestamps, self.clock.now());
        timestamps.len()
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
