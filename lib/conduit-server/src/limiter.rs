//! Connection admission control

use conduit_core::config::{RateLimitKind, RateLimitSettings};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Decides whether a freshly accepted connection is served
pub trait Limiter: Send + Sync {
    /// Non-blocking; `false` means the connection is dropped
    fn allow(&self) -> bool;
}

/// Admits everything
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysPass;

impl Limiter for AlwaysPass {
    fn allow(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_fill: Instant,
}

/// Token bucket refilled with one token per `fill_interval`, up to
/// `capacity`. Takes a token when one is available and rejects otherwise.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    fill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts full
    pub fn new(capacity: u64, fill_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            fill_interval: fill_interval.max(Duration::from_millis(1)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_fill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_fill.elapsed();
        let fills = (elapsed.as_nanos() / self.fill_interval.as_nanos()) as u64;
        if fills == 0 {
            return;
        }
        state.tokens = state.tokens.saturating_add(fills).min(self.capacity);
        // keep the remainder so partial intervals are not lost
        state.last_fill += self.fill_interval * fills.min(u32::MAX as u64) as u32;
    }
}

impl Limiter for TokenBucket {
    fn allow(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.refill(&mut state);
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

pub fn from_settings(settings: &RateLimitSettings) -> Arc<dyn Limiter> {
    match settings.kind {
        RateLimitKind::AlwaysPass => Arc::new(AlwaysPass),
        RateLimitKind::NoBlock => Arc::new(TokenBucket::new(
            settings.capacity,
            Duration::from_millis(settings.fill_interval_ms),
        )),
    }
}
