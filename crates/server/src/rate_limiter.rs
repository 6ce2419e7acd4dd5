//! Token bucket rate limiter for session connections.
//!
//! Per-connection bucket. If a message exceeds the available tokens it is
//! rejected immediately (no partial consume) with a `retry_after_ms` hint for
//! well-behaved agents. A `Clock` trait keeps tests deterministic.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Clock abstraction for testability.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Real clock using std::time::Instant.
#[derive(Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Rate limiter configuration. Costs are per message kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum burst capacity (tokens).
    pub burst: u32,
    /// Refill rate (tokens per second).
    pub per_sec: u32,
    pub mutate_cost: u32,
    /// Fetching full spreadsheet state is the expensive read.
    pub fetch_cost: u32,
    pub join_cost: u32,
    pub leave_cost: u32,
    pub ping_cost: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst: 200,
            per_sec: 50,
            mutate_cost: 1,
            fetch_cost: 10,
            join_cost: 10,
            leave_cost: 1,
            ping_cost: 1,
        }
    }
}

/// Error returned when the rate limit is exceeded.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitedError {
    /// Milliseconds until enough tokens are available.
    pub retry_after_ms: u64,
    pub requested: u32,
    pub available: u32,
}

/// Token bucket with fractional refill.
pub struct RateLimiter<C: Clock = RealClock> {
    tokens: f64,
    max_tokens: u32,
    refill_rate: u32,
    last_refill: Instant,
    clock: C,
    config: RateLimiterConfig,
}

impl RateLimiter<RealClock> {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, RealClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> Self {
        let now = clock.now();
        Self {
            tokens: config.burst as f64,
            max_tokens: config.burst,
            refill_rate: config.per_sec,
            last_refill: now,
            clock,
            config,
        }
    }

    fn refill(&mut self) {
        let now = self.clock.now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let refill_amount = elapsed.as_secs_f64() * self.refill_rate as f64;
        self.tokens = (self.tokens + refill_amount).min(self.max_tokens as f64);
        self.last_refill = now;
    }

    pub fn try_mutate(&mut self) -> Result<(), RateLimitedError> {
        self.try_consume(self.config.mutate_cost)
    }

    pub fn try_fetch(&mut self) -> Result<(), RateLimitedError> {
        self.try_consume(self.config.fetch_cost)
    }

    pub fn try_join(&mut self) -> Result<(), RateLimitedError> {
        self.try_consume(self.config.join_cost)
    }

    pub fn try_leave(&mut self) -> Result<(), RateLimitedError> {
        self.try_consume(self.config.leave_cost)
    }

    pub fn try_ping(&mut self) -> Result<(), RateLimitedError> {
        self.try_consume(self.config.ping_cost)
    }

    fn try_consume(&mut self, cost: u32) -> Result<(), RateLimitedError> {
        self.refill();
        if self.tokens >= cost as f64 {
            self.tokens -= cost as f64;
            Ok(())
        } else {
            let deficit = cost as f64 - self.tokens;
            let retry_after_ms = if self.refill_rate == 0 {
                u64::MAX
            } else {
                (deficit / self.refill_rate as f64 * 1000.0).ceil() as u64
            };
            Err(RateLimitedError {
                retry_after_ms,
                requested: cost,
                available: self.tokens as u32,
            })
        }
    }
}
