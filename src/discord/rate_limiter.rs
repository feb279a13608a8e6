//! Multi-window limiter for outbound presence updates

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{BridgeError, Result};

/// Discord tolerates roughly 5 activity updates per 15 seconds
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_operations_per_window: usize,
    pub primary_window: Duration,
    pub max_burst_operations: usize,
    pub burst_window: Duration,
    pub minimum_interval: Duration,
    /// Multiplier in (0, 1] applied to both caps
    pub safety_factor: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_operations_per_window: 5,
            primary_window: Duration::from_secs(15),
            max_burst_operations: 3,
            burst_window: Duration::from_secs(5),
            minimum_interval: Duration::from_secs(1),
            safety_factor: 0.8,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_operations_per_window == 0 || self.max_burst_operations == 0 {
            return Err(BridgeError::config("rate limit caps must be positive"));
        }
        if self.primary_window.is_zero() || self.burst_window.is_zero() {
            return Err(BridgeError::config("rate limit windows must be positive"));
        }
        if self.burst_window > self.primary_window {
            return Err(BridgeError::config(
                "burst window must not exceed the primary window",
            ));
        }
        // The last operation must survive pruning for the interval gate to hold
        if self.minimum_interval > self.primary_window {
            return Err(BridgeError::config(
                "minimum interval must not exceed the primary window",
            ));
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(BridgeError::config("safety factor must be in (0, 1]"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    effective_max: usize,
    effective_burst: usize,
    operations: VecDeque<Instant>,
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scale_cap(cap: usize, factor: f64) -> usize {
    ((cap as f64 * factor) as usize).max(1)
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        let effective_max = scale_cap(config.max_operations_per_window, config.safety_factor);
        let effective_burst = scale_cap(config.max_burst_operations, config.safety_factor);
        tracing::debug!(
            "Rate limiter: {} ops per {:?}, burst {} per {:?}, min interval {:?}",
            effective_max,
            config.primary_window,
            effective_burst,
            config.burst_window,
            config.minimum_interval
        );

        Ok(Self {
            config,
            effective_max,
            effective_burst,
            operations: VecDeque::new(),
        })
    }

    pub fn effective_max_operations(&self) -> usize {
        self.effective_max
    }

    pub fn effective_burst_operations(&self) -> usize {
        self.effective_burst
    }

    pub fn can_proceed(&mut self) -> bool {
        self.can_proceed_at(Instant::now())
    }

    pub fn can_proceed_at(&mut self, now: Instant) -> bool {
        self.prune(now);

        if let Some(last) = self.operations.back() {
            if now.saturating_duration_since(*last) < self.config.minimum_interval {
                return false;
            }
        }

        if self.operations.len() >= self.effective_max {
            return false;
        }

        self.count_since(now, self.config.burst_window) < self.effective_burst
    }

    pub fn record_operation(&mut self) {
        self.record_operation_at(Instant::now());
    }

    pub fn record_operation_at(&mut self, now: Instant) {
        self.operations.push_back(now);
    }

    pub fn reset(&mut self) {
        self.operations.clear();
    }

    pub fn time_until_next_allowed(&mut self) -> Duration {
        self.time_until_next_allowed_at(Instant::now())
    }

    /// Longest of the three gate waits.
    pub fn time_until_next_allowed_at(&mut self, now: Instant) -> Duration {
        self.prune(now);

        let mut wait = Duration::ZERO;

        if let Some(last) = self.operations.back() {
            let elapsed = now.saturating_duration_since(*last);
            wait = wait.max(self.config.minimum_interval.saturating_sub(elapsed));
        }

        if self.operations.len() >= self.effective_max {
            if let Some(oldest) = self.operations.front() {
                let age = now.saturating_duration_since(*oldest);
                wait = wait.max(self.config.primary_window.saturating_sub(age));
            }
        }

        if self.count_since(now, self.config.burst_window) >= self.effective_burst {
            let oldest_in_burst = self
                .operations
                .iter()
                .find(|ts| now.saturating_duration_since(**ts) < self.config.burst_window);
            if let Some(oldest) = oldest_in_burst {
                let age = now.saturating_duration_since(*oldest);
                wait = wait.max(self.config.burst_window.saturating_sub(age));
            }
        }

        wait
    }

    pub fn operations_in_window(&mut self) -> usize {
        self.prune(Instant::now());
        self.operations.len()
    }

    pub fn burst_operations_in_window(&mut self) -> usize {
        let now = Instant::now();
        self.prune(now);
        self.count_since(now, self.config.burst_window)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.operations.front() {
            if now.saturating_duration_since(*oldest) >= self.config.primary_window {
                self.operations.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_since(&self, now: Instant, window: Duration) -> usize {
        self.operations
            .iter()
            .filter(|ts| now.saturating_duration_since(**ts) < window)
            .count()
    }
}
