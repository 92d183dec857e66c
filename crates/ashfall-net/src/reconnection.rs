//! Client-side reconnection backoff.
//!
//! [`ReconnectState`] yields the delay before each reconnect attempt: the
//! initial interval, growing by the multiplier after every failure, capped at
//! the maximum. [`crate::TcpClient`] drives the actual attempts.

use std::time::Duration;

use rand::Rng;

/// Configuration for client-side reconnection behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt. Default: 1.5.
    pub backoff_multiplier: f64,
    /// Maximum delay between reconnection attempts. Default: 30 s.
    pub max_delay: Duration,
    /// Attempts before giving up; 0 retries forever. Default: 0.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0), applied as ±jitter to each delay. Default: 0.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 0,
            jitter: 0.0,
        }
    }
}

impl From<&ashfall_config::ReconnectConfig> for ReconnectConfig {
    fn from(c: &ashfall_config::ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(c.initial_interval_ms),
            backoff_multiplier: c.multiplier,
            max_delay: Duration::from_millis(c.max_interval_ms),
            max_attempts: c.max_retries,
            jitter: c.jitter,
        }
    }
}

/// Tracks reconnection attempt count and computes the next backoff delay.
#[derive(Debug)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    /// Returns `None` once `max_attempts` attempts have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }

        let base = self.current_delay;
        self.attempts = self.attempts.saturating_add(1);

        let jittered = if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
