// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::opts::ClientConfig;

/// Reconnection delay policy.
///
/// Delay for attempt `n` (1-based) is `min(initial * 2^(n-1), max)`, then scaled by a
/// random factor in `[1 - jitter, 1 + jitter]`. The attempt counter resets once a
/// connection has stayed up for longer than `max`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    jitter: f64,
    /// 0 = unlimited
    max_attempts: u32,
    attempts: u32,
    connected_since: Option<Instant>,
    cancelled: bool,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempts: 0,
            connected_since: None,
            cancelled: false,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.reconnect_jitter,
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        // 2^16 already exceeds any sane cap
        let exponent = self.attempts.min(16);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Counts an attempt and returns its delay, or `None` when cancelled or the cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.cancelled || self.exhausted() {
            return None;
        }
        let base = self.base_delay();
        self.attempts += 1;
        self.connected_since = None;
        if self.jitter == 0.0 {
            return Some(base);
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Some(base.mul_f64(factor))
    }

    pub fn exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempts >= self.max_attempts
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Marks the connection as established. Cancellation only applies to one outage.
    pub fn on_connected(&mut self, now: Instant) {
        self.connected_since = Some(now);
        self.cancelled = false;
    }

    /// Resets the counter once the connection has been up for longer than the cap.
    /// Returns true when a reset happened.
    pub fn maybe_reset(&mut self, now: Instant) -> bool {
        match self.connected_since {
            Some(since) if self.attempts > 0 && now.saturating_duration_since(since) > self.max => {
                self.attempts = 0;
                true
            }
            _ => false,
        }
    }

    /// When `maybe_reset` would next have an effect.
    pub fn reset_deadline(&self) -> Option<Instant> {
        match self.connected_since {
            Some(since) if self.attempts > 0 => Some(since + self.max + Duration::from_millis(1)),
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Back to the initial state, e.g. after an explicit connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.connected_since = None;
        self.cancelled = false;
    }
}
