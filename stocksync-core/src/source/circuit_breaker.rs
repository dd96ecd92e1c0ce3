//! Circuit breaker for price source rate limiting and IP bans.
//!
//! A 403 trips the breaker immediately; repeated 429/5xx trip it once the
//! consecutive-failure threshold is reached. While open, every request is
//! refused until the cooldown elapses.

use crate::config::SourceConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { tripped_at: Instant },
}

/// Shared breaker guarding one remote source.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Breaker with the threshold and cooldown from `[source]`.
    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(
            Duration::from_secs(config.breaker_cooldown_secs),
            config.breaker_threshold,
        )
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BreakerState) -> T) -> T {
        // A poisoned lock only means another fetch thread panicked; the
        // breaker state itself is still a valid value.
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Check if requests are currently allowed. Closes the breaker once the
    /// cooldown has elapsed.
    pub fn is_allowed(&self) -> bool {
        let cooldown = self.cooldown;
        self.with_state(|state| match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { tripped_at } if tripped_at.elapsed() >= cooldown => {
                tracing::info!("circuit breaker cooldown elapsed, resuming requests");
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
                true
            }
            BreakerState::Open { .. } => false,
        })
    }

    pub fn record_success(&self) {
        self.with_state(|state| {
            if let BreakerState::Closed { .. } = state {
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
            }
        });
    }

    pub fn record_failure(&self) {
        let threshold = self.failure_threshold;
        self.with_state(|state| {
            if let BreakerState::Closed {
                consecutive_failures,
            } = *state
            {
                let failures = consecutive_failures + 1;
                *state = if failures >= threshold {
                    tracing::warn!(failures, "circuit breaker tripped after repeated failures");
                    BreakerState::Open {
                        tripped_at: Instant::now(),
                    }
                } else {
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                };
            }
        });
    }

    /// Immediately open the breaker (403 Forbidden / IP ban).
    pub fn trip(&self) {
        tracing::warn!("circuit breaker tripped: source refused access");
        self.with_state(|state| {
            *state = BreakerState::Open {
                tripped_at: Instant::now(),
            }
        });
    }

    /// Remaining cooldown time (zero if closed).
    pub fn remaining_cooldown(&self) -> Duration {
        let cooldown = self.cooldown;
        self.with_state(|state| match *state {
            BreakerState::Closed { .. } => Duration::ZERO,
            BreakerState::Open { tripped_at } => cooldown.saturating_sub(tripped_at.elapsed()),
        })
    }
}
