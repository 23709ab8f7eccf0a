// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovery Backoff Policies
//!
//! This module maps a recovery attempt number to a delay. Two policies are
//! carried by the transport configuration: `private` paces re-creation of
//! the private reply queue, `consumed` paces re-establishment of
//! long-running consumers.

use serde::Deserialize;
use std::time::Duration;

/// Delay parameters for one recovery policy.
///
/// Attempt 0 retries immediately, attempt 1 waits `min_ms`, and later
/// attempts grow geometrically by `factor`, capped at `max_ms`. A random
/// multiplier in `[1, 2)` spreads simultaneous retries apart.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BackoffPolicy {
    /// Delay of the first paced attempt, in milliseconds
    pub min_ms: u64,
    /// Upper bound on any computed delay, in milliseconds
    pub max_ms: u64,
    /// Geometric growth factor applied per attempt
    pub factor: f64,
}

impl BackoffPolicy {
    /// Computes the delay before the given attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            1 => Duration::from_millis(self.min_ms),
            n => {
                let jitter = 1.0 + rand::random::<f64>();
                let grown = self.min_ms as f64 * self.factor.powi(n as i32 - 1);
                let millis = (jitter * grown).round().min(self.max_ms as f64);
                Duration::from_millis(millis as u64)
            }
        }
    }
}

/// The two named policies recognized by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Paces private reply queue re-creation
    pub private: BackoffPolicy,
    /// Paces consumed queue re-establishment
    pub consumed: BackoffPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            private: BackoffPolicy {
                min_ms: 250,
                max_ms: 1000,
                factor: 0.2,
            },
            consumed: BackoffPolicy {
                min_ms: 500,
                max_ms: 5000,
                factor: 0.2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_zero_is_immediate() {
        let policy = RecoveryConfig::default().private;
        assert_eq!(policy.delay(0), Duration::ZERO);
    }

    #[test]
    fn attempt_one_is_min() {
        let policy = RecoveryConfig::default().consumed;
        assert_eq!(policy.delay(1), Duration::from_millis(500));
    }

    #[test]
    fn later_attempts_stay_within_bounds() {
        let policy = BackoffPolicy {
            min_ms: 100,
            max_ms: 5000,
            factor: 2.0,
        };

        for attempt in 2..10 {
            let delay = policy.delay(attempt).as_millis() as u64;
            // (1 + rand01) * 100 * 2^(n-1), capped at 5000
            let floor = (100u64 * 2u64.pow(attempt - 1)).min(5000);
            assert!(delay >= floor, "attempt {attempt}: {delay} < {floor}");
            assert!(delay <= 5000, "attempt {attempt}: {delay} > cap");
        }
    }

    #[test]
    fn cap_applies_to_jittered_value() {
        let policy = BackoffPolicy {
            min_ms: 900,
            max_ms: 1000,
            factor: 2.0,
        };

        for _ in 0..50 {
            assert!(policy.delay(5) <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn shrinking_factor_decays_toward_zero() {
        let policy = RecoveryConfig::default().private;
        // factor 0.2: attempt 4 jittered delay is at most 2 * 250 * 0.2^3 = 4ms
        assert!(policy.delay(4) <= Duration::from_millis(4));
    }
}
