//! Reconnect delay policy for the persistent channel.
//!
//! The channel never gives up: attempts are unbounded, only the delay is
//! capped. Jitter spreads reconnects from many dashboards after a server
//! restart.

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delays are scaled by a uniform factor in `[1 - j, 1 + j]`.
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// `min(max_delay, base_delay * 2^attempt)` before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::Invalid {
                field: "backoff.base_delay",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid {
                field: "backoff.max_delay",
                reason: format!(
                    "{:?} is shorter than base delay {:?}",
                    self.max_delay, self.base_delay
                ),
            });
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::Invalid {
                field: "backoff.jitter_fraction",
                reason: format!("{} is outside [0, 1)", self.jitter_fraction),
            });
        }
        Ok(())
    }
}

pub struct BackoffState {
    policy: BackoffPolicy,
    attempt_count: u32,
    rng: StdRng,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests.
    pub fn seeded(policy: BackoffPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            attempt_count: 0,
            rng,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Records one failure and returns the jittered delay before the retry.
    /// Call exactly once per failed attempt.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.policy.nominal_delay(self.attempt_count);
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.jitter(nominal)
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    fn jitter(&mut self, nominal: Duration) -> Duration {
        let spread = self.policy.jitter_fraction;
        if spread <= 0.0 {
            return nominal;
        }
        let factor = self.rng.gen_range((1.0 - spread)..=(1.0 + spread));
        nominal.mul_f64(factor)
    }
}

impl std::fmt::Debug for BackoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffState")
            .field("policy", &self.policy)
            .field("attempt_count", &self.attempt_count)
            .finish_non_exhaustive()
    }
}
