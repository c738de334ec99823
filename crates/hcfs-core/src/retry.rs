//! Bounded retry with exponential backoff.
//!
//! [`Backoff`] is the per-operation state machine: every failed attempt is
//! fed to [`Backoff::on_failure`], which says whether to sleep and retry,
//! reauthenticate first, or give up.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{BlockError, RetryClass};

/// Retry budget for one block operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Randomize each delay within [delay / 2, delay].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy described by `config`.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: 2.0,
            jitter: config.jitter,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fresh state machine for one operation.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 1,
            delay: self.initial_backoff,
            reauthenticated: false,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Sleep for the given delay, then try again.
    RetryAfter(Duration),
    /// Renew the session, then try again immediately.
    Reauthenticate,
    /// Stop and surface the error.
    GiveUp,
}

/// Retry state of one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    delay: Duration,
    reauthenticated: bool,
}

impl Backoff {
    /// The attempt currently being made, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decide how to proceed after `error`.
    pub fn on_failure(&mut self, error: &BlockError) -> Step {
        if self.attempt >= self.policy.max_attempts {
            return Step::GiveUp;
        }
        match error.class() {
            RetryClass::Abort => Step::GiveUp,
            RetryClass::Reauthenticate if self.reauthenticated => Step::GiveUp,
            RetryClass::Reauthenticate => {
                self.reauthenticated = true;
                self.attempt += 1;
                Step::Reauthenticate
            }
            RetryClass::Retry => {
                self.attempt += 1;
                Step::RetryAfter(self.next_delay())
            }
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.delay.min(self.policy.max_backoff);
        self.delay = self
            .delay
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_backoff);
        if self.policy.jitter && !base.is_zero() {
            let half = base / 2;
            half + rand::rng().random_range(Duration::ZERO..=half)
        } else {
            base
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    /// Successive delays for an operation that keeps failing transiently.
    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.next_delay())
    }
}
