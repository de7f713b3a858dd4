// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Truncated exponential backoff with jitter.
//!
//! The service recommends exponential backoff, starting at one second and
//! doubling on each attempt, with up to one second of random jitter so
//! synchronized clients do not retry in lockstep.

use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Computes the delay before the next retry attempt.
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    /// The delay to wait after attempt number `attempt_count` failed.
    fn on_failure(&self, loop_start: std::time::Instant, attempt_count: u32) -> Duration;
}

/// A helper type to pass any [BackoffPolicy] to builder methods.
#[derive(Clone)]
pub struct BackoffPolicyArg(pub(crate) Arc<dyn BackoffPolicy>);

impl<T> std::convert::From<T> for BackoffPolicyArg
where
    T: BackoffPolicy + 'static,
{
    fn from(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl std::convert::From<Arc<dyn BackoffPolicy>> for BackoffPolicyArg {
    fn from(value: Arc<dyn BackoffPolicy>) -> Self {
        Self(value)
    }
}

impl From<BackoffPolicyArg> for Arc<dyn BackoffPolicy> {
    fn from(value: BackoffPolicyArg) -> Self {
        value.0
    }
}

/// The jitter added to each computed delay, sampled uniformly once per retry.
const JITTER_CEILING: Duration = Duration::from_millis(1000);

/// A builder for [ExponentialBackoff].
#[derive(Clone, Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    maximum_delay: Duration,
    multiplier: f64,
}

impl ExponentialBackoffBuilder {
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            maximum_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    /// Change the delay before the first retry.
    pub fn with_initial_delay<V: Into<Duration>>(mut self, v: V) -> Self {
        self.initial_delay = v.into();
        self
    }

    /// Change the truncation point for the delay growth.
    pub fn with_maximum_delay<V: Into<Duration>>(mut self, v: V) -> Self {
        self.maximum_delay = v.into();
        self
    }

    /// Change the per-attempt growth factor.
    pub fn with_multiplier<V: Into<f64>>(mut self, v: V) -> Self {
        self.multiplier = v.into();
        self
    }

    /// Validates the configuration and creates the policy.
    pub fn build(self) -> Result<ExponentialBackoff> {
        if self.multiplier < 1.0 {
            return Err(Error::validation(format!(
                "multiplier ({}) must be >= 1.0",
                self.multiplier
            )));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::validation(format!(
                "initial delay must be greater than zero, got={:?}",
                self.initial_delay
            )));
        }
        if self.maximum_delay < self.initial_delay {
            return Err(Error::validation(format!(
                "maximum delay ({:?}) must be greater or equal to the initial delay ({:?})",
                self.maximum_delay, self.initial_delay
            )));
        }
        Ok(ExponentialBackoff {
            initial_delay: self.initial_delay,
            maximum_delay: self.maximum_delay,
            multiplier: self.multiplier,
        })
    }
}

impl std::default::Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Implements truncated exponential backoff with jitter.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    maximum_delay: Duration,
    multiplier: f64,
}

impl std::default::Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            maximum_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl ExponentialBackoff {
    /// The deterministic part: `min(initial × multiplier^(n-1), maximum)`.
    fn base_delay(&self, attempt_count: u32) -> Duration {
        let exp = std::cmp::min(attempt_count, i32::MAX as u32) as i32;
        let scaling = self.multiplier.powi(exp.saturating_sub(1));
        if scaling >= self.maximum_delay.div_duration_f64(self.initial_delay) {
            self.maximum_delay
        } else {
            self.initial_delay.mul_f64(scaling)
        }
    }

    fn delay_with_rng(&self, attempt_count: u32, rng: &mut impl rand::Rng) -> Duration {
        let jitter = rng.random_range(Duration::ZERO..JITTER_CEILING);
        self.base_delay(attempt_count) + jitter
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn on_failure(&self, _loop_start: std::time::Instant, attempt_count: u32) -> Duration {
        self.delay_with_rng(attempt_count, &mut rand::rng())
    }
}

/// The default backoff policy for the Storage client.
pub(crate) fn default() -> impl BackoffPolicy {
    ExponentialBackoffBuilder::new()
        .with_initial_delay(Duration::from_secs(1))
        .with_maximum_delay(Duration::from_secs(60))
        .with_multiplier(2.0)
        .build()
        .expect("statically configured policy should succeed")
}
