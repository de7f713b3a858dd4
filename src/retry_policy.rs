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

//! Retry policies for Cloud Storage requests.
//!
//! The storage service [recommends] retrying 408, 429, and all 5xx status
//! codes for idempotent requests. Requests that never left the client, or
//! whose responses were corrupted in transit, are always safe to retry.
//! Status codes 401, 405, and 412 are never retried: repeating the request
//! cannot change the outcome.
//!
//! Whether a given request is idempotent is decided where the request is
//! built: reads always are; mutations are idempotent when they carry a
//! precondition (`ifGenerationMatch`, `ifMetagenerationMatch`, an etag) or
//! when repeating them is harmless (bucket creation and deletion). The
//! policy receives that decision as the `idempotent` flag.
//!
//! Resumable uploads return `308 Resume Incomplete` as part of their normal
//! protocol; that status never reaches a retry policy.
//!
//! [recommends]: https://cloud.google.com/storage/docs/retry-strategy

use crate::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The result of a retry policy decision.
///
/// Each variant carries the error so composed policies can pass it through:
/// an inner policy may return [Continue][RetryResult::Continue] based on the
/// error type, while an outer decorator returns
/// [Exhausted][RetryResult::Exhausted] based on attempt counts or elapsed
/// time.
#[derive(Debug)]
pub enum RetryResult {
    /// The error is not retryable, stop the loop.
    Permanent(Error),
    /// The error is retryable, but the retry budget is spent.
    Exhausted(Error),
    /// The error is retryable, continue the loop.
    Continue(Error),
}

impl RetryResult {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue(_))
    }
}

/// Determines how errors are handled in the retry loop.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Query the policy after a failed attempt.
    ///
    /// # Parameters
    /// * `loop_start` - when the retry loop started.
    /// * `attempt_count` - the number of attempts so far, including the
    ///   initial one; always non-zero.
    /// * `idempotent` - whether repeating this request is safe.
    /// * `error` - the error from the last attempt.
    fn on_error(
        &self,
        loop_start: Instant,
        attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult;

    /// The remaining time in the policy, for time-budgeted policies.
    ///
    /// The retry loop uses this to refuse backoff sleeps that would overrun
    /// the budget, and to derive per-attempt deadlines.
    fn remaining_time(&self, _loop_start: Instant, _attempt_count: u32) -> Option<Duration> {
        None
    }
}

/// A helper type to pass any [RetryPolicy] to builder methods.
#[derive(Clone)]
pub struct RetryPolicyArg(pub(crate) Arc<dyn RetryPolicy>);

impl<T> std::convert::From<T> for RetryPolicyArg
where
    T: RetryPolicy + 'static,
{
    fn from(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl std::convert::From<Arc<dyn RetryPolicy>> for RetryPolicyArg {
    fn from(value: Arc<dyn RetryPolicy>) -> Self {
        Self(value)
    }
}

impl From<RetryPolicyArg> for Arc<dyn RetryPolicy> {
    fn from(value: RetryPolicyArg) -> Self {
        value.0
    }
}

/// Extension trait to decorate [RetryPolicy] implementations with limits.
pub trait RetryPolicyExt: RetryPolicy + Sized {
    /// Limit the total elapsed time in the retry loop.
    fn with_time_limit(self, maximum_duration: Duration) -> LimitedElapsedTime<Self> {
        LimitedElapsedTime::custom(self, maximum_duration)
    }

    /// Limit the number of attempts.
    ///
    /// `on_error()` is not consulted before the initial attempt, so a limit
    /// of 0 or 1 disables retries.
    fn with_attempt_limit(self, maximum_attempts: u32) -> LimitedAttemptCount<Self> {
        LimitedAttemptCount::custom(self, maximum_attempts)
    }
}

impl<T: RetryPolicy> RetryPolicyExt for T {}

/// Controls how aggressively mutations are retried.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum IdempotencyStrategy {
    /// Retry retryable errors even for requests classified as
    /// non-idempotent. Appropriate when the service deduplicates via request
    /// identifiers, or when duplicate mutations are acceptable.
    Always,
    /// Retry only requests classified as idempotent. The default.
    #[default]
    Conditional,
    /// Never retry anything.
    Never,
}

/// The recommended retry policy for Cloud Storage.
///
/// This policy must be decorated to bound the retry loop:
///
/// ```
/// # use google_cloud_storage_v1::retry_policy::{RecommendedPolicy, RetryPolicyExt};
/// use std::time::Duration;
/// let policy = RecommendedPolicy::default()
///     .with_time_limit(Duration::from_secs(60))
///     .with_attempt_limit(10);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecommendedPolicy {
    strategy: IdempotencyStrategy,
}

impl RecommendedPolicy {
    pub fn new(strategy: IdempotencyStrategy) -> Self {
        Self { strategy }
    }
}

/// Error payload reasons the service uses to signal throttling.
const RATE_LIMIT_REASONS: [&str; 3] =
    ["rateLimitExceeded", "userRateLimitExceeded", "EAI_AGAIN"];

impl RetryPolicy for RecommendedPolicy {
    fn on_error(
        &self,
        _loop_start: Instant,
        _attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult {
        if self.strategy == IdempotencyStrategy::Never {
            return RetryResult::Permanent(error);
        }
        // Network failures and corrupted responses: the request may never
        // have been processed, and even when it was, the client cannot tell.
        // Both directions of the corruption are treated as I/O.
        if error.is_io() || error.is_authentication() {
            return RetryResult::Continue(error);
        }
        let Some(code) = error.http_status_code() else {
            return RetryResult::Permanent(error);
        };
        match code {
            401 | 405 | 412 => RetryResult::Permanent(error),
            _ if is_rate_limited(&error) => RetryResult::Continue(error),
            408 | 429 | 500..600 => {
                if idempotent || self.strategy == IdempotencyStrategy::Always {
                    RetryResult::Continue(error)
                } else {
                    RetryResult::Permanent(error)
                }
            }
            _ => RetryResult::Permanent(error),
        }
    }
}

fn is_rate_limited(error: &Error) -> bool {
    error
        .as_inner::<crate::error::HttpError>()
        .and_then(|http| http.reason())
        .is_some_and(|reason| RATE_LIMIT_REASONS.contains(&reason.as_str()))
}

/// Decorates a policy for resumable upload loops.
///
/// The upload engine consumes ordinary `308 Resume Incomplete` responses as
/// protocol progress. A 308 can still surface as an error when a status
/// probe races a finalizing request; continuing the loop re-probes and
/// reconciles.
#[derive(Debug)]
pub struct ContinueOn308<P> {
    inner: P,
}

impl<P> ContinueOn308<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl RetryPolicy for ContinueOn308<Arc<dyn RetryPolicy>> {
    fn on_error(
        &self,
        loop_start: Instant,
        attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult {
        if error.http_status_code() == Some(308) {
            return RetryResult::Continue(error);
        }
        self.inner
            .on_error(loop_start, attempt_count, idempotent, error)
    }

    fn remaining_time(&self, loop_start: Instant, attempt_count: u32) -> Option<Duration> {
        self.inner.remaining_time(loop_start, attempt_count)
    }
}

/// A decorator limiting the total time in the retry loop.
#[derive(Debug)]
pub struct LimitedElapsedTime<P = RecommendedPolicy>
where
    P: RetryPolicy,
{
    inner: P,
    maximum_duration: Duration,
}

impl LimitedElapsedTime {
    pub fn new(maximum_duration: Duration) -> Self {
        Self {
            inner: RecommendedPolicy::default(),
            maximum_duration,
        }
    }
}

impl<P> LimitedElapsedTime<P>
where
    P: RetryPolicy,
{
    pub fn custom(inner: P, maximum_duration: Duration) -> Self {
        Self {
            inner,
            maximum_duration,
        }
    }

    fn error_if_expired(&self, loop_start: Instant) -> Option<Error> {
        let deadline = loop_start + self.maximum_duration;
        let now = Instant::now();
        if now < deadline {
            return None;
        }
        Some(Error::exhausted(format!(
            "time-limited retry policy exhausted {:?} ago",
            now.saturating_duration_since(deadline)
        )))
    }
}

impl<P> RetryPolicy for LimitedElapsedTime<P>
where
    P: RetryPolicy + 'static,
{
    fn on_error(
        &self,
        loop_start: Instant,
        attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult {
        match self.inner.on_error(loop_start, attempt_count, idempotent, error) {
            RetryResult::Continue(e) => match self.error_if_expired(loop_start) {
                Some(_) => RetryResult::Exhausted(e),
                None => RetryResult::Continue(e),
            },
            other => other,
        }
    }

    fn remaining_time(&self, loop_start: Instant, attempt_count: u32) -> Option<Duration> {
        let deadline = loop_start + self.maximum_duration;
        let mine = deadline.saturating_duration_since(Instant::now());
        match self.inner.remaining_time(loop_start, attempt_count) {
            Some(inner) => Some(std::cmp::min(inner, mine)),
            None => Some(mine),
        }
    }
}

/// A decorator limiting the number of attempts.
#[derive(Debug)]
pub struct LimitedAttemptCount<P = RecommendedPolicy>
where
    P: RetryPolicy,
{
    inner: P,
    maximum_attempts: u32,
}

impl LimitedAttemptCount {
    pub fn new(maximum_attempts: u32) -> Self {
        Self {
            inner: RecommendedPolicy::default(),
            maximum_attempts,
        }
    }
}

impl<P> LimitedAttemptCount<P>
where
    P: RetryPolicy,
{
    pub fn custom(inner: P, maximum_attempts: u32) -> Self {
        Self {
            inner,
            maximum_attempts,
        }
    }
}

impl<P> RetryPolicy for LimitedAttemptCount<P>
where
    P: RetryPolicy,
{
    fn on_error(
        &self,
        loop_start: Instant,
        attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult {
        match self.inner.on_error(loop_start, attempt_count, idempotent, error) {
            RetryResult::Continue(e) if attempt_count >= self.maximum_attempts => {
                RetryResult::Exhausted(e)
            }
            other => other,
        }
    }

    fn remaining_time(&self, loop_start: Instant, attempt_count: u32) -> Option<Duration> {
        self.inner.remaining_time(loop_start, attempt_count)
    }
}

/// The default retry policy for the Storage client: the recommended rules
/// with a conservative time budget.
pub(crate) fn default() -> impl RetryPolicy {
    RecommendedPolicy::default().with_time_limit(Duration::from_secs(60))
}
