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

//! The retry loop shared by every operation in this crate.

use crate::Result;
use crate::backoff_policy::BackoffPolicy;
use crate::error::Error;
use crate::retry_policy::{RetryPolicy, RetryResult};
use std::sync::Arc;
use std::time::Duration;

/// Runs the retry loop for a given function.
///
/// Calls `inner` as long as (1) the retry policy has not expired, and (2)
/// `inner` has not returned a successful response. Between attempts the
/// function sleeps for the duration prescribed by the backoff policy, via
/// the injected `sleep` so tests can run without waiting.
///
/// A backoff delay that exceeds the policy's remaining time ends the loop
/// with an exhausted error instead of sleeping past the budget.
pub(crate) async fn retry_loop<F, S, Response>(
    mut inner: F,
    sleep: S,
    idempotent: bool,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff_policy: Arc<dyn BackoffPolicy>,
) -> Result<Response>
where
    F: AsyncFnMut(Option<Duration>) -> Result<Response> + Send,
    S: AsyncFn(Duration) -> () + Send,
{
    let loop_start = std::time::Instant::now();
    let mut attempt_count = 0_u32;
    loop {
        let remaining_time = retry_policy.remaining_time(loop_start, attempt_count);
        attempt_count += 1;
        let error = match inner(remaining_time).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        let delay = backoff_policy.on_failure(loop_start, attempt_count);
        match retry_policy.on_error(loop_start, attempt_count, idempotent, error) {
            RetryResult::Permanent(e) => return Err(e),
            // The retry budget is spent; surface that, keeping the last
            // underlying error as the cause.
            RetryResult::Exhausted(e) => return Err(Error::exhausted(e)),
            RetryResult::Continue(e) => {
                let remaining = retry_policy.remaining_time(loop_start, attempt_count);
                if remaining.is_some_and(|remaining| remaining < delay) {
                    return Err(Error::exhausted(e));
                }
                tracing::debug!(
                    attempt_count,
                    ?delay,
                    "retrying after transient error: {e}"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use crate::retry_policy::{RecommendedPolicy, RetryPolicyExt};
    use std::sync::Mutex;

    fn transient() -> Error {
        Error::http(HttpError::new(503, Default::default(), None))
    }

    fn permanent() -> Error {
        Error::http(HttpError::new(403, Default::default(), None))
    }

    fn policies() -> (Arc<dyn RetryPolicy>, Arc<dyn BackoffPolicy>) {
        (
            Arc::new(RecommendedPolicy::default().with_attempt_limit(5)),
            Arc::new(crate::backoff_policy::default()),
        )
    }

    #[tokio::test]
    async fn immediate_success() -> anyhow::Result<()> {
        let (retry, backoff) = policies();
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let record = sleeps.clone();
        let response = retry_loop(
            async move |_| Ok("success"),
            async |d| record.lock().unwrap().push(d),
            true,
            retry,
            backoff,
        )
        .await?;
        assert_eq!(response, "success");
        assert!(sleeps.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn transient_then_success() -> anyhow::Result<()> {
        let (retry, backoff) = policies();
        let mut attempts = 0;
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let record = sleeps.clone();
        let response = retry_loop(
            async move |_| {
                attempts += 1;
                if attempts < 3 {
                    Err(transient())
                } else {
                    Ok(attempts)
                }
            },
            async |d| record.lock().unwrap().push(d),
            true,
            retry,
            backoff,
        )
        .await?;
        assert_eq!(response, 3);
        assert_eq!(sleeps.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_stops_the_loop() {
        let (retry, backoff) = policies();
        let mut attempts = 0;
        let response: Result<()> = retry_loop(
            async move |_| {
                attempts += 1;
                assert_eq!(attempts, 1, "permanent errors must not be retried");
                Err(permanent())
            },
            async |_| {},
            true,
            retry,
            backoff,
        )
        .await;
        let err = response.unwrap_err();
        assert_eq!(err.http_status_code(), Some(403));
    }

    #[tokio::test]
    async fn non_idempotent_stops_the_loop() {
        let (retry, backoff) = policies();
        let response: Result<()> =
            retry_loop(async move |_| Err(transient()), async |_| {}, false, retry, backoff)
                .await;
        let err = response.unwrap_err();
        assert_eq!(err.http_status_code(), Some(503));
    }

    #[tokio::test]
    async fn attempts_exhausted() {
        let (retry, backoff) = policies();
        let mut attempts = 0;
        let response: Result<()> = retry_loop(
            async move |_| {
                attempts += 1;
                Err(transient())
            },
            async |_| {},
            true,
            retry,
            backoff,
        )
        .await;
        let err = response.unwrap_err();
        assert!(err.is_exhausted(), "{err:?}");
        assert_eq!(err.http_status_code(), Some(503), "{err:?}");
    }

    #[tokio::test]
    async fn no_sleep_past_overall_timeout() {
        // The policy has (almost) no time left; the backoff delay always
        // exceeds it, so the loop must give up without sleeping.
        let retry: Arc<dyn RetryPolicy> = Arc::new(
            RecommendedPolicy::default().with_time_limit(Duration::from_nanos(1)),
        );
        let backoff: Arc<dyn BackoffPolicy> = Arc::new(crate::backoff_policy::default());
        let slept = Arc::new(Mutex::new(false));
        let record = slept.clone();
        let response: Result<()> = retry_loop(
            async move |_| Err(transient()),
            async |_| *record.lock().unwrap() = true,
            true,
            retry,
            backoff,
        )
        .await;
        let err = response.unwrap_err();
        assert!(err.is_exhausted(), "{err:?}");
        assert!(!*slept.lock().unwrap(), "must not sleep past the budget");
    }

    #[tokio::test]
    async fn remaining_time_reaches_attempts() {
        let retry: Arc<dyn RetryPolicy> = Arc::new(
            RecommendedPolicy::default().with_time_limit(Duration::from_secs(3600)),
        );
        let backoff: Arc<dyn BackoffPolicy> = Arc::new(crate::backoff_policy::default());
        let response = retry_loop(
            async move |remaining: Option<Duration>| {
                let remaining = remaining.expect("time-limited policy reports remaining time");
                assert!(remaining <= Duration::from_secs(3600));
                Ok(remaining)
            },
            async |_| {},
            true,
            retry,
            backoff,
        )
        .await;
        assert!(response.is_ok(), "{response:?}");
    }
}
