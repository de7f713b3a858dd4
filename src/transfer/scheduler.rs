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

//! A bounded-concurrency task scheduler with admission backpressure.
//!
//! At most `concurrency_limit` tasks run at once, and at most
//! `max_queue_size` tasks are resident (queued + running). Submitting past
//! the queue bound blocks the producer; that backpressure is what keeps
//! memory bounded when a large file streams into parallel part uploads.
//! Both semaphores are fair, so tasks start in submission order.

use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub(crate) struct TransferScheduler {
    run: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl TransferScheduler {
    pub fn new(
        concurrency_limit: usize,
        max_queue_size: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if concurrency_limit == 0 {
            return Err(Error::validation("concurrency limit must be positive"));
        }
        if max_queue_size < concurrency_limit {
            return Err(Error::validation(format!(
                "max queue size ({max_queue_size}) must be at least the concurrency limit ({concurrency_limit})"
            )));
        }
        Ok(Self {
            run: Arc::new(Semaphore::new(concurrency_limit)),
            queue: Arc::new(Semaphore::new(max_queue_size)),
            cancel,
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Submits a task, blocking while the queue is full.
    ///
    /// The returned handle resolves to the task's result; queued tasks that
    /// are cancelled before starting resolve to a cancellation error.
    pub async fn submit<F, T>(&self, task: F) -> Result<tokio::task::JoinHandle<Result<T>>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        // This await is the backpressure point for producers.
        let queue_permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(Error::cancelled("transfer cancelled before admission"));
            }
            permit = self.queue.clone().acquire_owned() => {
                permit.map_err(Error::other)?
            }
        };
        let run = self.run.clone();
        let cancel = self.cancel.clone();
        Ok(tokio::spawn(async move {
            let _queue_permit = queue_permit;
            let _run_permit = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled("transfer cancelled while queued"));
                }
                permit = run.acquire_owned() => permit.map_err(Error::other)?,
            };
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::cancelled("transfer cancelled")),
                result = task => result,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type TestResult = anyhow::Result<()>;

    #[test]
    fn rejects_invalid_limits() {
        let cancel = CancellationToken::new();
        let err = TransferScheduler::new(0, 4, cancel.clone()).unwrap_err();
        assert!(err.is_validation(), "{err:?}");
        let err = TransferScheduler::new(4, 2, cancel).unwrap_err();
        assert!(err.is_validation(), "{err:?}");
    }

    #[tokio::test]
    async fn runs_at_most_concurrency_limit() -> TestResult {
        const LIMIT: usize = 3;
        const TASKS: usize = 24;
        let scheduler = TransferScheduler::new(LIMIT, TASKS, CancellationToken::new())?;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let running = running.clone();
            let peak = peak.clone();
            let handle = scheduler
                .submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await?;
            handles.push(handle);
        }
        for handle in handles {
            handle.await??;
        }
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= LIMIT, "observed {peak} concurrent tasks");
        assert!(peak > 0);
        Ok(())
    }

    #[tokio::test]
    async fn queue_admission_blocks_producer() -> TestResult {
        let scheduler = TransferScheduler::new(1, 2, CancellationToken::new())?;
        // A gate that starts closed and stays open once released.
        let gate = Arc::new(Semaphore::new(0));

        // Fill the queue: one running (held at the gate), one queued.
        let mut handles = Vec::new();
        for _ in 0..2 {
            let gate = gate.clone();
            handles.push(
                scheduler
                    .submit(async move {
                        let _pass = gate.acquire().await;
                        Ok(())
                    })
                    .await?,
            );
        }

        // A third submit must block until a resident task completes.
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            scheduler.submit(async { Ok(()) }),
        )
        .await;
        assert!(blocked.is_err(), "submit should block while the queue is full");

        // Open the gate; admission frees up.
        gate.add_permits(1);
        let admitted = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.submit(async { Ok(()) }),
        )
        .await;
        let handle = admitted.expect("queue slot freed")?;
        handle.await??;
        for handle in handles {
            handle.await??;
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_queued_tasks() -> TestResult {
        let cancel = CancellationToken::new();
        let scheduler = TransferScheduler::new(1, 4, cancel.clone())?;
        let gate = Arc::new(tokio::sync::Notify::new());

        let gate_for_task = gate.clone();
        let running = scheduler
            .submit(async move {
                gate_for_task.notified().await;
                Ok(())
            })
            .await?;
        let queued = scheduler.submit(async { Ok(()) }).await?;

        cancel.cancel();
        gate.notify_waiters();

        let err = queued.await?.unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
        // The running task was interrupted or finished; either way it
        // terminates.
        let _ = running.await?;

        // New submissions are refused outright.
        let err = scheduler.submit(async { Ok(()) }).await.unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
        Ok(())
    }
}
