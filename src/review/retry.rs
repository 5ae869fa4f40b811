#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::{sync::Arc, time::Duration};

use tokio::sync::Semaphore;

use super::{FigureRequest, ReviewClient, ReviewError, ReviewRequest, ReviewScore, bound_score};

/// Attempt count, per-attempt timeout and backoff for review calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries:      u32,
    /// Hard timeout of one attempt.
    pub timeout:      Duration,
    /// Delay before the first retry; doubles on each subsequent one.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries:      2,
            timeout:      Duration::from_secs(60),
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Maximum number of calls to the client.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

/// A review that failed on every attempt.
#[derive(Debug, Clone)]
pub struct ReviewFailure {
    /// Calls made.
    pub attempts: u32,
    /// Error from the last call.
    pub last:     ReviewError,
}

impl std::fmt::Display for ReviewFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} after {} attempt(s)", self.last, self.attempts)
    }
}

/// Shared entry point for review calls.
///
/// All workflows in a run share one gate, so `permits` bounds the number of
/// outstanding provider calls across the whole run. A permit is held only
/// for the duration of a single attempt, never across a backoff sleep.
#[derive(Clone)]
pub struct ReviewGate {
    /// Underlying client.
    client:  Arc<dyn ReviewClient>,
    /// Concurrent call bound.
    permits: Arc<Semaphore>,
    /// Retry behaviour.
    policy:  RetryPolicy,
}

impl ReviewGate {
    /// Creates a gate allowing `max_concurrent` outstanding calls.
    pub fn new(client: Arc<dyn ReviewClient>, max_concurrent: usize, policy: RetryPolicy) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            policy,
        }
    }

    /// Scores `request`, retrying retryable failures with exponential backoff.
    ///
    /// Returns the bounded score together with the number of calls made.
    pub async fn review(&self, request: &ReviewRequest) -> Result<(ReviewScore, u32), ReviewFailure> {
        self.with_retries(&request.submission_id, &request.criterion.id, move || async move {
            let score = self.client.score(request).await?;
            bound_score(score, &request.criterion)
        })
        .await
    }

    /// Describes a report figure under the same permits, timeout and retry
    /// bound as scoring.
    pub async fn describe_figure(
        &self,
        request: &FigureRequest,
    ) -> Result<(String, u32), ReviewFailure> {
        let target = request.path.display().to_string();
        self.with_retries(&request.submission_id, &target, move || async move {
            let description = self.client.describe_figure(request).await?;
            if description.trim().is_empty() {
                return Err(ReviewError::Malformed("empty figure description".into()));
            }
            Ok(description)
        })
        .await
    }

    /// Runs `call` until it succeeds, fails finally, or the attempts run out.
    ///
    /// A permit is held for each attempt only.
    async fn with_retries<T, F, Fut>(
        &self,
        submission: &str,
        target: &str,
        call: F,
    ) -> Result<(T, u32), ReviewFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ReviewError>>,
    {
        let attempts = self.policy.attempts();
        let mut last = ReviewError::Provider("no attempt made".into());

        for attempt in 1..=attempts {
            let result = {
                let _permit = match self.permits.acquire().await {
                    Ok(p) => p,
                    Err(_) => {
                        return Err(ReviewFailure {
                            attempts: attempt - 1,
                            last:     ReviewError::Provider("review pool closed".into()),
                        });
                    }
                };
                match tokio::time::timeout(self.policy.timeout, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(ReviewError::Timeout(self.policy.timeout)),
                }
            };

            match result {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => {
                    tracing::warn!(
                        submission = %submission,
                        target = %target,
                        attempt,
                        error = %e,
                        "review attempt failed"
                    );
                    let retryable = e.is_retryable();
                    last = e;
                    if !retryable {
                        return Err(ReviewFailure {
                            attempts: attempt,
                            last,
                        });
                    }
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(ReviewFailure { attempts, last })
    }
}
