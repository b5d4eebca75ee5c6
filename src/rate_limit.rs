//! Request budgets and retry policy for external dependencies
//!
//! Every roster, embedding, and knowledge call goes through a
//! [`RateLimitedClient`]. One client instance exists per external dependency
//! and is shared (behind an `Arc`) by every component that talks to it, so the
//! budget holds across concurrent pipelines.

use std::future::Future;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, warn};

use crate::error::{InboxError, Result};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Outcome classification reported by a single call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Network failure, 5xx, 429. Worth retrying.
    Transient(String),
    /// 4xx or a malformed query. Retrying cannot help.
    Permanent(String),
}

impl CallError {
    /// Classify an HTTP status returned by an external API.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body.trim());
        if status == 429 || status >= 500 {
            CallError::Transient(message)
        } else {
            CallError::Permanent(message)
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CallError::Transient(m) | CallError::Permanent(m) => m,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => CallError::from_status(status.as_u16(), &err.to_string()),
            None if err.is_builder() => CallError::Permanent(err.to_string()),
            None => CallError::Transient(err.to_string()),
        }
    }
}

/// Exponential backoff: attempt `n` (0-based) waits `base_delay * 2^n` before the next try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }
}

/// At most `requests` calls per `period`, evenly spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub requests: u32,
    pub period: Duration,
}

impl RatePolicy {
    pub fn per_second(requests: u32) -> Self {
        Self {
            requests,
            period: Duration::from_secs(1),
        }
    }

    fn quota(&self) -> Option<Quota> {
        if self.requests == 0 {
            return None;
        }
        // Burst of one: calls are spaced by period / requests, so no window of
        // length `period` ever sees more than `requests` calls.
        Quota::with_period(self.period / self.requests)
    }
}

pub struct RateLimitedClient {
    name: String,
    limiter: Option<DirectLimiter>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("name", &self.name)
            .field("limited", &self.limiter.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

impl RateLimitedClient {
    pub fn new(name: impl Into<String>, rate: RatePolicy, retry: RetryPolicy) -> Result<Self> {
        let name = name.into();
        let quota = rate.quota().ok_or_else(|| InboxError::Config {
            message: format!(
                "rate limit for {} must allow at least one request per non-zero period",
                name
            ),
        })?;
        if retry.max_attempts == 0 {
            return Err(InboxError::Config {
                message: format!("retry attempts for {} must be at least 1", name),
            });
        }
        Ok(Self {
            name,
            limiter: Some(RateLimiter::direct(quota)),
            retry,
        })
    }

    /// A client that never waits for a slot. Retries still apply.
    pub fn unlimited(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limiter: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` once a rate slot is free, retrying transient failures.
    ///
    /// Each attempt takes its own slot. Waiting for a slot reserves nothing, so
    /// dropping the returned future at any await point leaves the budget intact.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(dependency = %self.name, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(CallError::Permanent(message)) => {
                    warn!(dependency = %self.name, error = %message, "permanent failure, not retrying");
                    return Err(InboxError::InvalidRequest {
                        dependency: self.name.clone(),
                        message,
                    });
                }
                Err(CallError::Transient(message)) => {
                    last_error = message;
                    if attempt + 1 < self.retry.max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        debug!(
                            dependency = %self.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        warn!(
            dependency = %self.name,
            attempts = self.retry.max_attempts,
            error = %last_error,
            "retries exhausted"
        );
        Err(InboxError::DependencyUnavailable {
            dependency: self.name.clone(),
            attempts: self.retry.max_attempts,
            message: last_error,
        })
    }
}

/// Convenience for building a limiter from config values.
pub fn client_for(
    name: &str,
    requests_per_second: u32,
    max_attempts: u32,
    base_delay_ms: u64,
) -> Result<RateLimitedClient> {
    RateLimitedClient::new(
        name,
        RatePolicy::per_second(requests_per_second),
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let client = RateLimitedClient::unlimited("roster");
        let calls = AtomicU32::new(0);
        let out = client
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CallError::Transient("502".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let client = RateLimitedClient::unlimited("roster");
        let calls = AtomicU32::new(0);
        let err = client
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallError::Permanent("bad formula".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InboxError::InvalidRequest { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_dependency_unavailable_after_doubling_delays() {
        let client = RateLimitedClient::unlimited("roster");
        let started = tokio::time::Instant::now();
        let err = client
            .execute(|| async { Err::<(), _>(CallError::Transient("connection reset".into())) })
            .await
            .unwrap_err();
        match err {
            InboxError::DependencyUnavailable {
                dependency,
                attempts,
                message,
            } => {
                assert_eq!(dependency, "roster");
                assert_eq!(attempts, 3);
                assert_eq!(message, "connection reset");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // 200ms + 400ms between the three attempts, no sleep after the last one
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(2), Duration::from_millis(800));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(CallError::from_status(503, ""), CallError::Transient(_)));
        assert!(matches!(CallError::from_status(429, ""), CallError::Transient(_)));
        assert!(matches!(CallError::from_status(422, ""), CallError::Permanent(_)));
        assert!(matches!(CallError::from_status(404, ""), CallError::Permanent(_)));
    }

    #[test]
    fn zero_rate_is_rejected() {
        let err = RateLimitedClient::new("kb", RatePolicy::per_second(0), RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, InboxError::Config { .. }));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_budget() {
        let client = Arc::new(
            RateLimitedClient::new("roster", RatePolicy::per_second(20), RetryPolicy::default())
                .unwrap(),
        );
        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.execute(|| async { Ok::<_, CallError>(()) }).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // 5 calls spaced 50ms apart: the last one cannot start before ~200ms
        assert!(started.elapsed() >= Duration::from_millis(180));
    }
}
