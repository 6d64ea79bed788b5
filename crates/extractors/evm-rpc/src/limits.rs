//! Concurrency, rate and retry limits shared by every fetch of a collection.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use backon::ExponentialBuilder;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, SemaphorePermit};

pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 4;
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;
pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Upper bound of a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// User-facing fetch limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchLimits {
    /// Chunks fetched at the same time, across all datatypes
    pub max_concurrent_chunks: usize,
    /// Requests in flight at the same time, across all chunks
    pub max_concurrent_requests: usize,
    /// Global request rate. Unlimited when unset.
    pub requests_per_second: Option<NonZeroU32>,
    /// Retries per request after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry. Doubles on every further retry.
    pub initial_backoff_ms: u64,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            requests_per_second: None,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
        }
    }
}

impl FetchLimits {
    pub fn validate(&self) -> Result<(), InvalidLimitsError> {
        if self.max_concurrent_chunks == 0 {
            return Err(InvalidLimitsError::ZeroConcurrentChunks);
        }
        if self.max_concurrent_requests == 0 {
            return Err(InvalidLimitsError::ZeroConcurrentRequests);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
        }
    }
}

/// Limits that would stall the collection forever.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidLimitsError {
    /// `max_concurrent_chunks` is zero, so no chunk could ever start.
    #[error("max_concurrent_chunks must be greater than zero")]
    ZeroConcurrentChunks,

    /// `max_concurrent_requests` is zero, so no request could ever be sent.
    #[error("max_concurrent_requests must be greater than zero")]
    ZeroConcurrentRequests,
}

/// Runtime limiter shared by the fetchers of one collection.
///
/// A chunk holds a chunk permit for the whole time it is fetched. Every remote request holds a
/// request permit while in flight and, when a rate is configured, waits for the global rate
/// limiter before it is sent.
pub struct Limits {
    chunk_permits: Arc<Semaphore>,
    request_permits: Semaphore,
    rate_limiter: Option<DefaultDirectRateLimiter>,
    max_concurrent_requests: usize,
}

impl Limits {
    pub fn new(limits: &FetchLimits) -> Self {
        let rate_limiter = limits
            .requests_per_second
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        Self {
            chunk_permits: Arc::new(Semaphore::new(limits.max_concurrent_chunks)),
            request_permits: Semaphore::new(limits.max_concurrent_requests),
            rate_limiter,
            max_concurrent_requests: limits.max_concurrent_requests,
        }
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    /// Waits for a chunk slot.
    pub async fn acquire_chunk(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.chunk_permits).acquire_owned().await
    }

    /// Waits until a request may be sent. The request must hold the permit while in flight.
    pub async fn admit_request(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        let permit = self.request_permits.acquire().await?;
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
        Ok(permit)
    }

    /// Releases every waiter with an error. Used on cancellation.
    pub fn close(&self) {
        self.chunk_permits.close();
        self.request_permits.close();
    }
}

impl std::fmt::Debug for Limits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limits")
            .field("available_chunks", &self.chunk_permits.available_permits())
            .field("available_requests", &self.request_permits.available_permits())
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

/// Exponential backoff for transient request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        FetchLimits::default().retry_policy()
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(MAX_BACKOFF.max(self.initial_backoff))
            .with_max_times(self.max_retries)
    }

    /// Retries after which failures are logged as errors instead of warnings.
    pub fn escalation_threshold(&self) -> usize {
        self.max_retries / 2
    }
}

#[cfg(test)]
mod tests {
    use backon::BackoffBuilder;

    use super::*;

    #[test]
    fn default_limits_are_valid() {
        //* Given
        let limits = FetchLimits::default();

        //* Then
        assert_eq!(limits.max_concurrent_chunks, 4);
        assert_eq!(limits.max_concurrent_requests, 100);
        assert_eq!(limits.requests_per_second, None);
        assert_eq!(limits.validate(), Ok(()));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        //* Given
        let limits = FetchLimits {
            max_concurrent_requests: 0,
            ..Default::default()
        };

        //* Then
        assert_eq!(
            limits.validate(),
            Err(InvalidLimitsError::ZeroConcurrentRequests)
        );
    }

    #[test]
    fn backoff_doubles_from_initial_delay_and_stops_after_max_retries() {
        //* Given
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
        };

        //* When
        let delays: Vec<_> = policy.backoff().build().collect();

        //* Then
        // backon scales the delay by an f32 factor, so compare whole milliseconds.
        let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![100, 200, 400]);
    }

    #[tokio::test]
    async fn chunk_permits_bound_concurrent_chunks() {
        //* Given
        let limits = Limits::new(&FetchLimits {
            max_concurrent_chunks: 2,
            ..Default::default()
        });

        //* When
        let first = limits.acquire_chunk().await.expect("Failed to acquire permit");
        let _second = limits.acquire_chunk().await.expect("Failed to acquire permit");
        let third = tokio::time::timeout(Duration::from_millis(20), limits.acquire_chunk()).await;

        //* Then
        assert!(third.is_err(), "third chunk should wait for a free slot");
        drop(first);
        limits
            .acquire_chunk()
            .await
            .expect("Failed to acquire released permit");
    }

    #[tokio::test]
    async fn closed_limits_reject_waiters() {
        //* Given
        let limits = Limits::new(&FetchLimits::default());

        //* When
        limits.close();

        //* Then
        assert!(limits.admit_request().await.is_err());
        assert!(limits.acquire_chunk().await.is_err());
    }
}
