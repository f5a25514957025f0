//! # Retry Policies
//!
//! Exponential backoff for the relay server's HTTP API. Only errors that
//! [`LinkError::is_retryable`] accepts are retried; everything else fails
//! on the first attempt.
//!
//! | Policy | Retries | Used for |
//! |--------|---------|----------|
//! | [`RetryPolicy::query()`] | 3 | Reads: listing online robots |
//! | [`RetryPolicy::idempotent()`] | 2 | Safe writes: client registration |
//! | [`RetryPolicy::none()`] | 0 | Callers that retry on their own, via [`RegistryClient::with_retry_policy`] |
//!
//! Inference uploads never go through here: one capture is one upload,
//! bounded by the inference timeout.
//!
//! [`RegistryClient::with_retry_policy`]: crate::registry::RegistryClient::with_retry_policy
//!
//! ```rust
//! use robot_link::retry::{RetryPolicy, with_retry};
//! use robot_link::LinkError;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//!
//! let calls = AtomicUsize::new(0);
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//!
//! let policy = RetryPolicy::custom(2, Duration::from_millis(1), Duration::from_millis(5));
//! let result = rt.block_on(with_retry(&policy, || {
//!     let call = calls.fetch_add(1, Ordering::SeqCst);
//!     async move {
//!         if call == 0 {
//!             Err(LinkError::Http("connection reset".into()))
//!         } else {
//!             Ok::<_, LinkError>("ok")
//!         }
//!     }
//! }));
//!
//! assert_eq!(result.unwrap(), "ok");
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::{LinkError, LinkResult};

/// How a failed operation is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    None,

    /// Retry transient errors with exponential backoff.
    Backoff {
        /// Retries after the initial attempt.
        max_retries: u32,
        /// Delay before the first retry; doubled after each one.
        base_delay: Duration,
        /// Upper bound for the delay.
        max_delay: Duration,
    },
}

impl RetryPolicy {
    #[must_use]
    pub fn none() -> Self {
        Self::None
    }

    /// 3 retries starting at 500ms. For reads.
    #[must_use]
    pub fn query() -> Self {
        Self::custom(3, Duration::from_millis(500), Duration::from_secs(10))
    }

    /// 2 retries starting at 1s. For writes the server treats idempotently.
    #[must_use]
    pub fn idempotent() -> Self {
        Self::custom(2, Duration::from_secs(1), Duration::from_secs(15))
    }

    #[must_use]
    pub fn custom(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self::Backoff {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Backoff { max_retries, .. } => max_retries.saturating_add(1),
        }
    }
}

/// Run `operation` under `policy`.
///
/// # Errors
/// Non-retryable errors are returned as-is. When every attempt fails with a
/// retryable error the last one is wrapped in
/// [`LinkError::RetriesExhausted`].
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> LinkResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LinkResult<T>>,
{
    let RetryPolicy::Backoff {
        base_delay,
        max_delay,
        ..
    } = policy
    else {
        return operation().await;
    };

    let attempts = policy.max_attempts();
    let mut delay = *base_delay;
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        if attempt >= attempts {
            return Err(LinkError::RetriesExhausted {
                attempts: attempt,
                last_error: Box::new(err),
            });
        }

        tracing::warn!(
            attempt,
            max = attempts,
            error = %err,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Retrying after transient error"
        );
        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2).min(*max_delay);
        attempt += 1;
    }
}
