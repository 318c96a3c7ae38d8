//! Bounded retry for provider and destination calls.
//!
//! Provider and destination calls made during a sync pass go through [`retry_with_backoff`].
//! Each attempt runs under a per-call timeout and transient failures are retried with
//! exponential backoff. The call gives up after `max_attempts`, so one unreachable service
//! cannot stall a run.

use backoff::{ExponentialBackoffBuilder, future::retry};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Errors that can be fed through [`retry_with_backoff`].
pub trait RetryableError: std::error::Error + Sized {
	/// Whether another attempt could succeed.
	fn is_retryable(&self) -> bool;

	/// Error reported when a single attempt exceeds the call timeout.
	fn timed_out(after: Duration) -> Self;
}

/// Retry behaviour for a class of HTTP failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailureClass {
	Retryable,
	Permanent,
	ReauthRequired,
}

/// Classify an HTTP status into retry behaviour.
pub fn classify_http_status(status: u16) -> HttpFailureClass {
	match status {
		401 | 403 => HttpFailureClass::ReauthRequired,
		408 | 409 | 423 | 425 | 429 => HttpFailureClass::Retryable,
		500..=599 => HttpFailureClass::Retryable,
		_ => HttpFailureClass::Permanent,
	}
}

/// Attempt budget and timing for one logical call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	/// Total attempts including the first one.
	pub max_attempts: u32,
	/// Upper bound for a single attempt.
	pub call_timeout: Duration,
	pub initial_interval: Duration,
	pub max_interval: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			call_timeout: Duration::from_secs(30),
			initial_interval: Duration::from_millis(500),
			max_interval: Duration::from_secs(8),
		}
	}
}

/// Run `call` until it succeeds, fails permanently, or the attempt budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut>(
	policy: &RetryPolicy,
	operation: &str,
	mut call: F,
) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: RetryableError,
{
	let backoff = ExponentialBackoffBuilder::new()
		.with_initial_interval(policy.initial_interval)
		.with_max_interval(policy.max_interval)
		.with_max_elapsed_time(None)
		.build();
	let max_attempts = policy.max_attempts.max(1);
	let call_timeout = policy.call_timeout;
	let mut attempt = 0u32;

	retry(backoff, || {
		attempt += 1;
		let current = attempt;
		let pending = call();
		async move {
			let error = match tokio::time::timeout(call_timeout, pending).await {
				Ok(Ok(value)) => return Ok(value),
				Ok(Err(e)) => e,
				Err(_) => E::timed_out(call_timeout),
			};

			if !error.is_retryable() {
				return Err(backoff::Error::permanent(error));
			}
			if current >= max_attempts {
				warn!(
					"{} failed after {} attempts: {}",
					operation, current, error
				);
				return Err(backoff::Error::permanent(error));
			}
			warn!(
				"{} failed (attempt {}/{}), retrying: {}",
				operation, current, max_attempts, error
			);
			Err(backoff::Error::transient(error))
		}
	})
	.await
}
