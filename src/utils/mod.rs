//!
//! Utility module for the budget sync engine.
//!
//! Re-exports amount formatting helpers and the retry/backoff wrapper used for every network call.
/// Minor-unit amount conversion and formatting
pub mod amount;
/// Bounded exponential backoff with per-call timeouts
pub mod retry;

pub use amount::{
	decimal_to_minor_units, destination_to_minor_units, format_minor_units,
	rescale_minor_units,
};
pub use retry::{HttpFailureClass, RetryPolicy, RetryableError, classify_http_status, retry_with_backoff};
