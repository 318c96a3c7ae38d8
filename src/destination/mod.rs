//! Budget back ends that transactions are written to
//!
//! Each destination implements [`DestinationWriter`]. Writes carry an idempotency key derived
//! from the source transaction id, so a write retried after a lost response is recognised by
//! the destination instead of creating a second row.

/// Actual Budget through an actual-http-api server
mod actual;
/// YNAB REST API
mod ynab;

pub use actual::ActualWriter;
pub use ynab::YnabWriter;

use crate::budget::types::{AccountMapping, CanonicalTransaction, DestinationSystem, SyncRecord};
use crate::utils::{HttpFailureClass, RetryableError, classify_http_status};

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Longest import id YNAB accepts.
pub const MAX_IMPORT_ID_LEN: usize = 36;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WriteError {
	#[error("Destination timed out: {0}")]
	Timeout(String),

	#[error("Destination unavailable: {0}")]
	Unavailable(String),

	#[error("Destination rejected credentials: {0}")]
	Unauthorized(String),

	#[error("Destination rejected transaction: {0}")]
	Rejected(String),

	#[error("Destination response could not be decoded: {0}")]
	Decode(String),
}

impl WriteError {
	/// Map a non-success HTTP status to a write error.
	pub fn from_status(status: u16, body: &str) -> Self {
		let reason = format!("HTTP {}: {}", status, body);
		match classify_http_status(status) {
			HttpFailureClass::ReauthRequired => WriteError::Unauthorized(reason),
			HttpFailureClass::Retryable => WriteError::Unavailable(reason),
			HttpFailureClass::Permanent => WriteError::Rejected(reason),
		}
	}
}

impl From<reqwest::Error> for WriteError {
	fn from(error: reqwest::Error) -> Self {
		if error.is_timeout() {
			WriteError::Timeout(error.to_string())
		} else if error.is_decode() {
			WriteError::Decode(error.to_string())
		} else {
			WriteError::Unavailable(error.to_string())
		}
	}
}

impl RetryableError for WriteError {
	fn is_retryable(&self) -> bool {
		matches!(self, WriteError::Timeout(_) | WriteError::Unavailable(_))
	}

	fn timed_out(after: Duration) -> Self {
		WriteError::Timeout(format!("no response within {:?}", after))
	}
}

/// Transaction already present in a destination account, used for heuristic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTransaction {
	pub id: String,
	pub date: NaiveDate,
	/// Minor units of the source currency.
	pub amount: i64,
	pub payee: Option<String>,
	pub memo: Option<String>,
	/// Idempotency key the row was imported with, if it came from an import.
	pub import_id: Option<String>,
}

/// A budgeting back end.
#[async_trait::async_trait]
pub trait DestinationWriter: Send + Sync {
	fn system(&self) -> DestinationSystem;

	/// Create `transaction` in the mapped account and return the destination's id for it.
	///
	/// Must be idempotent for the same source transaction.
	async fn create_transaction(
		&self,
		transaction: &CanonicalTransaction,
		mapping: &AccountMapping,
	) -> Result<String, WriteError>;

	async fn is_healthy(&self) -> bool;

	/// Current balance of the mapped account, in minor units of `currency`.
	async fn account_balance(
		&self,
		mapping: &AccountMapping,
		currency: &str,
	) -> Result<i64, WriteError>;

	/// Recent transactions in the mapped account, newest first, at most `limit`.
	async fn recent_transactions(
		&self,
		_mapping: &AccountMapping,
		_since: NaiveDate,
		_currency: &str,
		_limit: usize,
	) -> Result<Vec<DestinationTransaction>, WriteError> {
		Ok(Vec::new())
	}

	/// Whether pending and settled rows are kept apart, so a settlement needs its own write.
	fn distinguishes_pending(&self) -> bool {
		false
	}

	/// Turn the row created for a pending transaction into the settled one.
	async fn settle_transaction(
		&self,
		existing_id: &str,
		_settled: &CanonicalTransaction,
		_mapping: &AccountMapping,
	) -> Result<String, WriteError> {
		Ok(existing_id.to_string())
	}

	/// Mark the single row kept for a pending transaction as cleared now that it has settled.
	async fn clear_transaction(
		&self,
		pending: &SyncRecord,
		settled: &CanonicalTransaction,
		mapping: &AccountMapping,
	) -> Result<(), WriteError>;
}

/// Idempotency key for a source transaction id.
///
/// Short ids are used as is; longer ones are hashed to fit the destination's limit.
pub fn idempotency_key(source_transaction_id: &str) -> String {
	if source_transaction_id.len() <= MAX_IMPORT_ID_LEN {
		return source_transaction_id.to_string();
	}
	let digest = hex::encode(Sha256::digest(source_transaction_id.as_bytes()));
	format!("akahu:{}", &digest[..30])
}

/// Truncate to at most `max` characters.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
	text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn short_ids_are_their_own_key() {
		assert_eq!(idempotency_key("trans_clx1abc"), "trans_clx1abc");
	}

	#[test]
	fn long_ids_are_hashed_to_fit() {
		let id = "trans_".repeat(10);
		let key = idempotency_key(&id);
		assert_eq!(key.len(), MAX_IMPORT_ID_LEN);
		assert!(key.starts_with("akahu:"));
		assert_eq!(key, idempotency_key(&id));
		assert_ne!(key, idempotency_key(&"trans_".repeat(11)));
	}

	#[test]
	fn status_classification() {
		assert!(matches!(WriteError::from_status(401, ""), WriteError::Unauthorized(_)));
		assert!(WriteError::from_status(429, "").is_retryable());
		assert!(WriteError::from_status(502, "").is_retryable());
		assert!(!WriteError::from_status(400, "bad payee").is_retryable());
	}

	#[test]
	fn truncates_on_char_boundaries() {
		assert_eq!(truncate_chars("Café Ōtaki", 4), "Café");
	}
}
