use crate::budget::types::{CanonicalTransaction, FetchError, SourceAccount};
use crate::provider::{AkahuAccount, AkahuMerchant, AkahuPendingTransaction, AkahuTransaction};
use crate::utils::{decimal_to_minor_units, format_minor_units};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

/// Normalises Akahu payloads into canonical records.
#[derive(Clone)]
pub struct TransactionProcessor {
	default_currency: String,
}

impl TransactionProcessor {
	pub fn new(default_currency: impl Into<String>) -> Self {
		Self {
			default_currency: default_currency.into(),
		}
	}

	/// Snapshot an Akahu account, defaulting the currency when the balance omits it.
	pub fn source_account(&self, account: &AkahuAccount) -> SourceAccount {
		let currency = account
			.balance
			.as_ref()
			.and_then(|balance| balance.currency.clone())
			.unwrap_or_else(|| self.default_currency.clone());
		let balance = account
			.balance
			.as_ref()
			.and_then(|balance| balance.current)
			.map(|current| decimal_to_minor_units(current, &currency));

		SourceAccount {
			id: account.id.clone(),
			display_name: account.name.clone(),
			connection_name: account
				.connection
				.as_ref()
				.map(|connection| connection.name.clone())
				.unwrap_or_default(),
			currency,
			balance,
		}
	}

	/// Parse an Akahu timestamp such as `2024-03-01T11:00:00.000Z`.
	pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, FetchError> {
		DateTime::parse_from_rfc3339(raw)
			.map(|timestamp| timestamp.with_timezone(&Utc))
			.map_err(|e| {
				error!("[PARSE_TRANSACTION] Invalid timestamp {:?}: {}", raw, e);
				FetchError::Decode(format!("invalid transaction date {:?}: {}", raw, e))
			})
	}

	/// Convert a settled Akahu transaction.
	pub fn process_transaction(
		&self,
		transaction: &AkahuTransaction,
		account: &SourceAccount,
	) -> Result<CanonicalTransaction, FetchError> {
		let posted_at = Self::parse_timestamp(&transaction.date)?;
		debug!(
			"Processing transaction: {} ({} {})",
			transaction.id, transaction.date, transaction.amount
		);

		Ok(CanonicalTransaction {
			source_transaction_id: transaction.id.clone(),
			source_account_id: account.id.clone(),
			posted_at,
			amount: decimal_to_minor_units(transaction.amount, &account.currency),
			currency: account.currency.clone(),
			description: transaction.description.trim().to_string(),
			payee: merchant_name(transaction.merchant.as_ref()),
			is_pending: false,
		})
	}

	/// Convert a pending Akahu transaction, deriving a stable id since Akahu assigns none.
	pub fn process_pending(
		&self,
		transaction: &AkahuPendingTransaction,
		account: &SourceAccount,
	) -> Result<CanonicalTransaction, FetchError> {
		let posted_at = Self::parse_timestamp(&transaction.date)?;
		let amount = decimal_to_minor_units(transaction.amount, &account.currency);
		let description = transaction.description.trim().to_string();

		Ok(CanonicalTransaction {
			source_transaction_id: pending_transaction_id(&account.id, posted_at, amount, &description),
			source_account_id: account.id.clone(),
			posted_at,
			amount,
			currency: account.currency.clone(),
			description,
			payee: merchant_name(transaction.merchant.as_ref()),
			is_pending: true,
		})
	}

	/// Batch process multiple settled transactions
	pub fn process_transactions_batch(
		&self,
		transactions: &[AkahuTransaction],
		account: &SourceAccount,
	) -> Result<Vec<CanonicalTransaction>, FetchError> {
		transactions
			.iter()
			.map(|transaction| self.process_transaction(transaction, account))
			.collect()
	}
}

fn merchant_name(merchant: Option<&AkahuMerchant>) -> Option<String> {
	merchant
		.and_then(|merchant| merchant.name.as_deref())
		.map(str::trim)
		.filter(|name| !name.is_empty())
		.map(str::to_string)
}

/// Deterministic id for a pending transaction.
pub fn pending_transaction_id(
	account_id: &str,
	posted_at: DateTime<Utc>,
	amount: i64,
	description: &str,
) -> String {
	let mut hasher = Sha256::new();
	hasher.update(account_id.as_bytes());
	hasher.update(b"|");
	hasher.update(posted_at.to_rfc3339().as_bytes());
	hasher.update(b"|");
	hasher.update(amount.to_string().as_bytes());
	hasher.update(b"|");
	hasher.update(description.to_lowercase().as_bytes());
	let digest = hex::encode(hasher.finalize());
	format!("pending_{}", &digest[..24])
}

/// Payee of balance adjustments written to tracking accounts.
pub const ADJUSTMENT_PAYEE: &str = "Balance Adjustment";

/// Transaction moving a tracking account's destination balance from `current` to `target`.
///
/// The id is derived from the account, both balances and the day, so a retried or repeated run
/// on the same day produces the same adjustment instead of a second one.
pub fn balance_adjustment(
	account: &SourceAccount,
	current: i64,
	target: i64,
	now: DateTime<Utc>,
) -> CanonicalTransaction {
	let mut hasher = Sha256::new();
	hasher.update(account.id.as_bytes());
	hasher.update(b"|");
	hasher.update(current.to_string().as_bytes());
	hasher.update(b"|");
	hasher.update(target.to_string().as_bytes());
	hasher.update(b"|");
	hasher.update(now.date_naive().to_string().as_bytes());
	let digest = hex::encode(hasher.finalize());

	CanonicalTransaction {
		source_transaction_id: format!("adjustment_{}", &digest[..24]),
		source_account_id: account.id.clone(),
		posted_at: now,
		amount: target - current,
		currency: account.currency.clone(),
		description: format!(
			"Adjusted from {} to {} to reconcile tracking account",
			format_minor_units(current, &account.currency),
			format_minor_units(target, &account.currency)
		),
		payee: Some(ADJUSTMENT_PAYEE.to_string()),
		is_pending: false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::provider::{AkahuBalance, AkahuConnection};
	use chrono::TimeZone;

	fn account() -> SourceAccount {
		SourceAccount {
			id: "acc_123".to_string(),
			display_name: "Everyday".to_string(),
			connection_name: "ANZ".to_string(),
			currency: "NZD".to_string(),
			balance: None,
		}
	}

	fn settled(amount: f64, merchant: Option<&str>) -> AkahuTransaction {
		AkahuTransaction {
			id: "trans_1".to_string(),
			account: "acc_123".to_string(),
			date: "2024-03-01T11:00:00.000Z".to_string(),
			description: " CAFE 123 WELLINGTON ".to_string(),
			amount,
			merchant: merchant.map(|name| AkahuMerchant {
				id: None,
				name: Some(name.to_string()),
			}),
			kind: Some("EFTPOS".to_string()),
		}
	}

	#[test]
	fn converts_settled_transaction() {
		let processor = TransactionProcessor::new("NZD");
		let tx = processor
			.process_transaction(&settled(-5.0, Some("Cafe")), &account())
			.unwrap();

		assert_eq!(tx.source_transaction_id, "trans_1");
		assert_eq!(tx.amount, -500);
		assert_eq!(tx.currency, "NZD");
		assert_eq!(tx.description, "CAFE 123 WELLINGTON");
		assert_eq!(tx.payee_name(), "Cafe");
		assert!(!tx.is_pending);
		assert_eq!(tx.posted_at.to_rfc3339(), "2024-03-01T11:00:00+00:00");
	}

	#[test]
	fn rejects_unparseable_dates() {
		let processor = TransactionProcessor::new("NZD");
		let mut raw = settled(-5.0, None);
		raw.date = "yesterday".to_string();
		assert!(matches!(
			processor.process_transaction(&raw, &account()),
			Err(FetchError::Decode(_))
		));
	}

	#[test]
	fn pending_ids_are_stable() {
		let processor = TransactionProcessor::new("NZD");
		let pending = AkahuPendingTransaction {
			account: "acc_123".to_string(),
			date: "2024-03-01T11:00:00.000Z".to_string(),
			description: "CAFE 123".to_string(),
			amount: -20.0,
			updated_at: None,
			merchant: None,
		};
		let first = processor.process_pending(&pending, &account()).unwrap();
		let second = processor.process_pending(&pending, &account()).unwrap();

		assert!(first.is_pending);
		assert!(first.source_transaction_id.starts_with("pending_"));
		assert_eq!(first.source_transaction_id, second.source_transaction_id);
		assert_eq!(first.amount, -2000);
	}

	#[test]
	fn adjustments_are_stable_within_a_day() {
		let morning = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
		let evening = Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap();

		let first = balance_adjustment(&account(), 10_000, 12_550, morning);
		let again = balance_adjustment(&account(), 10_000, 12_550, evening);
		assert_eq!(first.source_transaction_id, again.source_transaction_id);
		assert!(first.source_transaction_id.len() <= crate::destination::MAX_IMPORT_ID_LEN);
		assert_eq!(first.amount, 2_550);
		assert_eq!(first.payee_name(), ADJUSTMENT_PAYEE);
		assert_eq!(
			first.description,
			"Adjusted from 100.00 NZD to 125.50 NZD to reconcile tracking account"
		);

		let moved = balance_adjustment(&account(), 9_000, 12_550, morning);
		assert_ne!(first.source_transaction_id, moved.source_transaction_id);
		let next_day = balance_adjustment(
			&account(),
			10_000,
			12_550,
			Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap(),
		);
		assert_ne!(first.source_transaction_id, next_day.source_transaction_id);
	}

	#[test]
	fn account_snapshot_defaults_currency() {
		let processor = TransactionProcessor::new("NZD");
		let raw = AkahuAccount {
			id: "acc_1".to_string(),
			name: "Savings".to_string(),
			connection: Some(AkahuConnection {
				id: None,
				name: "Kiwibank".to_string(),
			}),
			account_type: Some("SAVINGS".to_string()),
			balance: Some(AkahuBalance {
				currency: None,
				current: Some(10.0),
			}),
		};
		let snapshot = processor.source_account(&raw);
		assert_eq!(snapshot.connection_name, "Kiwibank");
		assert_eq!(snapshot.currency, "NZD");
		assert_eq!(snapshot.balance, Some(1000));
	}
}
