use crate::config::ConfigError;
use crate::utils::RetryableError;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Budgeting back end a transaction can be committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationSystem {
	Ynab,
	ActualBudget,
}

impl DestinationSystem {
	pub fn as_str(&self) -> &'static str {
		match self {
			DestinationSystem::Ynab => "ynab",
			DestinationSystem::ActualBudget => "actual",
		}
	}
}

impl fmt::Display for DestinationSystem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Bank account as reported by the aggregation provider, refreshed every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAccount {
	pub id: String,
	pub display_name: String,
	pub connection_name: String,
	pub currency: String,
	/// Current balance in minor units, when the provider reported one.
	#[serde(default)]
	pub balance: Option<i64>,
}

/// One row of the persisted account-mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMapping {
	pub source_account_id: String,
	pub source_account_name: Option<String>,
	pub destination_system: DestinationSystem,
	pub destination_account_id: String,
	/// YNAB budget or Actual sync id; writers fall back to their configured default.
	pub destination_budget_id: Option<String>,
	/// Tracking accounts are kept in step by balance adjustments instead of transactions.
	#[serde(default)]
	pub tracking: bool,
}

/// Provider transaction normalised for every destination.
///
/// `amount` is a signed integer in the currency's minor unit, debits negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTransaction {
	pub source_transaction_id: String,
	pub source_account_id: String,
	pub posted_at: DateTime<Utc>,
	pub amount: i64,
	pub currency: String,
	pub description: String,
	/// Merchant name when the provider knows one.
	pub payee: Option<String>,
	pub is_pending: bool,
}

impl CanonicalTransaction {
	/// Payee shown in budgets: merchant name, falling back to the bank description.
	pub fn payee_name(&self) -> &str {
		self.payee
			.as_deref()
			.filter(|payee| !payee.trim().is_empty())
			.unwrap_or(&self.description)
	}

	/// Calendar date of the transaction in the budget's local time.
	pub fn posted_on(&self, offset: FixedOffset) -> NaiveDate {
		self.posted_at.with_timezone(&offset).date_naive()
	}
}

/// Durable proof that a source transaction was committed to a destination.
///
/// Unique per `(source_transaction_id, destination_system)`. Only `settled_by` and, when the
/// destination keeps separate pending and settled rows, `destination_transaction_id` change
/// after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
	pub source_transaction_id: String,
	pub destination_system: DestinationSystem,
	pub destination_transaction_id: String,
	pub committed_at: DateTime<Utc>,
	pub source_account_id: String,
	pub destination_account_id: String,
	pub amount: i64,
	pub posted_at: DateTime<Utc>,
	pub description: String,
	pub is_pending: bool,
	/// Settled transaction that replaced this pending one.
	#[serde(default)]
	pub settled_by: Option<String>,
	/// Pending transaction this settled record was linked to.
	#[serde(default)]
	pub settles: Option<String>,
}

pub type RecordKey = (String, DestinationSystem);

impl SyncRecord {
	pub fn committed(
		transaction: &CanonicalTransaction,
		mapping: &AccountMapping,
		destination_transaction_id: String,
		committed_at: DateTime<Utc>,
	) -> Self {
		Self {
			source_transaction_id: transaction.source_transaction_id.clone(),
			destination_system: mapping.destination_system,
			destination_transaction_id,
			committed_at,
			source_account_id: transaction.source_account_id.clone(),
			destination_account_id: mapping.destination_account_id.clone(),
			amount: transaction.amount,
			posted_at: transaction.posted_at,
			description: transaction.description.clone(),
			is_pending: transaction.is_pending,
			settled_by: None,
			settles: None,
		}
	}

	pub fn key(&self) -> RecordKey {
		(self.source_transaction_id.clone(), self.destination_system)
	}
}

/// Incremental fetch position for one source account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
	pub last_posted_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
	pub fn at(last_posted_at: DateTime<Utc>) -> Self {
		Self {
			last_posted_at,
			updated_at: Utc::now(),
		}
	}

	/// Move the cursor forward to `posted_at`; never moves it back.
	pub fn advance(current: Option<SyncCursor>, posted_at: DateTime<Utc>) -> SyncCursor {
		match current {
			Some(cursor) if cursor.last_posted_at >= posted_at => cursor,
			_ => SyncCursor::at(posted_at),
		}
	}
}

/// Failure talking to the aggregation provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
	#[error("Provider request timed out: {0}")]
	Timeout(String),

	#[error("Provider unavailable: {0}")]
	Unavailable(String),

	#[error("Provider rejected credentials: {0}")]
	Unauthorized(String),

	#[error("Provider rejected request: {0}")]
	Rejected(String),

	#[error("Provider response could not be decoded: {0}")]
	Decode(String),
}

impl RetryableError for FetchError {
	fn is_retryable(&self) -> bool {
		matches!(self, FetchError::Timeout(_) | FetchError::Unavailable(_))
	}

	fn timed_out(after: Duration) -> Self {
		FetchError::Timeout(format!("no response within {:?}", after))
	}
}

/// Failure reading or writing the durable sync state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	SerdeError(#[from] serde_json::Error),

	#[error("Sync record not found: {0}")]
	NotFound(String),
}

/// Errors that end a sync run before or outside per-account processing.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("Sync state error: {0}")]
	Store(#[from] StoreError),

	#[error("Provider error: {0}")]
	Fetch(#[from] FetchError),

	#[error("A sync run is already in progress")]
	AlreadyRunning,
}
