use crate::budget::sync::transaction_processor::TransactionProcessor;
use crate::budget::types::{CanonicalTransaction, FetchError, SourceAccount, SyncCursor};
use crate::provider::{AkahuClient, ProviderError};
use crate::utils::{HttpFailureClass, RetryPolicy, classify_http_status, retry_with_backoff};

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{Stream, StreamExt, stream};
use std::collections::HashSet;
use std::pin::Pin;
use tracing::{debug, info, warn};

/// Lazy, finite, non-restartable sequence of transactions, oldest first.
pub type TransactionStream =
	Pin<Box<dyn Stream<Item = Result<CanonicalTransaction, FetchError>> + Send>>;

/// Source of accounts and transactions for a sync run.
#[async_trait::async_trait]
pub trait TransactionFetcher: Send + Sync {
	/// Current snapshot of the provider's accounts.
	async fn list_accounts(&self) -> Result<Vec<SourceAccount>, FetchError>;

	/// Transactions for `account` since `cursor` (or the configured start when there is none).
	///
	/// The provider may return transactions that were already seen; filtering them is the
	/// dedup engine's job.
	async fn fetch_transactions(
		&self,
		account: &SourceAccount,
		cursor: Option<&SyncCursor>,
	) -> Result<TransactionStream, FetchError>;
}

/// Configuration for transaction fetching
#[derive(Debug, Clone)]
pub struct FetchConfig {
	/// How far before the cursor to re-read, so late-posting transactions are not missed
	pub overlap: chrono::Duration,
	/// Start date when an account has never been synced
	pub default_start: DateTime<Utc>,
	/// Whether to include pending transactions
	pub include_pending: bool,
}

impl Default for FetchConfig {
	fn default() -> Self {
		Self {
			overlap: chrono::Duration::weeks(1),
			// 2024-01-01T00:00:00Z
			default_start: DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(1_704_067_200),
			include_pending: false,
		}
	}
}

impl FetchConfig {
	/// Lower bound for the next fetch of an account.
	pub fn start_for(&self, cursor: Option<&SyncCursor>) -> DateTime<Utc> {
		match cursor {
			Some(cursor) => cursor.last_posted_at - self.overlap,
			None => self.default_start,
		}
	}
}

impl From<ProviderError> for FetchError {
	fn from(error: ProviderError) -> Self {
		match error {
			ProviderError::HttpError(e) if e.is_timeout() => FetchError::Timeout(e.to_string()),
			ProviderError::HttpError(e) if e.is_decode() => FetchError::Decode(e.to_string()),
			ProviderError::HttpError(e) => FetchError::Unavailable(e.to_string()),
			ProviderError::JsonError(e) => FetchError::Decode(e.to_string()),
			ProviderError::Status { status, body } => {
				let reason = format!("HTTP {}: {}", status, body);
				match classify_http_status(status) {
					HttpFailureClass::ReauthRequired => FetchError::Unauthorized(reason),
					HttpFailureClass::Retryable => FetchError::Unavailable(reason),
					HttpFailureClass::Permanent => FetchError::Rejected(reason),
				}
			}
			ProviderError::ApiError(message) => FetchError::Rejected(message),
		}
	}
}

/// Fetcher backed by the Akahu API
pub struct AkahuTransactionFetcher {
	client: AkahuClient,
	processor: TransactionProcessor,
	config: FetchConfig,
	retry: RetryPolicy,
}

impl AkahuTransactionFetcher {
	pub fn new(
		client: AkahuClient,
		processor: TransactionProcessor,
		config: FetchConfig,
		retry: RetryPolicy,
	) -> Self {
		Self {
			client,
			processor,
			config,
			retry,
		}
	}

	/// Read every page (and optionally pending items) and order the result oldest first.
	async fn fetch_all(
		client: AkahuClient,
		processor: TransactionProcessor,
		config: FetchConfig,
		retry: RetryPolicy,
		account: SourceAccount,
		start: DateTime<Utc>,
	) -> Result<Vec<CanonicalTransaction>, FetchError> {
		let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
		let mut transactions = Vec::new();
		let mut next_cursor: Option<String> = None;
		let mut seen = HashSet::new();

		loop {
			let page = retry_with_backoff(&retry, "akahu transactions page", || {
				let client = client.clone();
				let account_id = account.id.clone();
				let start = start.clone();
				let cursor = next_cursor.clone();
				async move {
					client
						.transactions_page(&account_id, &start, cursor.as_deref())
						.await
						.map_err(FetchError::from)
				}
			})
			.await?;

			let page_len = page.items.len();
			for transaction in processor.process_transactions_batch(&page.items, &account)? {
				if seen.insert(transaction.source_transaction_id.clone()) {
					transactions.push(transaction);
				}
			}
			info!(
				"Fetched {} transactions from Akahu for account {}",
				page_len, account.id
			);

			match page.next_cursor() {
				Some(cursor) if page_len > 0 => next_cursor = Some(cursor.to_string()),
				_ => break,
			}
		}

		if config.include_pending {
			let pending = retry_with_backoff(&retry, "akahu pending transactions", || {
				let client = client.clone();
				let account_id = account.id.clone();
				async move {
					client
						.pending_transactions(&account_id)
						.await
						.map_err(FetchError::from)
				}
			})
			.await?;

			debug!(
				"Fetched {} pending transactions for account {}",
				pending.len(),
				account.id
			);
			for item in &pending {
				let transaction = processor.process_pending(item, &account)?;
				if seen.insert(transaction.source_transaction_id.clone()) {
					transactions.push(transaction);
				}
			}
		}

		transactions.sort_by(|a, b| {
			a.posted_at
				.cmp(&b.posted_at)
				.then_with(|| a.source_transaction_id.cmp(&b.source_transaction_id))
		});
		info!(
			"Finished reading {} transactions from Akahu for account {}",
			transactions.len(),
			account.id
		);
		Ok(transactions)
	}
}

#[async_trait::async_trait]
impl TransactionFetcher for AkahuTransactionFetcher {
	async fn list_accounts(&self) -> Result<Vec<SourceAccount>, FetchError> {
		let accounts = retry_with_backoff(&self.retry, "akahu accounts", || {
			let client = self.client.clone();
			async move { client.list_accounts().await.map_err(FetchError::from) }
		})
		.await?;

		Ok(accounts
			.iter()
			.map(|account| self.processor.source_account(account))
			.collect())
	}

	async fn fetch_transactions(
		&self,
		account: &SourceAccount,
		cursor: Option<&SyncCursor>,
	) -> Result<TransactionStream, FetchError> {
		let start = self.config.start_for(cursor);
		if cursor.is_none() {
			warn!(
				"No cursor for account {}, reading from {}",
				account.id, start
			);
		}

		let pages = Self::fetch_all(
			self.client.clone(),
			self.processor.clone(),
			self.config.clone(),
			self.retry.clone(),
			account.clone(),
			start,
		);

		// Nothing is requested until the stream is first polled.
		let transactions = stream::once(pages)
			.map(|result| match result {
				Ok(transactions) => transactions.into_iter().map(Ok).collect::<Vec<_>>(),
				Err(e) => vec![Err(e)],
			})
			.flat_map(stream::iter);

		Ok(Box::pin(transactions))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn start_rewinds_cursor_by_overlap() {
		let config = FetchConfig::default();
		let cursor = SyncCursor::at(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap());
		assert_eq!(
			config.start_for(Some(&cursor)),
			Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap()
		);
		assert_eq!(config.start_for(None), config.default_start);
	}

	#[test]
	fn maps_provider_status_to_fetch_errors() {
		let unauthorized = FetchError::from(ProviderError::Status {
			status: 401,
			body: "expired".to_string(),
		});
		assert!(matches!(unauthorized, FetchError::Unauthorized(_)));

		let unavailable = FetchError::from(ProviderError::Status {
			status: 503,
			body: String::new(),
		});
		assert!(matches!(unavailable, FetchError::Unavailable(_)));

		let rejected = FetchError::from(ProviderError::Status {
			status: 400,
			body: "bad start".to_string(),
		});
		assert!(matches!(rejected, FetchError::Rejected(_)));
	}
}
