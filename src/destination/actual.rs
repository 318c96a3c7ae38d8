use super::{
	DestinationTransaction, DestinationWriter, WriteError, idempotency_key, truncate_chars,
};
use crate::budget::types::{AccountMapping, CanonicalTransaction, DestinationSystem, SyncRecord};
use crate::utils::{destination_to_minor_units, rescale_minor_units};

use chrono::{Duration as DateDuration, FixedOffset, NaiveDate};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Actual stores integer cents.
const CENTS_EXPONENT: u32 = 2;
const MAX_PAYEE_LEN: usize = 200;
const NOTES_PREFIX: &str = "Akahu transaction: ";
/// How far before a record's date to look for its row by imported id.
const RESOLVE_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Serialize)]
struct ImportTransaction<'a> {
	account: &'a str,
	date: String,
	amount: i64,
	payee_name: String,
	imported_payee: String,
	notes: String,
	imported_id: String,
	cleared: bool,
}

#[derive(Debug, Serialize)]
struct ImportRequest<'a> {
	transactions: Vec<ImportTransaction<'a>>,
}

#[derive(Debug, Serialize)]
struct TransactionUpdate {
	transaction: ClearedFields,
}

#[derive(Debug, Serialize)]
struct ClearedFields {
	cleared: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
	data: T,
}

#[derive(Debug, Default, Deserialize)]
struct ImportResult {
	#[serde(default)]
	added: Vec<String>,
	#[serde(default)]
	updated: Vec<String>,
	#[serde(default)]
	errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ActualTransaction {
	id: String,
	date: NaiveDate,
	amount: i64,
	#[serde(default)]
	imported_payee: Option<String>,
	#[serde(default)]
	notes: Option<String>,
	#[serde(default)]
	imported_id: Option<String>,
}

/// Writer for Actual Budget, reached through an actual-http-api server.
pub struct ActualWriter {
	http_client: Client,
	server_url: String,
	api_key: String,
	sync_id: Option<String>,
	encryption_key: Option<String>,
	local_offset: FixedOffset,
}

impl ActualWriter {
	pub fn new(
		server_url: String,
		api_key: String,
		sync_id: Option<String>,
		encryption_key: Option<String>,
		local_offset: FixedOffset,
		timeout: Duration,
	) -> Result<Self, WriteError> {
		let http_client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| WriteError::Rejected(format!("failed to build HTTP client: {}", e)))?;

		Ok(Self {
			http_client,
			server_url: server_url.trim_end_matches('/').to_string(),
			api_key,
			sync_id,
			encryption_key,
			local_offset,
		})
	}

	fn sync_id<'a>(&'a self, mapping: &'a AccountMapping) -> Result<&'a str, WriteError> {
		mapping
			.destination_budget_id
			.as_deref()
			.or(self.sync_id.as_deref())
			.ok_or_else(|| {
				WriteError::Rejected(format!(
					"no Actual budget for account {}",
					mapping.destination_account_id
				))
			})
	}

	fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
		let request = request.header("x-api-key", &self.api_key);
		match &self.encryption_key {
			Some(key) => request.header("budget-encryption-password", key),
			None => request,
		}
	}

	async fn list_transactions(
		&self,
		sync_id: &str,
		mapping: &AccountMapping,
		since: NaiveDate,
	) -> Result<Vec<ActualTransaction>, WriteError> {
		let response = self
			.authorized(self.http_client.get(format!(
				"{}/v1/budgets/{}/accounts/{}/transactions",
				self.server_url, sync_id, mapping.destination_account_id
			)))
			.query(&[("since_date", since.format("%Y-%m-%d").to_string())])
			.send()
			.await?;
		Self::decode(response).await
	}

	/// Real id of the row written for `record`, looking it up by imported id when only a
	/// placeholder was stored.
	async fn resolve_id(
		&self,
		sync_id: &str,
		mapping: &AccountMapping,
		record: &SyncRecord,
	) -> Result<String, WriteError> {
		let Some(imported_id) = record.destination_transaction_id.strip_prefix("imported:") else {
			return Ok(record.destination_transaction_id.clone());
		};
		let since = record.posted_at.with_timezone(&self.local_offset).date_naive()
			- DateDuration::days(RESOLVE_WINDOW_DAYS);
		self.list_transactions(sync_id, mapping, since)
			.await?
			.into_iter()
			.find(|transaction| transaction.imported_id.as_deref() == Some(imported_id))
			.map(|transaction| transaction.id)
			.ok_or_else(|| {
				WriteError::Rejected(format!(
					"no Actual transaction imported as {}",
					imported_id
				))
			})
	}

	async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, WriteError> {
		let status = response.status();
		let body = response.text().await?;
		if !status.is_success() {
			return Err(WriteError::from_status(status.as_u16(), &body));
		}
		let envelope: Envelope<T> =
			serde_json::from_str(&body).map_err(|e| WriteError::Decode(e.to_string()))?;
		Ok(envelope.data)
	}
}

#[async_trait::async_trait]
impl DestinationWriter for ActualWriter {
	fn system(&self) -> DestinationSystem {
		DestinationSystem::ActualBudget
	}

	async fn create_transaction(
		&self,
		transaction: &CanonicalTransaction,
		mapping: &AccountMapping,
	) -> Result<String, WriteError> {
		let sync_id = self.sync_id(mapping)?;
		let imported_id = idempotency_key(&transaction.source_transaction_id);
		let payee = truncate_chars(transaction.payee_name(), MAX_PAYEE_LEN);

		let request = ImportRequest {
			transactions: vec![ImportTransaction {
				account: &mapping.destination_account_id,
				date: transaction
					.posted_on(self.local_offset)
					.format("%Y-%m-%d")
					.to_string(),
				amount: rescale_minor_units(transaction.amount, &transaction.currency, CENTS_EXPONENT),
				payee_name: payee.clone(),
				imported_payee: payee,
				notes: format!("{}{}", NOTES_PREFIX, transaction.description),
				imported_id: imported_id.clone(),
				cleared: !transaction.is_pending,
			}],
		};

		let response = self
			.authorized(self.http_client.post(format!(
				"{}/v1/budgets/{}/accounts/{}/transactions/import",
				self.server_url, sync_id, mapping.destination_account_id
			)))
			.json(&request)
			.send()
			.await?;
		let result: ImportResult = Self::decode(response).await?;

		if !result.errors.is_empty() {
			return Err(WriteError::Rejected(format!(
				"Actual import errors: {:?}",
				result.errors
			)));
		}
		if let Some(id) = result.added.into_iter().next() {
			info!(
				"Created Actual transaction {} for {}",
				id, transaction.source_transaction_id
			);
			return Ok(id);
		}
		if let Some(id) = result.updated.into_iter().next() {
			// Reconciled against an existing row with the same imported id.
			debug!(
				"Actual reconciled {} with existing transaction {}",
				transaction.source_transaction_id, id
			);
			return Ok(id);
		}
		Ok(format!("imported:{}", imported_id))
	}

	async fn is_healthy(&self) -> bool {
		// Without a default budget only the server itself can be checked.
		let url = match self.sync_id.as_deref() {
			Some(sync_id) => format!("{}/v1/budgets/{}/accounts", self.server_url, sync_id),
			None => format!("{}/v1/budgets", self.server_url),
		};

		match self.authorized(self.http_client.get(url)).send().await {
			Ok(response) if response.status().is_success() => true,
			Ok(response) => {
				warn!("Actual health check returned HTTP {}", response.status());
				false
			}
			Err(e) => {
				warn!("Actual health check failed: {}", e);
				false
			}
		}
	}

	async fn account_balance(
		&self,
		mapping: &AccountMapping,
		currency: &str,
	) -> Result<i64, WriteError> {
		let sync_id = self.sync_id(mapping)?;
		let response = self
			.authorized(self.http_client.get(format!(
				"{}/v1/budgets/{}/accounts/{}/balance",
				self.server_url, sync_id, mapping.destination_account_id
			)))
			.send()
			.await?;
		let cents: i64 = Self::decode(response).await?;
		Ok(destination_to_minor_units(cents, currency, CENTS_EXPONENT))
	}

	async fn clear_transaction(
		&self,
		pending: &SyncRecord,
		settled: &CanonicalTransaction,
		mapping: &AccountMapping,
	) -> Result<(), WriteError> {
		let sync_id = self.sync_id(mapping)?;
		let id = self.resolve_id(sync_id, mapping, pending).await?;

		let response = self
			.authorized(self.http_client.patch(format!(
				"{}/v1/budgets/{}/transactions/{}",
				self.server_url, sync_id, id
			)))
			.json(&TransactionUpdate {
				transaction: ClearedFields { cleared: true },
			})
			.send()
			.await?;
		let _: serde_json::Value = Self::decode(response).await?;

		info!(
			"Cleared Actual transaction {} for pending {} (settled as {})",
			id, pending.source_transaction_id, settled.source_transaction_id
		);
		Ok(())
	}

	async fn recent_transactions(
		&self,
		mapping: &AccountMapping,
		since: NaiveDate,
		currency: &str,
		limit: usize,
	) -> Result<Vec<DestinationTransaction>, WriteError> {
		let sync_id = self.sync_id(mapping)?;
		let data = self.list_transactions(sync_id, mapping, since).await?;

		let mut transactions: Vec<DestinationTransaction> = data
			.into_iter()
			.map(|transaction| DestinationTransaction {
				id: transaction.id,
				date: transaction.date,
				amount: destination_to_minor_units(transaction.amount, currency, CENTS_EXPONENT),
				payee: transaction.imported_payee,
				memo: transaction
					.notes
					.map(|notes| notes.trim_start_matches(NOTES_PREFIX).to_string()),
				import_id: transaction.imported_id,
			})
			.collect();
		transactions.sort_by(|a, b| b.date.cmp(&a.date));
		transactions.truncate(limit);
		Ok(transactions)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_import_result() {
		let body = r#"{"data":{"added":[],"updated":["abc-123"],"errors":[]}}"#;
		let envelope: Envelope<ImportResult> = serde_json::from_str(body).unwrap();
		assert!(envelope.data.added.is_empty());
		assert_eq!(envelope.data.updated, vec!["abc-123".to_string()]);
	}

	#[test]
	fn parses_recent_transactions() {
		let body = r#"{"data":[{"id":"a1","date":"2024-03-02","amount":-500,"imported_payee":"Cafe","notes":"Akahu transaction: CAFE","imported_id":"t1","account":"act-acc"}]}"#;
		let envelope: Envelope<Vec<ActualTransaction>> = serde_json::from_str(body).unwrap();
		assert_eq!(envelope.data[0].amount, -500);
		assert_eq!(envelope.data[0].imported_payee.as_deref(), Some("Cafe"));
		assert_eq!(envelope.data[0].imported_id.as_deref(), Some("t1"));
	}

	#[test]
	fn parses_balance_and_builds_cleared_update() {
		let envelope: Envelope<i64> = serde_json::from_str(r#"{"data":-152034}"#).unwrap();
		assert_eq!(
			destination_to_minor_units(envelope.data, "NZD", CENTS_EXPONENT),
			-152_034
		);

		let update = TransactionUpdate {
			transaction: ClearedFields { cleared: true },
		};
		assert_eq!(
			serde_json::to_value(&update).unwrap(),
			serde_json::json!({"transaction": {"cleared": true}})
		);
	}

	#[test]
	fn import_payload_uses_cents_and_notes() {
		let transaction = ImportTransaction {
			account: "act-acc",
			date: "2024-03-02".to_string(),
			amount: rescale_minor_units(-500, "NZD", CENTS_EXPONENT),
			payee_name: "Cafe".to_string(),
			imported_payee: "Cafe".to_string(),
			notes: "Akahu transaction: CAFE".to_string(),
			imported_id: "t1".to_string(),
			cleared: true,
		};
		let json = serde_json::to_value(&transaction).unwrap();
		assert_eq!(json["amount"], -500);
		assert_eq!(json["imported_id"], "t1");
	}
}
