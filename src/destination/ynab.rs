use super::{
	DestinationTransaction, DestinationWriter, WriteError, idempotency_key, truncate_chars,
};
use crate::budget::types::{AccountMapping, CanonicalTransaction, DestinationSystem, SyncRecord};
use crate::utils::{destination_to_minor_units, rescale_minor_units};

use chrono::{FixedOffset, NaiveDate};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// YNAB stores amounts in milliunits.
const MILLIUNIT_EXPONENT: u32 = 3;
const MAX_PAYEE_LEN: usize = 200;
const MAX_MEMO_LEN: usize = 500;

#[derive(Debug, Serialize)]
struct NewTransaction<'a> {
	account_id: &'a str,
	date: String,
	amount: i64,
	payee_name: String,
	memo: String,
	cleared: &'static str,
	approved: bool,
	flag_color: &'static str,
	import_id: String,
}

#[derive(Debug, Serialize)]
struct SaveTransactionsRequest<'a> {
	transactions: Vec<NewTransaction<'a>>,
}

/// Update addressed by id, or by import id when the row's id was never learned.
#[derive(Debug, Serialize)]
struct ClearedUpdate {
	#[serde(skip_serializing_if = "Option::is_none")]
	id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	import_id: Option<String>,
	cleared: &'static str,
}

#[derive(Debug, Serialize)]
struct UpdateTransactionsRequest {
	transactions: Vec<ClearedUpdate>,
}

#[derive(Debug, Deserialize)]
struct AccountData {
	account: YnabAccount,
}

#[derive(Debug, Deserialize)]
struct YnabAccount {
	/// Milliunits.
	balance: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
	data: T,
}

#[derive(Debug, Deserialize)]
struct SaveTransactionsData {
	#[serde(default)]
	transaction_ids: Vec<String>,
	#[serde(default)]
	duplicate_import_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionsData {
	#[serde(default)]
	transactions: Vec<YnabTransaction>,
}

#[derive(Debug, Deserialize)]
struct YnabTransaction {
	id: String,
	date: NaiveDate,
	amount: i64,
	payee_name: Option<String>,
	memo: Option<String>,
	#[serde(default)]
	import_id: Option<String>,
	#[serde(default)]
	deleted: bool,
}

/// Writer for the YNAB REST API.
pub struct YnabWriter {
	http_client: Client,
	endpoint: String,
	bearer_token: String,
	default_budget_id: Option<String>,
	local_offset: FixedOffset,
}

impl YnabWriter {
	pub fn new(
		endpoint: String,
		bearer_token: String,
		default_budget_id: Option<String>,
		local_offset: FixedOffset,
		timeout: Duration,
	) -> Result<Self, WriteError> {
		let http_client = Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| WriteError::Rejected(format!("failed to build HTTP client: {}", e)))?;

		Ok(Self {
			http_client,
			endpoint: endpoint.trim_end_matches('/').to_string(),
			bearer_token,
			default_budget_id,
			local_offset,
		})
	}

	fn budget_id<'a>(&'a self, mapping: &'a AccountMapping) -> Result<&'a str, WriteError> {
		mapping
			.destination_budget_id
			.as_deref()
			.or(self.default_budget_id.as_deref())
			.ok_or_else(|| {
				WriteError::Rejected(format!(
					"no YNAB budget for account {}",
					mapping.destination_account_id
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
impl DestinationWriter for YnabWriter {
	fn system(&self) -> DestinationSystem {
		DestinationSystem::Ynab
	}

	async fn create_transaction(
		&self,
		transaction: &CanonicalTransaction,
		mapping: &AccountMapping,
	) -> Result<String, WriteError> {
		let budget_id = self.budget_id(mapping)?;
		let import_id = idempotency_key(&transaction.source_transaction_id);

		let request = SaveTransactionsRequest {
			transactions: vec![NewTransaction {
				account_id: &mapping.destination_account_id,
				date: transaction
					.posted_on(self.local_offset)
					.format("%Y-%m-%d")
					.to_string(),
				amount: rescale_minor_units(
					transaction.amount,
					&transaction.currency,
					MILLIUNIT_EXPONENT,
				),
				payee_name: truncate_chars(transaction.payee_name(), MAX_PAYEE_LEN),
				memo: truncate_chars(&transaction.description, MAX_MEMO_LEN),
				cleared: if transaction.is_pending {
					"uncleared"
				} else {
					"cleared"
				},
				approved: false,
				flag_color: "red",
				import_id: import_id.clone(),
			}],
		};

		let response = self
			.http_client
			.post(format!("{}/budgets/{}/transactions", self.endpoint, budget_id))
			.bearer_auth(&self.bearer_token)
			.json(&request)
			.send()
			.await?;
		let data: SaveTransactionsData = Self::decode(response).await?;

		if let Some(id) = data.transaction_ids.into_iter().next() {
			info!(
				"Created YNAB transaction {} for {}",
				id, transaction.source_transaction_id
			);
			return Ok(id);
		}
		if data.duplicate_import_ids.iter().any(|id| id == &import_id) {
			// Written by an earlier attempt whose response was lost.
			warn!(
				"YNAB already has import id {} for {}",
				import_id, transaction.source_transaction_id
			);
			return Ok(format!("import:{}", import_id));
		}
		Err(WriteError::Decode(
			"YNAB response contained no transaction id".to_string(),
		))
	}

	async fn is_healthy(&self) -> bool {
		let result = self
			.http_client
			.get(format!("{}/user", self.endpoint))
			.bearer_auth(&self.bearer_token)
			.send()
			.await;
		match result {
			Ok(response) if response.status().is_success() => true,
			Ok(response) => {
				warn!("YNAB health check returned HTTP {}", response.status());
				false
			}
			Err(e) => {
				warn!("YNAB health check failed: {}", e);
				false
			}
		}
	}

	async fn account_balance(
		&self,
		mapping: &AccountMapping,
		currency: &str,
	) -> Result<i64, WriteError> {
		let budget_id = self.budget_id(mapping)?;
		let response = self
			.http_client
			.get(format!(
				"{}/budgets/{}/accounts/{}",
				self.endpoint, budget_id, mapping.destination_account_id
			))
			.bearer_auth(&self.bearer_token)
			.send()
			.await?;
		let data: AccountData = Self::decode(response).await?;
		Ok(destination_to_minor_units(
			data.account.balance,
			currency,
			MILLIUNIT_EXPONENT,
		))
	}

	async fn clear_transaction(
		&self,
		pending: &SyncRecord,
		settled: &CanonicalTransaction,
		mapping: &AccountMapping,
	) -> Result<(), WriteError> {
		let budget_id = self.budget_id(mapping)?;
		let request = UpdateTransactionsRequest {
			transactions: vec![cleared_update(pending)],
		};

		let response = self
			.http_client
			.patch(format!("{}/budgets/{}/transactions", self.endpoint, budget_id))
			.bearer_auth(&self.bearer_token)
			.json(&request)
			.send()
			.await?;
		let _: serde_json::Value = Self::decode(response).await?;

		info!(
			"Cleared YNAB transaction for pending {} (settled as {})",
			pending.source_transaction_id, settled.source_transaction_id
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
		let budget_id = self.budget_id(mapping)?;
		let response = self
			.http_client
			.get(format!(
				"{}/budgets/{}/accounts/{}/transactions",
				self.endpoint, budget_id, mapping.destination_account_id
			))
			.bearer_auth(&self.bearer_token)
			.query(&[("since_date", since.format("%Y-%m-%d").to_string())])
			.send()
			.await?;
		let data: TransactionsData = Self::decode(response).await?;

		let mut transactions: Vec<DestinationTransaction> = data
			.transactions
			.into_iter()
			.filter(|transaction| !transaction.deleted)
			.map(|transaction| DestinationTransaction {
				id: transaction.id,
				date: transaction.date,
				amount: destination_to_minor_units(transaction.amount, currency, MILLIUNIT_EXPONENT),
				payee: transaction.payee_name,
				memo: transaction.memo,
				import_id: transaction.import_id,
			})
			.collect();
		transactions.sort_by(|a, b| b.date.cmp(&a.date));
		transactions.truncate(limit);

		debug!(
			"Loaded {} recent YNAB transactions for account {}",
			transactions.len(),
			mapping.destination_account_id
		);
		Ok(transactions)
	}
}

fn cleared_update(pending: &SyncRecord) -> ClearedUpdate {
	match pending.destination_transaction_id.strip_prefix("import:") {
		Some(import_id) => ClearedUpdate {
			id: None,
			import_id: Some(import_id.to_string()),
			cleared: "cleared",
		},
		None => ClearedUpdate {
			id: Some(pending.destination_transaction_id.clone()),
			import_id: None,
			cleared: "cleared",
		},
	}
}
