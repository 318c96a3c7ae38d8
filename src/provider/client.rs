//!
//! REST client for the Akahu open-banking API.
//!
//! This module provides an async client for listing the user's connected accounts and reading
//! their settled and pending transactions. Every request carries the user token as a bearer
//! token and the app token in `X-Akahu-ID`. Methods return raw Akahu payloads; conversion to
//! canonical transactions happens in the sync layer.

use super::types::*;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Akahu API client
#[derive(Clone)]
pub struct AkahuClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL, e.g. `https://api.akahu.io/v1`.
	endpoint: String,
	user_token: String,
	app_token: String,
}

impl AkahuClient {
	/// Create a new Akahu client.
	///
	/// # Arguments
	/// * `endpoint` - The API base URL.
	/// * `user_token` - The user access token.
	/// * `app_token` - The application id token.
	/// * `timeout` - Per-request timeout applied by the HTTP client.
	pub fn new(
		endpoint: String,
		user_token: String,
		app_token: String,
		timeout: Duration,
	) -> Result<Self, ProviderError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			endpoint: endpoint.trim_end_matches('/').to_string(),
			user_token,
			app_token,
		})
	}

	/// List every account the user has connected.
	pub async fn list_accounts(&self) -> Result<Vec<AkahuAccount>, ProviderError> {
		let response: ItemsResponse<AkahuAccount> = self.get_json("accounts", &[]).await?;
		Self::ensure_success(&response)?;
		Ok(response.items)
	}

	/// Fetch one page of settled transactions for an account.
	///
	/// # Arguments
	/// * `account_id` - The Akahu account id.
	/// * `start` - RFC 3339 lower bound for the transaction date.
	/// * `cursor` - Page cursor returned by the previous page, if any.
	pub async fn transactions_page(
		&self,
		account_id: &str,
		start: &str,
		cursor: Option<&str>,
	) -> Result<ItemsResponse<AkahuTransaction>, ProviderError> {
		let mut query = vec![("start", start)];
		if let Some(cursor) = cursor {
			query.push(("cursor", cursor));
		}

		let response: ItemsResponse<AkahuTransaction> = self
			.get_json(&format!("accounts/{}/transactions", account_id), &query)
			.await?;
		Self::ensure_success(&response)?;

		debug!(
			"Fetched page of {} transactions for account {} (next cursor: {:?})",
			response.items.len(),
			account_id,
			response.next_cursor()
		);
		Ok(response)
	}

	/// Fetch all pending transactions for an account. This endpoint is not paginated.
	pub async fn pending_transactions(
		&self,
		account_id: &str,
	) -> Result<Vec<AkahuPendingTransaction>, ProviderError> {
		let response: ItemsResponse<AkahuPendingTransaction> = self
			.get_json(&format!("accounts/{}/transactions/pending", account_id), &[])
			.await?;
		Self::ensure_success(&response)?;
		Ok(response.items)
	}

	fn ensure_success<T>(response: &ItemsResponse<T>) -> Result<(), ProviderError> {
		if response.success == Some(false) {
			return Err(ProviderError::ApiError(
				response
					.message
					.clone()
					.unwrap_or_else(|| "request was not successful".to_string()),
			));
		}
		Ok(())
	}

	/// Execute an authenticated GET and decode the JSON body.
	async fn get_json<T: DeserializeOwned>(
		&self,
		path: &str,
		query: &[(&str, &str)],
	) -> Result<T, ProviderError> {
		let url = format!("{}/{}", self.endpoint, path);

		let response = self
			.http_client
			.get(&url)
			.bearer_auth(&self.user_token)
			.header("X-Akahu-ID", &self.app_token)
			.query(query)
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(ProviderError::Status {
				status: status.as_u16(),
				body,
			});
		}

		let body = response.text().await?;
		Ok(serde_json::from_str(&body)?)
	}
}
