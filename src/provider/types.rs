//! Types for Akahu REST responses

use serde::{Deserialize, Serialize};

/// Connected bank or institution an account belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AkahuConnection {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AkahuBalance {
    pub currency: Option<String>,
    pub current: Option<f64>,
}

/// An account as listed by `GET /accounts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AkahuAccount {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub connection: Option<AkahuConnection>,
    #[serde(rename = "type")]
    pub account_type: Option<String>,
    pub balance: Option<AkahuBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AkahuMerchant {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub name: Option<String>,
}

/// A settled transaction from `GET /accounts/{id}/transactions`.
///
/// `amount` is a decimal in the account currency (negative for debits) and `date` an
/// RFC 3339 timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AkahuTransaction {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_account")]
    pub account: String,
    pub date: String,
    pub description: String,
    pub amount: f64,
    pub merchant: Option<AkahuMerchant>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// A pending transaction from `GET /accounts/{id}/transactions/pending`.
///
/// Pending items carry no identifier; they are replaced by a settled transaction later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AkahuPendingTransaction {
    #[serde(rename = "_account")]
    pub account: String,
    pub date: String,
    pub description: String,
    pub amount: f64,
    pub updated_at: Option<String>,
    pub merchant: Option<AkahuMerchant>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageCursor {
    pub next: Option<String>,
}

/// Envelope used by every Akahu list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsResponse<T> {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub cursor: Option<PageCursor>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> ItemsResponse<T> {
    /// Cursor for the next page, if the provider reported one.
    pub fn next_cursor(&self) -> Option<&str> {
        self.cursor.as_ref().and_then(|cursor| cursor.next.as_deref())
    }
}

/// Error types for Akahu API calls
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Akahu returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Akahu reported failure: {0}")]
    ApiError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transaction_page_with_cursor() {
        let body = r#"{
            "success": true,
            "items": [{
                "_id": "trans_1",
                "_account": "acc_123",
                "_connection": "conn_1",
                "date": "2024-03-01T11:00:00.000Z",
                "description": "CAFE 123 WELLINGTON",
                "amount": -5.0,
                "merchant": {"_id": "merchant_1", "name": "Cafe"},
                "type": "EFTPOS"
            }],
            "cursor": {"next": "abc"}
        }"#;
        let page: ItemsResponse<AkahuTransaction> = serde_json::from_str(body).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].merchant.as_ref().unwrap().name.as_deref(), Some("Cafe"));
        assert_eq!(page.next_cursor(), Some("abc"));
    }

    #[test]
    fn last_page_has_no_cursor() {
        let page: ItemsResponse<AkahuTransaction> =
            serde_json::from_str(r#"{"success": true, "items": [], "cursor": {"next": null}}"#).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor(), None);
    }
}
