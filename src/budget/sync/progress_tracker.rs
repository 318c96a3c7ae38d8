//! Progress tracking and the run summary.
//!
//! Each account pipeline keeps an [`AccountSummary`] of what happened to its transactions; the
//! orchestrator collects them into the [`RunSummary`] returned to the caller.

use crate::budget::types::DestinationSystem;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Lifecycle of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    MappingLoaded,
    Summarized,
    /// The mapping could not be loaded; no account was touched.
    Aborted,
}

/// Lifecycle of one account pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// Adjusting a tracking account's destination balance.
    Reconciling,
    Fetching,
    Classifying,
    Writing,
    Recording,
    Completed,
    Failed,
    Cancelled,
}

/// Final outcome of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Completed,
    /// Finished, but some (transaction, destination) pairs failed.
    PartiallyFailed,
    Failed,
    Cancelled,
}

/// One failure reported in the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub source_transaction_id: Option<String>,
    pub destination_system: Option<DestinationSystem>,
    pub reason: String,
}

/// Per-account counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub display_name: String,
    pub status: AccountStatus,
    pub fetched: usize,
    pub created: usize,
    pub already_synced: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    pub failures: Vec<FailureEntry>,
}

impl AccountSummary {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            status: AccountStatus::Completed,
            fetched: 0,
            created: 0,
            already_synced: 0,
            skipped_duplicate: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    pub fn cancelled(display_name: impl Into<String>) -> Self {
        Self {
            status: AccountStatus::Cancelled,
            ..Self::new(display_name)
        }
    }

    pub fn record_fetched(&mut self) {
        self.fetched += 1;
    }

    pub fn record_created(&mut self) {
        self.created += 1;
    }

    pub fn record_already_synced(&mut self) {
        self.already_synced += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.skipped_duplicate += 1;
    }

    /// Record a failed (transaction, destination) pair.
    pub fn record_write_failure(
        &mut self,
        source_transaction_id: &str,
        destination_system: DestinationSystem,
        reason: impl Into<String>,
    ) {
        self.failed += 1;
        self.failures.push(FailureEntry {
            source_transaction_id: Some(source_transaction_id.to_string()),
            destination_system: Some(destination_system),
            reason: reason.into(),
        });
    }

    /// Record a balance reconciliation that failed for one destination.
    pub fn record_balance_failure(
        &mut self,
        destination_system: DestinationSystem,
        reason: impl Into<String>,
    ) {
        self.failed += 1;
        self.failures.push(FailureEntry {
            source_transaction_id: None,
            destination_system: Some(destination_system),
            reason: reason.into(),
        });
    }

    /// Record a failure of the account as a whole.
    pub fn record_account_failure(&mut self, reason: impl Into<String>) {
        self.status = AccountStatus::Failed;
        self.failures.push(FailureEntry {
            source_transaction_id: None,
            destination_system: None,
            reason: reason.into(),
        });
    }

    /// Settle the final status once the account's stream is exhausted.
    pub fn finish(&mut self) {
        if self.status == AccountStatus::Completed && self.failed > 0 {
            self.status = AccountStatus::PartiallyFailed;
        }
    }
}

/// Result of one sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub per_account: BTreeMap<String, AccountSummary>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Init,
            per_account: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
        info!("{}", self.summary());
    }

    pub fn total_created(&self) -> usize {
        self.per_account.values().map(|account| account.created).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.per_account.values().map(|account| account.failed).sum()
    }

    /// Get a human-readable summary of the run
    pub fn summary(&self) -> String {
        let count = |status: AccountStatus| {
            self.per_account
                .values()
                .filter(|account| account.status == status)
                .count()
        };
        format!(
            "Sync {:?}: {} accounts ({} failed, {} cancelled), {} created, {} already synced, {} duplicates skipped, {} failed writes{}",
            self.state,
            self.per_account.len(),
            count(AccountStatus::Failed),
            count(AccountStatus::Cancelled),
            self.total_created(),
            self.per_account.values().map(|a| a.already_synced).sum::<usize>(),
            self.per_account.values().map(|a| a.skipped_duplicate).sum::<usize>(),
            self.total_failed(),
            if self.warnings.is_empty() {
                String::new()
            } else {
                format!(" ({} warnings)", self.warnings.len())
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_failures_mark_account_partial() {
        let mut account = AccountSummary::new("Everyday");
        account.record_fetched();
        account.record_created();
        account.record_write_failure("t2", DestinationSystem::Ynab, "HTTP 400");
        account.finish();

        assert_eq!(account.status, AccountStatus::PartiallyFailed);
        assert_eq!(account.failures[0].source_transaction_id.as_deref(), Some("t2"));
    }

    #[test]
    fn summary_counts_accounts() {
        let mut run = RunSummary::start();
        let mut everyday = AccountSummary::new("Everyday");
        everyday.record_created();
        run.per_account.insert("acc_123".to_string(), everyday);
        run.per_account
            .insert("acc_456".to_string(), AccountSummary::cancelled("Savings"));
        run.warn("mapping for acc_789 has no writer");
        run.finish(RunState::Summarized);

        assert!(run.finished_at.is_some());
        assert_eq!(run.total_created(), 1);
        let text = run.summary();
        assert!(text.contains("2 accounts"));
        assert!(text.contains("1 cancelled"));
        assert!(text.contains("1 warnings"));
    }
}
