//! Sync orchestrator: one pass from the provider into every mapped destination.
//!
//! A run loads the mapping table, refreshes the provider's account list, health-checks the
//! destination writers and then runs one pipeline per mapped source account:
//!
//! - fetch the account's transactions since its cursor
//! - classify each transaction once per mapped destination
//! - write new transactions and record each commit in the sync state store
//! - move the cursor forward (or back to the earliest failure)
//!
//! Tracking accounts skip the transaction pipeline. Their destination balance is compared with
//! the provider's and a single adjustment transaction closes any gap.
//!
//! Accounts run concurrently up to `max_concurrent_accounts`. A failure is isolated to its
//! account, or to one (transaction, destination) pair for writes, and is reported in the
//! [`RunSummary`]; only an unreadable mapping file aborts the run.

use crate::budget::sync::dedup::{Classification, DedupEngine, MatchContext};
use crate::budget::sync::events::{EventDispatcher, SyncEvent, SyncEventHandler};
use crate::budget::sync::fetcher::TransactionFetcher;
use crate::budget::sync::mapping::{MappingSource, MappingTable};
use crate::budget::sync::progress_tracker::{AccountState, AccountSummary, RunState, RunSummary};
use crate::budget::sync::state_persistence::SyncStateStore;
use crate::budget::sync::transaction_processor::balance_adjustment;
use crate::budget::types::{
    AccountMapping, CanonicalTransaction, DestinationSystem, SourceAccount, SyncCursor,
    SyncError, SyncRecord,
};
use crate::destination::DestinationWriter;
use crate::utils::{RetryPolicy, retry_with_backoff};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::{StreamExt, stream};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coordinates fetcher, dedup engine, writers and store for a sync run.
pub struct SyncOrchestrator {
    fetcher: Arc<dyn TransactionFetcher>,
    writers: HashMap<DestinationSystem, Arc<dyn DestinationWriter>>,
    store: Arc<SyncStateStore>,
    engine: DedupEngine,
    dispatcher: EventDispatcher,
    retry: RetryPolicy,
    mapping_path: PathBuf,
    max_concurrent_accounts: usize,
}

impl SyncOrchestrator {
    pub fn new(
        fetcher: Arc<dyn TransactionFetcher>,
        store: Arc<SyncStateStore>,
        engine: DedupEngine,
        mapping_path: PathBuf,
        retry: RetryPolicy,
        max_concurrent_accounts: usize,
    ) -> Self {
        Self {
            fetcher,
            writers: HashMap::new(),
            store,
            engine,
            dispatcher: EventDispatcher::new(),
            retry,
            mapping_path,
            max_concurrent_accounts: max_concurrent_accounts.max(1),
        }
    }

    /// Register the writer for a destination, replacing any earlier one.
    pub fn register_writer(&mut self, writer: Arc<dyn DestinationWriter>) {
        info!("Registered writer for {}", writer.system());
        self.writers.insert(writer.system(), writer);
    }

    pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
        self.dispatcher.register_handler(handler);
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<SyncStateStore> {
        &self.store
    }

    /// Run one sync pass.
    ///
    /// Returns `Err` only when the mapping file cannot be loaded. Everything else is reported
    /// in the summary.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::start();
        info!("Starting budget synchronization");
        self.run_state(RunState::Init).await;

        let table = match MappingTable::load(&self.mapping_path).await {
            Ok(table) => table,
            Err(e) => {
                error!("Aborting sync: {}", e);
                summary.warn(e.to_string());
                summary.finish(RunState::Aborted);
                self.run_state(RunState::Aborted).await;
                return Err(e.into());
            }
        };
        self.run_state(RunState::MappingLoaded).await;

        if table.source == MappingSource::Missing {
            summary.warn(format!(
                "Mapping file {} not found; no accounts are mapped",
                self.mapping_path.display()
            ));
            summary.finish(RunState::Summarized);
            self.run_state(RunState::Summarized).await;
            return Ok(summary);
        }

        let work = self.plan(&table, &mut summary).await;
        let healthy = self.check_writers(&work).await;
        info!("Syncing {} mapped accounts", work.len());

        let results: Vec<(String, AccountSummary)> = stream::iter(work)
            .map(|(account, mappings)| {
                let healthy = &healthy;
                async move {
                    if cancel.is_cancelled() {
                        self.account_state(&account.id, AccountState::Cancelled).await;
                        return (account.id.clone(), AccountSummary::cancelled(&account.display_name));
                    }
                    let account_summary = self.process_account(&account, &mappings, healthy).await;
                    (account.id, account_summary)
                }
            })
            .buffer_unordered(self.max_concurrent_accounts)
            .collect()
            .await;

        summary.per_account.extend(results);
        if cancel.is_cancelled() {
            summary.warn("Run cancelled before all accounts were processed");
        }

        summary.finish(RunState::Summarized);
        self.run_state(RunState::Summarized).await;
        Ok(summary)
    }

    /// Pair every mapped source account with its account snapshot and usable mappings.
    async fn plan(
        &self,
        table: &MappingTable,
        summary: &mut RunSummary,
    ) -> Vec<(SourceAccount, Vec<AccountMapping>)> {
        let accounts = match self.fetcher.list_accounts().await {
            Ok(accounts) => Some(accounts),
            Err(e) => {
                warn!("Could not refresh provider accounts, using mapping snapshots: {}", e);
                summary.warn(format!("Provider account list unavailable: {}", e));
                None
            }
        };

        let mut work = Vec::new();
        for (source_account_id, mappings) in table.by_source_account() {
            let mut usable = Vec::new();
            for mapping in mappings {
                if self.writers.contains_key(&mapping.destination_system) {
                    usable.push(mapping);
                } else {
                    warn!(
                        "Skipping {} mapping for {}: destination not enabled",
                        mapping.destination_system, source_account_id
                    );
                    summary.warn(format!(
                        "{} mapping for {} skipped: destination not enabled",
                        mapping.destination_system, source_account_id
                    ));
                }
            }
            if usable.is_empty() {
                continue;
            }

            let account = match &accounts {
                Some(accounts) => match accounts.iter().find(|a| a.id == source_account_id) {
                    Some(account) => account.clone(),
                    None => {
                        warn!(
                            "Mapped account {} is not listed by the provider",
                            source_account_id
                        );
                        table.known_account(&source_account_id)
                    }
                },
                None => table.known_account(&source_account_id),
            };
            work.push((account, usable));
        }
        work
    }

    /// Health-check each destination that has work this run.
    async fn check_writers(
        &self,
        work: &[(SourceAccount, Vec<AccountMapping>)],
    ) -> HashMap<DestinationSystem, bool> {
        let mut systems: Vec<DestinationSystem> = work
            .iter()
            .flat_map(|(_, mappings)| mappings.iter().map(|m| m.destination_system))
            .collect();
        systems.sort();
        systems.dedup();

        let checks = systems.into_iter().filter_map(|system| {
            let writer = self.writers.get(&system)?.clone();
            Some(async move { (system, writer.is_healthy().await) })
        });
        let healthy: HashMap<DestinationSystem, bool> = join_all(checks).await.into_iter().collect();
        for (system, ok) in &healthy {
            if !ok {
                warn!("{} is unhealthy; writes to it will be reported as failed", system);
            }
        }
        healthy
    }

    async fn process_account(
        &self,
        account: &SourceAccount,
        mappings: &[AccountMapping],
        healthy: &HashMap<DestinationSystem, bool>,
    ) -> AccountSummary {
        let mut summary = AccountSummary::new(&account.display_name);
        info!(
            "Syncing account {} ({}) to {} destination(s)",
            account.display_name,
            account.id,
            mappings.len()
        );

        let (tracking, ledger): (Vec<AccountMapping>, Vec<AccountMapping>) =
            mappings.iter().cloned().partition(|mapping| mapping.tracking);
        for mapping in &tracking {
            self.reconcile_balance(account, mapping, healthy, &mut summary)
                .await;
        }
        if !ledger.is_empty()
            && !self
                .sync_transactions(account, &ledger, healthy, &mut summary)
                .await
        {
            return summary;
        }

        summary.finish();
        self.account_state(&account.id, AccountState::Completed).await;
        info!(
            "Account {}: {} fetched, {} created, {} already synced, {} duplicates, {} failed",
            account.id,
            summary.fetched,
            summary.created,
            summary.already_synced,
            summary.skipped_duplicate,
            summary.failed
        );
        summary
    }

    /// Fetch, classify and write the account's transactions. `false` when the account failed.
    async fn sync_transactions(
        &self,
        account: &SourceAccount,
        mappings: &[AccountMapping],
        healthy: &HashMap<DestinationSystem, bool>,
        summary: &mut AccountSummary,
    ) -> bool {
        self.account_state(&account.id, AccountState::Fetching).await;

        let cursor = self.store.cursor(&account.id).await;
        let mut transactions = match self
            .fetcher
            .fetch_transactions(account, cursor.as_ref())
            .await
        {
            Ok(transactions) => transactions,
            Err(e) => {
                self.fail_account(account, summary, format!("fetch failed: {}", e))
                    .await;
                return false;
            }
        };
        self.account_state(&account.id, AccountState::Classifying).await;

        let mut contexts: Vec<MatchContext> = mappings.iter().map(|_| MatchContext::new()).collect();
        let mut newest: Option<DateTime<Utc>> = None;
        let mut earliest_failure: Option<DateTime<Utc>> = None;

        while let Some(item) = transactions.next().await {
            let transaction = match item {
                Ok(transaction) => transaction,
                Err(e) => {
                    self.fail_account(account, summary, format!("fetch failed: {}", e))
                        .await;
                    return false;
                }
            };
            summary.record_fetched();
            debug!(
                "Processing {} {} {}",
                transaction.source_transaction_id, transaction.posted_at, transaction.amount
            );

            let mut all_ok = true;
            for (mapping, context) in mappings.iter().zip(contexts.iter_mut()) {
                let ok = self
                    .sync_to_destination(&transaction, mapping, context, healthy, summary)
                    .await;
                all_ok &= ok;
            }

            if !all_ok {
                earliest_failure = Some(
                    earliest_failure.map_or(transaction.posted_at, |at| at.min(transaction.posted_at)),
                );
            }
            newest = Some(newest.map_or(transaction.posted_at, |at| at.max(transaction.posted_at)));
        }

        let next_cursor = match (earliest_failure, newest) {
            (Some(failed_at), _) => Some(SyncCursor::at(failed_at)),
            (None, Some(newest)) => Some(SyncCursor::advance(cursor, newest)),
            (None, None) => None,
        };
        if let Some(next_cursor) = next_cursor {
            if let Err(e) = self.store.save_cursor(&account.id, next_cursor).await {
                self.fail_account(account, summary, format!("cursor not saved: {}", e))
                    .await;
                return false;
            }
        }
        true
    }

    /// Write one adjustment so a tracking account's destination balance matches the provider.
    async fn reconcile_balance(
        &self,
        account: &SourceAccount,
        mapping: &AccountMapping,
        healthy: &HashMap<DestinationSystem, bool>,
        summary: &mut AccountSummary,
    ) {
        let system = mapping.destination_system;
        self.account_state(&account.id, AccountState::Reconciling)
            .await;

        let Some(target) = account.balance else {
            self.fail_balance(account, system, summary, "provider reported no balance".to_string())
                .await;
            return;
        };
        let Some(writer) = self.writers.get(&system) else {
            self.fail_balance(account, system, summary, "no writer registered".to_string())
                .await;
            return;
        };
        if !healthy.get(&system).copied().unwrap_or(false) {
            self.fail_balance(account, system, summary, "destination unhealthy".to_string())
                .await;
            return;
        }

        let current = match retry_with_backoff(&self.retry, "destination balance", || {
            writer.account_balance(mapping, &account.currency)
        })
        .await
        {
            Ok(current) => current,
            Err(e) => {
                self.fail_balance(account, system, summary, e.to_string())
                    .await;
                return;
            }
        };
        if current == target {
            debug!("Tracking account {} is balanced in {}", account.id, system);
            summary.record_already_synced();
            return;
        }

        let adjustment = balance_adjustment(account, current, target, Utc::now());
        if self
            .store
            .find(&adjustment.source_transaction_id, system)
            .await
            .is_some()
        {
            // Written today already; the destination moved again since.
            warn!(
                "Tracking account {} drifted back to a balance already adjusted today in {}",
                account.id, system
            );
            summary.record_already_synced();
            return;
        }
        info!(
            "Adjusting tracking account {} in {}: {}",
            account.id, system, adjustment.description
        );
        let mut context = MatchContext::new();
        self.commit(writer.as_ref(), &adjustment, mapping, &mut context, summary)
            .await;
    }

    /// Classify and, if needed, commit one transaction to one destination. `false` on failure.
    async fn sync_to_destination(
        &self,
        transaction: &CanonicalTransaction,
        mapping: &AccountMapping,
        context: &mut MatchContext,
        healthy: &HashMap<DestinationSystem, bool>,
        summary: &mut AccountSummary,
    ) -> bool {
        let system = mapping.destination_system;
        let Some(writer) = self.writers.get(&system) else {
            return self
                .fail_write(transaction, system, summary, "no writer registered".to_string())
                .await;
        };
        let is_healthy = healthy.get(&system).copied().unwrap_or(false);

        if is_healthy {
            self.engine
                .prepare(context, writer.as_ref(), mapping, &self.store, transaction)
                .await;
        }
        let classification = self
            .engine
            .classify(transaction, mapping, &self.store, context)
            .await;
        self.dispatcher
            .dispatch(SyncEvent::TransactionClassified {
                source_transaction_id: transaction.source_transaction_id.clone(),
                destination_system: system,
                classification: classification.clone(),
            })
            .await;

        match classification {
            Classification::AlreadySynced { settles: None } => {
                summary.record_already_synced();
                true
            }
            Classification::ProbableDuplicate { .. } => {
                summary.record_duplicate();
                true
            }
            Classification::AlreadySynced {
                settles: Some(pending_id),
            } => {
                self.settle(writer.as_ref(), is_healthy, transaction, mapping, &pending_id, summary)
                    .await
            }
            Classification::New if !is_healthy => {
                self.fail_write(transaction, system, summary, "destination unhealthy".to_string())
                    .await
            }
            Classification::New => {
                self.commit(writer.as_ref(), transaction, mapping, context, summary)
                    .await
            }
        }
    }

    async fn commit(
        &self,
        writer: &dyn DestinationWriter,
        transaction: &CanonicalTransaction,
        mapping: &AccountMapping,
        context: &mut MatchContext,
        summary: &mut AccountSummary,
    ) -> bool {
        let system = mapping.destination_system;
        self.account_state(&transaction.source_account_id, AccountState::Writing)
            .await;

        let written = retry_with_backoff(&self.retry, "destination write", || {
            writer.create_transaction(transaction, mapping)
        })
        .await;
        let destination_transaction_id = match written {
            Ok(id) => id,
            Err(e) => return self.fail_write(transaction, system, summary, e.to_string()).await,
        };

        self.account_state(&transaction.source_account_id, AccountState::Recording)
            .await;
        let record = SyncRecord::committed(
            transaction,
            mapping,
            destination_transaction_id.clone(),
            Utc::now(),
        );
        match self.store.insert_if_absent(record).await {
            Ok(true) => {
                context.claim(&destination_transaction_id, &transaction.source_transaction_id);
                summary.record_created();
                self.dispatcher
                    .dispatch(SyncEvent::TransactionCommitted {
                        source_transaction_id: transaction.source_transaction_id.clone(),
                        destination_system: system,
                        destination_transaction_id,
                        amount: transaction.amount,
                        currency: transaction.currency.clone(),
                    })
                    .await;
                true
            }
            Ok(false) => {
                summary.record_already_synced();
                true
            }
            Err(e) => {
                // The next run writes again; the idempotency key stops a second row.
                self.fail_write(
                    transaction,
                    system,
                    summary,
                    format!("written as {} but not recorded: {}", destination_transaction_id, e),
                )
                .await
            }
        }
    }

    /// Reconcile a settled transaction with the pending row already in the destination.
    ///
    /// The destination row is updated first (replaced, or marked cleared when the destination
    /// keeps a single row) and the records linked only after it succeeded, so a failure leaves
    /// the pending record unsettled and the next run tries again.
    async fn settle(
        &self,
        writer: &dyn DestinationWriter,
        is_healthy: bool,
        transaction: &CanonicalTransaction,
        mapping: &AccountMapping,
        pending_id: &str,
        summary: &mut AccountSummary,
    ) -> bool {
        let system = mapping.destination_system;
        let mut settled_destination_id = None;

        if !is_healthy {
            return self
                .fail_write(transaction, system, summary, "destination unhealthy".to_string())
                .await;
        }
        let Some(pending) = self.store.find(pending_id, system).await else {
            return self
                .fail_write(
                    transaction,
                    system,
                    summary,
                    format!("pending record {} disappeared", pending_id),
                )
                .await;
        };

        if writer.distinguishes_pending() {
            let settled = retry_with_backoff(&self.retry, "destination settle", || {
                writer.settle_transaction(&pending.destination_transaction_id, transaction, mapping)
            })
            .await;
            match settled {
                Ok(id) => settled_destination_id = Some(id),
                Err(e) => return self.fail_write(transaction, system, summary, e.to_string()).await,
            }
        } else {
            let cleared = retry_with_backoff(&self.retry, "destination clear", || {
                writer.clear_transaction(&pending, transaction, mapping)
            })
            .await;
            if let Err(e) = cleared {
                return self.fail_write(transaction, system, summary, e.to_string()).await;
            }
        }

        match self
            .store
            .link_settlement(pending_id, system, transaction, settled_destination_id)
            .await
        {
            Ok(linked) => {
                info!(
                    "{} settled pending {} ({} {})",
                    transaction.source_transaction_id,
                    pending_id,
                    system,
                    linked.destination_transaction_id
                );
                summary.record_already_synced();
                true
            }
            Err(e) => self.fail_write(transaction, system, summary, e.to_string()).await,
        }
    }

    async fn fail_write(
        &self,
        transaction: &CanonicalTransaction,
        system: DestinationSystem,
        summary: &mut AccountSummary,
        reason: String,
    ) -> bool {
        error!(
            "Failed to sync {} to {}: {}",
            transaction.source_transaction_id, system, reason
        );
        summary.record_write_failure(&transaction.source_transaction_id, system, reason.clone());
        self.dispatcher
            .dispatch(SyncEvent::WriteFailed {
                source_transaction_id: transaction.source_transaction_id.clone(),
                destination_system: system,
                reason,
            })
            .await;
        false
    }

    async fn fail_balance(
        &self,
        account: &SourceAccount,
        system: DestinationSystem,
        summary: &mut AccountSummary,
        reason: String,
    ) {
        error!(
            "Failed to reconcile tracking account {} in {}: {}",
            account.id, system, reason
        );
        summary.record_balance_failure(system, reason.clone());
        self.dispatcher
            .dispatch(SyncEvent::WriteFailed {
                source_transaction_id: format!("balance:{}", account.id),
                destination_system: system,
                reason,
            })
            .await;
    }

    async fn fail_account(&self, account: &SourceAccount, summary: &mut AccountSummary, reason: String) {
        error!("Account {} failed: {}", account.id, reason);
        summary.record_account_failure(reason.clone());
        self.account_state(&account.id, AccountState::Failed).await;
        self.dispatcher
            .dispatch(SyncEvent::AccountFailed {
                source_account_id: account.id.clone(),
                reason,
            })
            .await;
    }

    async fn run_state(&self, state: RunState) {
        self.dispatcher
            .dispatch(SyncEvent::RunStateChanged { state })
            .await;
    }

    async fn account_state(&self, source_account_id: &str, state: AccountState) {
        self.dispatcher
            .dispatch(SyncEvent::AccountStateChanged {
                source_account_id: source_account_id.to_string(),
                state,
            })
            .await;
    }
}
