use crate::budget::sync::dedup::DedupEngine;
use crate::budget::sync::events::LoggingEventHandler;
use crate::budget::sync::fetcher::AkahuTransactionFetcher;
use crate::budget::sync::orchestrator::SyncOrchestrator;
use crate::budget::sync::progress_tracker::RunSummary;
use crate::budget::sync::state_persistence::SyncStateStore;
use crate::budget::sync::transaction_processor::TransactionProcessor;
use crate::budget::types::SyncError;
use crate::config::{ConfigError, SyncSettings};
use crate::destination::{ActualWriter, YnabWriter};
use crate::provider::AkahuClient;
use crate::scoring::{OpenAiScorer, SimilarityScorer};

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Currency assumed for provider accounts that do not report one.
const DEFAULT_CURRENCY: &str = "NZD";

/// Runs sync passes, never more than one at a time.
pub struct BudgetSyncService {
	orchestrator: SyncOrchestrator,
	run_lock: tokio::sync::Mutex<()>,
	/// Token of the run in progress, if any
	current_run: Mutex<Option<CancellationToken>>,
}

impl BudgetSyncService {
	pub fn new(orchestrator: SyncOrchestrator) -> Self {
		Self {
			orchestrator,
			run_lock: tokio::sync::Mutex::new(()),
			current_run: Mutex::new(None),
		}
	}

	/// Wire the provider, destinations, scorer and state store described by `settings`.
	pub async fn from_settings(settings: &SyncSettings) -> Result<Self, SyncError> {
		let timeout = settings.retry.call_timeout;

		let client = AkahuClient::new(
			settings.akahu.endpoint.clone(),
			settings.akahu.user_token.clone(),
			settings.akahu.app_token.clone(),
			timeout,
		)
		.map_err(|e| ConfigError::HttpClient(e.to_string()))?;
		let fetcher = AkahuTransactionFetcher::new(
			client,
			TransactionProcessor::new(DEFAULT_CURRENCY),
			settings.fetch.clone(),
			settings.retry.clone(),
		);

		let scorer: Option<Arc<dyn SimilarityScorer>> = match &settings.scorer {
			Some(scorer) => {
				info!("Using {} at {} for ambiguous matches", scorer.model, scorer.base_url);
				Some(Arc::new(
					OpenAiScorer::new(
						scorer.base_url.clone(),
						scorer.api_key.clone(),
						scorer.model.clone(),
						settings.matching.scorer_timeout,
					)
					.map_err(|e| ConfigError::HttpClient(e.to_string()))?,
				))
			}
			None => None,
		};

		let store = SyncStateStore::open(settings.state_dir.clone()).await?;
		let engine = DedupEngine::new(settings.matching.clone(), scorer, settings.local_offset);

		let mut orchestrator = SyncOrchestrator::new(
			Arc::new(fetcher),
			Arc::new(store),
			engine,
			settings.mapping_file.clone(),
			settings.retry.clone(),
			settings.max_concurrent_accounts,
		);

		if let Some(ynab) = &settings.ynab {
			let writer = YnabWriter::new(
				ynab.endpoint.clone(),
				ynab.bearer_token.clone(),
				ynab.default_budget_id.clone(),
				settings.local_offset,
				timeout,
			)
			.map_err(|e| ConfigError::HttpClient(e.to_string()))?;
			orchestrator.register_writer(Arc::new(writer));
		}
		if let Some(actual) = &settings.actual {
			let writer = ActualWriter::new(
				actual.server_url.clone(),
				actual.api_key.clone(),
				actual.sync_id.clone(),
				actual.encryption_key.clone(),
				settings.local_offset,
				timeout,
			)
			.map_err(|e| ConfigError::HttpClient(e.to_string()))?;
			orchestrator.register_writer(Arc::new(writer));
		}
		orchestrator.register_handler(Arc::new(LoggingEventHandler));

		Ok(Self::new(orchestrator))
	}

	/// Run one sync pass now.
	///
	/// Fails with [`SyncError::AlreadyRunning`] instead of waiting when a pass is in progress.
	pub async fn run_sync_now(&self) -> Result<RunSummary, SyncError> {
		let _guard = self.run_lock.try_lock().map_err(|_| {
			warn!("Sync requested while another run is in progress");
			SyncError::AlreadyRunning
		})?;

		let cancel = CancellationToken::new();
		self.set_current_run(Some(cancel.clone()));
		let result = self.orchestrator.sync(&cancel).await;
		self.set_current_run(None);
		result
	}

	/// Ask the run in progress to stop starting new accounts. Returns `false` when idle.
	pub fn cancel_current_run(&self) -> bool {
		let current = self
			.current_run
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		match current.as_ref() {
			Some(cancel) => {
				info!("Cancelling the current sync run");
				cancel.cancel();
				true
			}
			None => false,
		}
	}

	fn set_current_run(&self, cancel: Option<CancellationToken>) {
		*self
			.current_run
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner()) = cancel;
	}
}
