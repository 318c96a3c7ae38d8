//! Duplicate detection for transactions about to be written.
//!
//! Every fetched transaction is classified once per mapped destination, in this order:
//!
//! 1. an exact sync record for `(source transaction, destination)` means it is already synced;
//! 2. a settled transaction that matches an unsettled pending record is linked to it;
//! 3. a recent destination row with the same amount, a close date and a similar description
//!    is a probable duplicate (entered by hand or by another tool) and is skipped;
//! 4. anything else is new.
//!
//! Descriptions in the ambiguous similarity band may be handed to a [`SimilarityScorer`].

use crate::budget::sync::similarity::description_similarity;
use crate::budget::sync::state_persistence::SyncStateStore;
use crate::budget::types::{AccountMapping, CanonicalTransaction};
use crate::destination::{DestinationTransaction, DestinationWriter, idempotency_key};
use crate::scoring::SimilarityScorer;

use chrono::{Duration as DateDuration, FixedOffset, NaiveDate};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Matching thresholds.
#[derive(Debug, Clone)]
pub struct MatchConfig {
	/// Max distance in days between a transaction and a destination row it duplicates.
	pub date_window_days: i64,
	/// Max distance in days between a pending transaction and its settlement.
	pub settle_window_days: i64,
	/// Description similarity at or above which two rows are the same payee.
	pub similarity_threshold: f64,
	/// Lower edge of the band handed to the scorer.
	pub ambiguous_floor: f64,
	/// Destination rows considered per account.
	pub recent_limit: usize,
	pub scorer_timeout: Duration,
}

impl Default for MatchConfig {
	fn default() -> Self {
		Self {
			date_window_days: 3,
			settle_window_days: 5,
			similarity_threshold: 0.8,
			ambiguous_floor: 0.5,
			recent_limit: 50,
			scorer_timeout: Duration::from_secs(5),
		}
	}
}

/// Outcome of classifying one transaction for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
	New,
	/// Already committed. `settles` names the pending transaction this one replaces.
	AlreadySynced { settles: Option<String> },
	ProbableDuplicate { destination_transaction_id: String },
}

/// Candidate destination rows for one (source account, mapping) pair during a run.
#[derive(Debug, Default)]
pub struct MatchContext {
	loaded: bool,
	candidates: Vec<DestinationTransaction>,
	/// Destination ids already owned by a sync record.
	claimed: HashSet<String>,
	/// Import keys of synced transactions; rows carrying one are ours whatever their id.
	claimed_import_keys: HashSet<String>,
	/// Destination ids matched earlier in this run.
	consumed: HashSet<String>,
}

impl MatchContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Context with a fixed candidate list.
	#[cfg(test)]
	pub fn with_candidates(
		candidates: Vec<DestinationTransaction>,
		claimed: HashSet<String>,
	) -> Self {
		Self {
			loaded: true,
			candidates,
			claimed,
			..Self::default()
		}
	}

	/// Mark a destination row as owned by a transaction committed this run.
	pub fn claim(&mut self, destination_transaction_id: &str, source_transaction_id: &str) {
		self.claimed.insert(destination_transaction_id.to_string());
		self.claimed_import_keys
			.insert(idempotency_key(source_transaction_id));
	}

	fn is_claimed(&self, candidate: &DestinationTransaction) -> bool {
		self.claimed.contains(&candidate.id)
			|| self.consumed.contains(&candidate.id)
			|| candidate
				.import_id
				.as_ref()
				.is_some_and(|key| self.claimed_import_keys.contains(key))
	}
}

struct CandidateMatch {
	destination_transaction_id: String,
	similarity: f64,
	ours: String,
	theirs: String,
}

/// Classifies transactions against the sync store and recent destination rows.
pub struct DedupEngine {
	config: MatchConfig,
	scorer: Option<Arc<dyn SimilarityScorer>>,
	local_offset: FixedOffset,
}

impl DedupEngine {
	pub fn new(
		config: MatchConfig,
		scorer: Option<Arc<dyn SimilarityScorer>>,
		local_offset: FixedOffset,
	) -> Self {
		Self {
			config,
			scorer,
			local_offset,
		}
	}

	/// Load the destination rows a context matches against, once per context.
	///
	/// `oldest` is the first transaction of the account's (oldest first) stream. A failed load
	/// leaves the context empty, so only the sync record checks apply.
	pub async fn prepare(
		&self,
		context: &mut MatchContext,
		writer: &dyn DestinationWriter,
		mapping: &AccountMapping,
		store: &SyncStateStore,
		oldest: &CanonicalTransaction,
	) {
		if context.loaded {
			return;
		}
		context.loaded = true;
		context.claimed = store
			.claimed_destination_ids(mapping.destination_system)
			.await;
		context.claimed_import_keys = store
			.claimed_import_keys(mapping.destination_system)
			.await;

		let since = oldest.posted_on(self.local_offset)
			- DateDuration::days(self.config.date_window_days);
		match writer
			.recent_transactions(mapping, since, &oldest.currency, self.config.recent_limit)
			.await
		{
			Ok(candidates) => {
				debug!(
					"Loaded {} {} candidates for account {} since {}",
					candidates.len(),
					mapping.destination_system,
					mapping.destination_account_id,
					since
				);
				context.candidates = candidates;
			}
			Err(e) => warn!(
				"Could not load recent {} transactions for account {}, skipping heuristic matching: {}",
				mapping.destination_system, mapping.destination_account_id, e
			),
		}
	}

	/// Classify `transaction` for the destination named by `mapping`.
	pub async fn classify(
		&self,
		transaction: &CanonicalTransaction,
		mapping: &AccountMapping,
		store: &SyncStateStore,
		context: &mut MatchContext,
	) -> Classification {
		let system = mapping.destination_system;

		if store
			.find(&transaction.source_transaction_id, system)
			.await
			.is_some()
		{
			return Classification::AlreadySynced { settles: None };
		}

		if !transaction.is_pending {
			if let Some(pending_id) = self.settled_pending(transaction, mapping, store).await {
				debug!(
					"{} settles pending {} in {}",
					transaction.source_transaction_id, pending_id, system
				);
				return Classification::AlreadySynced {
					settles: Some(pending_id),
				};
			}
		}

		let Some(candidate) = self.best_candidate(transaction, context) else {
			return Classification::New;
		};

		if candidate.similarity >= self.config.similarity_threshold {
			return self.take_duplicate(transaction, context, candidate);
		}
		if candidate.similarity < self.config.ambiguous_floor {
			return Classification::New;
		}

		match self.score(&candidate).await {
			Some(score) if score >= self.config.similarity_threshold => {
				self.take_duplicate(transaction, context, candidate)
			}
			Some(_) => Classification::New,
			None => self.ambiguous_fallback(transaction, mapping, store).await,
		}
	}

	/// Unsettled pending record that `transaction` settles, best description match first.
	async fn settled_pending(
		&self,
		transaction: &CanonicalTransaction,
		mapping: &AccountMapping,
		store: &SyncStateStore,
	) -> Option<String> {
		let settled_on = transaction.posted_on(self.local_offset);
		store
			.unsettled_pending(mapping.destination_system, &transaction.source_account_id)
			.await
			.into_iter()
			.filter(|record| record.amount == transaction.amount)
			.filter(|record| {
				let pending_on = record.posted_at.with_timezone(&self.local_offset).date_naive();
				days_apart(settled_on, pending_on) <= self.config.settle_window_days
			})
			.map(|record| {
				let similarity = description_similarity(&record.description, &transaction.description);
				(record.source_transaction_id, similarity)
			})
			.filter(|(_, similarity)| *similarity >= self.config.similarity_threshold)
			.max_by(|a, b| a.1.total_cmp(&b.1))
			.map(|(id, _)| id)
	}

	fn best_candidate(
		&self,
		transaction: &CanonicalTransaction,
		context: &MatchContext,
	) -> Option<CandidateMatch> {
		let posted_on = transaction.posted_on(self.local_offset);
		let ours: Vec<&str> = [Some(transaction.description.as_str()), transaction.payee.as_deref()]
			.into_iter()
			.flatten()
			.filter(|text| !text.trim().is_empty())
			.collect();

		context
			.candidates
			.iter()
			.filter(|candidate| candidate.amount == transaction.amount)
			.filter(|candidate| days_apart(candidate.date, posted_on) <= self.config.date_window_days)
			.filter(|candidate| !context.is_claimed(candidate))
			.filter_map(|candidate| {
				let theirs = [candidate.payee.as_deref(), candidate.memo.as_deref()]
					.into_iter()
					.flatten()
					.filter(|text| !text.trim().is_empty());
				theirs
					.flat_map(|their| ours.iter().map(move |our| (*our, their)))
					.map(|(our, their)| (description_similarity(our, their), our, their))
					.max_by(|a, b| a.0.total_cmp(&b.0))
					.map(|(similarity, our, their)| CandidateMatch {
						destination_transaction_id: candidate.id.clone(),
						similarity,
						ours: our.to_string(),
						theirs: their.to_string(),
					})
			})
			.max_by(|a, b| a.similarity.total_cmp(&b.similarity))
	}

	fn take_duplicate(
		&self,
		transaction: &CanonicalTransaction,
		context: &mut MatchContext,
		candidate: CandidateMatch,
	) -> Classification {
		debug!(
			"{} looks like existing destination row {} ({:?} ~ {:?}, {:.2})",
			transaction.source_transaction_id,
			candidate.destination_transaction_id,
			candidate.ours,
			candidate.theirs,
			candidate.similarity
		);
		context
			.consumed
			.insert(candidate.destination_transaction_id.clone());
		Classification::ProbableDuplicate {
			destination_transaction_id: candidate.destination_transaction_id,
		}
	}

	/// Ask the scorer, if any. `None` when there is no usable answer.
	async fn score(&self, candidate: &CandidateMatch) -> Option<f64> {
		let scorer = self.scorer.as_ref()?;
		match tokio::time::timeout(
			self.config.scorer_timeout,
			scorer.score(&candidate.ours, &candidate.theirs),
		)
		.await
		{
			Ok(Ok(score)) => Some(score),
			Ok(Err(e)) => {
				warn!("Similarity scorer failed: {}", e);
				None
			}
			Err(_) => {
				warn!(
					"Similarity scorer timed out after {:?}",
					self.config.scorer_timeout
				);
				None
			}
		}
	}

	/// Ambiguous match with no scorer answer: treat as synced only when a committed record on
	/// the same destination and account has the same amount inside the date window.
	async fn ambiguous_fallback(
		&self,
		transaction: &CanonicalTransaction,
		mapping: &AccountMapping,
		store: &SyncStateStore,
	) -> Classification {
		let posted_on = transaction.posted_on(self.local_offset);
		let prior = store
			.records_for_source_account(mapping.destination_system, &transaction.source_account_id)
			.await
			.into_iter()
			.any(|record| {
				record.amount == transaction.amount
					&& days_apart(
						record.posted_at.with_timezone(&self.local_offset).date_naive(),
						posted_on,
					) <= self.config.date_window_days
			});

		if prior {
			debug!(
				"{} is ambiguous and has a prior record; treating as synced",
				transaction.source_transaction_id
			);
			Classification::AlreadySynced { settles: None }
		} else {
			Classification::New
		}
	}
}

fn days_apart(a: NaiveDate, b: NaiveDate) -> i64 {
	(a - b).num_days().abs()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::budget::sync::orchestrator::tests::MockWriter;
	use crate::budget::sync::repositories::memory::{
		MemoryCursorRepository, MemorySyncRecordRepository,
	};
	use crate::budget::types::{DestinationSystem, SyncRecord};
	use crate::scoring::ScorerError;
	use chrono::{TimeZone, Utc};
	use std::sync::atomic::{AtomicU32, Ordering};

	struct FixedScorer {
		score: Result<f64, ()>,
		calls: AtomicU32,
	}

	#[async_trait::async_trait]
	impl SimilarityScorer for FixedScorer {
		async fn score(&self, _a: &str, _b: &str) -> Result<f64, ScorerError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self.score
				.map_err(|_| ScorerError::InvalidResponse("unavailable".to_string()))
		}
	}

	/// Scorer that answers only after `delay`.
	struct SlowScorer {
		delay: Duration,
		calls: AtomicU32,
	}

	#[async_trait::async_trait]
	impl SimilarityScorer for SlowScorer {
		async fn score(&self, _a: &str, _b: &str) -> Result<f64, ScorerError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(self.delay).await;
			Ok(1.0)
		}
	}

	fn nz() -> FixedOffset {
		FixedOffset::east_opt(13 * 3600).unwrap()
	}

	fn mapping() -> AccountMapping {
		AccountMapping {
			source_account_id: "acc_123".to_string(),
			source_account_name: None,
			destination_system: DestinationSystem::Ynab,
			destination_account_id: "ynab-acc".to_string(),
			destination_budget_id: Some("budget_9".to_string()),
			tracking: false,
		}
	}

	fn transaction(id: &str, day: u32, amount: i64, description: &str) -> CanonicalTransaction {
		CanonicalTransaction {
			source_transaction_id: id.to_string(),
			source_account_id: "acc_123".to_string(),
			posted_at: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
			amount,
			currency: "NZD".to_string(),
			description: description.to_string(),
			payee: None,
			is_pending: false,
		}
	}

	fn candidate(id: &str, day: u32, amount: i64, payee: &str) -> DestinationTransaction {
		DestinationTransaction {
			id: id.to_string(),
			date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
			amount,
			payee: Some(payee.to_string()),
			memo: None,
			import_id: None,
		}
	}

	async fn store() -> SyncStateStore {
		SyncStateStore::with_repositories(
			Box::new(MemorySyncRecordRepository::default()),
			Box::new(MemoryCursorRepository::default()),
		)
		.await
		.unwrap()
	}

	fn engine(scorer: Option<Arc<dyn SimilarityScorer>>) -> DedupEngine {
		DedupEngine::new(MatchConfig::default(), scorer, nz())
	}

	#[tokio::test]
	async fn exact_record_wins() {
		let store = store().await;
		let tx = transaction("t1", 1, -500, "Cafe");
		store
			.insert_if_absent(SyncRecord::committed(&tx, &mapping(), "y1".to_string(), Utc::now()))
			.await
			.unwrap();

		let mut context = MatchContext::with_candidates(vec![candidate("y9", 1, -500, "Cafe")], HashSet::new());
		let result = engine(None).classify(&tx, &mapping(), &store, &mut context).await;
		assert_eq!(result, Classification::AlreadySynced { settles: None });
	}

	#[tokio::test]
	async fn exact_record_skips_the_scorer() {
		let store = store().await;
		let tx = transaction("t1", 1, -500, "Cafe Wellington");
		store
			.insert_if_absent(SyncRecord::committed(&tx, &mapping(), "y1".to_string(), Utc::now()))
			.await
			.unwrap();
		let scorer = Arc::new(FixedScorer {
			score: Ok(0.0),
			calls: AtomicU32::new(0),
		});

		// An ambiguous candidate would reach the scorer if the record check did not come first.
		let mut context = MatchContext::with_candidates(vec![candidate("y9", 1, -500, "Cafe")], HashSet::new());
		let result = engine(Some(scorer.clone()))
			.classify(&tx, &mapping(), &store, &mut context)
			.await;
		assert_eq!(result, Classification::AlreadySynced { settles: None });
		assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn rows_imported_for_synced_transactions_are_not_candidates() {
		let store = store().await;
		// A lost response left only a placeholder id for t1's row.
		let synced = transaction("t1", 1, -450, "AT HOP");
		store
			.insert_if_absent(SyncRecord::committed(
				&synced,
				&mapping(),
				"import:t1".to_string(),
				Utc::now(),
			))
			.await
			.unwrap();

		let mut writer = MockWriter::new(DestinationSystem::Ynab);
		writer.recent = vec![DestinationTransaction {
			import_id: Some("t1".to_string()),
			..candidate("9f1c-real", 1, -450, "AT HOP")
		}];
		let later = transaction("t2", 2, -450, "AT HOP");
		let engine = engine(None);

		let mut context = MatchContext::new();
		engine
			.prepare(&mut context, &writer, &mapping(), &store, &later)
			.await;
		assert_eq!(
			engine.classify(&later, &mapping(), &store, &mut context).await,
			Classification::New
		);

		// A row imported by someone else is still a duplicate.
		writer.recent[0].import_id = Some("YNAB:-450000:2024-03-01:1".to_string());
		let mut context = MatchContext::new();
		engine
			.prepare(&mut context, &writer, &mapping(), &store, &later)
			.await;
		assert_eq!(
			engine.classify(&later, &mapping(), &store, &mut context).await,
			Classification::ProbableDuplicate {
				destination_transaction_id: "9f1c-real".to_string()
			}
		);
	}

	#[tokio::test]
	async fn claimed_import_key_covers_commits_from_this_run() {
		let store = store().await;
		let mut context = MatchContext::with_candidates(
			vec![DestinationTransaction {
				import_id: Some("t1".to_string()),
				..candidate("9f1c-real", 1, -450, "AT HOP")
			}],
			HashSet::new(),
		);
		context.claim("import:t1", "t1");

		let result = engine(None)
			.classify(&transaction("t2", 2, -450, "AT HOP"), &mapping(), &store, &mut context)
			.await;
		assert_eq!(result, Classification::New);
	}

	#[tokio::test]
	async fn matching_destination_row_is_a_duplicate_once() {
		let store = store().await;
		let mut context = MatchContext::with_candidates(
			vec![candidate("y1", 2, -500, "CAFE")],
			HashSet::new(),
		);
		let engine = engine(None);

		let first = engine
			.classify(&transaction("t1", 1, -500, "Cafe"), &mapping(), &store, &mut context)
			.await;
		assert_eq!(
			first,
			Classification::ProbableDuplicate {
				destination_transaction_id: "y1".to_string()
			}
		);

		let second = engine
			.classify(&transaction("t2", 1, -500, "Cafe"), &mapping(), &store, &mut context)
			.await;
		assert_eq!(second, Classification::New);
	}

	#[tokio::test]
	async fn amount_and_date_window_gate_matches() {
		let store = store().await;
		let mut context = MatchContext::with_candidates(
			vec![candidate("y1", 1, -501, "Cafe"), candidate("y2", 10, -500, "Cafe")],
			HashSet::new(),
		);
		let result = engine(None)
			.classify(&transaction("t1", 1, -500, "Cafe"), &mapping(), &store, &mut context)
			.await;
		assert_eq!(result, Classification::New);
	}

	#[tokio::test]
	async fn claimed_rows_are_not_candidates() {
		let store = store().await;
		let mut claimed = HashSet::new();
		claimed.insert("y1".to_string());
		let mut context = MatchContext::with_candidates(vec![candidate("y1", 1, -500, "Cafe")], claimed);
		let result = engine(None)
			.classify(&transaction("t1", 1, -500, "Cafe"), &mapping(), &store, &mut context)
			.await;
		assert_eq!(result, Classification::New);
	}

	#[tokio::test]
	async fn scorer_breaks_ambiguous_ties() {
		let store = store().await;
		let scorer = Arc::new(FixedScorer {
			score: Ok(0.95),
			calls: AtomicU32::new(0),
		});
		let engine = engine(Some(scorer.clone()));
		// "cafe wellington" vs "cafe" has Jaccard 0.5: ambiguous.
		let mut context =
			MatchContext::with_candidates(vec![candidate("y1", 1, -500, "Cafe")], HashSet::new());

		let result = engine
			.classify(
				&transaction("t1", 1, -500, "Cafe Wellington"),
				&mapping(),
				&store,
				&mut context,
			)
			.await;
		assert_eq!(
			result,
			Classification::ProbableDuplicate {
				destination_transaction_id: "y1".to_string()
			}
		);
		assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failed_scorer_falls_back_to_records() {
		let store = store().await;
		let scorer = Arc::new(FixedScorer {
			score: Err(()),
			calls: AtomicU32::new(0),
		});
		let engine = engine(Some(scorer.clone()));
		let ambiguous = transaction("t1", 1, -500, "Cafe Wellington");

		let mut context =
			MatchContext::with_candidates(vec![candidate("y1", 1, -500, "Cafe")], HashSet::new());
		assert_eq!(
			engine.classify(&ambiguous, &mapping(), &store, &mut context).await,
			Classification::New
		);

		let earlier = transaction("t0", 2, -500, "Something else");
		store
			.insert_if_absent(SyncRecord::committed(&earlier, &mapping(), "y0".to_string(), Utc::now()))
			.await
			.unwrap();
		let mut context =
			MatchContext::with_candidates(vec![candidate("y1", 1, -500, "Cafe")], HashSet::new());
		assert_eq!(
			engine.classify(&ambiguous, &mapping(), &store, &mut context).await,
			Classification::AlreadySynced { settles: None }
		);
		assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn slow_scorer_falls_back_without_blocking() {
		let store = store().await;
		let scorer = Arc::new(SlowScorer {
			delay: Duration::from_secs(30),
			calls: AtomicU32::new(0),
		});
		let config = MatchConfig {
			scorer_timeout: Duration::from_millis(20),
			..MatchConfig::default()
		};
		let engine = DedupEngine::new(config, Some(scorer.clone()), nz());
		let ambiguous = transaction("t1", 1, -500, "Cafe Wellington");

		let mut context =
			MatchContext::with_candidates(vec![candidate("y1", 1, -500, "Cafe")], HashSet::new());
		let result = tokio::time::timeout(
			Duration::from_secs(5),
			engine.classify(&ambiguous, &mapping(), &store, &mut context),
		)
		.await
		.expect("classification waited for the scorer");
		// No prior record in the window, so the fallback treats it as new.
		assert_eq!(result, Classification::New);
		assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);

		let earlier = transaction("t0", 2, -500, "Something else");
		store
			.insert_if_absent(SyncRecord::committed(&earlier, &mapping(), "y0".to_string(), Utc::now()))
			.await
			.unwrap();
		let mut context =
			MatchContext::with_candidates(vec![candidate("y1", 1, -500, "Cafe")], HashSet::new());
		assert_eq!(
			engine.classify(&ambiguous, &mapping(), &store, &mut context).await,
			Classification::AlreadySynced { settles: None }
		);
	}

	#[tokio::test]
	async fn settled_transaction_links_to_pending() {
		let store = store().await;
		let mut pending = transaction("p1", 1, -2000, "CAFE 123");
		pending.is_pending = true;
		store
			.insert_if_absent(SyncRecord::committed(&pending, &mapping(), "y1".to_string(), Utc::now()))
			.await
			.unwrap();

		let settled = transaction("s1", 3, -2000, "CAFE 123");
		let result = engine(None)
			.classify(&settled, &mapping(), &store, &mut MatchContext::new())
			.await;
		assert_eq!(
			result,
			Classification::AlreadySynced {
				settles: Some("p1".to_string())
			}
		);

		let different_amount = transaction("s2", 3, -2100, "CAFE 123");
		let result = engine(None)
			.classify(&different_amount, &mapping(), &store, &mut MatchContext::new())
			.await;
		assert_eq!(result, Classification::New);
	}
}
