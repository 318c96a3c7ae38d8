//! Budget Synchronization Module
//!
//! This module holds the core logic for pushing provider transactions into budgeting back ends.
//! It is composed of several submodules, each responsible for one aspect of a sync run:
//!
//! - `orchestrator`: Entry point for a run. Loads the mapping, drives one pipeline per account and builds the summary.
//! - `fetcher`: Pulls accounts and transactions from the provider as an oldest-first stream.
//! - `transaction_processor`: Normalizes raw provider transactions into canonical ones.
//! - `mapping`: Reads the account mapping file written by the mapping wizard.
//! - `dedup`: Classifies each transaction as new, already synced or a probable duplicate.
//! - `similarity`: Description similarity used by the dedup engine.
//! - `state_persistence`: Sync records and cursors, the durable proof of what was committed.
//! - `repositories`: Storage backends for the sync state.
//! - `events`: Event types and handlers for following a run.
//! - `progress_tracker`: Per-account counters and the run summary.
//!
//! A transaction is committed to a destination at most once: the sync record written after a
//! successful write is what every later run checks first.

/// Duplicate detection
pub mod dedup;
/// Event system for following a run
pub mod events;
/// Provider transaction stream
pub mod fetcher;
/// Account mapping table
pub mod mapping;
/// Main coordinator for a sync run
pub mod orchestrator;
/// Run and account summaries
pub mod progress_tracker;
/// Storage backends for sync state
pub mod repositories;
/// Description similarity
pub mod similarity;
/// Sync records and cursors
pub mod state_persistence;
/// Provider transaction normalization
pub mod transaction_processor;
