//! Account mapping table written by the mapping wizard.
//!
//! The file lists known Akahu and destination accounts plus, per Akahu account, the YNAB and/or
//! Actual account it feeds. Each linked destination becomes one [`AccountMapping`]. A source
//! account with no entry is not synced.

use crate::budget::types::{AccountMapping, DestinationSystem, SourceAccount};
use crate::config::ConfigError;

use itertools::Itertools;
use serde::Deserialize;
use serde::de::IgnoredAny;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// The wizard's file. Every section must be present even when empty.
#[derive(Debug, Deserialize)]
struct MappingFile {
	akahu_accounts: BTreeMap<String, KnownAccount>,
	#[serde(rename = "actual_accounts")]
	_actual_accounts: IgnoredAny,
	#[serde(rename = "ynab_accounts")]
	_ynab_accounts: IgnoredAny,
	mapping: MappingEntries,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MappingEntries {
	ById(BTreeMap<String, MappingEntry>),
	/// Older files store a list of entries carrying their own id.
	Listed(Vec<MappingEntry>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MappingEntry {
	akahu_id: Option<String>,
	akahu_name: Option<String>,
	/// "On Budget" or "Tracking".
	account_type: Option<String>,
	ynab_account_id: Option<String>,
	ynab_budget_id: Option<String>,
	ynab_do_not_map: bool,
	actual_account_id: Option<String>,
	actual_budget_id: Option<String>,
	actual_do_not_map: bool,
}

impl MappingEntry {
	fn is_tracking(&self) -> bool {
		self.account_type
			.as_deref()
			.is_some_and(|kind| kind.trim().eq_ignore_ascii_case("tracking"))
	}

	/// Destination account and budget for `system`, unless unlinked or marked do-not-map.
	fn link(&self, system: DestinationSystem) -> Option<(String, Option<String>)> {
		let (account_id, budget_id, do_not_map) = match system {
			DestinationSystem::Ynab => (
				&self.ynab_account_id,
				&self.ynab_budget_id,
				self.ynab_do_not_map,
			),
			DestinationSystem::ActualBudget => (
				&self.actual_account_id,
				&self.actual_budget_id,
				self.actual_do_not_map,
			),
		};
		if do_not_map {
			return None;
		}
		Some((non_empty(account_id)?, non_empty(budget_id)))
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KnownAccount {
	name: Option<String>,
	connection: Option<Named>,
	currency: Option<String>,
}

/// A plain name or an object carrying one, as connections are stored both ways.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Named {
	Plain(String),
	Object { name: String },
}

impl Named {
	fn name(&self) -> &str {
		match self {
			Named::Plain(name) | Named::Object { name } => name,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSource {
	File,
	/// No mapping file yet; nothing will be synced.
	Missing,
}

/// Mappings loaded for one run.
#[derive(Debug, Clone)]
pub struct MappingTable {
	pub entries: Vec<AccountMapping>,
	/// Account snapshots recorded by the wizard, used when the provider cannot be reached.
	pub known_accounts: Vec<SourceAccount>,
	pub source: MappingSource,
}

impl MappingTable {
	pub fn empty() -> Self {
		Self {
			entries: Vec::new(),
			known_accounts: Vec::new(),
			source: MappingSource::Missing,
		}
	}

	/// Read the mapping file. A missing file yields an empty table.
	pub async fn load(path: &Path) -> Result<Self, ConfigError> {
		let content = match tokio::fs::read_to_string(path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				warn!("Mapping file {:?} not found - first run ever?", path);
				return Ok(Self::empty());
			}
			Err(e) => return Err(mapping_error(path, e.to_string())),
		};

		let table = Self::parse(&content, path)?;
		info!(
			"Loaded {} account mappings from {:?}",
			table.entries.len(),
			path
		);
		Ok(table)
	}

	pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
		let file: MappingFile =
			serde_json::from_str(content).map_err(|e| mapping_error(path, e.to_string()))?;

		let entries: Vec<(String, MappingEntry)> = match file.mapping {
			MappingEntries::ById(entries) => entries.into_iter().collect(),
			MappingEntries::Listed(entries) => entries
				.into_iter()
				.filter_map(|entry| non_empty(&entry.akahu_id).map(|akahu_id| (akahu_id, entry)))
				.collect(),
		};

		let mut mappings = Vec::new();
		for (akahu_id, entry) in entries {
			let tracking = entry.is_tracking();
			for system in [DestinationSystem::Ynab, DestinationSystem::ActualBudget] {
				let Some((account_id, budget_id)) = entry.link(system) else {
					continue;
				};
				if tracking {
					debug!("{} is a tracking account in {}", akahu_id, system);
				}
				mappings.push(AccountMapping {
					source_account_id: akahu_id.clone(),
					source_account_name: non_empty(&entry.akahu_name),
					destination_system: system,
					destination_account_id: account_id,
					destination_budget_id: budget_id,
					tracking,
				});
			}
		}

		let known_accounts = file
			.akahu_accounts
			.into_iter()
			.map(|(id, account)| SourceAccount {
				display_name: non_empty(&account.name).unwrap_or_else(|| id.clone()),
				connection_name: account
					.connection
					.as_ref()
					.map(|connection| connection.name().trim().to_string())
					.unwrap_or_default(),
				currency: non_empty(&account.currency).unwrap_or_else(|| "NZD".to_string()),
				balance: None,
				id,
			})
			.collect();

		Ok(Self {
			entries: mappings,
			known_accounts,
			source: MappingSource::File,
		})
	}

	/// Mappings grouped by source account.
	pub fn by_source_account(&self) -> BTreeMap<String, Vec<AccountMapping>> {
		self.entries
			.iter()
			.cloned()
			.map(|mapping| (mapping.source_account_id.clone(), mapping))
			.into_group_map()
			.into_iter()
			.collect()
	}

	/// Snapshot for `source_account_id` built from the file, for use without the provider.
	///
	/// File snapshots carry no balance.
	pub fn known_account(&self, source_account_id: &str) -> SourceAccount {
		self.known_accounts
			.iter()
			.find(|account| account.id == source_account_id)
			.cloned()
			.unwrap_or_else(|| SourceAccount {
				id: source_account_id.to_string(),
				display_name: self
					.entries
					.iter()
					.find(|mapping| mapping.source_account_id == source_account_id)
					.and_then(|mapping| mapping.source_account_name.clone())
					.unwrap_or_else(|| source_account_id.to_string()),
				connection_name: String::new(),
				currency: "NZD".to_string(),
				balance: None,
			})
	}
}

fn non_empty(value: &Option<String>) -> Option<String> {
	value
		.as_deref()
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(str::to_string)
}

fn mapping_error(path: &Path, reason: impl Into<String>) -> ConfigError {
	ConfigError::Mapping {
		path: path.display().to_string(),
		reason: reason.into(),
	}
}
