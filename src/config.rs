//! Runtime settings loaded from the process environment (and `.env`).
//!
//! Credentials for the provider and destinations, sync targets, file locations, matching
//! thresholds and network limits all come from environment variables. They are layered with
//! figment: built-in defaults first, then `Env::raw()`, whose lowercased keys map one to one onto
//! the fields of `EnvSettings`. Validation happens after extraction, in [`SyncSettings::from_figment`].

use crate::budget::sync::dedup::MatchConfig;
use crate::budget::sync::fetcher::FetchConfig;
use crate::utils::RetryPolicy;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const AKAHU_ENDPOINT: &str = "https://api.akahu.io/v1";
pub const YNAB_ENDPOINT: &str = "https://api.ynab.com/v1";
pub const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Missing required environment variable: {0}")]
	Missing(String),

	#[error("Invalid value for {key}: {value:?}")]
	Invalid { key: String, value: String },

	#[error("Environment variable SYNC_TO_AB or SYNC_TO_YNAB must be True")]
	NoDestination,

	#[error("Invalid mapping file {path}: {reason}")]
	Mapping { path: String, reason: String },

	#[error("Failed to build HTTP client: {0}")]
	HttpClient(String),

	#[error(transparent)]
	Figment(#[from] figment::Error),
}

#[derive(Debug, Clone)]
pub struct AkahuSettings {
	pub endpoint: String,
	pub user_token: String,
	pub app_token: String,
}

#[derive(Debug, Clone)]
pub struct YnabSettings {
	pub endpoint: String,
	pub bearer_token: String,
	pub default_budget_id: Option<String>,
}

/// Actual Budget reached through an `actual-http-api` server.
#[derive(Debug, Clone)]
pub struct ActualSettings {
	pub server_url: String,
	pub api_key: String,
	pub sync_id: Option<String>,
	pub encryption_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScorerSettings {
	pub base_url: String,
	pub api_key: String,
	pub model: String,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
	pub akahu: AkahuSettings,
	pub ynab: Option<YnabSettings>,
	pub actual: Option<ActualSettings>,
	pub scorer: Option<ScorerSettings>,
	pub mapping_file: PathBuf,
	pub state_dir: PathBuf,
	pub matching: MatchConfig,
	pub fetch: FetchConfig,
	pub retry: RetryPolicy,
	pub max_concurrent_accounts: usize,
	/// Offset used to turn provider timestamps into budget dates.
	pub local_offset: FixedOffset,
}

/// Boolean switch as written in a `.env` file: `True`, `true`, `1` and `yes` all enable it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Flag {
	Bool(bool),
	Number(i64),
	Text(String),
}

impl Flag {
	fn is_set(&self) -> bool {
		match self {
			Flag::Bool(value) => *value,
			Flag::Number(value) => *value == 1,
			Flag::Text(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
		}
	}
}

impl Default for Flag {
	fn default() -> Self {
		Flag::Bool(false)
	}
}

/// Environment variables as extracted by figment, one field per (lowercased) variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct EnvSettings {
	sync_to_ynab: Flag,
	sync_to_ab: Flag,
	akahu_endpoint: String,
	akahu_user_token: Option<String>,
	akahu_app_token: Option<String>,
	ynab_endpoint: String,
	ynab_bearer_token: Option<String>,
	ynab_budget_id: Option<String>,
	actual_server_url: Option<String>,
	actual_api_key: Option<String>,
	actual_sync_id: Option<String>,
	actual_encryption_key: Option<String>,
	openai_api_key: Option<String>,
	openai_base_url: String,
	openai_model: String,
	mapping_file: PathBuf,
	sync_state_dir: PathBuf,
	match_date_window_days: i64,
	match_settle_window_days: i64,
	match_similarity_threshold: f64,
	match_ambiguous_floor: f64,
	match_recent_limit: usize,
	match_scorer_timeout_secs: u64,
	fetch_overlap_days: i64,
	fetch_default_start: Option<String>,
	fetch_include_pending: Flag,
	retry_max_attempts: u32,
	call_timeout_secs: u64,
	local_utc_offset_hours: i32,
	max_concurrent_accounts: usize,
}

impl Default for EnvSettings {
	fn default() -> Self {
		let matching = MatchConfig::default();
		let fetch = FetchConfig::default();
		let retry = RetryPolicy::default();
		Self {
			sync_to_ynab: Flag::default(),
			sync_to_ab: Flag::default(),
			akahu_endpoint: AKAHU_ENDPOINT.to_string(),
			akahu_user_token: None,
			akahu_app_token: None,
			ynab_endpoint: YNAB_ENDPOINT.to_string(),
			ynab_bearer_token: None,
			ynab_budget_id: None,
			actual_server_url: None,
			actual_api_key: None,
			actual_sync_id: None,
			actual_encryption_key: None,
			openai_api_key: None,
			openai_base_url: OPENAI_ENDPOINT.to_string(),
			openai_model: "gpt-4".to_string(),
			mapping_file: PathBuf::from("akahu_budget_mapping.json"),
			sync_state_dir: PathBuf::from("sync_state"),
			match_date_window_days: matching.date_window_days,
			match_settle_window_days: matching.settle_window_days,
			match_similarity_threshold: matching.similarity_threshold,
			match_ambiguous_floor: matching.ambiguous_floor,
			match_recent_limit: matching.recent_limit,
			match_scorer_timeout_secs: matching.scorer_timeout.as_secs(),
			fetch_overlap_days: fetch.overlap.num_days(),
			fetch_default_start: None,
			fetch_include_pending: Flag::Bool(fetch.include_pending),
			retry_max_attempts: retry.max_attempts,
			call_timeout_secs: retry.call_timeout.as_secs(),
			local_utc_offset_hours: 13,
			max_concurrent_accounts: 4,
		}
	}
}

impl SyncSettings {
	/// Load settings from the process environment.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_figment(&Self::figment())
	}

	/// Built-in defaults only, for layering other providers on top.
	pub fn defaults() -> Figment {
		Figment::from(Serialized::defaults(EnvSettings::default()))
	}

	/// Defaults overridden by every environment variable.
	pub fn figment() -> Figment {
		Self::defaults().merge(Env::raw())
	}

	pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
		let env: EnvSettings = figment.extract()?;

		let sync_to_ynab = env.sync_to_ynab.is_set();
		let sync_to_actual = env.sync_to_ab.is_set();
		if !sync_to_ynab && !sync_to_actual {
			return Err(ConfigError::NoDestination);
		}

		let akahu = AkahuSettings {
			endpoint: env.akahu_endpoint,
			user_token: required(env.akahu_user_token, "AKAHU_USER_TOKEN")?,
			app_token: required(env.akahu_app_token, "AKAHU_APP_TOKEN")?,
		};

		let ynab = if sync_to_ynab {
			Some(YnabSettings {
				endpoint: env.ynab_endpoint,
				bearer_token: required(env.ynab_bearer_token, "YNAB_BEARER_TOKEN")?,
				default_budget_id: non_empty(env.ynab_budget_id),
			})
		} else {
			None
		};

		let actual = if sync_to_actual {
			Some(ActualSettings {
				server_url: required(env.actual_server_url, "ACTUAL_SERVER_URL")?,
				api_key: required(env.actual_api_key, "ACTUAL_API_KEY")?,
				sync_id: non_empty(env.actual_sync_id),
				encryption_key: non_empty(env.actual_encryption_key),
			})
		} else {
			None
		};

		let scorer = non_empty(env.openai_api_key).map(|api_key| ScorerSettings {
			base_url: env.openai_base_url,
			api_key,
			model: env.openai_model,
		});

		let matching = MatchConfig {
			date_window_days: env.match_date_window_days,
			settle_window_days: env.match_settle_window_days,
			similarity_threshold: unit_interval(env.match_similarity_threshold, "MATCH_SIMILARITY_THRESHOLD")?,
			ambiguous_floor: unit_interval(env.match_ambiguous_floor, "MATCH_AMBIGUOUS_FLOOR")?,
			recent_limit: env.match_recent_limit,
			scorer_timeout: Duration::from_secs(env.match_scorer_timeout_secs),
		};
		if matching.ambiguous_floor > matching.similarity_threshold {
			return Err(ConfigError::Invalid {
				key: "MATCH_AMBIGUOUS_FLOOR".to_string(),
				value: matching.ambiguous_floor.to_string(),
			});
		}

		let fetch_defaults = FetchConfig::default();
		let fetch = FetchConfig {
			overlap: chrono::Duration::days(env.fetch_overlap_days),
			default_start: match non_empty(env.fetch_default_start) {
				Some(value) => parse_start(&value)?,
				None => fetch_defaults.default_start,
			},
			include_pending: env.fetch_include_pending.is_set(),
		};

		let retry = RetryPolicy {
			max_attempts: env.retry_max_attempts,
			call_timeout: Duration::from_secs(env.call_timeout_secs),
			..RetryPolicy::default()
		};

		let local_offset =
			FixedOffset::east_opt(env.local_utc_offset_hours * 3600).ok_or_else(|| ConfigError::Invalid {
				key: "LOCAL_UTC_OFFSET_HOURS".to_string(),
				value: env.local_utc_offset_hours.to_string(),
			})?;

		Ok(Self {
			akahu,
			ynab,
			actual,
			scorer,
			mapping_file: env.mapping_file,
			state_dir: env.sync_state_dir,
			matching,
			fetch,
			retry,
			max_concurrent_accounts: env.max_concurrent_accounts.max(1),
			local_offset,
		})
	}
}

fn non_empty(value: Option<String>) -> Option<String> {
	value
		.map(|value| value.trim().to_string())
		.filter(|value| !value.is_empty())
}

fn required(value: Option<String>, key: &str) -> Result<String, ConfigError> {
	non_empty(value).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn unit_interval(value: f64, key: &str) -> Result<f64, ConfigError> {
	if (0.0..=1.0).contains(&value) {
		Ok(value)
	} else {
		Err(ConfigError::Invalid {
			key: key.to_string(),
			value: value.to_string(),
		})
	}
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC).
fn parse_start(value: &str) -> Result<DateTime<Utc>, ConfigError> {
	if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
		return Ok(timestamp.with_timezone(&Utc));
	}
	NaiveDate::parse_from_str(value, "%Y-%m-%d")
		.ok()
		.and_then(|date| date.and_hms_opt(0, 0, 0))
		.map(|naive| naive.and_utc())
		.ok_or_else(|| ConfigError::Invalid {
			key: "FETCH_DEFAULT_START".to_string(),
			value: value.to_string(),
		})
}

#[cfg(test)]
mod tests {
	use super::*;
	use figment::Jail;

	fn base() -> Figment {
		SyncSettings::defaults()
			.merge(("akahu_user_token", "user"))
			.merge(("akahu_app_token", "app"))
			.merge(("sync_to_ynab", "True"))
			.merge(("ynab_bearer_token", "token"))
	}

	#[test]
	fn requires_at_least_one_destination() {
		let result = SyncSettings::from_figment(&SyncSettings::defaults().merge(("akahu_user_token", "user")));
		assert!(matches!(result, Err(ConfigError::NoDestination)));
	}

	#[test]
	fn reports_missing_credentials() {
		let figment = SyncSettings::defaults()
			.merge(("sync_to_ab", "True"))
			.merge(("akahu_user_token", "u"))
			.merge(("akahu_app_token", "a"));
		let result = SyncSettings::from_figment(&figment);
		assert!(matches!(result, Err(ConfigError::Missing(key)) if key == "ACTUAL_SERVER_URL"));
	}

	#[test]
	fn blank_credentials_count_as_missing() {
		let result = SyncSettings::from_figment(&base().merge(("ynab_bearer_token", "  ")));
		assert!(matches!(result, Err(ConfigError::Missing(key)) if key == "YNAB_BEARER_TOKEN"));
	}

	#[test]
	fn applies_defaults() {
		let settings = SyncSettings::from_figment(&base()).unwrap();
		assert!(settings.ynab.is_some());
		assert!(settings.actual.is_none());
		assert!(settings.scorer.is_none());
		assert_eq!(settings.mapping_file, PathBuf::from("akahu_budget_mapping.json"));
		assert_eq!(settings.matching.date_window_days, 3);
		assert_eq!(settings.fetch.overlap, chrono::Duration::days(7));
		assert!(!settings.fetch.include_pending);
		assert_eq!(settings.retry.max_attempts, 3);
		assert_eq!(settings.local_offset.local_minus_utc(), 13 * 3600);
	}

	#[test]
	fn overrides_matching_thresholds() {
		let figment = base()
			.merge(("match_date_window_days", 5))
			.merge(("match_similarity_threshold", 0.9))
			.merge(("fetch_default_start", "2023-06-01"))
			.merge(("openai_api_key", "sk-test"));
		let settings = SyncSettings::from_figment(&figment).unwrap();
		assert_eq!(settings.matching.date_window_days, 5);
		assert_eq!(settings.matching.similarity_threshold, 0.9);
		assert_eq!(settings.fetch.default_start.to_rfc3339(), "2023-06-01T00:00:00+00:00");
		assert_eq!(settings.scorer.unwrap().model, "gpt-4");
	}

	#[test]
	fn rejects_out_of_range_threshold() {
		let result = SyncSettings::from_figment(&base().merge(("match_similarity_threshold", 1.5)));
		assert!(matches!(result, Err(ConfigError::Invalid { key, .. }) if key == "MATCH_SIMILARITY_THRESHOLD"));
	}

	#[test]
	fn rejects_floor_above_threshold() {
		let figment = base()
			.merge(("match_similarity_threshold", 0.6))
			.merge(("match_ambiguous_floor", 0.7));
		let result = SyncSettings::from_figment(&figment);
		assert!(matches!(result, Err(ConfigError::Invalid { key, .. }) if key == "MATCH_AMBIGUOUS_FLOOR"));
	}

	#[test]
	fn rejects_impossible_utc_offset() {
		let result = SyncSettings::from_figment(&base().merge(("local_utc_offset_hours", 30)));
		assert!(matches!(result, Err(ConfigError::Invalid { key, .. }) if key == "LOCAL_UTC_OFFSET_HOURS"));
	}

	#[test]
	fn mistyped_number_is_a_figment_error() {
		let result = SyncSettings::from_figment(&base().merge(("match_recent_limit", "lots")));
		assert!(matches!(result, Err(ConfigError::Figment(_))));
	}

	#[test]
	fn reads_the_process_environment() {
		Jail::expect_with(|jail| {
			jail.set_env("AKAHU_USER_TOKEN", "user");
			jail.set_env("AKAHU_APP_TOKEN", "app");
			jail.set_env("SYNC_TO_AB", "True");
			jail.set_env("ACTUAL_SERVER_URL", "http://localhost:5007");
			jail.set_env("ACTUAL_API_KEY", "key");
			jail.set_env("FETCH_INCLUDE_PENDING", "yes");
			jail.set_env("MATCH_RECENT_LIMIT", "80");
			jail.set_env("MAX_CONCURRENT_ACCOUNTS", "0");

			let settings = SyncSettings::from_env().expect("settings load");
			let actual = settings.actual.expect("actual enabled");
			assert_eq!(actual.server_url, "http://localhost:5007");
			assert!(settings.fetch.include_pending);
			assert_eq!(settings.matching.recent_limit, 80);
			assert_eq!(settings.max_concurrent_accounts, 1);
			Ok(())
		});
	}
}
