mod budget;
mod config;
mod destination;
mod provider;
mod scoring;
mod utils;

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::budget::BudgetSyncService;
use crate::config::SyncSettings;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	// Settings may come from a .env file next to the binary
	dotenvy::dotenv().ok();

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,akahu_budget_sync=debug")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting Akahu budget sync");

	let settings = match SyncSettings::from_env() {
		Ok(settings) => settings,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let service = match BudgetSyncService::from_settings(&settings).await {
		Ok(service) => Arc::new(service),
		Err(e) => {
			error!("Failed to start budget sync service: {}", e);
			return ExitCode::FAILURE;
		}
	};

	// Ctrl-C stops the run from starting further accounts; accounts in flight finish.
	let signal_service = service.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("Interrupt received");
			signal_service.cancel_current_run();
		}
	});

	let summary = match service.run_sync_now().await {
		Ok(summary) => summary,
		Err(e) => {
			error!("Sync failed: {}", e);
			return ExitCode::FAILURE;
		}
	};

	match serde_json::to_string_pretty(&summary) {
		Ok(json) => println!("{}", json),
		Err(e) => error!("Failed to serialize run summary: {}", e),
	}

	if summary.total_failed() > 0 {
		warn!("{} transaction writes failed; they will be retried next run", summary.total_failed());
	}
	ExitCode::SUCCESS
}
