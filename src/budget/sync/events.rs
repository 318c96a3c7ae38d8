//! Event system for budget synchronization.
//!
//! The orchestrator reports what it is doing as [`SyncEvent`]s: run and account state changes,
//! classifications, commits and failures. Registered handlers receive every event; this is the
//! status callback surface for anything that wants to follow a run (logging, a UI, a webhook
//! front end). Handler failures are logged and never affect the run.

use crate::budget::sync::dedup::Classification;
use crate::budget::sync::progress_tracker::{AccountState, RunState};
use crate::budget::types::{DestinationSystem, SyncError};
use crate::utils::format_minor_units;

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Events that occur during a sync run
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The run moved to a new state
    RunStateChanged { state: RunState },
    /// An account pipeline moved to a new state
    AccountStateChanged {
        source_account_id: String,
        state: AccountState,
    },
    /// A transaction was classified for one destination
    TransactionClassified {
        source_transaction_id: String,
        destination_system: DestinationSystem,
        classification: Classification,
    },
    /// A transaction was written and recorded
    TransactionCommitted {
        source_transaction_id: String,
        destination_system: DestinationSystem,
        destination_transaction_id: String,
        amount: i64,
        currency: String,
    },
    /// A write or record for one (transaction, destination) pair failed
    WriteFailed {
        source_transaction_id: String,
        destination_system: DestinationSystem,
        reason: String,
    },
    /// An account could not be processed
    AccountFailed {
        source_account_id: String,
        reason: String,
    },
}

/// Trait for handling sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in registration order. Accounts are processed concurrently, so events
/// from different accounts may interleave.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    pub async fn dispatch(&self, event: SyncEvent) {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(&event).await {
                error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

/// Handler that writes the event stream to the log.
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingEventHandler {
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::RunStateChanged { state } => info!("Sync run {:?}", state),
            SyncEvent::AccountStateChanged {
                source_account_id,
                state,
            } => debug!("Account {} {:?}", source_account_id, state),
            SyncEvent::TransactionClassified {
                source_transaction_id,
                destination_system,
                classification,
            } => debug!(
                "{} for {}: {:?}",
                source_transaction_id, destination_system, classification
            ),
            SyncEvent::TransactionCommitted {
                source_transaction_id,
                destination_system,
                destination_transaction_id,
                amount,
                currency,
            } => info!(
                "Committed {} ({}) to {} as {}",
                source_transaction_id,
                format_minor_units(*amount, currency),
                destination_system,
                destination_transaction_id
            ),
            SyncEvent::WriteFailed {
                source_transaction_id,
                destination_system,
                reason,
            } => warn!(
                "Failed to sync {} to {}: {}",
                source_transaction_id, destination_system, reason
            ),
            SyncEvent::AccountFailed {
                source_account_id,
                reason,
            } => error!("Account {} failed: {}", source_account_id, reason),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingEventHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::types::FetchError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SyncEventHandler for Recorder {
        async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
            self.events.lock().unwrap().push(format!("{:?}", event));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Recorder"
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl SyncEventHandler for Failing {
        async fn handle(&self, _event: &SyncEvent) -> Result<(), SyncError> {
            Err(SyncError::Fetch(FetchError::Unavailable(
                "callback endpoint down".to_string(),
            )))
        }

        fn name(&self) -> &'static str {
            "Failing"
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(Failing));
        dispatcher.register_handler(recorder.clone());
        dispatcher.register_handler(Arc::new(LoggingEventHandler));

        dispatcher
            .dispatch(SyncEvent::RunStateChanged {
                state: RunState::MappingLoaded,
            })
            .await;

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("MappingLoaded"));
    }
}
