//! Optional tie-breaker for ambiguous duplicate matches
//!
//! When the description similarity of a candidate duplicate falls in the ambiguous band, the
//! dedup engine may ask an external scorer whether two descriptions refer to the same payee.
//! The scorer is never consulted for transactions that already have a sync record. It gets one
//! attempt bounded by the matching timeout; an unanswered call falls back to the record check.

/// OpenAI-compatible chat-completions scorer
mod openai;

pub use openai::OpenAiScorer;

/// Scores how likely two transaction descriptions refer to the same payee.
#[async_trait::async_trait]
pub trait SimilarityScorer: Send + Sync {
	/// Score in `[0.0, 1.0]`.
	async fn score(&self, a: &str, b: &str) -> Result<f64, ScorerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ScorerError {
	#[error("Scorer request failed: {0}")]
	Request(#[from] reqwest::Error),

	#[error("Scorer returned HTTP {status}: {body}")]
	Status { status: u16, body: String },

	#[error("Scorer response could not be used: {0}")]
	InvalidResponse(String),
}
