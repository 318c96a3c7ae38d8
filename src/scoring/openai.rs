use super::{ScorerError, SimilarityScorer};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You compare bank transaction descriptions. Reply with a single \
number between 0 and 1: the probability that both descriptions refer to the same payee.";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
	role: &'a str,
	content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
	model: &'a str,
	messages: Vec<ChatMessage<'a>>,
	temperature: f32,
	max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
	#[serde(default)]
	choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
	message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
	#[serde(default)]
	content: Option<String>,
}

/// Scorer backed by an OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiScorer {
	http_client: Client,
	base_url: String,
	api_key: String,
	model: String,
}

impl OpenAiScorer {
	pub fn new(
		base_url: String,
		api_key: String,
		model: String,
		timeout: Duration,
	) -> Result<Self, ScorerError> {
		Ok(Self {
			http_client: Client::builder().timeout(timeout).build()?,
			base_url: base_url.trim_end_matches('/').to_string(),
			api_key,
			model,
		})
	}
}

/// First number in `reply`, which must lie in `[0, 1]`.
fn parse_score(reply: &str) -> Result<f64, ScorerError> {
	let score = reply
		.split(|c: char| !(c.is_ascii_digit() || c == '.'))
		.find(|token| !token.is_empty() && token.chars().any(|c| c.is_ascii_digit()))
		.and_then(|token| token.trim_end_matches('.').parse::<f64>().ok())
		.ok_or_else(|| ScorerError::InvalidResponse(format!("no score in {:?}", reply)))?;

	if (0.0..=1.0).contains(&score) {
		Ok(score)
	} else {
		Err(ScorerError::InvalidResponse(format!(
			"score {} outside [0, 1]",
			score
		)))
	}
}

#[async_trait::async_trait]
impl SimilarityScorer for OpenAiScorer {
	async fn score(&self, a: &str, b: &str) -> Result<f64, ScorerError> {
		let request = ChatRequest {
			model: &self.model,
			messages: vec![
				ChatMessage {
					role: "system",
					content: SYSTEM_PROMPT.to_string(),
				},
				ChatMessage {
					role: "user",
					content: format!("A: {}\nB: {}", a, b),
				},
			],
			temperature: 0.0,
			max_tokens: 8,
		};

		let response = self
			.http_client
			.post(format!("{}/chat/completions", self.base_url))
			.bearer_auth(&self.api_key)
			.json(&request)
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(ScorerError::Status {
				status: status.as_u16(),
				body,
			});
		}

		let body: ChatResponse = response.json().await?;
		let reply = body
			.choices
			.into_iter()
			.next()
			.and_then(|choice| choice.message.content)
			.ok_or_else(|| ScorerError::InvalidResponse("empty completion".to_string()))?;

		let score = parse_score(&reply)?;
		debug!("Scorer rated {:?} vs {:?} at {}", a, b, score);
		Ok(score)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_plain_and_wrapped_scores() {
		assert_eq!(parse_score("0.92").unwrap(), 0.92);
		assert_eq!(parse_score("Score: 1").unwrap(), 1.0);
		assert_eq!(parse_score(" 0.3.").unwrap(), 0.3);
	}

	#[test]
	fn rejects_out_of_range_or_missing_scores() {
		assert!(matches!(parse_score("7"), Err(ScorerError::InvalidResponse(_))));
		assert!(matches!(parse_score("maybe"), Err(ScorerError::InvalidResponse(_))));
	}
}
