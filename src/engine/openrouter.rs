use super::parse::parse_turn;
use super::prompts::{render_user, system_prompt};
use super::{ReasoningEngine, ReasoningRequest, ReasoningTurn};
use crate::util::truncate;
use serde::{Deserialize, Serialize};

/// OpenRouter direct API URL
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

const MAX_TOKENS: u32 = 8192;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions engine in JSON mode.
#[derive(Debug, Clone)]
pub struct OpenRouterEngine {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterEngine {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: MAX_TOKENS,
            stream: false,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("X-Title", "apimend")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to parse OpenRouter response: {}\n{}",
                        e,
                        truncate(&text, 500)
                    )
                })?;
                return Ok(parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default());
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let backoff_ms = INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1);
                eprintln!(
                    "  OpenRouter rate limited. Retrying in {}s (attempt {}/{})",
                    backoff_ms / 1000,
                    retry_count,
                    MAX_RETRIES
                );
                tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
                continue;
            }

            let message = match status.as_u16() {
                401 => "Invalid API key. Set OPENROUTER_API_KEY to a valid key.".to_string(),
                429 => format!(
                    "Rate limited by OpenRouter after {} retries. Try again in a few minutes.",
                    retry_count
                ),
                500..=599 => format!(
                    "OpenRouter server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => format!("API error {}: {}", status, truncate(&text, 200)),
            };
            return Err(anyhow::anyhow!("{}", message));
        }
    }
}

impl ReasoningEngine for OpenRouterEngine {
    async fn respond(&self, request: &ReasoningRequest) -> anyhow::Result<ReasoningTurn> {
        let content = self
            .complete(system_prompt(request.task), &render_user(request))
            .await?;
        let turn = parse_turn(&content)?;
        tracing::debug!(
            invocations = turn.invocations.len(),
            signal = ?turn.signal,
            "engine turn parsed"
        );
        Ok(turn)
    }
}
