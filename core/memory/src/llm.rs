use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Bounded retries on upstream overload before giving up.
const MAX_OVERLOAD_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Error classes for calls into the generative backend. Overload is the
/// only retryable class; everything else surfaces immediately.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("backend overloaded after {0} retries")]
    Overloaded(u32),
    #[error("backend error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned no content")]
    NoContent,
}

fn is_overloaded(status: u16) -> bool {
    // 429 rate limit, 503 busy, 529 anthropic-style overload.
    matches!(status, 429 | 503 | 529)
}

/// Configuration for the generative-text backend
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmProvider {
    Ollama,
    OpenAi,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 30,
        }
    }
}

impl LlmConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "ollama".to_string())
            .to_lowercase();

        let provider = match provider.as_str() {
            "openai" => LlmProvider::OpenAi,
            _ => LlmProvider::Ollama,
        };

        let base_url = match provider {
            LlmProvider::Ollama => {
                std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
            }
            LlmProvider::OpenAi => std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
        };

        let model = match provider {
            LlmProvider::Ollama => {
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string())
            }
            LlmProvider::OpenAi => {
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
            }
        };

        let api_key = if provider == LlmProvider::OpenAi {
            Some(
                std::env::var("OPENAI_API_KEY")
                    .context("OPENAI_API_KEY required for OpenAI provider")?,
            )
        } else {
            None
        };

        Ok(Self {
            provider,
            api_key,
            base_url,
            model,
            timeout_secs: 30,
        })
    }
}

/// Client for the generative backend. The memory service only ever asks
/// for structured JSON (extraction diffs, consolidation plans); plain
/// generation lives with the scheduler.
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self { config, client }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(LlmConfig::from_env()?))
    }

    /// Request a JSON-mode completion, retrying on overload with
    /// exponential backoff up to the retry cap.
    pub async fn complete_json(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            let result = match self.config.provider {
                LlmProvider::Ollama => self.call_ollama(system, prompt).await,
                LlmProvider::OpenAi => self.call_openai(system, prompt).await,
            };

            match result {
                Err(LlmError::Api { status, .. })
                    if is_overloaded(status) && attempt < MAX_OVERLOAD_RETRIES =>
                {
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                    warn!(
                        "Backend overloaded ({}), retrying in {}ms (attempt {}/{})",
                        status,
                        delay,
                        attempt + 1,
                        MAX_OVERLOAD_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(LlmError::Api { status, body }) if is_overloaded(status) => {
                    debug!("Giving up after {} overload retries: {}", attempt, body);
                    return Err(LlmError::Overloaded(attempt));
                }
                other => return other,
            }
        }
    }

    /// Call Ollama API
    async fn call_ollama(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "system": system,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": {
                "temperature": 0.3,
                "num_predict": 1024,
            }
        });

        debug!("Calling Ollama at {}", url);

        let response = self.client.post(&url).json(&request_body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response.json().await?;
        Ok(ollama_response.response)
    }

    /// Call OpenAI-compatible API
    async fn call_openai(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.3,
            "max_tokens": 1024,
            "response_format": { "type": "json_object" }
        });

        debug!("Calling OpenAI at {}", url);

        let mut request = self.client.post(&url).json(&request_body);
        if let Some(ref api_key) = self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        #[derive(Deserialize)]
        struct OpenAiResponse {
            choices: Vec<OpenAiChoice>,
        }

        #[derive(Deserialize)]
        struct OpenAiChoice {
            message: OpenAiMessage,
        }

        #[derive(Deserialize)]
        struct OpenAiMessage {
            content: String,
        }

        let openai_response: OpenAiResponse = response.json().await?;

        openai_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or(LlmError::NoContent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        std::env::set_var("LLM_PROVIDER", "ollama");
        std::env::set_var("OLLAMA_URL", "http://localhost:11434");
        std::env::set_var("OLLAMA_MODEL", "llama3.2:3b");

        let config = LlmConfig::from_env().unwrap();
        assert_eq!(config.provider, LlmProvider::Ollama);
        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.model, "llama3.2:3b");
    }

    #[test]
    fn test_overload_classification() {
        assert!(is_overloaded(429));
        assert!(is_overloaded(503));
        assert!(is_overloaded(529));
        assert!(!is_overloaded(400));
        assert!(!is_overloaded(500));
    }
}
