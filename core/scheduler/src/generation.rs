use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const MAX_OVERLOAD_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Canned fallback when generation is exhausted but a message still has to
/// go out (the one apology after an event burns its attempts).
pub const APOLOGY_TEXT: &str =
    "Sorry, I meant to send you something earlier but I couldn't get it together. I'm here now!";

#[derive(Debug, Error)]
pub enum GenerationError {
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

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub provider: GenerationProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationProvider {
    Ollama,
    OpenAi,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProvider::Ollama,
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_secs: 60,
        }
    }
}

impl GenerationConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let provider = std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "ollama".to_string())
            .to_lowercase();

        let provider = match provider.as_str() {
            "openai" => GenerationProvider::OpenAi,
            _ => GenerationProvider::Ollama,
        };

        let base_url = match provider {
            GenerationProvider::Ollama => {
                std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
            }
            GenerationProvider::OpenAi => std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
        };

        let model = match provider {
            GenerationProvider::Ollama => {
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2:3b".to_string())
            }
            GenerationProvider::OpenAi => {
                std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string())
            }
        };

        let api_key = if provider == GenerationProvider::OpenAi {
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
            timeout_secs: 60,
        })
    }
}

/// Client for free-form message generation. Unlike the memory service's
/// extraction calls, these responses are sent to the user verbatim, so no
/// JSON mode.
pub struct GenerationClient {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl GenerationClient {
    pub fn new(config: GenerationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self { config, client }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(GenerationConfig::from_env()?))
    }

    /// Generate message text, retrying on overload with exponential backoff
    /// up to the retry cap.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
        let mut attempt = 0;
        loop {
            let result = match self.config.provider {
                GenerationProvider::Ollama => self.call_ollama(system, prompt).await,
                GenerationProvider::OpenAi => self.call_openai(system, prompt).await,
            };

            match result {
                Err(GenerationError::Api { status, .. })
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
                Err(GenerationError::Api { status, body }) if is_overloaded(status) => {
                    debug!("Giving up after {} overload retries: {}", attempt, body);
                    return Err(GenerationError::Overloaded(attempt));
                }
                other => return other,
            }
        }
    }

    /// Structured variant for day planning: JSON mode, low temperature,
    /// same overload handling.
    pub async fn complete_json(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
        let mut attempt = 0;
        loop {
            let result = match self.config.provider {
                GenerationProvider::Ollama => self.call_ollama_json(system, prompt).await,
                GenerationProvider::OpenAi => self.call_openai_json(system, prompt).await,
            };

            match result {
                Err(GenerationError::Api { status, .. })
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
                Err(GenerationError::Api { status, body }) if is_overloaded(status) => {
                    debug!("Giving up after {} overload retries: {}", attempt, body);
                    return Err(GenerationError::Overloaded(attempt));
                }
                other => return other,
            }
        }
    }

    /// Call Ollama API
    async fn call_ollama(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "system": system,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.8,
                "num_predict": 512,
            }
        });

        debug!("Calling Ollama at {}", url);

        let response = self.client.post(&url).json(&request_body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api { status, body });
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response.json().await?;
        Ok(ollama_response.response)
    }

    async fn call_ollama_json(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
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

        debug!("Calling Ollama (json mode) at {}", url);

        let response = self.client.post(&url).json(&request_body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api { status, body });
        }

        #[derive(Deserialize)]
        struct OllamaResponse {
            response: String,
        }

        let ollama_response: OllamaResponse = response.json().await?;
        Ok(ollama_response.response)
    }

    async fn call_openai_json(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
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

        debug!("Calling OpenAI (json mode) at {}", url);

        let mut request = self.client.post(&url).json(&request_body);
        if let Some(ref api_key) = self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api { status, body });
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
            .ok_or(GenerationError::NoContent)
    }

    /// Call OpenAI-compatible API
    async fn call_openai(&self, system: &str, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.8,
            "max_tokens": 512
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
            return Err(GenerationError::Api { status, body });
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
            .ok_or(GenerationError::NoContent)
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

        let config = GenerationConfig::from_env().unwrap();
        assert_eq!(config.provider, GenerationProvider::Ollama);
        assert_eq!(config.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_overload_classification() {
        assert!(is_overloaded(429));
        assert!(is_overloaded(503));
        assert!(is_overloaded(529));
        assert!(!is_overloaded(404));
        assert!(!is_overloaded(500));
    }
}
