//! OpenAI-compatible inference server client.
//!
//! Only two endpoints are used: `GET /health` to wait for the server to come
//! up, and `POST /v1/completions` to sample a raw-text completion.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::InferenceConfig;
use crate::error::{Error, Result};

const SERVICE: &str = "inference server";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: usize,
    pub text: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    pub choices: Vec<CompletionChoice>,
}

impl CompletionResponse {
    /// Text of the first choice.
    pub fn first_text(&self) -> Result<&str> {
        self.choices
            .first()
            .map(|c| c.text.as_str())
            .ok_or_else(|| Error::Dependency {
                service: SERVICE,
                message: "completion response has no choices".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InferenceClient {
    api_base: String,
    model_id: String,
    max_tokens: u32,
    temperature: f64,
    startup_timeout: Duration,
    poll_interval: Duration,
    http: reqwest::Client,
}

impl InferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model_id: config.model_id.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            http,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Whether `GET /health` answers with a 2xx status.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.api_base);
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "health probe failed");
                false
            }
        }
    }

    /// Poll `/health` until it succeeds or the startup timeout elapses.
    pub async fn wait_until_healthy(&self) -> Result<()> {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            if self.health().await {
                info!(
                    api_base = %self.api_base,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "inference server ready"
                );
                return Ok(());
            }
            polls += 1;
            if started.elapsed() >= self.startup_timeout {
                return Err(Error::Dependency {
                    service: SERVICE,
                    message: format!(
                        "not healthy after {}s ({polls} polls)",
                        self.startup_timeout.as_secs()
                    ),
                });
            }
            if polls % 10 == 0 {
                info!(polls, "still waiting for inference server");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Sample a completion of `prompt` with the configured model settings.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/v1/completions", self.api_base);
        let body = CompletionRequest {
            model: self.model_id.clone(),
            prompt: prompt.to_string(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        debug!(model = %self.model_id, prompt_chars = prompt.len(), "sending completion request");

        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Dependency {
                service: SERVICE,
                message: format!("POST /v1/completions returned {status}: {text}"),
            });
        }

        let parsed: CompletionResponse = resp.json().await?;
        let text = parsed.first_text()?.to_string();
        debug!(completion_chars = text.len(), "completion received");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_base() {
        let config = InferenceConfig {
            api_base: "http://localhost:9001/".into(),
            ..Default::default()
        };
        let client = InferenceClient::new(&config).unwrap();
        assert_eq!(client.api_base(), "http://localhost:9001");
    }

    #[test]
    fn test_completion_response_parse() {
        let resp: CompletionResponse = serde_json::from_str(
            r#"{"id": "cmpl-1", "choices": [{"index": 0, "text": " hello", "finish_reason": "length"}]}"#,
        )
        .unwrap();
        assert_eq!(resp.first_text().unwrap(), " hello");

        let empty: CompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        let err = empty.first_text().unwrap_err();
        assert!(matches!(err, Error::Dependency { .. }));
    }

    #[test]
    fn test_request_body_shape() {
        let req = CompletionRequest {
            model: "m".into(),
            prompt: "p".into(),
            max_tokens: 8,
            temperature: 0.5,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["max_tokens"], 8);
        assert_eq!(value["prompt"], "p");
    }

    #[tokio::test]
    async fn test_wait_until_healthy_times_out() {
        let config = InferenceConfig {
            // Reserved port; connection is refused immediately.
            api_base: "http://127.0.0.1:9".into(),
            startup_timeout_secs: 0,
            poll_interval_ms: 1,
            timeout_secs: 1,
            ..Default::default()
        };
        let client = InferenceClient::new(&config).unwrap();
        assert!(!client.health().await);
        let err = client.wait_until_healthy().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
