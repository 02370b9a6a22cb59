//! Coordination service client.
//!
//! The service registers trainers, hands out batches and collects scored
//! groups. Every call is a single JSON request/response. Transport errors
//! and `429`/`5xx` answers are retried with doubling backoff up to
//! `max_retries` attempts; any other non-2xx answer fails the call at once.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::convert::group::ScoredGroup;
use crate::error::{Error, Result};

const SERVICE: &str = "coordination service";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Run metadata sent on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub run_group: String,
    pub run_project: String,
    pub batch_size: usize,
    pub max_token_len: usize,
    pub checkpoint_dir: String,
    pub save_checkpoint_interval: u64,
    pub starting_step: u64,
    pub num_steps: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    uuid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    batch: Option<serde_json::Value>,
}

/// One scored group as the service stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredData {
    pub tokens: Vec<Vec<u32>>,
    pub masks: Vec<Vec<i64>>,
    pub scores: Vec<f64>,
    pub env_id: u64,
}

impl ScoredData {
    /// Payload for a tokenized group. The submitted scores are the group's
    /// centered advantages.
    pub fn from_group(group: &ScoredGroup, env_id: u64) -> Result<Self> {
        if !group.is_tokenized() {
            return Err(Error::Validation(
                "cannot submit a group without token data".into(),
            ));
        }
        Ok(Self {
            tokens: group.tokens.clone(),
            masks: group.masks.clone(),
            scores: group.advantages.clone(),
            env_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    api_base: String,
    env_id: u64,
    max_retries: u32,
    retry_backoff: Duration,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            env_id: config.env_id.unwrap_or(0),
            max_retries: config.max_retries.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            http,
        })
    }

    pub fn env_id(&self) -> u64 {
        self.env_id
    }

    /// Register this trainer and return the id the service assigned.
    pub async fn register(&self, registration: &Registration) -> Result<String> {
        let resp: RegisterResponse = self
            .request(Method::POST, "/register", Some(registration))
            .await?;
        let id = resp.uuid.unwrap_or_else(|| "trainer".to_string());
        info!(trainer_id = %id, run_group = %registration.run_group, "registered trainer");
        Ok(id)
    }

    /// The next batch, or `None` when the service has nothing ready.
    pub async fn get_batch(&self) -> Result<Option<serde_json::Value>> {
        let resp: BatchResponse = self.request::<(), _>(Method::GET, "/batch", None).await?;
        Ok(resp.batch.filter(|b| !b.is_null()))
    }

    pub async fn submit_scored_data(&self, data: &ScoredData) -> Result<()> {
        let _: serde_json::Value = self
            .request(Method::POST, "/scored_data", Some(data))
            .await?;
        debug!(group_size = data.scores.len(), env_id = data.env_id, "submitted scored data");
        Ok(())
    }

    pub async fn submit_group(&self, group: &ScoredGroup) -> Result<()> {
        self.submit_scored_data(&ScoredData::from_group(group, self.env_id)?)
            .await
    }

    pub async fn get_status(&self) -> Result<serde_json::Value> {
        self.request::<(), _>(Method::GET, "/status", None).await
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.api_base, path);
        let mut delay = self.retry_backoff;
        let mut attempt = 1;

        loop {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }

            let err = match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let text = resp.text().await?;
                    // Some endpoints answer with an empty body.
                    let body = if text.trim().is_empty() {
                        "null"
                    } else {
                        text.as_str()
                    };
                    return Ok(serde_json::from_str(body)?);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    let err = Error::Dependency {
                        service: SERVICE,
                        message: format!("{method} {path} returned {status}: {text}"),
                    };
                    if !is_retryable_status(status) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    err
                }
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            warn!(
                %method,
                path,
                attempt,
                max_attempts = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "coordination request failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
