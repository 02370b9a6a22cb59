use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::convert::{ConverterConfig, GroupConfig};
use crate::error::Result;
use crate::reward::normalizer::NormalizerMode;
use crate::training::trainer::BackendChoice;

/// Complete configuration for the trajectory-to-GRPO pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub converter: ConverterConfig,
    pub group: GroupConfig,
    pub data: DataConfig,
    pub grpo: GrpoConfig,
    pub model: ModelConfig,
    pub coordinator: CoordinatorConfig,
    pub inference: InferenceConfig,
    /// Running statistics kept over raw group scores (default: cumulative).
    pub normalizer: NormalizerMode,
}

/// Where trajectories come from and how they are grouped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory of trajectory JSON files (default: "trajectories").
    pub source_dir: PathBuf,
    /// Optional JSON file of ground-truth market outcomes keyed by window id.
    pub outcomes_file: Option<PathBuf>,
    /// Windows with fewer trajectories are skipped (default: 2).
    pub min_agents_per_window: usize,
    /// Trajectories with fewer steps are skipped (default: 3).
    pub min_actions_per_trajectory: usize,
    /// Skip trajectories without any recorded LLM call (default: true).
    pub require_llm_calls: bool,
    /// Seed for group shuffling and sampling.
    pub seed: Option<u64>,
}

/// GRPO optimization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpoConfig {
    /// AdamW learning rate (default: 1e-5).
    pub learning_rate: f64,
    /// AdamW weight decay (default: 0.01).
    pub weight_decay: f64,
    /// Logit temperature (default: 1.0).
    pub temperature: f64,
    /// Entropy bonus coefficient (default: 0.01).
    pub entropy_coeff: f64,
    /// Sequences per mini-batch for gradient accumulation (default: 2).
    pub mini_batch_size: usize,
    /// Global gradient norm clip (default: 1.0).
    pub max_grad_norm: f64,
    /// Optimizer steps to run (default: 100).
    pub training_steps: u64,
    /// Save a checkpoint every N steps; 0 disables (default: 10).
    pub checkpoint_interval: u64,
    /// Root directory for `step-<n>` checkpoints (default: "checkpoints").
    pub checkpoint_dir: PathBuf,
    /// Resume from the latest checkpoint under `checkpoint_dir` (default: true).
    pub resume: bool,
}

/// Local model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Name reported to the coordination service.
    pub model_name: String,
    /// Path to a HuggingFace `tokenizer.json`.
    pub tokenizer_path: Option<PathBuf>,
    /// Prepend the tokenizer's BOS token (default: true).
    pub add_bos: bool,
    /// Vocabulary size of the local policy; the tokenizer's is used when larger.
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    /// Compute backend (default: auto).
    pub backend: BackendChoice,
}

/// Coordination service client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Base URL (default: "http://localhost:8000"). `ATROPOS_API_URL` overrides.
    pub api_base: String,
    /// Environment id attached to submitted groups.
    pub env_id: Option<u64>,
    pub wandb_group: String,
    pub wandb_project: String,
    /// Batch size announced at registration (default: 32).
    pub batch_size: usize,
    /// Longest token sequence announced at registration (default: 2048).
    pub max_token_len: usize,
    /// Per-request timeout (default: 30).
    pub timeout_secs: u64,
    /// Attempts per call before giving up (default: 3).
    pub max_retries: u32,
    /// Delay before the first retry, doubled each attempt (default: 500).
    pub retry_backoff_ms: u64,
}

/// Inference server client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL (default: "http://localhost:9001"). `INFERENCE_API_URL` overrides.
    pub api_base: String,
    pub model_id: String,
    /// Completion length cap (default: 512).
    pub max_tokens: u32,
    /// Sampling temperature (default: 0.7).
    pub temperature: f64,
    /// Per-request timeout (default: 60).
    pub timeout_secs: u64,
    /// How long to wait for the server to report healthy (default: 120).
    pub startup_timeout_secs: u64,
    /// Delay between health polls (default: 2000).
    pub poll_interval_ms: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("trajectories"),
            outcomes_file: None,
            min_agents_per_window: 2,
            min_actions_per_trajectory: 3,
            require_llm_calls: true,
            seed: None,
        }
    }
}

impl Default for GrpoConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            weight_decay: 0.01,
            temperature: 1.0,
            entropy_coeff: 0.01,
            mini_batch_size: 2,
            max_grad_norm: 1.0,
            training_steps: 100,
            checkpoint_interval: 10,
            checkpoint_dir: PathBuf::from("checkpoints"),
            resume: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: "Qwen/Qwen2.5-0.5B-Instruct".into(),
            tokenizer_path: None,
            add_bos: true,
            vocab_size: 32_000,
            hidden_size: 64,
            num_layers: 2,
            backend: BackendChoice::Auto,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".into(),
            env_id: None,
            wandb_group: "grpo-forge".into(),
            wandb_project: "grpo-forge".into(),
            batch_size: 32,
            max_token_len: 2048,
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:9001".into(),
            model_id: "Qwen/Qwen2.5-0.5B-Instruct".into(),
            max_tokens: 512,
            temperature: 0.7,
            timeout_secs: 60,
            startup_timeout_secs: 120,
            poll_interval_ms: 2000,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file. Missing sections and fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Replace service URLs and the trajectory directory from the
    /// environment when set.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("ATROPOS_API_URL") {
            self.coordinator.api_base = url;
        }
        if let Some(url) = non_empty("INFERENCE_API_URL") {
            self.inference.api_base = url;
        }
        if let Some(dir) = non_empty("TRAJECTORY_DIR") {
            self.data.source_dir = PathBuf::from(dir);
        }
    }
}
