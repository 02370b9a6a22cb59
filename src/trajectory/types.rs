//! Core trajectory data types read from the trajectory source.
//!
//! Field names accept both the snake_case and camelCase spellings produced by
//! the different recorders (`agent_balance` / `agentBalance`, `llm_calls` /
//! `llmCalls`, ...). The aliases live here, on the canonical types, so that no
//! scoring or conversion code ever has to look at the raw key spelling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Balance assumed when neither step data nor trajectory totals provide one.
pub const DEFAULT_STARTING_BALANCE: f64 = 10_000.0;

// ---------------------------------------------------------------------------
// Environment snapshot
// ---------------------------------------------------------------------------

/// The agent's account state at the time a step was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    #[serde(default = "default_balance", alias = "agentBalance", alias = "balance")]
    pub agent_balance: f64,
    #[serde(default, alias = "agentPnL", alias = "agentPnl", alias = "pnl")]
    pub agent_pnl: f64,
    #[serde(default, alias = "openPositions")]
    pub open_positions: u32,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self {
            agent_balance: DEFAULT_STARTING_BALANCE,
            agent_pnl: 0.0,
            open_positions: 0,
        }
    }
}

fn default_balance() -> f64 {
    DEFAULT_STARTING_BALANCE
}

// ---------------------------------------------------------------------------
// LLM call
// ---------------------------------------------------------------------------

/// A single model invocation made by the agent during a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmCall {
    #[serde(default)]
    pub model: String,
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: String,
    #[serde(default, alias = "userPrompt")]
    pub user_prompt: String,
    #[serde(default)]
    pub response: String,
    /// Separate chain-of-thought text, when the recorder captured it.
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    /// What the call was for (e.g. "action", "reasoning", "evaluation").
    #[serde(default)]
    pub purpose: String,
}

impl LlmCall {
    /// The text the quality evaluator should inspect for reasoning: the
    /// dedicated reasoning field when present, the response otherwise.
    pub fn reasoning_text(&self) -> &str {
        match self.reasoning.as_deref() {
            Some(r) if !r.trim().is_empty() => r,
            _ => &self.response,
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The action the agent took at the end of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default = "default_action_type", alias = "actionType", alias = "type")]
    pub action_type: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl Action {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            parameters: serde_json::Map::new(),
            success: true,
            reasoning: None,
        }
    }
}

fn default_action_type() -> String {
    "wait".to_string()
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One decision point within a trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, alias = "stepNumber")]
    pub step_number: u32,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, alias = "environmentState")]
    pub environment_state: EnvironmentState,
    #[serde(default, alias = "llmCalls")]
    pub llm_calls: Vec<LlmCall>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub reward: f64,
}

impl Step {
    /// A step with recorded model interactions contributes format and
    /// reasoning signal; one without is only scored through its action.
    pub fn is_scorable(&self) -> bool {
        !self.llm_calls.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// A complete recorded episode for one agent in one time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "trajectoryId")]
    pub trajectory_id: String,
    #[serde(default, alias = "agentId")]
    pub agent_id: String,
    #[serde(default, alias = "windowId")]
    pub window_id: String,
    #[serde(default, alias = "scenarioId")]
    pub scenario_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, alias = "totalReward")]
    pub total_reward: f64,
    #[serde(default, alias = "finalPnL", alias = "finalPnl")]
    pub final_pnl: f64,
    #[serde(default, alias = "finalBalance")]
    pub final_balance: Option<f64>,
    #[serde(default, alias = "episodeLength")]
    pub episode_length: u32,
    #[serde(default, alias = "tradesExecuted")]
    pub trades_executed: Option<u32>,
    #[serde(default)]
    pub archetype: Option<String>,
    #[serde(default, alias = "finalStatus")]
    pub final_status: Option<String>,
}

impl Trajectory {
    /// Total number of LLM calls recorded across all steps.
    pub fn llm_call_count(&self) -> usize {
        self.steps.iter().map(|s| s.llm_calls.len()).sum()
    }

    /// Number of steps that carried an action.
    pub fn action_count(&self) -> usize {
        self.steps.iter().filter(|s| s.action.is_some()).count()
    }

    /// Number of actions that were reported as successful.
    pub fn successful_action_count(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|s| s.action.as_ref())
            .filter(|a| a.success)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Ground-truth market context
// ---------------------------------------------------------------------------

/// What actually happened to one instrument over the trajectory's window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentOutcome {
    #[serde(default, alias = "startPrice")]
    pub start_price: f64,
    #[serde(default, alias = "endPrice")]
    pub end_price: f64,
    #[serde(default, alias = "changePercent")]
    pub change_percent: f64,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default, alias = "newsEvents")]
    pub news_events: Vec<String>,
}

/// Ground-truth outcomes for a time window, keyed by ticker.
///
/// A `BTreeMap` keeps the rendered system message stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketOutcomes {
    #[serde(default, alias = "windowId")]
    pub window_id: String,
    #[serde(default)]
    pub stocks: BTreeMap<String, InstrumentOutcome>,
}
