//! Trajectory to training-sample conversion.
//!
//! A trajectory becomes a role-tagged conversation (one system message with
//! the ground-truth context, then the agent's user/assistant exchanges), a
//! scalar score from the reward scorer, and, when a tokenizer is supplied,
//! aligned token and mask sequences.

use std::fmt::Write as _;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convert::mask::create_masks;
use crate::error::{Error, Result};
use crate::model::tokenizer::{ChatMessage, ChatTokenizer};
use crate::reward::quality::quality;
use crate::reward::scorer::{risk_reward, CompositeScorer, RewardInputs, Scorer};
use crate::trajectory::types::{MarketOutcomes, Step, Trajectory, DEFAULT_STARTING_BALANCE};

/// Upper bound for the augmentation dropout rate.
pub const MAX_DROPOUT_RATE: f64 = 0.5;

/// Responses shorter than this are not used as supervised samples.
pub const MIN_RESPONSE_CHARS: usize = 20;

/// Exposure attributed to each open position when estimating risk.
const EXPOSURE_PER_POSITION: f64 = 0.1;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Probability in `[0, 0.5]` of dropping a trajectory for augmentation.
    pub dropout_rate: f64,
    /// Only the last `max_steps` steps of a trajectory are converted.
    pub max_steps: usize,
    /// Keep the role-tagged messages on built groups.
    pub include_messages: bool,
    /// Seed for the dropout draw. Random when unset.
    pub seed: Option<u64>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            dropout_rate: 0.0,
            max_steps: 20,
            include_messages: true,
            seed: None,
        }
    }
}

impl ConverterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=MAX_DROPOUT_RATE).contains(&self.dropout_rate) {
            return Err(Error::InvalidDropoutRate(self.dropout_rate));
        }
        if self.max_steps == 0 {
            return Err(Error::Validation("max_steps must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Per-trajectory bookkeeping carried alongside the converted sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryMetadata {
    pub trajectory_id: String,
    pub agent_id: String,
    pub window_id: String,
    pub final_pnl: f64,
    pub episode_length: u32,
    pub trades_executed: u32,
    pub format_score: f64,
    pub reasoning_score: f64,
    pub risk_penalties: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertedTrajectory {
    pub messages: Vec<ChatMessage>,
    /// Empty unless a tokenizer was supplied.
    pub tokens: Vec<u32>,
    /// Same length as `tokens`.
    pub masks: Vec<i64>,
    pub score: f64,
    pub metadata: TrajectoryMetadata,
}

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

/// Capability used by the group builder.
pub trait Converter {
    /// Convert one trajectory. `Ok(None)` means the trajectory was dropped
    /// for augmentation.
    fn convert(
        &mut self,
        trajectory: &Trajectory,
        outcomes: Option<&MarketOutcomes>,
        tokenizer: Option<&dyn ChatTokenizer>,
    ) -> Result<Option<ConvertedTrajectory>>;

    fn include_messages(&self) -> bool;
}

pub struct TrajectoryConverter {
    config: ConverterConfig,
    scorer: Box<dyn Scorer>,
    rng: StdRng,
}

impl TrajectoryConverter {
    pub fn new(config: ConverterConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            scorer: Box::new(CompositeScorer),
            rng,
        })
    }

    /// Replace the default composite scorer.
    pub fn with_scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Convert a trajectory into messages, a score, and optionally tokens
    /// and masks.
    ///
    /// Fails with [`Error::InsufficientMessages`] when the conversation has
    /// fewer than three messages.
    pub fn convert_trajectory(
        &mut self,
        trajectory: &Trajectory,
        outcomes: Option<&MarketOutcomes>,
        tokenizer: Option<&dyn ChatTokenizer>,
    ) -> Result<Option<ConvertedTrajectory>> {
        if self.config.dropout_rate > 0.0 && self.rng.gen::<f64>() < self.config.dropout_rate {
            debug!(trajectory_id = %trajectory.trajectory_id, "trajectory dropped for augmentation");
            return Ok(None);
        }

        let mut messages = vec![ChatMessage::system(system_message(trajectory, outcomes))];

        let skip = trajectory.steps.len().saturating_sub(self.config.max_steps);
        let steps = &trajectory.steps[skip..];

        let mut total_format = 0.0;
        let mut total_reasoning = 0.0;
        let mut scorable_steps = 0u32;
        let mut risky_actions = 0u32;
        let mut total_actions = 0u32;
        let mut successful_actions = 0u32;

        for step in steps {
            push_step_messages(&mut messages, step);

            if let Some(action) = &step.action {
                total_actions += 1;
                if action.success {
                    successful_actions += 1;
                }
            }

            if !step.is_scorable() {
                continue;
            }
            scorable_steps += 1;

            let (format, reasoning) = quality(
                &step.llm_calls,
                step.action.as_ref(),
                None,
                trajectory.archetype.as_deref(),
            );
            total_format += format;
            total_reasoning += reasoning;

            let exposure =
                (step.environment_state.open_positions as f64 * EXPOSURE_PER_POSITION).min(1.0);
            let action_type = step.action.as_ref().map_or("wait", |a| a.action_type.as_str());
            if risk_reward(exposure, action_type) < 0.0 {
                risky_actions += 1;
            }
        }

        if messages.len() < 3 {
            return Err(Error::InsufficientMessages {
                trajectory_id: trajectory.trajectory_id.clone(),
                count: messages.len(),
            });
        }

        let denom = scorable_steps.max(1) as f64;
        let avg_format = total_format / denom;
        let avg_reasoning = total_reasoning / denom;

        let (starting_balance, end_balance) = balances(trajectory);
        // Unrecorded trade counts never trigger the churn penalty.
        let trades_executed = trajectory.trades_executed.unwrap_or(0);

        let inputs = RewardInputs {
            final_pnl: trajectory.final_pnl,
            starting_balance,
            end_balance,
            format_score: avg_format.clamp(0.0, 1.0),
            reasoning_score: avg_reasoning.clamp(0.0, 1.0),
            risky_actions_count: risky_actions,
            total_actions,
            successful_actions,
            num_steps: trajectory.steps.len() as u32,
            trades_executed,
        };
        let score = self.scorer.score(&inputs);

        let (tokens, masks) = match tokenizer {
            Some(tok) => {
                let tokens = tok.apply_chat_template(&messages)?;
                let masks = create_masks(&tokens, &messages, tok)?;
                (tokens, masks)
            }
            None => (Vec::new(), Vec::new()),
        };

        debug!(
            trajectory_id = %trajectory.trajectory_id,
            messages = messages.len(),
            tokens = tokens.len(),
            score,
            "converted trajectory"
        );

        Ok(Some(ConvertedTrajectory {
            messages,
            tokens,
            masks,
            score,
            metadata: TrajectoryMetadata {
                trajectory_id: trajectory.trajectory_id.clone(),
                agent_id: trajectory.agent_id.clone(),
                window_id: trajectory.window_id.clone(),
                final_pnl: trajectory.final_pnl,
                episode_length: trajectory.episode_length,
                trades_executed,
                format_score: avg_format,
                reasoning_score: avg_reasoning,
                risk_penalties: risky_actions,
            },
        }))
    }
}

impl Converter for TrajectoryConverter {
    fn convert(
        &mut self,
        trajectory: &Trajectory,
        outcomes: Option<&MarketOutcomes>,
        tokenizer: Option<&dyn ChatTokenizer>,
    ) -> Result<Option<ConvertedTrajectory>> {
        self.convert_trajectory(trajectory, outcomes, tokenizer)
    }

    fn include_messages(&self) -> bool {
        self.config.include_messages
    }
}

// ---------------------------------------------------------------------------
// Message construction
// ---------------------------------------------------------------------------

/// The system message: trajectory identity plus ground-truth outcomes the
/// agent could not see.
pub fn system_message(trajectory: &Trajectory, outcomes: Option<&MarketOutcomes>) -> String {
    let mut msg = format!(
        "You are evaluating trading agent decisions.\n\nAGENT: {}\nTIME WINDOW: {}\n",
        trajectory.agent_id, trajectory.window_id
    );

    if let Some(outcomes) = outcomes.filter(|o| !o.stocks.is_empty()) {
        msg.push_str("\nMARKET OUTCOMES (ground truth the agent did not know):\n");
        for (ticker, o) in &outcomes.stocks {
            let _ = write!(
                msg,
                "\n{ticker}:\n  Price: ${:.2} -> ${:.2} ({:+.1}%)\n  Sentiment: {}",
                o.start_price,
                o.end_price,
                o.change_percent,
                o.sentiment.as_deref().unwrap_or("UNKNOWN"),
            );
            if let Some(headline) = o.news_events.first() {
                let _ = write!(msg, "\n  News: {headline}");
            }
        }
    }

    msg.push_str("\n\nEvaluate this agent's decisions given the outcomes.");
    msg
}

fn push_step_messages(messages: &mut Vec<ChatMessage>, step: &Step) {
    if step.is_scorable() {
        for call in &step.llm_calls {
            if call.user_prompt.trim().is_empty() || call.response.trim().is_empty() {
                continue;
            }
            messages.push(ChatMessage::user(call.user_prompt.clone()));
            messages.push(ChatMessage::assistant(call.response.clone()));
        }
        return;
    }

    let env = &step.environment_state;
    messages.push(ChatMessage::user(format!(
        "Market Update:\n- Balance: ${:.2}\n- P&L: ${:.2}\n- Open Positions: {}",
        env.agent_balance, env.agent_pnl, env.open_positions
    )));

    if let Some(action) = &step.action {
        let mut content = format!("Action: {}", action.action_type);
        if !action.parameters.is_empty() {
            let params = serde_json::Value::Object(action.parameters.clone());
            let _ = write!(content, "\nParameters: {params}");
        }
        messages.push(ChatMessage::assistant(content));
    }
}

/// Starting and ending balance, preferring step snapshots over trajectory
/// totals.
fn balances(trajectory: &Trajectory) -> (f64, f64) {
    match (trajectory.steps.first(), trajectory.steps.last()) {
        (Some(first), Some(last)) => (
            first.environment_state.agent_balance,
            last.environment_state.agent_balance,
        ),
        _ => match trajectory.final_balance {
            Some(end) => (end - trajectory.final_pnl, end),
            None => (DEFAULT_STARTING_BALANCE, DEFAULT_STARTING_BALANCE),
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Dropout rate that thins `current` trajectories down toward `target`,
/// capped at `max_dropout`. Zero when there is no surplus.
pub fn calculate_dropout_rate(current: usize, target: usize, max_dropout: f64) -> f64 {
    if current <= target {
        return 0.0;
    }
    let rate = 1.0 - target as f64 / current as f64;
    rate.min(max_dropout)
}

/// Supervised chat samples, one per LLM call whose response has at least
/// [`MIN_RESPONSE_CHARS`] characters.
pub fn training_samples(trajectories: &[Trajectory]) -> Vec<Vec<ChatMessage>> {
    trajectories
        .iter()
        .flat_map(|t| t.steps.iter())
        .flat_map(|s| s.llm_calls.iter())
        .filter(|c| c.response.trim().chars().count() >= MIN_RESPONSE_CHARS)
        .map(|c| {
            let mut sample = Vec::with_capacity(3);
            if !c.system_prompt.trim().is_empty() {
                sample.push(ChatMessage::system(c.system_prompt.clone()));
            }
            if !c.user_prompt.trim().is_empty() {
                sample.push(ChatMessage::user(c.user_prompt.clone()));
            }
            sample.push(ChatMessage::assistant(c.response.clone()));
            sample
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::convert::mask::{trainable_count, IGNORE_INDEX};
    use crate::model::tokenizer::testing::WordTokenizer;
    use crate::trajectory::types::{Action, EnvironmentState, InstrumentOutcome, LlmCall};

    pub(crate) fn llm_step(balance: f64, prompt: &str, response: &str) -> Step {
        Step {
            environment_state: EnvironmentState {
                agent_balance: balance,
                ..Default::default()
            },
            llm_calls: vec![LlmCall {
                user_prompt: prompt.into(),
                response: response.into(),
                ..Default::default()
            }],
            action: Some(Action::new("buy")),
            ..Default::default()
        }
    }

    pub(crate) fn sample_trajectory(id: &str, pnl: f64) -> Trajectory {
        Trajectory {
            trajectory_id: id.into(),
            agent_id: format!("agent-{id}"),
            window_id: "w1".into(),
            final_pnl: pnl,
            steps: vec![
                llm_step(10_000.0, "Prices are rising. Act?", "<thinking>trend up, risk low</thinking> buy ACME"),
                llm_step(10_000.0 + pnl / 2.0, "Position open. Next?", "Holding; momentum intact."),
                llm_step(10_000.0 + pnl, "Window closing.", "Sell to lock in profit."),
            ],
            ..Default::default()
        }
    }

    fn converter() -> TrajectoryConverter {
        TrajectoryConverter::new(ConverterConfig {
            seed: Some(1),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_dropout_rejected() {
        let err = TrajectoryConverter::new(ConverterConfig {
            dropout_rate: 0.7,
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidDropoutRate(r) if r == 0.7));
    }

    #[test]
    fn test_convert_builds_conversation() {
        let conv = converter()
            .convert_trajectory(&sample_trajectory("t1", 500.0), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(conv.messages.len(), 7);
        assert_eq!(conv.messages[0].role, "system");
        assert_eq!(conv.messages[1].role, "user");
        assert_eq!(conv.messages[2].role, "assistant");
        assert!(conv.tokens.is_empty() && conv.masks.is_empty());
        assert!((-1.0..=1.0).contains(&conv.score));
        assert_eq!(conv.metadata.trajectory_id, "t1");
        assert_eq!(conv.metadata.trades_executed, 0);
    }

    #[test]
    fn test_recorded_trade_count_drives_churn_penalty() {
        let mut c = converter();
        let calm = sample_trajectory("calm", 200.0);
        let mut churned = calm.clone();
        churned.trajectory_id = "churned".into();
        churned.trades_executed = Some(40);

        let calm = c.convert_trajectory(&calm, None, None).unwrap().unwrap();
        let churned = c.convert_trajectory(&churned, None, None).unwrap().unwrap();
        assert_eq!(churned.metadata.trades_executed, 40);
        assert!(churned.score < calm.score);
    }

    #[test]
    fn test_profitable_scores_higher() {
        let mut c = converter();
        let win = c.convert_trajectory(&sample_trajectory("w", 800.0), None, None).unwrap().unwrap();
        let lose = c.convert_trajectory(&sample_trajectory("l", -800.0), None, None).unwrap().unwrap();
        assert!(win.score > lose.score);
    }

    #[test]
    fn test_too_few_messages_is_validation_error() {
        let traj = Trajectory {
            trajectory_id: "empty".into(),
            ..Default::default()
        };
        let err = converter().convert_trajectory(&traj, None, None).unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(err, Error::InsufficientMessages { count: 1, .. }));
    }

    #[test]
    fn test_empty_prompt_calls_skipped() {
        let mut traj = sample_trajectory("t", 100.0);
        for step in &mut traj.steps {
            step.llm_calls[0].response.clear();
        }
        let err = converter().convert_trajectory(&traj, None, None).unwrap_err();
        assert!(matches!(err, Error::InsufficientMessages { .. }));
    }

    #[test]
    fn test_fallback_messages() {
        let mut action = Action::new("buy");
        action.parameters.insert("ticker".into(), "ACME".into());
        let traj = Trajectory {
            trajectory_id: "f".into(),
            steps: vec![Step {
                environment_state: EnvironmentState {
                    agent_balance: 9_876.5,
                    agent_pnl: -123.5,
                    open_positions: 2,
                },
                action: Some(action),
                ..Default::default()
            }],
            ..Default::default()
        };
        let conv = converter().convert_trajectory(&traj, None, None).unwrap().unwrap();
        assert_eq!(conv.messages.len(), 3);
        assert!(conv.messages[1].content.contains("Balance: $9876.50"));
        assert!(conv.messages[1].content.contains("Open Positions: 2"));
        assert!(conv.messages[2].content.starts_with("Action: buy"));
        assert!(conv.messages[2].content.contains("\"ticker\":\"ACME\""));
        assert_eq!(conv.metadata.format_score, 0.0);
    }

    #[test]
    fn test_max_steps_keeps_tail() {
        let mut c = TrajectoryConverter::new(ConverterConfig {
            max_steps: 1,
            ..Default::default()
        })
        .unwrap();
        let conv = c.convert_trajectory(&sample_trajectory("t", 10.0), None, None).unwrap().unwrap();
        assert_eq!(conv.messages.len(), 3);
        assert_eq!(conv.messages[1].content, "Window closing.");
    }

    #[test]
    fn test_system_message_with_outcomes() {
        let mut outcomes = MarketOutcomes::default();
        outcomes.stocks.insert(
            "ACME".into(),
            InstrumentOutcome {
                start_price: 100.0,
                end_price: 110.0,
                change_percent: 10.0,
                sentiment: None,
                news_events: vec!["ACME beats earnings".into()],
            },
        );
        let msg = system_message(&sample_trajectory("t", 0.0), Some(&outcomes));
        assert!(msg.contains("ACME:"));
        assert!(msg.contains("$100.00 -> $110.00 (+10.0%)"));
        assert!(msg.contains("Sentiment: UNKNOWN"));
        assert!(msg.contains("News: ACME beats earnings"));
    }

    #[test]
    fn test_tokenized_conversion_masks_assistant() {
        let tok = WordTokenizer::with_bos();
        let conv = converter()
            .convert_trajectory(&sample_trajectory("t", 100.0), None, Some(&tok))
            .unwrap()
            .unwrap();
        assert_eq!(conv.tokens.len(), conv.masks.len());
        assert_eq!(conv.masks[0], IGNORE_INDEX);
        assert!(trainable_count(&conv.masks) > 0);
        assert!(trainable_count(&conv.masks) < conv.tokens.len());
    }

    #[test]
    fn test_dropout_drops_about_half() {
        let mut c = TrajectoryConverter::new(ConverterConfig {
            dropout_rate: 0.5,
            seed: Some(3),
            ..Default::default()
        })
        .unwrap();
        let kept = (0..200)
            .filter(|_| {
                c.convert_trajectory(&sample_trajectory("t", 1.0), None, None)
                    .unwrap()
                    .is_some()
            })
            .count();
        assert!(kept > 50 && kept < 150, "kept {kept} of 200");
    }

    #[test]
    fn test_balance_fallback_from_totals() {
        let traj = Trajectory {
            final_pnl: 250.0,
            final_balance: Some(10_250.0),
            ..Default::default()
        };
        assert_eq!(balances(&traj), (10_000.0, 10_250.0));
        assert_eq!(
            balances(&Trajectory::default()),
            (DEFAULT_STARTING_BALANCE, DEFAULT_STARTING_BALANCE)
        );
    }

    #[test]
    fn test_calculate_dropout_rate() {
        let r = calculate_dropout_rate(2000, 1000, 0.3);
        assert!(r > 0.0 && r <= 0.3);
        assert_eq!(calculate_dropout_rate(500, 1000, 0.3), 0.0);
        assert!((calculate_dropout_rate(1250, 1000, 0.3) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_training_samples_filter_short() {
        let samples = training_samples(&[sample_trajectory("t", 10.0)]);
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.last().is_some_and(|m| m.is_assistant())));

        let mut short = sample_trajectory("s", 0.0);
        short.steps[0].llm_calls[0].response = "buy".into();
        assert_eq!(training_samples(&[short]).len(), 2);
    }
}
