//! Deterministic reward functions.
//!
//! Every function here is pure: the same [`RewardInputs`] always produce the
//! same score, and every component is bounded so that the composite stays in
//! `[-1, 1]` regardless of how extreme the raw P&L figures are.

use serde::{Deserialize, Serialize};

use crate::reward::quality::{format_score, reasoning_score};
use crate::trajectory::types::DEFAULT_STARTING_BALANCE;

/// Sensitivity of the P&L component: a return of `1 / PNL_SENSITIVITY`
/// (20%) maps to `tanh(1) ~ 0.76`.
const PNL_SENSITIVITY: f64 = 5.0;

/// Per-action return sensitivity for the efficiency component.
const EFFICIENCY_SENSITIVITY: f64 = 25.0;

/// Exposure above which opening more risk is penalized.
const HIGH_EXPOSURE: f64 = 0.8;
/// Exposure above which opening more risk earns a mild penalty.
const ELEVATED_EXPOSURE: f64 = 0.5;

/// Trades beyond this count are treated as churn.
const EXCESSIVE_TRADE_THRESHOLD: u32 = 20;

// Composite weights.
const W_PNL: f64 = 0.5;
const W_FORMAT: f64 = 0.15;
const W_REASONING: f64 = 0.15;
const W_ACTION_QUALITY: f64 = 0.1;
const W_EFFICIENCY: f64 = 0.1;
const RISK_PENALTY_PER_ACTION: f64 = 0.05;
const MAX_RISK_PENALTY: f64 = 0.3;
const CHURN_PENALTY_PER_TRADE: f64 = 0.01;
const MAX_CHURN_PENALTY: f64 = 0.2;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything the scorer needs for one trajectory. Built fresh per
/// trajectory by the converter; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardInputs {
    pub final_pnl: f64,
    pub starting_balance: f64,
    pub end_balance: f64,
    /// Average format score over scorable steps, in `[0, 1]`.
    pub format_score: f64,
    /// Average reasoning score over scorable steps, in `[0, 1]`.
    pub reasoning_score: f64,
    pub risky_actions_count: u32,
    pub total_actions: u32,
    pub successful_actions: u32,
    pub num_steps: u32,
    pub trades_executed: u32,
}

impl Default for RewardInputs {
    fn default() -> Self {
        Self {
            final_pnl: 0.0,
            starting_balance: DEFAULT_STARTING_BALANCE,
            end_balance: DEFAULT_STARTING_BALANCE,
            format_score: 0.0,
            reasoning_score: 0.0,
            risky_actions_count: 0,
            total_actions: 0,
            successful_actions: 0,
            num_steps: 0,
            trades_executed: 0,
        }
    }
}

impl RewardInputs {
    /// Return on the starting balance. Non-positive balances fall back to
    /// the default so that a bankrupt start does not flip signs.
    fn return_fraction(&self) -> f64 {
        let base = if self.starting_balance.is_finite() && self.starting_balance > 0.0 {
            self.starting_balance
        } else {
            DEFAULT_STARTING_BALANCE
        };
        finite_or_zero(self.final_pnl / base)
    }
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

fn clamp_unit(x: f64) -> f64 {
    finite_or_zero(x).clamp(-1.0, 1.0)
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Profitability. Same sign as `final_pnl`; exactly `0.0` for zero P&L.
///
/// A nonzero P&L too small to register against the balance still scores
/// `±f64::MIN_POSITIVE` rather than zero.
pub fn pnl_reward(inputs: &RewardInputs) -> f64 {
    if inputs.final_pnl == 0.0 || !inputs.final_pnl.is_finite() {
        return 0.0;
    }
    let reward = (inputs.return_fraction() * PNL_SENSITIVITY).tanh();
    reward.abs().max(f64::MIN_POSITIVE).copysign(inputs.final_pnl)
}

/// P&L discounted by the share of actions that added risk at high exposure,
/// and by any drawdown between the starting and ending balance.
pub fn risk_adjusted_reward(inputs: &RewardInputs) -> f64 {
    let base = pnl_reward(inputs);
    let actions = inputs.total_actions.max(inputs.num_steps).max(1) as f64;
    let risky_fraction = (inputs.risky_actions_count as f64 / actions).min(1.0);

    let drawdown = if inputs.starting_balance > 0.0 && inputs.end_balance < inputs.starting_balance
    {
        (inputs.starting_balance - inputs.end_balance) / inputs.starting_balance
    } else {
        0.0
    };

    clamp_unit(base - 0.5 * risky_fraction - 0.5 * finite_or_zero(drawdown).min(1.0))
}

/// Return earned per action taken. Zero when no actions were taken.
pub fn efficiency_reward(inputs: &RewardInputs) -> f64 {
    if inputs.total_actions == 0 {
        return 0.0;
    }
    let per_action = inputs.return_fraction() / inputs.total_actions as f64;
    clamp_unit((per_action * EFFICIENCY_SENSITIVITY).tanh())
}

/// Action success rate mapped from `[0, 1]` to `[-1, 1]`, nudged by the
/// text-quality signals. Zero when no actions were taken.
pub fn action_quality_reward(inputs: &RewardInputs) -> f64 {
    if inputs.total_actions == 0 {
        return 0.0;
    }
    let success_rate =
        (inputs.successful_actions as f64 / inputs.total_actions as f64).clamp(0.0, 1.0);
    let quality = (inputs.format_score.clamp(0.0, 1.0) + inputs.reasoning_score.clamp(0.0, 1.0)) / 2.0;
    clamp_unit(0.8 * (2.0 * success_rate - 1.0) + 0.2 * (2.0 * quality - 1.0))
}

/// Risk signal for a single step.
///
/// `exposure` is the fraction of capital at risk in `[0, 1]`. Opening more
/// risk at high exposure is penalized, reducing it is mildly rewarded, and
/// everything else is neutral.
pub fn risk_reward(exposure: f64, action_type: &str) -> f64 {
    let exposure = finite_or_zero(exposure).clamp(0.0, 1.0);
    let action = action_type.to_ascii_lowercase();
    let adds_risk = matches!(
        action.as_str(),
        "buy" | "trade" | "open" | "open_position" | "long" | "short" | "buy_shares" | "buy_prediction"
    );
    let reduces_risk = matches!(
        action.as_str(),
        "sell" | "close" | "close_position" | "sell_shares" | "hedge"
    );

    if adds_risk && exposure > HIGH_EXPOSURE {
        -0.5
    } else if adds_risk && exposure > ELEVATED_EXPOSURE {
        -0.1
    } else if reduces_risk && exposure > HIGH_EXPOSURE {
        0.1
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Weighted combination of all components, clamped to `[-1, 1]`.
///
/// P&L dominates; format, reasoning, action quality and efficiency add on
/// top; risky actions and trade churn subtract.
pub fn composite_reward(inputs: &RewardInputs) -> f64 {
    let pnl = pnl_reward(inputs);
    let format = finite_or_zero(inputs.format_score).clamp(0.0, 1.0);
    let reasoning = finite_or_zero(inputs.reasoning_score).clamp(0.0, 1.0);
    let quality = action_quality_reward(inputs);
    let efficiency = efficiency_reward(inputs);

    let risk_penalty =
        (inputs.risky_actions_count as f64 * RISK_PENALTY_PER_ACTION).min(MAX_RISK_PENALTY);
    let churn = inputs.trades_executed.saturating_sub(EXCESSIVE_TRADE_THRESHOLD);
    let churn_penalty = (churn as f64 * CHURN_PENALTY_PER_TRADE).min(MAX_CHURN_PENALTY);

    let score = W_PNL * pnl
        + W_FORMAT * format
        + W_REASONING * reasoning
        + W_ACTION_QUALITY * quality
        + W_EFFICIENCY * efficiency
        - risk_penalty
        - churn_penalty;

    clamp_unit(score)
}

/// Maps a trajectory's [`RewardInputs`] to its scalar score.
pub trait Scorer: Send + Sync {
    fn score(&self, inputs: &RewardInputs) -> f64;
}

/// The default scorer: [`composite_reward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeScorer;

impl Scorer for CompositeScorer {
    fn score(&self, inputs: &RewardInputs) -> f64 {
        composite_reward(inputs)
    }
}

// ---------------------------------------------------------------------------
// Rollout judge
// ---------------------------------------------------------------------------

/// Inputs for judging a freshly sampled completion.
///
/// The completion is treated as a single tick: its own format and reasoning
/// quality, the trajectory's realized P&L against the default starting
/// balance, and no risk signal since text alone carries none.
pub fn judge_inputs(completion: &str, final_pnl: f64, archetype: Option<&str>) -> RewardInputs {
    RewardInputs {
        final_pnl,
        end_balance: DEFAULT_STARTING_BALANCE + final_pnl,
        format_score: format_score(completion),
        reasoning_score: reasoning_score(completion, archetype),
        risky_actions_count: 0,
        ..Default::default()
    }
}

/// Score a completion on the same scale as converted trajectories.
pub fn judge_completion(completion: &str, final_pnl: f64, archetype: Option<&str>) -> f64 {
    composite_reward(&judge_inputs(completion, final_pnl, archetype))
}

// ---------------------------------------------------------------------------
// Relative scoring within a group
// ---------------------------------------------------------------------------

/// Convert raw rewards into rank-based scores in `[0, 1]`.
///
/// The best reward scores 1.0 and the worst 0.0; tied rewards share a score.
/// A single reward scores 0.5.
pub fn relative_scores(rewards: &[f64]) -> Vec<f64> {
    match rewards.len() {
        0 => Vec::new(),
        1 => vec![0.5],
        n => rewards
            .iter()
            .map(|r| {
                let better = rewards.iter().filter(|other| *other > r).count();
                1.0 - better as f64 / (n - 1) as f64
            })
            .collect(),
    }
}

/// Scores from an ordinal ranking, where `ranking[i]` is the 1-based rank of
/// item `i` (1 = best). Rank 1 scores 1.0 and rank `n` scores 0.0.
pub fn ranking_to_scores(ranking: &[usize]) -> Vec<f64> {
    let n = ranking.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![1.0];
    }
    ranking
        .iter()
        .map(|&rank| {
            let rank = rank.clamp(1, n);
            1.0 - (rank - 1) as f64 / (n - 1) as f64
        })
        .collect()
}

/// Win rate of each of `n` items over a list of `(winner, loser)` pairs.
/// Items that never appear score 0.5; out-of-range indices are ignored.
pub fn pairwise_preferences_to_scores(n: usize, preferences: &[(usize, usize)]) -> Vec<f64> {
    let mut wins = vec![0usize; n];
    let mut games = vec![0usize; n];
    for &(winner, loser) in preferences {
        if winner >= n || loser >= n || winner == loser {
            continue;
        }
        wins[winner] += 1;
        games[winner] += 1;
        games[loser] += 1;
    }
    wins.iter()
        .zip(&games)
        .map(|(&w, &g)| if g == 0 { 0.5 } else { w as f64 / g as f64 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(final_pnl: f64) -> RewardInputs {
        RewardInputs {
            final_pnl,
            end_balance: DEFAULT_STARTING_BALANCE + final_pnl,
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // pnl_reward
    // ------------------------------------------------------------------

    #[test]
    fn test_pnl_reward_zero_is_exact() {
        assert_eq!(pnl_reward(&inputs(0.0)), 0.0);
    }

    #[test]
    fn test_pnl_reward_sign_matches() {
        for pnl in [-50_000.0, -500.0, -0.01, 0.01, 500.0, 50_000.0] {
            let r = pnl_reward(&inputs(pnl));
            assert_eq!(r.signum(), pnl.signum(), "pnl {pnl} gave {r}");
            assert!((-1.0..=1.0).contains(&r));
        }
    }

    #[test]
    fn test_pnl_reward_monotone() {
        assert!(pnl_reward(&inputs(1000.0)) > pnl_reward(&inputs(500.0)));
        assert!(pnl_reward(&inputs(-1000.0)) < pnl_reward(&inputs(-500.0)));
    }

    #[test]
    fn test_pnl_reward_zero_starting_balance() {
        let r = pnl_reward(&RewardInputs {
            final_pnl: 100.0,
            starting_balance: 0.0,
            ..Default::default()
        });
        assert!(r > 0.0 && r.is_finite());
    }

    // ------------------------------------------------------------------
    // Bounded components
    // ------------------------------------------------------------------

    #[test]
    fn test_components_are_bounded() {
        let extremes = [
            RewardInputs {
                final_pnl: 1e12,
                total_actions: 1,
                successful_actions: 1,
                ..Default::default()
            },
            RewardInputs {
                final_pnl: -1e12,
                end_balance: 0.0,
                risky_actions_count: 1000,
                total_actions: 3,
                ..Default::default()
            },
            RewardInputs {
                final_pnl: f64::NAN,
                ..Default::default()
            },
        ];
        for i in &extremes {
            for r in [
                risk_adjusted_reward(i),
                efficiency_reward(i),
                action_quality_reward(i),
                composite_reward(i),
            ] {
                assert!((-1.0..=1.0).contains(&r), "{r} out of range for {i:?}");
            }
        }
    }

    #[test]
    fn test_efficiency_zero_actions() {
        assert_eq!(efficiency_reward(&inputs(500.0)), 0.0);
    }

    #[test]
    fn test_efficiency_prefers_fewer_actions() {
        let few = RewardInputs {
            total_actions: 2,
            ..inputs(500.0)
        };
        let many = RewardInputs {
            total_actions: 20,
            ..inputs(500.0)
        };
        assert!(efficiency_reward(&few) > efficiency_reward(&many));
    }

    #[test]
    fn test_risk_adjusted_penalizes_risky_actions() {
        let safe = RewardInputs {
            total_actions: 10,
            ..inputs(500.0)
        };
        let risky = RewardInputs {
            risky_actions_count: 5,
            ..safe.clone()
        };
        assert!(risk_adjusted_reward(&risky) < risk_adjusted_reward(&safe));
    }

    #[test]
    fn test_risk_reward_ladder() {
        assert_eq!(risk_reward(0.9, "buy"), -0.5);
        assert_eq!(risk_reward(0.6, "BUY"), -0.1);
        assert_eq!(risk_reward(0.3, "buy"), 0.0);
        assert_eq!(risk_reward(0.9, "sell"), 0.1);
        assert_eq!(risk_reward(0.9, "wait"), 0.0);
    }

    // ------------------------------------------------------------------
    // composite_reward
    // ------------------------------------------------------------------

    #[test]
    fn test_composite_in_range() {
        let r = composite_reward(&RewardInputs {
            final_pnl: 500.0,
            end_balance: 10_500.0,
            format_score: 0.8,
            reasoning_score: 0.7,
            ..Default::default()
        });
        assert!((-1.0..=1.0).contains(&r));
        assert!(r > 0.0);
    }

    #[test]
    fn test_composite_quality_helps() {
        let plain = inputs(200.0);
        let thoughtful = RewardInputs {
            format_score: 1.0,
            reasoning_score: 1.0,
            ..plain.clone()
        };
        assert!(composite_reward(&thoughtful) > composite_reward(&plain));
    }

    #[test]
    fn test_composite_churn_penalized() {
        let calm = RewardInputs {
            trades_executed: 5,
            ..inputs(200.0)
        };
        let churn = RewardInputs {
            trades_executed: 60,
            ..inputs(200.0)
        };
        assert!(composite_reward(&churn) < composite_reward(&calm));
    }

    // ------------------------------------------------------------------
    // Rollout judge
    // ------------------------------------------------------------------

    #[test]
    fn test_judge_prefers_structured_profitable_completion() {
        let good = "<thinking>Momentum and volume support the position; risk is capped by a stop.</thinking> Buy 10 shares.";
        let bad = "ok";
        assert!(judge_completion(good, 500.0, None) > judge_completion(bad, 500.0, None));
        assert!(judge_completion(good, 500.0, None) > judge_completion(good, -500.0, None));
        assert_eq!(judge_completion("", 0.0, None), 0.0);
    }

    #[test]
    fn test_judge_uses_composite_scale() {
        let text = "<analysis>Earnings beat and volume is rising, so the trend should hold.</analysis> Buy.";
        let inputs = RewardInputs {
            final_pnl: 250.0,
            starting_balance: DEFAULT_STARTING_BALANCE,
            end_balance: DEFAULT_STARTING_BALANCE + 250.0,
            format_score: format_score(text),
            reasoning_score: reasoning_score(text, Some("trader")),
            ..Default::default()
        };
        assert_eq!(judge_inputs(text, 250.0, Some("trader")), inputs);
        assert_eq!(judge_completion(text, 250.0, Some("trader")), composite_reward(&inputs));
    }

    #[test]
    fn test_pnl_sign_survives_tiny_returns() {
        let tiny = |final_pnl: f64| RewardInputs {
            final_pnl,
            starting_balance: 1e300,
            ..Default::default()
        };
        assert!(pnl_reward(&tiny(1e-30)) > 0.0);
        assert!(pnl_reward(&tiny(-1e-30)) < 0.0);
        assert_eq!(pnl_reward(&tiny(0.0)), 0.0);
    }

    // ------------------------------------------------------------------
    // Relative scoring
    // ------------------------------------------------------------------

    #[test]
    fn test_relative_scores_ordering() {
        let scores = relative_scores(&[1.0, 0.0, -0.5]);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        assert!(scores[0] > scores[1] && scores[1] > scores[2]);
    }

    #[test]
    fn test_relative_scores_ties() {
        let scores = relative_scores(&[0.3, 0.3, 0.1]);
        assert_eq!(scores[0], scores[1]);
        assert!(scores[2] < scores[0]);
    }

    #[test]
    fn test_relative_scores_edge_sizes() {
        assert!(relative_scores(&[]).is_empty());
        assert_eq!(relative_scores(&[0.7]), vec![0.5]);
    }

    #[test]
    fn test_ranking_to_scores() {
        let scores = ranking_to_scores(&[2, 1, 3]);
        assert!((scores[0] - 0.5).abs() < 1e-12);
        assert!((scores[1] - 1.0).abs() < 1e-12);
        assert!(scores[2].abs() < 1e-12);
    }

    #[test]
    fn test_pairwise_preferences() {
        let scores = pairwise_preferences_to_scores(3, &[(0, 1), (0, 2), (1, 2), (9, 0)]);
        assert!((scores[0] - 1.0).abs() < 1e-12);
        assert!((scores[1] - 0.5).abs() < 1e-12);
        assert!(scores[2].abs() < 1e-12);
        assert_eq!(pairwise_preferences_to_scores(2, &[]), vec![0.5, 0.5]);
    }
}
