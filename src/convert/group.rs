//! Group building: sample, convert, and center a set of trajectories into
//! one GRPO batch unit.

use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::convert::converter::Converter;
use crate::error::{Error, Result};
use crate::model::tokenizer::{ChatMessage, ChatTokenizer};
use crate::training::advantage::{center_scores, compute_group_advantages, AdvantageStats};
use crate::trajectory::types::{MarketOutcomes, Trajectory};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Larger inputs are sampled down to this many trajectories.
    pub max_group_size: usize,
    /// Divide centered scores by the group standard deviation.
    pub normalize_std: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_group_size: 8,
            normalize_std: false,
        }
    }
}

/// Counts from one group build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub input: usize,
    pub sampled: usize,
    pub dropped: usize,
    pub rejected: usize,
    pub advantages: AdvantageStats,
}

/// One GRPO batch unit. `tokens`, `masks`, `advantages` and `raw_scores`
/// are parallel and hold at least two members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredGroup {
    pub tokens: Vec<Vec<u32>>,
    pub masks: Vec<Vec<i64>>,
    pub advantages: Vec<f64>,
    pub raw_scores: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Vec<ChatMessage>>>,
    /// Ids of the member trajectories, in order.
    pub trajectory_ids: Vec<String>,
    pub stats: GroupStats,
}

impl ScoredGroup {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether every member carries token data.
    pub fn is_tokenized(&self) -> bool {
        !self.tokens.is_empty() && self.tokens.iter().all(|t| !t.is_empty())
    }
}

/// Build a scored group from trajectories of one window.
///
/// Fails with [`Error::InsufficientGroup`] when fewer than two trajectories
/// are supplied, or fewer than two survive conversion. Members that fail
/// validation are logged and excluded; any other conversion error aborts
/// the build.
pub fn build_group<R: Rng + ?Sized>(
    trajectories: &[Trajectory],
    outcomes: Option<&MarketOutcomes>,
    converter: &mut dyn Converter,
    tokenizer: Option<&dyn ChatTokenizer>,
    config: &GroupConfig,
    rng: &mut R,
) -> Result<ScoredGroup> {
    if trajectories.len() < 2 {
        return Err(Error::InsufficientGroup {
            stage: "input",
            count: trajectories.len(),
        });
    }

    let sampled: Vec<&Trajectory> = if trajectories.len() > config.max_group_size {
        sample(rng, trajectories.len(), config.max_group_size.max(2))
            .into_iter()
            .map(|i| &trajectories[i])
            .collect()
    } else {
        trajectories.iter().collect()
    };

    let mut stats = GroupStats {
        input: trajectories.len(),
        sampled: sampled.len(),
        ..Default::default()
    };

    let mut converted = Vec::with_capacity(sampled.len());
    for traj in sampled {
        match converter.convert(traj, outcomes, tokenizer) {
            Ok(Some(c)) => converted.push(c),
            Ok(None) => stats.dropped += 1,
            Err(e) if e.is_validation() => {
                warn!(trajectory_id = %traj.trajectory_id, error = %e, "rejected trajectory");
                stats.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if converted.len() < 2 {
        return Err(Error::InsufficientGroup {
            stage: "conversion",
            count: converted.len(),
        });
    }

    let raw_scores: Vec<f64> = converted.iter().map(|c| c.score).collect();
    let advantages = if config.normalize_std {
        compute_group_advantages(&raw_scores)
    } else {
        center_scores(&raw_scores)
    };
    stats.advantages = AdvantageStats::from_group(&raw_scores, &advantages);

    debug!(?raw_scores, ?advantages, "group scores");
    info!(
        size = converted.len(),
        dropped = stats.dropped,
        rejected = stats.rejected,
        mean_score = stats.advantages.mean_score,
        "built scored group"
    );

    let include_messages = converter.include_messages();
    let mut group = ScoredGroup {
        tokens: Vec::with_capacity(converted.len()),
        masks: Vec::with_capacity(converted.len()),
        advantages,
        raw_scores,
        messages: include_messages.then(Vec::new),
        trajectory_ids: Vec::with_capacity(converted.len()),
        stats,
    };
    for c in converted {
        group.tokens.push(c.tokens);
        group.masks.push(c.masks);
        group.trajectory_ids.push(c.metadata.trajectory_id);
        if let Some(messages) = group.messages.as_mut() {
            messages.push(c.messages);
        }
    }
    Ok(group)
}
