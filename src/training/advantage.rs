//! Group-relative advantage estimation.
//!
//! A trajectory's advantage is its score relative to the other members of
//! its group:
//!
//!   A_i = R_i - mean(R)                 (centered)
//!   A_i = (R_i - mean(R)) / std(R)      (standardized)
//!
//! Centering alone keeps the reward scale; standardizing makes every group
//! contribute gradients of comparable magnitude.

use serde::{Deserialize, Serialize};

/// Below this standard deviation a group is treated as all-equal.
const MIN_STD: f64 = 1e-8;

/// Subtract the group mean from every score.
///
/// Returns an empty vector for empty input. The result sums to zero up to
/// floating-point error.
pub fn center_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let mean = mean(scores);
    scores.iter().map(|s| s - mean).collect()
}

/// Z-score every reward within its group.
///
/// # Edge cases
///
/// - If `rewards` is empty, returns an empty vector.
/// - If all rewards are identical (std = 0), all advantages are 0.0: no
///   member should be preferred over another.
pub fn compute_group_advantages(rewards: &[f64]) -> Vec<f64> {
    if rewards.is_empty() {
        return Vec::new();
    }

    let mean = mean(rewards);
    // Population standard deviation: the group is the whole population.
    let variance = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rewards.len() as f64;
    let std = variance.sqrt();

    if std < MIN_STD {
        return vec![0.0; rewards.len()];
    }

    rewards.iter().map(|r| (r - mean) / std).collect()
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Summary of a group's raw scores and advantages, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvantageStats {
    pub mean_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub advantage_sum: f64,
    pub positive: usize,
    pub non_positive: usize,
}

impl AdvantageStats {
    pub fn from_group(scores: &[f64], advantages: &[f64]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        Self {
            mean_score: mean(scores),
            min_score: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max_score: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            advantage_sum: advantages.iter().sum(),
            positive: advantages.iter().filter(|&&a| a > 0.0).count(),
            non_positive: advantages.iter().filter(|&&a| a <= 0.0).count(),
        }
    }
}
