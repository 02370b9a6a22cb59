//! Running reward normalization.
//!
//! Two update rules are supported: a cumulative Welford estimate over every
//! value seen, and an exponential moving average that tracks drifting reward
//! scales. Both keep only O(1) state and stay finite for an unbounded stream.

use serde::{Deserialize, Serialize};

const DEFAULT_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum NormalizerMode {
    /// Welford's algorithm over all observed values.
    #[default]
    Cumulative,
    /// Exponential moving average with the given decay in `(0, 1)`.
    Exponential { decay: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardNormalizer {
    mode: NormalizerMode,
    epsilon: f64,
    count: u64,
    mean: f64,
    /// Sum of squared deviations (cumulative) or the variance itself (EMA).
    m2: f64,
}

impl Default for RewardNormalizer {
    fn default() -> Self {
        Self::new(NormalizerMode::Cumulative)
    }
}

impl RewardNormalizer {
    pub fn new(mode: NormalizerMode) -> Self {
        let mode = match mode {
            NormalizerMode::Exponential { decay } if !(decay > 0.0 && decay < 1.0) => {
                NormalizerMode::Exponential { decay: 0.99 }
            }
            m => m,
        };
        Self {
            mode,
            epsilon: DEFAULT_EPSILON,
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon.abs().max(f64::MIN_POSITIVE);
        self
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Standard deviation estimate. Reported as 1.0 until two values have
    /// been seen, so early normalization only shifts.
    pub fn std(&self) -> f64 {
        if self.count < 2 {
            return 1.0;
        }
        let var = match self.mode {
            NormalizerMode::Cumulative => self.m2 / (self.count - 1) as f64,
            NormalizerMode::Exponential { .. } => self.m2,
        };
        var.max(0.0).sqrt()
    }

    /// Fold one value into the running statistics. Non-finite values are
    /// ignored.
    pub fn update(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count = self.count.saturating_add(1);

        if self.count == 1 {
            self.mean = value;
            self.m2 = 0.0;
            return;
        }

        match self.mode {
            NormalizerMode::Cumulative => {
                let delta = value - self.mean;
                self.mean += delta / self.count as f64;
                self.m2 += delta * (value - self.mean);
            }
            NormalizerMode::Exponential { decay } => {
                let delta = value - self.mean;
                self.mean += (1.0 - decay) * delta;
                self.m2 = decay * (self.m2 + (1.0 - decay) * delta * delta);
            }
        }
    }

    pub fn update_batch(&mut self, values: &[f64]) {
        for &v in values {
            self.update(v);
        }
    }

    /// `(value - mean) / (std + epsilon)`.
    pub fn normalize(&self, value: f64) -> f64 {
        let z = (value - self.mean) / (self.std() + self.epsilon);
        if z.is_finite() {
            z
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
    }
}
