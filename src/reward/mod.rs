//! Deterministic reward computation: scalar scorers, text-quality signals
//! and running normalization.

pub mod normalizer;
pub mod quality;
pub mod scorer;

pub use normalizer::{NormalizerMode, RewardNormalizer};
pub use quality::{quality, Feedback};
pub use scorer::{
    composite_reward, judge_completion, judge_inputs, relative_scores, CompositeScorer,
    RewardInputs, Scorer,
};
