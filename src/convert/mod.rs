//! Trajectory conversion into GRPO training data.
//!
//! - [`converter`] -- trajectory to conversation, score and tokens.
//! - [`mask`] -- per-token trainable masks.
//! - [`group`] -- sampling and advantage centering across a window group.

pub mod converter;
pub mod group;
pub mod mask;

pub use converter::{
    calculate_dropout_rate, training_samples, ConvertedTrajectory, Converter, ConverterConfig,
    TrajectoryConverter, TrajectoryMetadata,
};
pub use group::{build_group, GroupConfig, GroupStats, ScoredGroup};
pub use mask::{create_masks, IGNORE_INDEX};
