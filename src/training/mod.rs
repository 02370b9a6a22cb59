//! GRPO training.
//!
//! - [`advantage`] -- group-relative score centering and z-scoring.
//! - [`grpo`] -- the masked, length-normalized GRPO loss.
//! - [`optimizer`] -- AdamW with checkpointable moment buffers.
//! - [`trainer`] -- the trainer capability, backend probe and checkpoints.
//! - [`pipeline`] -- the loops that tie sources, conversion, training and
//!   the remote services together.

pub mod advantage;
pub mod grpo;
pub mod optimizer;
pub mod pipeline;
pub mod trainer;

pub use advantage::{center_scores, compute_group_advantages, AdvantageStats};
pub use grpo::{grpo_loss, GrpoBatch, GrpoDiagnostics, GrpoLossConfig};
pub use optimizer::{CheckpointedAdamW, OptimizerState};
pub use pipeline::{Pipeline, TrainingSummary};
pub use trainer::{Backend, BackendChoice, CandleTrainer, TrainStepReport, Trainer};
