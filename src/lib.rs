//! grpo-forge: recorded agent trajectories in, GRPO training groups out.
//!
//! Trajectories are grouped by time window, converted into role-tagged
//! conversations with per-token trainable masks, scored by a deterministic
//! composite reward, and centered into group-relative advantages. The
//! groups either drive a local candle trainer or are submitted to a remote
//! coordination service.

pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod reward;
pub mod training;
pub mod trajectory;

pub use error::{Error, Result};
