//! Recorded agent trajectories.
//!
//! - [`types`] -- the canonical data model (trajectory, step, LLM call, action).
//! - [`source`] -- where trajectories come from, and normalization of the
//!   raw record shapes into [`types::Trajectory`].
//! - [`cache`] -- an owned cache that groups trajectories by window and
//!   reloads from its source when empty.

pub mod cache;
pub mod source;
pub mod types;

pub use cache::{CachePolicy, TrajectoryCache, TrajectoryGroup};
pub use source::{load_outcomes, normalize_record, JsonDirSource, MemorySource, TrajectorySource};
pub use types::{Action, EnvironmentState, LlmCall, MarketOutcomes, Step, Trajectory};
