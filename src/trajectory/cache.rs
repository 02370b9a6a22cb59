//! An owned cache of trajectory groups.
//!
//! Trajectories are grouped by `(window, scenario)` so that every group holds
//! alternative episodes recorded under the same market conditions. The cache
//! hands groups out round-robin and reloads from its source once it is empty.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::trajectory::source::TrajectorySource;
use crate::trajectory::types::Trajectory;

/// Trajectories recorded in the same window and scenario.
#[derive(Debug, Clone)]
pub struct TrajectoryGroup {
    /// `"{window_id}_{scenario_id}"`, with `default` for a missing scenario.
    pub group_key: String,
    pub trajectories: Vec<Trajectory>,
}

/// Filters applied when groups are (re)built.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    /// Groups with fewer members are discarded.
    pub min_agents_per_window: usize,
    /// Trajectories with fewer steps are discarded.
    pub min_actions_per_trajectory: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            min_agents_per_window: 2,
            min_actions_per_trajectory: 3,
        }
    }
}

/// Owned, explicitly reloaded cache of trajectory groups.
pub struct TrajectoryCache {
    groups: Vec<TrajectoryGroup>,
    cursor: usize,
    policy: CachePolicy,
    rng: StdRng,
}

impl TrajectoryCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            groups: Vec::new(),
            cursor: 0,
            policy,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed seed for the group shuffle.
    pub fn with_seed(policy: CachePolicy, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(policy)
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Drop every cached group; the next [`next_group`](Self::next_group)
    /// call reloads from the source.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.cursor = 0;
    }

    /// Replace the cached groups with a fresh load from `source`.
    pub fn reload(&mut self, source: &dyn TrajectorySource) -> Result<usize> {
        let trajectories = source.load()?;
        let loaded = trajectories.len();
        self.groups = group_trajectories(trajectories, &self.policy);
        self.groups.shuffle(&mut self.rng);
        self.cursor = 0;

        info!(
            loaded,
            groups = self.groups.len(),
            min_agents = self.policy.min_agents_per_window,
            "trajectory cache reloaded"
        );
        Ok(self.groups.len())
    }

    /// Return the next group, reloading first if the cache is empty.
    ///
    /// Returns `Ok(None)` when the source has nothing usable.
    pub fn next_group(&mut self, source: &dyn TrajectorySource) -> Result<Option<TrajectoryGroup>> {
        if self.groups.is_empty() {
            self.reload(source)?;
        }
        if self.groups.is_empty() {
            warn!("no trajectory groups available");
            return Ok(None);
        }

        let idx = self.cursor % self.groups.len();
        self.cursor += 1;
        let group = self.groups[idx].clone();
        debug!(group_key = %group.group_key, size = group.trajectories.len(), "serving trajectory group");
        Ok(Some(group))
    }
}

/// Group trajectories by window and scenario, applying the cache policy.
pub fn group_trajectories(
    trajectories: Vec<Trajectory>,
    policy: &CachePolicy,
) -> Vec<TrajectoryGroup> {
    let mut groups: HashMap<String, Vec<Trajectory>> = HashMap::new();
    for t in trajectories {
        if t.steps.len() < policy.min_actions_per_trajectory {
            continue;
        }
        let key = format!(
            "{}_{}",
            t.window_id,
            t.scenario_id.as_deref().unwrap_or("default")
        );
        groups.entry(key).or_default().push(t);
    }

    let mut out: Vec<TrajectoryGroup> = groups
        .into_iter()
        .filter(|(_, v)| v.len() >= policy.min_agents_per_window)
        .map(|(group_key, trajectories)| TrajectoryGroup {
            group_key,
            trajectories,
        })
        .collect();
    // HashMap order is random; sort so the seeded shuffle is reproducible.
    out.sort_by(|a, b| a.group_key.cmp(&b.group_key));
    out
}
