//! Orchestration of the trajectory-to-GRPO loop.
//!
//! Three loops share one [`Pipeline`]:
//!
//! 1. **Local training**: fetch a window group from the cache, convert and
//!    score it, take one optimizer step, checkpoint every
//!    `checkpoint_interval` steps.
//! 2. **Submission**: push converted groups to the coordination service.
//! 3. **Rollout**: ask the inference server for a fresh completion of each
//!    member's conversation, judge the completions, and submit the group.
//!
//! ```text
//! source ──> cache ──> build_group ──> trainer.train_group ──> checkpoint
//!                           │
//!                           └──> coordinator.submit_scored_data
//! ```
//!
//! Groups that fail validation are logged, counted and skipped. Dependency
//! errors end the loop and propagate to the caller.

use std::collections::HashMap;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::convert::converter::{
    calculate_dropout_rate, training_samples, ConvertedTrajectory, TrajectoryConverter,
    MAX_DROPOUT_RATE,
};
use crate::convert::group::{build_group, GroupStats, ScoredGroup};
use crate::convert::mask::create_masks;
use crate::error::{Error, Result};
use crate::model::api::InferenceClient;
use crate::model::coordinator::{CoordinatorClient, Registration};
use crate::model::tokenizer::{format_chatml, ChatMessage, ChatTokenizer, HfChatTokenizer};
use crate::reward::normalizer::RewardNormalizer;
use crate::reward::scorer::judge_completion;
use crate::training::advantage::{center_scores, AdvantageStats};
use crate::training::trainer::{latest_checkpoint, TrainStepReport, Trainer};
use crate::trajectory::cache::{CachePolicy, TrajectoryCache};
use crate::trajectory::source::{load_outcomes, JsonDirSource, TrajectorySource};
use crate::trajectory::types::MarketOutcomes;

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Outcome of a local training run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Optimizer steps taken in this run.
    pub steps_run: u64,
    /// Trainer step after the run, including restored steps.
    pub final_step: u64,
    pub mean_loss: f64,
    pub last_report: Option<TrainStepReport>,
    pub skipped_groups: usize,
    pub checkpoints: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfig,
    source: Box<dyn TrajectorySource>,
    tokenizer: Option<Box<dyn ChatTokenizer>>,
    outcomes: HashMap<String, MarketOutcomes>,
    cache: TrajectoryCache,
    converter: TrajectoryConverter,
    rng: StdRng,
    reward_stats: RewardNormalizer,
    skipped_groups: usize,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn TrajectorySource>,
        tokenizer: Option<Box<dyn ChatTokenizer>>,
    ) -> Result<Self> {
        let policy = CachePolicy {
            min_agents_per_window: config.data.min_agents_per_window,
            min_actions_per_trajectory: config.data.min_actions_per_trajectory,
        };
        let (cache, rng) = match config.data.seed {
            Some(seed) => (
                TrajectoryCache::with_seed(policy, seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (TrajectoryCache::new(policy), StdRng::from_entropy()),
        };
        let converter = TrajectoryConverter::new(config.converter.clone())?;
        let reward_stats = RewardNormalizer::new(config.normalizer);

        Ok(Self {
            config,
            source,
            tokenizer,
            outcomes: HashMap::new(),
            cache,
            converter,
            rng,
            reward_stats,
            skipped_groups: 0,
        })
    }

    /// Build the pipeline the configuration describes: a JSON directory
    /// source, the configured tokenizer and outcomes file, if any.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let source = JsonDirSource::new(&config.data.source_dir)
            .require_llm_calls(config.data.require_llm_calls);
        let tokenizer: Option<Box<dyn ChatTokenizer>> = match &config.model.tokenizer_path {
            Some(path) => Some(Box::new(HfChatTokenizer::from_file(
                path,
                config.model.add_bos,
            )?)),
            None => None,
        };
        let outcomes = match &config.data.outcomes_file {
            Some(path) => load_outcomes(path)?,
            None => HashMap::new(),
        };
        Ok(Self::new(config, Box::new(source), tokenizer)?.with_outcomes(outcomes))
    }

    pub fn with_outcomes(mut self, outcomes: HashMap<String, MarketOutcomes>) -> Self {
        self.outcomes = outcomes;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> Option<&dyn ChatTokenizer> {
        self.tokenizer.as_deref()
    }

    /// Running statistics over every raw score that reached a group.
    pub fn reward_stats(&self) -> &RewardNormalizer {
        &self.reward_stats
    }

    fn record_scores(&mut self, scores: &[f64]) {
        self.reward_stats.update_batch(scores);
        debug!(
            count = self.reward_stats.count(),
            mean = self.reward_stats.mean(),
            std = self.reward_stats.std(),
            "running reward statistics"
        );
    }

    /// Groups skipped for validation failures so far.
    pub fn skipped_groups(&self) -> usize {
        self.skipped_groups
    }

    fn require_tokenizer(&self, purpose: &str) -> Result<&dyn ChatTokenizer> {
        self.tokenizer
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("{purpose} needs a tokenizer")))
    }

    // ------------------------------------------------------------------
    // Conversion
    // ------------------------------------------------------------------

    /// Convert every trajectory the source yields. Trajectories that fail
    /// validation or are dropped for augmentation are skipped.
    ///
    /// With a `target`, a surplus of trajectories is thinned toward that
    /// count by raising the dropout rate, capped at [`MAX_DROPOUT_RATE`].
    pub fn convert_all(&mut self, target: Option<usize>) -> Result<Vec<ConvertedTrajectory>> {
        let trajectories = self.source.load()?;

        let mut thinned;
        let converter = match target {
            Some(target) => {
                let rate = calculate_dropout_rate(trajectories.len(), target, MAX_DROPOUT_RATE);
                let mut config = self.config.converter.clone();
                config.dropout_rate = config.dropout_rate.max(rate);
                info!(
                    loaded = trajectories.len(),
                    target,
                    dropout_rate = config.dropout_rate,
                    "thinning trajectories toward target"
                );
                thinned = TrajectoryConverter::new(config)?;
                &mut thinned
            }
            None => &mut self.converter,
        };

        let mut out = Vec::with_capacity(trajectories.len());
        let mut rejected = 0usize;
        for traj in &trajectories {
            let outcomes = self.outcomes.get(&traj.window_id);
            match converter.convert_trajectory(traj, outcomes, self.tokenizer.as_deref()) {
                Ok(Some(c)) => out.push(c),
                Ok(None) => {}
                Err(e) if e.is_validation() => {
                    warn!(trajectory_id = %traj.trajectory_id, error = %e, "rejected trajectory");
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            loaded = trajectories.len(),
            converted = out.len(),
            rejected,
            "converted trajectories"
        );
        Ok(out)
    }

    /// Supervised chat samples from every LLM call in the source.
    pub fn sft_samples(&self) -> Result<Vec<Vec<ChatMessage>>> {
        let trajectories = self.source.load()?;
        let samples = training_samples(&trajectories);
        info!(trajectories = trajectories.len(), samples = samples.len(), "extracted SFT samples");
        Ok(samples)
    }

    /// The next window group that converts into a valid scored group.
    ///
    /// Windows that fail validation are skipped. Returns `Ok(None)` once
    /// every cached window has been tried without success, or when the
    /// source is empty.
    pub fn next_group(&mut self) -> Result<Option<ScoredGroup>> {
        let mut tried = 0usize;
        loop {
            let Some(window) = self.cache.next_group(self.source.as_ref())? else {
                return Ok(None);
            };
            tried += 1;

            let outcomes = window
                .trajectories
                .first()
                .and_then(|t| self.outcomes.get(&t.window_id));
            match build_group(
                &window.trajectories,
                outcomes,
                &mut self.converter,
                self.tokenizer.as_deref(),
                &self.config.group,
                &mut self.rng,
            ) {
                Ok(group) => {
                    debug!(group_key = %window.group_key, size = group.len(), "built scored group");
                    self.record_scores(&group.raw_scores);
                    return Ok(Some(group));
                }
                Err(e) if e.is_validation() => {
                    self.skipped_groups += 1;
                    warn!(group_key = %window.group_key, error = %e, "skipping window group");
                    if tried >= self.cache.len() {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Local training
    // ------------------------------------------------------------------

    /// Train until the trainer reaches `grpo.training_steps` or no group is
    /// available. Resumes from the latest checkpoint when configured to.
    pub fn train<T: Trainer + ?Sized>(&mut self, trainer: &mut T) -> Result<TrainingSummary> {
        self.require_tokenizer("local training")?;
        let grpo = self.config.grpo.clone();

        if grpo.resume {
            if let Some(dir) = latest_checkpoint(&grpo.checkpoint_dir)? {
                trainer.load_checkpoint(&dir)?;
            }
        }

        let start_step = trainer.step();
        let skipped_before = self.skipped_groups;
        let mut summary = TrainingSummary::default();
        let mut loss_sum = 0.0;
        let mut rejected_in_a_row = 0usize;

        info!(
            backend = ?trainer.backend(),
            start_step,
            target_steps = grpo.training_steps,
            checkpoint_interval = grpo.checkpoint_interval,
            "starting GRPO training"
        );

        while trainer.step() < grpo.training_steps {
            let Some(group) = self.next_group()? else {
                warn!(step = trainer.step(), "no trainable group available, stopping early");
                break;
            };
            let report = match trainer.train_group(&group) {
                Ok(report) => report,
                Err(e) if e.is_validation() => {
                    self.skipped_groups += 1;
                    rejected_in_a_row += 1;
                    warn!(step = trainer.step(), error = %e, "trainer rejected group, skipping");
                    if rejected_in_a_row > self.cache.len() {
                        warn!("every cached group was rejected by the trainer, stopping early");
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            rejected_in_a_row = 0;
            loss_sum += report.loss;
            summary.steps_run += 1;

            info!(
                step = report.step,
                loss = report.loss,
                policy_loss = report.policy_loss,
                entropy = report.entropy,
                grad_norm = report.grad_norm,
                pos_ll = report.pos_mean_log_likelihood,
                non_pos_ll = report.non_pos_mean_log_likelihood,
                group_size = report.group_size,
                "training step completed"
            );

            if grpo.checkpoint_interval > 0 && report.step % grpo.checkpoint_interval == 0 {
                summary
                    .checkpoints
                    .push(trainer.save_checkpoint(&grpo.checkpoint_dir)?);
            }
            summary.last_report = Some(report);
        }

        let final_saved = summary
            .last_report
            .as_ref()
            .is_some_and(|r| grpo.checkpoint_interval > 0 && r.step % grpo.checkpoint_interval == 0);
        if summary.steps_run > 0 && !final_saved {
            summary
                .checkpoints
                .push(trainer.save_checkpoint(&grpo.checkpoint_dir)?);
        }

        summary.final_step = trainer.step();
        summary.skipped_groups = self.skipped_groups - skipped_before;
        if summary.steps_run > 0 {
            summary.mean_loss = loss_sum / summary.steps_run as f64;
        }

        info!(
            steps_run = summary.steps_run,
            final_step = summary.final_step,
            mean_loss = summary.mean_loss,
            skipped_groups = summary.skipped_groups,
            "GRPO training finished"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Remote coordination
    // ------------------------------------------------------------------

    /// Run metadata announced when registering with the coordination
    /// service.
    pub fn registration(&self) -> Registration {
        Registration {
            run_group: self.config.coordinator.wandb_group.clone(),
            run_project: self.config.coordinator.wandb_project.clone(),
            batch_size: self.config.coordinator.batch_size,
            max_token_len: self.config.coordinator.max_token_len,
            checkpoint_dir: self.config.grpo.checkpoint_dir.display().to_string(),
            save_checkpoint_interval: self.config.grpo.checkpoint_interval,
            starting_step: 0,
            num_steps: self.config.grpo.training_steps,
        }
    }

    /// Submit up to `groups` converted groups. Returns how many were sent.
    pub async fn submit(&mut self, coordinator: &CoordinatorClient, groups: usize) -> Result<usize> {
        self.require_tokenizer("submission")?;
        let mut sent = 0;
        while sent < groups {
            let Some(group) = self.next_group()? else {
                warn!(sent, "no more groups to submit");
                break;
            };
            coordinator.submit_group(&group).await?;
            sent += 1;
            info!(sent, size = group.len(), "submitted scored group");
        }
        Ok(sent)
    }

    /// Sample, judge and submit up to `groups` rollout groups. Returns how
    /// many were sent.
    pub async fn rollout(
        &mut self,
        inference: &InferenceClient,
        coordinator: &CoordinatorClient,
        groups: usize,
    ) -> Result<usize> {
        self.require_tokenizer("rollout scoring")?;
        inference.wait_until_healthy().await?;

        let mut sent = 0;
        for _ in 0..groups {
            match self.rollout_group(inference).await {
                Ok(Some(group)) => {
                    coordinator.submit_group(&group).await?;
                    sent += 1;
                    info!(
                        sent,
                        size = group.len(),
                        mean_score = group.stats.advantages.mean_score,
                        "submitted rollout group"
                    );
                }
                Ok(None) => {
                    warn!(sent, "no more groups to roll out");
                    break;
                }
                Err(e) if e.is_validation() => {
                    self.skipped_groups += 1;
                    warn!(error = %e, "skipping rollout group");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Replace each member's final assistant turn with a fresh completion
    /// and score the completions relative to each other.
    pub async fn rollout_group(&mut self, inference: &InferenceClient) -> Result<Option<ScoredGroup>> {
        let tokenizer = self
            .tokenizer
            .as_deref()
            .ok_or_else(|| Error::Validation("rollout scoring needs a tokenizer".into()))?;
        let Some(window) = self.cache.next_group(self.source.as_ref())? else {
            return Ok(None);
        };

        let max = self.config.group.max_group_size.max(2);
        let members: Vec<usize> = if window.trajectories.len() > max {
            sample(&mut self.rng, window.trajectories.len(), max).into_vec()
        } else {
            (0..window.trajectories.len()).collect()
        };

        let mut stats = GroupStats {
            input: window.trajectories.len(),
            sampled: members.len(),
            ..Default::default()
        };
        let mut tokens = Vec::with_capacity(members.len());
        let mut masks = Vec::with_capacity(members.len());
        let mut raw_scores = Vec::with_capacity(members.len());
        let mut trajectory_ids = Vec::with_capacity(members.len());
        let mut messages = Vec::with_capacity(members.len());

        for idx in members {
            let traj = &window.trajectories[idx];
            let outcomes = self.outcomes.get(&traj.window_id);
            let converted = match self.converter.convert_trajectory(traj, outcomes, None) {
                Ok(Some(c)) => c,
                Ok(None) => {
                    stats.dropped += 1;
                    continue;
                }
                Err(e) if e.is_validation() => {
                    warn!(trajectory_id = %traj.trajectory_id, error = %e, "rejected trajectory");
                    stats.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(context) = rollout_context(&converted.messages) else {
                stats.rejected += 1;
                continue;
            };

            let completion = inference.complete(&format_chatml(context, true)).await?;
            let mut conversation = context.to_vec();
            conversation.push(ChatMessage::assistant(completion.trim()));

            let seq = tokenizer.apply_chat_template(&conversation)?;
            let mask = create_masks(&seq, &conversation, tokenizer)?;
            raw_scores.push(judge_completion(
                &completion,
                converted.metadata.final_pnl,
                traj.archetype.as_deref(),
            ));
            tokens.push(seq);
            masks.push(mask);
            trajectory_ids.push(traj.trajectory_id.clone());
            messages.push(conversation);
        }

        if raw_scores.len() < 2 {
            return Err(Error::InsufficientGroup {
                stage: "rollout",
                count: raw_scores.len(),
            });
        }

        self.record_scores(&raw_scores);
        let advantages = center_scores(&raw_scores);
        stats.advantages = AdvantageStats::from_group(&raw_scores, &advantages);
        debug!(group_key = %window.group_key, size = raw_scores.len(), "judged rollout group");

        Ok(Some(ScoredGroup {
            tokens,
            masks,
            advantages,
            raw_scores,
            messages: self.config.converter.include_messages.then_some(messages),
            trajectory_ids,
            stats,
        }))
    }
}

/// Messages preceding the final assistant turn, if the conversation has one
/// with at least one message before it.
pub fn rollout_context(messages: &[ChatMessage]) -> Option<&[ChatMessage]> {
    let last = messages.iter().rposition(ChatMessage::is_assistant)?;
    (last > 0).then(|| &messages[..last])
}
