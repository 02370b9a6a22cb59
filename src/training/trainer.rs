//! The trainer capability and its candle implementation.
//!
//! The backend is probed once, when the trainer is constructed. Each
//! [`Trainer::train_group`] call performs exactly one optimizer step:
//!
//! 1. split the group into mini-batches of `mini_batch_size` sequences;
//! 2. scale each mini-batch loss by `1 / num_mini_batches` and backpropagate,
//!    summing gradients across mini-batches;
//! 3. clip the summed gradients to `max_grad_norm` (global L2 norm);
//! 4. apply AdamW.
//!
//! Checkpoints carry the AdamW moment buffers, so a resumed run continues
//! exactly where the saved one left off.

use std::path::{Path, PathBuf};

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};
use candle_nn::{ParamsAdamW, VarBuilder, VarMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GrpoConfig;
use crate::convert::group::ScoredGroup;
use crate::error::{Error, Result};
use crate::model::policy::{PolicyConfig, TinyPolicy};
use crate::training::grpo::{grpo_loss, GrpoBatch, GrpoLossConfig};
use crate::training::optimizer::{CheckpointedAdamW, OptimizerState, OPTIMIZER_FILE};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const STATE_FILE: &str = "trainer_state.json";

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Cuda,
    Metal,
}

impl Backend {
    /// The best backend this build and machine support: CUDA, then Metal,
    /// then CPU.
    pub fn probe() -> Self {
        if candle_core::utils::cuda_is_available() {
            Backend::Cuda
        } else if candle_core::utils::metal_is_available() {
            Backend::Metal
        } else {
            Backend::Cpu
        }
    }

    pub fn device(self) -> Result<Device> {
        Ok(match self {
            Backend::Cpu => Device::Cpu,
            Backend::Cuda => Device::new_cuda(0)?,
            Backend::Metal => Device::new_metal(0)?,
        })
    }
}

/// Configured backend: probed, or forced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl BackendChoice {
    pub fn resolve(self) -> Backend {
        match self {
            BackendChoice::Auto => Backend::probe(),
            BackendChoice::Cpu => Backend::Cpu,
            BackendChoice::Cuda => Backend::Cuda,
            BackendChoice::Metal => Backend::Metal,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Result of one optimizer step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainStepReport {
    pub step: u64,
    pub loss: f64,
    pub policy_loss: f64,
    pub entropy: f64,
    /// Gradient norm before clipping.
    pub grad_norm: f64,
    pub pos_mean_log_likelihood: f64,
    pub non_pos_mean_log_likelihood: f64,
    pub pos_count: usize,
    pub non_pos_count: usize,
    pub trainable_tokens: usize,
    pub num_mini_batches: usize,
    pub group_size: usize,
}

pub trait Trainer {
    fn backend(&self) -> Backend;

    /// Optimizer steps taken so far, including restored ones.
    fn step(&self) -> u64;

    /// Run one optimizer step on a tokenized group.
    fn train_group(&mut self, group: &ScoredGroup) -> Result<TrainStepReport>;

    /// Write `<root>/step-<n>/` and return its path.
    fn save_checkpoint(&self, root: &Path) -> Result<PathBuf>;

    /// Restore weights, step counter and optimizer state from a checkpoint
    /// directory.
    fn load_checkpoint(&mut self, dir: &Path) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Checkpoint state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub step: u64,
    pub optimizer_state: OptimizerState,
    pub saved_at: DateTime<Utc>,
}

/// The `step-<n>` directory with the highest `n` under `root`, if any.
pub fn latest_checkpoint(root: &Path) -> Result<Option<PathBuf>> {
    if !root.exists() {
        return Ok(None);
    }
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("step-"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(step) = step {
            if path.join(STATE_FILE).exists() && best.as_ref().map_or(true, |(b, _)| step > *b) {
                best = Some((step, path));
            }
        }
    }
    Ok(best.map(|(_, p)| p))
}

// ---------------------------------------------------------------------------
// Candle trainer
// ---------------------------------------------------------------------------

pub struct CandleTrainer {
    backend: Backend,
    device: Device,
    vars: VarMap,
    model: TinyPolicy,
    optimizer: CheckpointedAdamW,
    loss_config: GrpoLossConfig,
    mini_batch_size: usize,
    max_grad_norm: f64,
    step: u64,
    tokenizer_file: Option<PathBuf>,
}

impl CandleTrainer {
    pub fn new(
        backend: Backend,
        policy: PolicyConfig,
        config: &GrpoConfig,
        tokenizer_file: Option<PathBuf>,
    ) -> Result<Self> {
        let device = backend.device()?;
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &device);
        let model = TinyPolicy::new(vb, policy)?;

        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = CheckpointedAdamW::new(&vars, params)?;

        info!(
            ?backend,
            vocab_size = policy.vocab_size,
            hidden_size = policy.hidden_size,
            parameters = vars.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            lr = config.learning_rate,
            "initialized candle trainer"
        );

        Ok(Self {
            backend,
            device,
            vars,
            model,
            optimizer,
            loss_config: GrpoLossConfig {
                temperature: config.temperature,
                entropy_coeff: config.entropy_coeff,
                vocab_size: Some(policy.vocab_size),
            },
            mini_batch_size: config.mini_batch_size.max(1),
            max_grad_norm: config.max_grad_norm,
            step: 0,
            tokenizer_file,
        })
    }

    pub fn model(&self) -> &TinyPolicy {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}

impl Trainer for CandleTrainer {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn step(&self) -> u64 {
        self.step
    }

    fn train_group(&mut self, group: &ScoredGroup) -> Result<TrainStepReport> {
        if !group.is_tokenized() {
            return Err(Error::Validation(
                "group has no token data; convert with a tokenizer".into(),
            ));
        }

        let batch = GrpoBatch {
            tokens: &group.tokens,
            masks: &group.masks,
            advantages: &group.advantages,
        };
        let n = batch.len();
        let num_mini_batches = n.div_ceil(self.mini_batch_size);
        let scale = 1.0 / num_mini_batches as f64;

        let mut report = TrainStepReport {
            num_mini_batches,
            group_size: n,
            ..Default::default()
        };
        let (mut pos_ll, mut neg_ll) = (0.0, 0.0);
        let mut grads: Option<GradStore> = None;

        for start in (0..n).step_by(self.mini_batch_size) {
            let end = (start + self.mini_batch_size).min(n);
            let mini = batch.slice(start, end);
            let (loss, diag) = grpo_loss(&self.model, &mini, &self.loss_config, &self.device)?;

            let mini_grads = (loss * scale)?.backward()?;
            match grads.as_mut() {
                Some(acc) => accumulate(acc, mini_grads, &self.vars.all_vars())?,
                None => grads = Some(mini_grads),
            }

            report.loss += diag.total_loss * scale;
            report.policy_loss += diag.policy_loss * scale;
            report.entropy += diag.entropy * scale;
            report.pos_count += diag.pos_count;
            report.non_pos_count += diag.non_pos_count;
            report.trainable_tokens += diag.trainable_tokens;
            pos_ll += diag.pos_mean_log_likelihood * diag.pos_count as f64;
            neg_ll += diag.non_pos_mean_log_likelihood * diag.non_pos_count as f64;

            debug!(start, end, loss = diag.total_loss, "mini-batch backward");
        }

        let Some(mut grads) = grads else {
            return Err(Error::Validation("group produced no mini-batches".into()));
        };

        report.grad_norm = clip_grad_norm(&mut grads, &self.vars.all_vars(), self.max_grad_norm)?;
        self.optimizer.step(&grads)?;
        self.step += 1;

        if report.pos_count > 0 {
            report.pos_mean_log_likelihood = pos_ll / report.pos_count as f64;
        }
        if report.non_pos_count > 0 {
            report.non_pos_mean_log_likelihood = neg_ll / report.non_pos_count as f64;
        }
        report.step = self.step;

        info!(
            step = self.step,
            loss = report.loss,
            entropy = report.entropy,
            grad_norm = report.grad_norm,
            mini_batches = num_mini_batches,
            "optimizer step"
        );
        Ok(report)
    }

    fn save_checkpoint(&self, root: &Path) -> Result<PathBuf> {
        let dir = root.join(format!("step-{}", self.step));
        std::fs::create_dir_all(&dir)?;

        self.vars.save(dir.join(WEIGHTS_FILE))?;
        self.optimizer.save(&dir.join(OPTIMIZER_FILE))?;
        if let Some(tokenizer) = &self.tokenizer_file {
            std::fs::copy(tokenizer, dir.join(TOKENIZER_FILE))?;
        }

        let state = TrainerState {
            step: self.step,
            optimizer_state: self.optimizer.state(),
            saved_at: Utc::now(),
        };
        std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(&state)?)?;

        info!(path = %dir.display(), step = self.step, "saved checkpoint");
        Ok(dir)
    }

    fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let state: TrainerState =
            serde_json::from_str(&std::fs::read_to_string(dir.join(STATE_FILE))?)?;
        self.vars.load(dir.join(WEIGHTS_FILE))?;

        self.optimizer
            .load(&dir.join(OPTIMIZER_FILE), &state.optimizer_state)?;
        self.step = state.step;

        info!(
            path = %dir.display(),
            step = state.step,
            saved_at = %state.saved_at,
            "restored checkpoint"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gradient helpers
// ---------------------------------------------------------------------------

/// Add `other`'s gradients into `acc`, variable by variable.
fn accumulate(acc: &mut GradStore, other: GradStore, vars: &[Var]) -> Result<()> {
    for var in vars {
        let t = var.as_tensor();
        if let Some(g) = other.get(t) {
            let sum = match acc.remove(t) {
                Some(a) => (a + g)?,
                None => g.clone(),
            };
            acc.insert(t, sum);
        }
    }
    Ok(())
}

/// Scale gradients so their global L2 norm is at most `max_norm`. Returns
/// the norm before scaling. A non-positive `max_norm` disables clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_sq += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total_sq.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            let t = var.as_tensor();
            if let Some(g) = grads.remove(t) {
                grads.insert(t, (g * scale)?);
            }
        }
        debug!(norm, max_norm, "clipped gradients");
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use candle_core::Tensor;

    use super::*;
    use crate::convert::group::GroupStats;
    use crate::convert::mask::IGNORE_INDEX;

    fn policy() -> PolicyConfig {
        PolicyConfig {
            vocab_size: 12,
            hidden_size: 8,
            num_layers: 1,
        }
    }

    fn grpo(mini_batch_size: usize) -> GrpoConfig {
        GrpoConfig {
            learning_rate: 0.05,
            weight_decay: 0.0,
            mini_batch_size,
            ..Default::default()
        }
    }

    fn group() -> ScoredGroup {
        ScoredGroup {
            tokens: vec![vec![1, 2, 3, 4], vec![1, 2, 5, 6], vec![1, 2, 7, 8]],
            masks: vec![
                vec![IGNORE_INDEX, IGNORE_INDEX, 3, 4],
                vec![IGNORE_INDEX, IGNORE_INDEX, 5, 6],
                vec![IGNORE_INDEX, IGNORE_INDEX, 7, 8],
            ],
            advantages: vec![1.0, -0.5, -0.5],
            raw_scores: vec![0.9, 0.2, 0.2],
            messages: None,
            trajectory_ids: vec!["a".into(), "b".into(), "c".into()],
            stats: GroupStats::default(),
        }
    }

    #[test]
    fn test_backend_choice() {
        assert_eq!(BackendChoice::Cpu.resolve(), Backend::Cpu);
        let probed = BackendChoice::Auto.resolve();
        assert_eq!(probed, Backend::probe());
        let choice: BackendChoice = serde_json::from_str("\"metal\"").unwrap();
        assert_eq!(choice, BackendChoice::Metal);
    }

    #[test]
    fn test_training_raises_positive_likelihood() {
        let mut trainer = CandleTrainer::new(Backend::Cpu, policy(), &grpo(2), None).unwrap();
        let group = group();
        let first = trainer.train_group(&group).unwrap();
        assert_eq!(first.step, 1);
        assert_eq!(first.num_mini_batches, 2);
        assert_eq!(first.group_size, 3);
        assert_eq!((first.pos_count, first.non_pos_count), (1, 2));

        let mut last = first.clone();
        for _ in 0..30 {
            last = trainer.train_group(&group).unwrap();
        }
        assert_eq!(trainer.step(), 31);
        assert!(
            last.pos_mean_log_likelihood > first.pos_mean_log_likelihood,
            "{} should exceed {}",
            last.pos_mean_log_likelihood,
            first.pos_mean_log_likelihood
        );
    }

    #[test]
    fn test_untokenized_group_rejected() {
        let mut trainer = CandleTrainer::new(Backend::Cpu, policy(), &grpo(2), None).unwrap();
        let mut g = group();
        g.tokens = vec![Vec::new(), Vec::new()];
        assert!(trainer.train_group(&g).unwrap_err().is_validation());
    }

    #[test]
    fn test_clip_grad_norm() {
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(2, "w", candle_nn::Init::Const(1.0)).unwrap();
        let loss = ((&w * 3.0).unwrap().sum_all().unwrap() * 2.0).unwrap();
        // d loss / d w = [6, 6], norm 6 * sqrt(2).
        let mut grads = loss.backward().unwrap();
        let all = vars.all_vars();
        let norm = clip_grad_norm(&mut grads, &all, 1.0).unwrap();
        assert!((norm - 6.0 * 2f64.sqrt()).abs() < 1e-4);

        let clipped = grads.get(all[0].as_tensor()).unwrap();
        let clipped_norm = clipped.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap().sqrt();
        assert!((clipped_norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_accumulate_sums() {
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(3, "w", candle_nn::Init::Const(0.5)).unwrap();
        let mut a = w.sum_all().unwrap().backward().unwrap();
        let b = (w.sum_all().unwrap() * 2.0).unwrap().backward().unwrap();
        let all = vars.all_vars();
        accumulate(&mut a, b, &all).unwrap();
        let g: Vec<f32> = a.get(all[0].as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = dir.path().join("source-tokenizer.json");
        std::fs::write(&tokenizer, "{}").unwrap();

        let mut trainer =
            CandleTrainer::new(Backend::Cpu, policy(), &grpo(3), Some(tokenizer)).unwrap();
        trainer.train_group(&group()).unwrap();
        trainer.train_group(&group()).unwrap();
        let saved = trainer.save_checkpoint(dir.path()).unwrap();
        assert!(saved.ends_with("step-2"));
        assert!(saved.join(WEIGHTS_FILE).exists());
        assert!(saved.join(TOKENIZER_FILE).exists());
        assert!(saved.join(OPTIMIZER_FILE).exists());

        let mut restored = CandleTrainer::new(
            Backend::Cpu,
            policy(),
            &GrpoConfig {
                learning_rate: 0.9,
                ..grpo(3)
            },
            None,
        )
        .unwrap();
        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(latest, saved);
        restored.load_checkpoint(&latest).unwrap();
        assert_eq!(restored.step(), 2);
        assert_eq!(restored.learning_rate(), 0.05);

        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let a: Vec<f32> = candle_core::Module::forward(trainer.model(), &ids)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = candle_core::Module::forward(restored.model(), &ids)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    fn logits(trainer: &CandleTrainer) -> Vec<f32> {
        let ids = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        candle_core::Module::forward(trainer.model(), &ids)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_resumed_run_matches_continuous_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut continuous = CandleTrainer::new(Backend::Cpu, policy(), &grpo(2), None).unwrap();
        continuous.train_group(&group()).unwrap();
        continuous.train_group(&group()).unwrap();
        let saved = continuous.save_checkpoint(dir.path()).unwrap();

        let state: TrainerState =
            serde_json::from_str(&std::fs::read_to_string(saved.join(STATE_FILE)).unwrap())
                .unwrap();
        assert_eq!(state.optimizer_state.t, 2);

        let mut resumed = CandleTrainer::new(Backend::Cpu, policy(), &grpo(2), None).unwrap();
        resumed.load_checkpoint(&saved).unwrap();

        let a = continuous.train_group(&group()).unwrap();
        let b = resumed.train_group(&group()).unwrap();
        assert_eq!(a.step, 3);
        assert_eq!(b.step, 3);
        assert_eq!(a.loss, b.loss);
        assert_eq!(logits(&continuous), logits(&resumed));
    }

    #[test]
    fn test_out_of_vocab_input_is_a_validation_error() {
        let mut trainer = CandleTrainer::new(Backend::Cpu, policy(), &grpo(3), None).unwrap();
        let mut g = group();
        g.tokens[1][1] = 12;
        let err = trainer.train_group(&g).unwrap_err();
        assert!(err.is_validation(), "{err}");
        assert_eq!(trainer.step(), 0);
    }

    #[test]
    fn test_latest_checkpoint_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(dir.path()).unwrap().is_none());
        assert!(latest_checkpoint(&dir.path().join("missing")).unwrap().is_none());
    }
}
