//! Group Relative Policy Optimization (GRPO) objective.
//!
//! For a batch of B sequences with advantages A_i:
//!
//!   ll_i   = (1 / |M_i|) * sum_{t in M_i} log pi_theta(x_{t+1} | x_{<=t}) / T
//!   L_pg   = -mean_i(A_i * ll_i)
//!   H      = mean over trainable positions of the per-token entropy
//!   L      = L_pg - c_H * H
//!
//! where:
//!   - M_i is the set of trainable target positions of sequence i
//!   - T is the sampling temperature applied to the logits
//!   - c_H is the entropy coefficient
//!
//! Length normalization keeps long assistant spans from dominating the
//! gradient. The forward pass has no randomness, so identical inputs give
//! bit-identical losses.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::ops::{log_softmax, softmax};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convert::mask::IGNORE_INDEX;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrpoLossConfig {
    /// Logits are divided by this before the softmax. Must be positive.
    pub temperature: f64,
    /// Weight of the entropy bonus.
    pub entropy_coeff: f64,
    /// Model vocabulary. When set, token ids are checked before the forward
    /// pass; otherwise only against the logits width afterwards.
    #[serde(default)]
    pub vocab_size: Option<usize>,
}

impl Default for GrpoLossConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            entropy_coeff: 0.01,
            vocab_size: None,
        }
    }
}

/// Parallel token, mask and advantage sequences for one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct GrpoBatch<'a> {
    pub tokens: &'a [Vec<u32>],
    pub masks: &'a [Vec<i64>],
    pub advantages: &'a [f64],
}

impl<'a> GrpoBatch<'a> {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Sub-batch covering sequences `start..end`.
    pub fn slice(&self, start: usize, end: usize) -> GrpoBatch<'a> {
        GrpoBatch {
            tokens: &self.tokens[start..end],
            masks: &self.masks[start..end],
            advantages: &self.advantages[start..end],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::Validation("GRPO batch is empty".into()));
        }
        if self.masks.len() != self.len() || self.advantages.len() != self.len() {
            return Err(Error::Validation(format!(
                "GRPO batch has {} token rows, {} mask rows and {} advantages",
                self.len(),
                self.masks.len(),
                self.advantages.len()
            )));
        }
        for (i, (t, m)) in self.tokens.iter().zip(self.masks).enumerate() {
            if t.len() != m.len() {
                return Err(Error::Validation(format!(
                    "sequence {i} has {} tokens but {} mask entries",
                    t.len(),
                    m.len()
                )));
            }
        }
        if self.tokens.iter().all(|t| t.len() < 2) {
            return Err(Error::Validation(
                "GRPO batch needs at least one sequence with 2+ tokens".into(),
            ));
        }
        Ok(())
    }

    fn check_vocab(&self, vocab: usize) -> Result<()> {
        match self.tokens.iter().flatten().find(|&&t| t as usize >= vocab) {
            Some(&bad) => Err(Error::Validation(format!(
                "token id {bad} is outside the model vocabulary of {vocab}"
            ))),
            None => Ok(()),
        }
    }
}

/// Scalars reported for one loss evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpoDiagnostics {
    pub total_loss: f64,
    pub policy_loss: f64,
    pub entropy: f64,
    /// Mean normalized log-likelihood of sequences with advantage > 0.
    pub pos_mean_log_likelihood: f64,
    /// Mean normalized log-likelihood of sequences with advantage <= 0.
    pub non_pos_mean_log_likelihood: f64,
    pub pos_count: usize,
    pub non_pos_count: usize,
    pub trainable_tokens: usize,
}

// ---------------------------------------------------------------------------
// Loss
// ---------------------------------------------------------------------------

/// Compute the GRPO loss and its diagnostics.
///
/// `model` maps `(batch, seq)` u32 token ids to `(batch, seq, vocab)`
/// logits. Sequences are right-padded; padded positions never count.
///
/// # Errors
///
/// Returns a validation error for mismatched lengths, a non-positive
/// temperature, or token ids outside the model's vocabulary.
pub fn grpo_loss<M: Module + ?Sized>(
    model: &M,
    batch: &GrpoBatch<'_>,
    config: &GrpoLossConfig,
    device: &Device,
) -> Result<(Tensor, GrpoDiagnostics)> {
    batch.validate()?;
    if !(config.temperature > 0.0 && config.temperature.is_finite()) {
        return Err(Error::Validation(format!(
            "temperature must be positive, got {}",
            config.temperature
        )));
    }
    if let Some(vocab) = config.vocab_size {
        batch.check_vocab(vocab)?;
    }

    let b = batch.len();
    let max_len = batch.tokens.iter().map(Vec::len).max().unwrap_or(0);
    let steps = max_len - 1;

    // Inputs are positions 0..n-1, targets 1..n; weights mark trainable
    // targets.
    let mut inputs = vec![0u32; b * steps];
    let mut targets = vec![0u32; b * steps];
    let mut weights = vec![0f32; b * steps];
    let mut counts = vec![0usize; b];
    for (i, (tokens, masks)) in batch.tokens.iter().zip(batch.masks).enumerate() {
        for t in 0..tokens.len().saturating_sub(1) {
            let idx = i * steps + t;
            inputs[idx] = tokens[t];
            targets[idx] = tokens[t + 1];
            if masks[t + 1] != IGNORE_INDEX {
                weights[idx] = 1.0;
                counts[i] += 1;
            }
        }
    }
    let trainable_tokens: usize = counts.iter().sum();

    let inputs = Tensor::from_vec(inputs, (b, steps), device)?;
    let logits = model.forward(&inputs)?.to_dtype(DType::F32)?;
    let (_, _, vocab) = logits.dims3()?;
    batch.check_vocab(vocab)?;

    let scaled = (logits / config.temperature)?;
    let log_probs = log_softmax(&scaled, D::Minus1)?;

    let targets = Tensor::from_vec(targets, (b, steps, 1), device)?;
    let token_log_probs = log_probs.gather(&targets, D::Minus1)?.squeeze(D::Minus1)?;
    let weights = Tensor::from_vec(weights, (b, steps), device)?;

    // Length-normalized log-likelihood per sequence.
    let denom: Vec<f32> = counts.iter().map(|&c| c.max(1) as f32).collect();
    let denom = Tensor::from_vec(denom, b, device)?;
    let seq_ll = (&token_log_probs * &weights)?.sum(1)?.div(&denom)?;

    let adv: Vec<f32> = batch.advantages.iter().map(|&a| a as f32).collect();
    let adv_t = Tensor::from_vec(adv, b, device)?;
    let policy_loss = (&seq_ll * &adv_t)?.mean_all()?.neg()?;

    let probs = softmax(&scaled, D::Minus1)?;
    let token_entropy = (&probs * &log_probs)?.sum(D::Minus1)?.neg()?;
    let entropy = ((&token_entropy * &weights)?.sum_all()? / trainable_tokens.max(1) as f64)?;

    let loss = (&policy_loss - (&entropy * config.entropy_coeff)?)?;

    // Diagnostics.
    let seq_ll_host: Vec<f32> = seq_ll.to_vec1()?;
    let (mut pos_sum, mut pos_count, mut neg_sum, mut neg_count) = (0.0f64, 0usize, 0.0f64, 0usize);
    for (&ll, &a) in seq_ll_host.iter().zip(batch.advantages) {
        if a > 0.0 {
            pos_sum += ll as f64;
            pos_count += 1;
        } else {
            neg_sum += ll as f64;
            neg_count += 1;
        }
    }
    let mean_or_zero = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };

    let diagnostics = GrpoDiagnostics {
        total_loss: loss.to_scalar::<f32>()? as f64,
        policy_loss: policy_loss.to_scalar::<f32>()? as f64,
        entropy: entropy.to_scalar::<f32>()? as f64,
        pos_mean_log_likelihood: mean_or_zero(pos_sum, pos_count),
        non_pos_mean_log_likelihood: mean_or_zero(neg_sum, neg_count),
        pos_count,
        non_pos_count: neg_count,
        trainable_tokens,
    };

    debug!(
        batch = b,
        steps,
        trainable_tokens,
        loss = diagnostics.total_loss,
        entropy = diagnostics.entropy,
        "computed GRPO loss"
    );

    Ok((loss, diagnostics))
}

#[cfg(test)]
mod tests {
    use candle_nn::{VarBuilder, VarMap};

    use super::*;
    use crate::model::policy::{PolicyConfig, TinyPolicy};

    const VOCAB: usize = 16;

    fn config() -> PolicyConfig {
        PolicyConfig {
            vocab_size: VOCAB,
            hidden_size: 8,
            num_layers: 1,
        }
    }

    /// All parameters zero: logits are zero, so every distribution is uniform.
    fn uniform_model() -> TinyPolicy {
        TinyPolicy::new(VarBuilder::zeros(DType::F32, &Device::Cpu), config()).unwrap()
    }

    fn random_model() -> (VarMap, TinyPolicy) {
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &Device::Cpu);
        let model = TinyPolicy::new(vb, config()).unwrap();
        (vars, model)
    }

    fn sample() -> (Vec<Vec<u32>>, Vec<Vec<i64>>) {
        let tokens = vec![vec![1, 2, 3, 4, 5], vec![1, 6, 7, 8]];
        let masks = vec![
            vec![IGNORE_INDEX, IGNORE_INDEX, 3, 4, 5],
            vec![IGNORE_INDEX, IGNORE_INDEX, IGNORE_INDEX, 8],
        ];
        (tokens, masks)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    #[test]
    fn test_uniform_model_closed_form() {
        let model = uniform_model();
        let (tokens, masks) = sample();
        let advantages = vec![1.0, 0.0];
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        let (_, d) = grpo_loss(&model, &batch, &GrpoLossConfig::default(), &Device::Cpu).unwrap();

        let ln_v = (VOCAB as f64).ln();
        assert!((d.entropy - ln_v).abs() < 1e-4);
        assert!((d.policy_loss - ln_v / 2.0).abs() < 1e-4);
        assert!((d.total_loss - (ln_v / 2.0 - 0.01 * ln_v)).abs() < 1e-4);
        assert!((d.pos_mean_log_likelihood + ln_v).abs() < 1e-4);
        assert!((d.non_pos_mean_log_likelihood + ln_v).abs() < 1e-4);
        assert_eq!((d.pos_count, d.non_pos_count), (1, 1));
        assert_eq!(d.trainable_tokens, 4);
    }

    #[test]
    fn test_empty_subset_reports_zero() {
        let model = uniform_model();
        let (tokens, masks) = sample();
        let advantages = vec![0.5, 0.25];
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        let (_, d) = grpo_loss(&model, &batch, &GrpoLossConfig::default(), &Device::Cpu).unwrap();
        assert_eq!(d.non_pos_count, 0);
        assert_eq!(d.non_pos_mean_log_likelihood, 0.0);
    }

    #[test]
    fn test_loss_is_reproducible() {
        let (_vars, model) = random_model();
        let (tokens, masks) = sample();
        let advantages = vec![0.3, -0.3];
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        let cfg = GrpoLossConfig {
            temperature: 0.7,
            ..Default::default()
        };
        let (a, da) = grpo_loss(&model, &batch, &cfg, &Device::Cpu).unwrap();
        let (b, db) = grpo_loss(&model, &batch, &cfg, &Device::Cpu).unwrap();
        assert_eq!(
            a.to_scalar::<f32>().unwrap().to_bits(),
            b.to_scalar::<f32>().unwrap().to_bits()
        );
        assert_eq!(da, db);
    }

    #[test]
    fn test_ignored_targets_do_not_contribute() {
        let (_vars, model) = random_model();
        let (mut tokens, masks) = sample();
        let advantages = vec![1.0, -1.0];
        let cfg = GrpoLossConfig::default();

        let (_, before) = grpo_loss(
            &model,
            &GrpoBatch { tokens: &tokens, masks: &masks, advantages: &advantages },
            &cfg,
            &Device::Cpu,
        )
        .unwrap();
        // Position 1 of the second sequence is an ignored target; changing it
        // only changes the input feeding another ignored target.
        tokens[1][1] = 9;
        let (_, after) = grpo_loss(
            &model,
            &GrpoBatch { tokens: &tokens, masks: &masks, advantages: &advantages },
            &cfg,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(before.total_loss, after.total_loss);
    }

    #[test]
    fn test_gradients_flow() {
        let (vars, model) = random_model();
        let (tokens, masks) = sample();
        let advantages = vec![1.0, -1.0];
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        let (loss, _) = grpo_loss(&model, &batch, &GrpoLossConfig::default(), &Device::Cpu).unwrap();
        let grads = loss.backward().unwrap();
        let with_grad = vars
            .all_vars()
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        assert!(with_grad > 0);
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    #[test]
    fn test_rejects_mismatched_lengths() {
        let model = uniform_model();
        let (tokens, mut masks) = sample();
        masks[0].pop();
        let advantages = vec![1.0, 0.0];
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        let err = grpo_loss(&model, &batch, &GrpoLossConfig::default(), &Device::Cpu).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_rejects_bad_temperature_and_vocab() {
        let model = uniform_model();
        let (mut tokens, masks) = sample();
        let advantages = vec![1.0, 0.0];
        let cfg = GrpoLossConfig {
            temperature: 0.0,
            ..Default::default()
        };
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        assert!(grpo_loss(&model, &batch, &cfg, &Device::Cpu).unwrap_err().is_validation());

        tokens[0][4] = VOCAB as u32;
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        let err = grpo_loss(&model, &batch, &GrpoLossConfig::default(), &Device::Cpu).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_rejects_out_of_vocab_input_token() {
        let model = uniform_model();
        let (mut tokens, masks) = sample();
        let advantages = vec![1.0, 0.0];
        // Position 1 feeds the embedding lookup, not just a target.
        tokens[0][1] = VOCAB as u32;
        let batch = GrpoBatch {
            tokens: &tokens,
            masks: &masks,
            advantages: &advantages,
        };
        let cfg = GrpoLossConfig {
            vocab_size: Some(VOCAB),
            ..Default::default()
        };
        let err = grpo_loss(&model, &batch, &cfg, &Device::Cpu).unwrap_err();
        assert!(err.is_validation(), "{err}");
    }
}
