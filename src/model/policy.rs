//! Minimal trainable language model.
//!
//! A token embedding followed by a stack of `Linear -> Tanh` layers and a
//! vocabulary head. Each position predicts the next token from its own
//! embedding only, which is enough to exercise the GRPO objective end to end
//! without committing to an architecture.

use candle_core::{Module, Result, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32_000,
            hidden_size: 64,
            num_layers: 2,
        }
    }
}

pub struct TinyPolicy {
    embed: Embedding,
    layers: Vec<Linear>,
    head: Linear,
    config: PolicyConfig,
}

impl TinyPolicy {
    pub fn new(vb: VarBuilder, config: PolicyConfig) -> Result<Self> {
        let embed = embedding(config.vocab_size, config.hidden_size, vb.pp("embed"))?;
        let layers = (0..config.num_layers)
            .map(|i| linear(config.hidden_size, config.hidden_size, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let head = linear(config.hidden_size, config.vocab_size, vb.pp("head"))?;
        Ok(Self {
            embed,
            layers,
            head,
            config,
        })
    }

    pub fn config(&self) -> PolicyConfig {
        self.config
    }
}

impl Module for TinyPolicy {
    /// `(batch, seq)` token ids to `(batch, seq, vocab)` logits.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.embed.forward(xs)?;
        for layer in &self.layers {
            h = layer.forward(&h)?.tanh()?;
        }
        self.head.forward(&h)
    }
}
