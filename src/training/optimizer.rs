//! AdamW whose moment buffers can be checkpointed.
//!
//! candle's `AdamW` keeps its first/second moments private, so a restored
//! run would restart them from zero. This optimizer applies the same update
//! but holds the moments as named [`Var`]s in their own [`VarMap`], which is
//! written next to the weights and loaded back verbatim together with the
//! bias-correction step `t`.

use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";

/// Hyper-parameters and step count saved alongside the moment buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    /// Updates applied so far; drives bias correction.
    #[serde(default)]
    pub t: u64,
}

impl From<&OptimizerState> for ParamsAdamW {
    fn from(s: &OptimizerState) -> Self {
        ParamsAdamW {
            lr: s.learning_rate,
            beta1: s.beta1,
            beta2: s.beta2,
            eps: s.eps,
            weight_decay: s.weight_decay,
        }
    }
}

struct Slot {
    theta: Var,
    m: Var,
    v: Var,
}

pub struct CheckpointedAdamW {
    params: ParamsAdamW,
    slots: Vec<Slot>,
    moments: VarMap,
    t: u64,
}

impl CheckpointedAdamW {
    /// Zeroed moments for every variable in `vars`. Moment `<name>.m` and
    /// `<name>.v` shadow parameter `<name>`.
    pub fn new(vars: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let moments = VarMap::new();
        let mut slots = Vec::new();
        {
            let mut store = moments.data().lock().map_err(|_| poisoned())?;
            for (name, theta) in named_vars(vars)? {
                let m = Var::zeros(theta.dims(), theta.dtype(), theta.device())?;
                let v = Var::zeros(theta.dims(), theta.dtype(), theta.device())?;
                store.insert(format!("{name}.m"), m.clone());
                store.insert(format!("{name}.v"), v.clone());
                slots.push(Slot { theta, m, v });
            }
        }
        Ok(Self {
            params,
            slots,
            moments,
            t: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn t(&self) -> u64 {
        self.t
    }

    /// One decoupled-weight-decay Adam update from `grads`.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let ParamsAdamW {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.t as i32));

        for slot in &self.slots {
            let Some(g) = grads.get(slot.theta.as_tensor()) else {
                continue;
            };
            let next_m = ((slot.m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
            let next_v = ((slot.v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (slot.theta.as_tensor() * (1.0 - lr * weight_decay))?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (decayed - (update * lr)?)?;

            slot.m.set(&next_m)?;
            slot.v.set(&next_v)?;
            slot.theta.set(&next_theta)?;
        }
        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            learning_rate: self.params.lr,
            beta1: self.params.beta1,
            beta2: self.params.beta2,
            eps: self.params.eps,
            weight_decay: self.params.weight_decay,
            t: self.t,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.moments.save(path)?;
        Ok(())
    }

    /// Load moments from `path` and take hyper-parameters and `t` from
    /// `state`.
    pub fn load(&mut self, path: &Path, state: &OptimizerState) -> Result<()> {
        self.moments.load(path)?;
        self.params = ParamsAdamW::from(state);
        self.t = state.t;
        Ok(())
    }
}

/// Variables sorted by name so moment order is stable.
fn named_vars(vars: &VarMap) -> Result<Vec<(String, Var)>> {
    let store = vars.data().lock().map_err(|_| poisoned())?;
    let mut named: Vec<(String, Var)> = store
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(named)
}

fn poisoned() -> Error {
    Error::Tensor(candle_core::Error::Msg("variable map lock poisoned".into()))
}
