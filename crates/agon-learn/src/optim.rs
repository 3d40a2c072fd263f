//! Phase optimizers.
//!
//! Each training phase owns one [`PhaseOptimizer`] built over the same
//! parameter set. A step clips the global gradient norm, applies the update
//! rule, and reports the pre-clip norm. Learning rates decay on validation
//! BLEU.

use agon_core::AgonError;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Update rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Plain stochastic gradient descent.
    Sgd,
    /// Adam with decoupled weight decay.
    #[default]
    AdamW,
}

/// Configuration for one phase optimizer.
///
/// # Example
///
/// ```
/// use agon_learn::optim::{OptimConfig, OptimizerKind};
///
/// let config = OptimConfig::default();
/// assert_eq!(config.kind, OptimizerKind::AdamW);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    /// Update rule (default: AdamW).
    pub kind: OptimizerKind,
    /// Initial learning rate (default: 1e-4).
    pub learning_rate: f64,
    /// AdamW weight decay, ignored by SGD (default: 0.0).
    pub weight_decay: f64,
    /// Global gradient norm cap; 0 disables clipping (default: 1.0).
    pub max_grad_norm: f64,
    /// Multiplier applied at each decayed validation (default: 0.5).
    pub learning_rate_decay: f64,
    /// Epoch from which decay always applies (default: 1000).
    pub start_decay_from: usize,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate: 1e-4,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            learning_rate_decay: 0.5,
            start_decay_from: 1000,
        }
    }
}

impl OptimConfig {
    /// Checks ranges.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] for a non-positive learning rate,
    /// a negative clip norm or weight decay, or a decay outside `(0, 1]`.
    pub fn validate(&self) -> Result<(), AgonError> {
        let bad = |message: String| Err(AgonError::InvalidConfig { message });
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return bad(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if self.weight_decay < 0.0 {
            return bad(format!("weight_decay must be >= 0, got {}", self.weight_decay));
        }
        if self.max_grad_norm < 0.0 {
            return bad(format!("max_grad_norm must be >= 0, got {}", self.max_grad_norm));
        }
        if !(self.learning_rate_decay > 0.0 && self.learning_rate_decay <= 1.0) {
            return bad(format!(
                "learning_rate_decay must be in (0, 1], got {}",
                self.learning_rate_decay
            ));
        }
        Ok(())
    }
}

/// Serializable schedule state of a [`PhaseOptimizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Current learning rate.
    pub learning_rate: f64,
    /// Whether decay has started.
    pub decaying: bool,
    /// Validation BLEU seen at the previous update, if any.
    pub last_valid_bleu: Option<f32>,
    /// Number of steps taken.
    pub steps: u64,
}

enum Rule {
    Sgd(SGD),
    AdamW(AdamW),
}

/// An optimizer for one training phase.
pub struct PhaseOptimizer {
    name: &'static str,
    rule: Rule,
    vars: Vec<Var>,
    config: OptimConfig,
    decaying: bool,
    last_valid_bleu: Option<f32>,
    steps: u64,
}

impl std::fmt::Debug for PhaseOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseOptimizer")
            .field("name", &self.name)
            .field("learning_rate", &self.learning_rate())
            .field("vars", &self.vars.len())
            .field("steps", &self.steps)
            .finish()
    }
}

impl PhaseOptimizer {
    /// Builds an optimizer named `name` over `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] if `config` fails validation and
    /// [`AgonError::Internal`] if the update rule cannot be constructed.
    pub fn new(name: &'static str, vars: Vec<Var>, config: &OptimConfig) -> Result<Self, AgonError> {
        config.validate()?;
        let map_err = |e: candle_core::Error| AgonError::internal("PhaseOptimizer::new", e);
        let rule = match config.kind {
            OptimizerKind::Sgd => Rule::Sgd(SGD::new(vars.clone(), config.learning_rate).map_err(map_err)?),
            OptimizerKind::AdamW => Rule::AdamW(
                AdamW::new(
                    vars.clone(),
                    ParamsAdamW {
                        lr: config.learning_rate,
                        weight_decay: config.weight_decay,
                        ..Default::default()
                    },
                )
                .map_err(map_err)?,
            ),
        };
        Ok(Self {
            name,
            rule,
            vars,
            config: config.clone(),
            decaying: false,
            last_valid_bleu: None,
            steps: 0,
        })
    }

    /// Phase name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match &self.rule {
            Rule::Sgd(o) => o.learning_rate(),
            Rule::AdamW(o) => o.learning_rate(),
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.rule {
            Rule::Sgd(o) => o.set_learning_rate(lr),
            Rule::AdamW(o) => o.set_learning_rate(lr),
        }
    }

    /// Number of steps taken.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Clips and applies `grads`. Returns the global gradient norm before
    /// clipping.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f32, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("PhaseOptimizer::step", e);
        let norm = clip_grad_norm(grads, &self.vars, self.config.max_grad_norm)?;
        match &mut self.rule {
            Rule::Sgd(o) => o.step(grads).map_err(map_err)?,
            Rule::AdamW(o) => o.step(grads).map_err(map_err)?,
        }
        self.steps += 1;
        Ok(norm)
    }

    /// Backpropagates `loss` into a fresh gradient store and steps.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f32, AgonError> {
        let mut grads = loss
            .backward()
            .map_err(|e| AgonError::internal("PhaseOptimizer::backward_step", e))?;
        self.step(&mut grads)
    }

    /// Applies the decay schedule after a validation run.
    ///
    /// Decay starts once `epoch` reaches `start_decay_from` or validation
    /// BLEU falls below the previous value; from then on every call
    /// multiplies the learning rate by `learning_rate_decay`.
    pub fn update_learning_rate(&mut self, valid_bleu: f32, epoch: usize) {
        if epoch >= self.config.start_decay_from {
            self.decaying = true;
        }
        if let Some(last) = self.last_valid_bleu {
            if valid_bleu < last {
                self.decaying = true;
            }
        }
        if self.decaying {
            let lr = self.learning_rate() * self.config.learning_rate_decay;
            self.set_learning_rate(lr);
            info!(phase = self.name, lr, "decaying learning rate");
        }
        self.last_valid_bleu = Some(valid_bleu);
    }

    /// Snapshot of the schedule.
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            learning_rate: self.learning_rate(),
            decaying: self.decaying,
            last_valid_bleu: self.last_valid_bleu,
            steps: self.steps,
        }
    }

    /// Restores a schedule snapshot. Moment estimates are not restored.
    pub fn restore(&mut self, state: &OptimizerState) {
        self.set_learning_rate(state.learning_rate);
        self.decaying = state.decaying;
        self.last_valid_bleu = state.last_valid_bleu;
        self.steps = state.steps;
    }
}

/// Scales the gradients of `vars` so their global L2 norm is at most
/// `max_norm`. A `max_norm` of 0 leaves them untouched. Returns the norm
/// before scaling.
///
/// # Errors
///
/// Returns [`AgonError::Internal`] on tensor failures.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f32, AgonError> {
    let map_err = |e: candle_core::Error| AgonError::internal("clip_grad_norm", e);
    let mut sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g
                .sqr()
                .and_then(|s| s.sum_all())
                .and_then(|s| s.to_vec0::<f32>())
                .map_err(map_err)? as f64;
        }
    }
    let norm = sq.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let t = var.as_tensor();
            if let Some(g) = grads.remove(t) {
                grads.insert(t, (g * scale).map_err(map_err)?);
            }
        }
    }
    Ok(norm as f32)
}
