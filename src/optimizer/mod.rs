pub mod gradient_clipper;
pub mod lr_scheduler;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::Params;
use crate::types::Tensor;

pub use gradient_clipper::GradientClipper;
pub use lr_scheduler::LearningRateScheduler;

/// Update rule applied to clipped gradients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Method {
    SGD,
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
}

/// Gradient transformation: clipping, then a scheduled update rule.
///
/// The optimizer holds no mutable state of its own; moments live in an
/// `OptimizerState` that travels with the parameters it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Optimizer {
    pub method: Method,
    pub schedule: LearningRateScheduler,
    pub clipper: GradientClipper,
}

/// Per-parameter optimizer moments
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptimizerState {
    SGD { count: u64 },
    Adam { m: Params, v: Params, count: u64 },
}

impl OptimizerState {
    /// Number of updates applied so far
    pub fn count(&self) -> u64 {
        match self {
            OptimizerState::SGD { count } | OptimizerState::Adam { count, .. } => *count,
        }
    }

    pub(crate) fn structure_difference(&self, other: &OptimizerState) -> Option<String> {
        match (self, other) {
            (OptimizerState::SGD { .. }, OptimizerState::SGD { .. }) => None,
            (OptimizerState::Adam { m, v, .. }, OptimizerState::Adam { m: m2, v: v2, .. }) => m
                .structure_difference(m2)
                .or_else(|| v.structure_difference(v2))
                .map(|d| format!("optimizer moments: {}", d)),
            _ => Some("optimizer kinds differ".to_string()),
        }
    }
}

impl Optimizer {
    pub fn sgd(learning_rate: f32) -> Self {
        Optimizer {
            method: Method::SGD,
            schedule: LearningRateScheduler::constant(learning_rate),
            clipper: GradientClipper::None,
        }
    }

    pub fn adam(learning_rate: f32) -> Self {
        Optimizer {
            method: Method::Adam {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
            },
            schedule: LearningRateScheduler::constant(learning_rate),
            clipper: GradientClipper::None,
        }
    }

    pub fn with_epsilon(mut self, eps: f32) -> Self {
        if let Method::Adam { epsilon, .. } = &mut self.method {
            *epsilon = eps;
        }
        self
    }

    pub fn with_schedule(mut self, schedule: LearningRateScheduler) -> Self {
        self.schedule = schedule;
        self
    }

    /// Clip by global norm when `max_norm` is set
    pub fn with_max_grad_norm(mut self, max_norm: Option<f32>) -> Self {
        self.clipper = match max_norm {
            Some(max_norm) => GradientClipper::ClipByGlobalNorm { max_norm },
            None => GradientClipper::None,
        };
        self
    }

    pub fn init(&self, params: &Params) -> OptimizerState {
        match self.method {
            Method::SGD => OptimizerState::SGD { count: 0 },
            Method::Adam { .. } => OptimizerState::Adam {
                m: params.zeros_like(),
                v: params.zeros_like(),
                count: 0,
            },
        }
    }

    /// Descend along `gradients`, returning new parameters and moments
    pub fn update(
        &self,
        state: &OptimizerState,
        params: &Params,
        gradients: &Params,
    ) -> Result<(Params, OptimizerState)> {
        params.check_same_structure(gradients)?;
        let gradients = self.clipper.clip(gradients);
        let learning_rate = self.schedule.get_lr(state.count() as usize);

        match (&self.method, state) {
            (Method::Adam { beta1, beta2, epsilon }, OptimizerState::Adam { m, v, count }) => {
                let t = (*count + 1) as i32;
                let m = m.zip_with(&gradients, |m, g| m * *beta1 + g * (1.0 - beta1))?;
                let v = v.zip_with(&gradients, |v, g| v * *beta2 + g.mapv(|x| x * x) * (1.0 - beta2))?;
                let m_correction = 1.0 - beta1.powi(t);
                let v_correction = 1.0 - beta2.powi(t);
                let step: Params = m
                    .iter()
                    .zip(v.iter())
                    .map(|((key, m), (_, v))| {
                        let m_hat = m / m_correction;
                        let v_hat = v / v_correction;
                        let update: Tensor = &m_hat / &v_hat.mapv(|x| x.sqrt() + epsilon);
                        (key.clone(), update)
                    })
                    .collect();
                let params = params.zip_with(&step, |p, s| p - &(s * learning_rate))?;
                Ok((params, OptimizerState::Adam { m, v, count: *count + 1 }))
            }
            (_, OptimizerState::SGD { count }) | (Method::SGD, OptimizerState::Adam { count, .. }) => {
                let params = params.zip_with(&gradients, |p, g| p - &(g * learning_rate))?;
                Ok((params, OptimizerState::SGD { count: *count + 1 }))
            }
        }
    }
}
