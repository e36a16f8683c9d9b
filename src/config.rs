//! Run configuration.
//!
//! An [`AlgoConfig`] gathers everything that defines a run. It is written to
//! the checkpoint directory when a run starts: the environment description goes
//! to the binary `extra` file, the rest to the JSON `config` file.

use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::optimizer::{LearningRateScheduler, Optimizer};
use crate::types::Space;

/// Gradient-step hyperparameters shared by every algorithm
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub learning_rate: f32,
    /// Linearly decay the learning rate to zero over the run
    pub learning_rate_annealing: bool,
    pub max_grad_norm: Option<f32>,
    pub batch_size: usize,
    /// Replay capacity, or rollout length for on-policy algorithms
    pub max_buffer_size: usize,
    pub n_epochs: usize,
    pub hidden_sizes: Vec<usize>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            learning_rate: 3e-4,
            learning_rate_annealing: false,
            max_grad_norm: None,
            batch_size: 64,
            max_buffer_size: 10_000,
            n_epochs: 1,
            hidden_sizes: vec![64, 64],
        }
    }
}

/// Training loop settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub n_env_steps: usize,
    /// Save every this many environment steps; negative disables periodic saves
    pub save_frequency: i64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            n_env_steps: 100_000,
            save_frequency: -1,
        }
    }
}

/// Environment description
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
    pub observation_space: Space,
    pub action_space: Space,
    pub n_envs: usize,
    pub n_agents: usize,
}

impl EnvConfig {
    pub fn new(observation_space: Space, action_space: Space) -> Self {
        EnvConfig {
            observation_space,
            action_space,
            n_envs: 1,
            n_agents: 1,
        }
    }

    pub fn with_counts(mut self, n_envs: usize, n_agents: usize) -> Self {
        self.n_envs = n_envs;
        self.n_agents = n_agents;
        self
    }
}

/// Complete configuration of a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlgoConfig<P> {
    pub seed: u64,
    pub algo_params: P,
    pub update_cfg: UpdateConfig,
    pub train_cfg: TrainConfig,
    pub env_cfg: EnvConfig,
}

fn positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(PallasError::invalid_parameter(name.to_string(), "must be positive".to_string()));
    }
    Ok(())
}

impl<P: Serialize> AlgoConfig<P> {
    pub fn new(seed: u64, algo_params: P, env_cfg: EnvConfig) -> Self {
        AlgoConfig {
            seed,
            algo_params,
            update_cfg: UpdateConfig::default(),
            train_cfg: TrainConfig::default(),
            env_cfg,
        }
    }

    /// Check the settings every algorithm relies on
    pub fn validate(&self) -> Result<()> {
        let update = &self.update_cfg;
        if !(update.learning_rate > 0.0) {
            return Err(PallasError::invalid_parameter(
                "learning_rate".to_string(),
                format!("must be positive, got {}", update.learning_rate),
            ));
        }
        if let Some(norm) = update.max_grad_norm {
            if !(norm > 0.0) {
                return Err(PallasError::invalid_parameter(
                    "max_grad_norm".to_string(),
                    format!("must be positive, got {}", norm),
                ));
            }
        }
        positive("batch_size", update.batch_size)?;
        positive("max_buffer_size", update.max_buffer_size)?;
        positive("n_epochs", update.n_epochs)?;
        positive("n_envs", self.env_cfg.n_envs)?;
        positive("n_agents", self.env_cfg.n_agents)?;
        if update.hidden_sizes.is_empty() || update.hidden_sizes.iter().any(|&h| h == 0) {
            return Err(PallasError::invalid_parameter(
                "hidden_sizes".to_string(),
                "need at least one positive hidden size".to_string(),
            ));
        }
        if self.train_cfg.save_frequency == 0 {
            return Err(PallasError::invalid_parameter(
                "save_frequency".to_string(),
                "use a negative value to disable saving".to_string(),
            ));
        }
        Ok(())
    }

    /// The configuration as JSON, without the environment description
    pub fn to_json_without_env(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("env_cfg");
        }
        Ok(value)
    }

    /// Adam with the configured clipping and, when enabled, linear annealing
    pub fn optimizer(&self) -> Optimizer {
        let update = &self.update_cfg;
        let mut optimizer = Optimizer::adam(update.learning_rate).with_max_grad_norm(update.max_grad_norm);
        if update.learning_rate_annealing {
            optimizer = optimizer.with_schedule(LearningRateScheduler::linear_annealing(
                update.learning_rate,
                self.env_cfg.n_envs * self.env_cfg.n_agents,
                self.train_cfg.n_env_steps,
                update.max_buffer_size,
                update.batch_size,
                update.n_epochs,
            ));
        }
        optimizer
    }
}
