//! # Algorithms
//!
//! Every algorithm implements [`Algorithm`], the contract the training loop
//! drives:
//!
//! - **DQN**: epsilon-greedy Q-learning over discrete actions
//! - **TD3**: twin critics, target policy smoothing and delayed policy updates
//! - **SAC**: entropy-regularised actor-critic with a learned temperature
//! - **A2C**: on-policy actor-critic with generalized advantage estimation
//!
//! Algorithms never mutate their trainable parameters in place. A learning step
//! samples records from the buffer, runs them through the experience pipeline
//! (regression targets, advantages) and hands the processed batch to the update
//! pipeline, whose modules each return a new [`TrainState`].
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pallas::algorithms::{Algorithm, DqnBuilder};
//! use pallas::config::EnvConfig;
//! use pallas::types::Space;
//!
//! let env = EnvConfig::new(Space::uniform_box(-10.0, 10.0, &[4]), Space::Discrete { n: 2 });
//! let dqn = DqnBuilder::new(env)
//!     .hidden_sizes(vec![64, 64])
//!     .gamma(0.99)
//!     .exploration(0.1)
//!     .build()
//!     .unwrap();
//! assert_eq!(dqn.name(), "dqn");
//! ```

pub mod a2c;
pub mod critic;
pub mod dqn;
pub mod sac;
pub mod td3;

use ndarray::{Array1, Array2, Axis};

use crate::config::{EnvConfig, TrainConfig};
use crate::error::{PallasError, Result};
use crate::experience::AgentData;
use crate::pipeline::{process_records, update_pipeline, Diagnostics, ExperienceTransform, ShapeRegime, UpdateModule};
use crate::replay_buffer::ExperienceBuffer;
use crate::seed::SeedStream;
use crate::tensor::TensorTree;
use crate::train_state::{TrainState, TrainingState};
use crate::types::{AgentMap, Tensor};

pub use a2c::{A2c, A2cBuilder, A2cParams};
pub use critic::TwinCritic;
pub use dqn::{Dqn, DqnBuilder, DqnParams};
pub use sac::{Sac, SacBuilder, SacParams};
pub use td3::{Td3, Td3Builder, Td3Params};

/// Actions chosen for every environment of one agent
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyOutput {
    /// Action as stored in the buffer, `[n_envs, ...]`
    pub action: Tensor,
    /// Action sent to the environment, `[n_envs, ...]`
    pub env_action: Tensor,
    /// `[n_envs]`, zero when the policy has no density
    pub log_prob: Tensor,
    /// `[n_envs]`, zero for algorithms without a state-value estimate
    pub value: Tensor,
}

impl PolicyOutput {
    /// Output of a policy whose stored and sent actions coincide
    pub fn deterministic(action: Tensor, n_envs: usize) -> Self {
        PolicyOutput {
            env_action: action.clone(),
            action,
            log_prob: Array1::<f32>::zeros(n_envs).into_dyn(),
            value: Array1::<f32>::zeros(n_envs).into_dyn(),
        }
    }
}

/// What one agent saw during one vectorized step; every field is `[n_envs, ...]`
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub observation: Tensor,
    pub action: Tensor,
    pub log_prob: Tensor,
    pub value: Tensor,
    pub reward: Tensor,
    /// For environments that just ended, the last observation of the finished episode
    pub next_observation: Tensor,
    pub terminated: Tensor,
    pub truncated: Tensor,
}

/// A learning algorithm driven by [`crate::trainer::train`]
pub trait Algorithm {
    type Experience: TensorTree;
    type Buffer: ExperienceBuffer<AgentData<Self::Experience>>;

    fn name(&self) -> &'static str;

    fn env_config(&self) -> &EnvConfig;

    fn train_config(&self) -> &TrainConfig;

    /// Seed the driver derives environment reset seeds from
    fn seed(&self) -> u64;

    /// Hyperparameters written to the run's `config` file
    fn config_json(&self) -> Result<serde_json::Value>;

    /// Greedy or mean action, without exploration noise
    fn select_action(&mut self, observations: &AgentMap<Tensor>) -> Result<AgentMap<PolicyOutput>>;

    /// Action used while collecting experience at environment step `step`
    fn explore(&mut self, step: usize, observations: &AgentMap<Tensor>) -> Result<AgentMap<PolicyOutput>>;

    /// Turn one vectorized step into a buffer record
    fn make_experience(&self, transitions: AgentMap<Transition>) -> Result<AgentData<Self::Experience>>;

    fn should_update(&mut self, step: usize, buffer: &Self::Buffer) -> bool;

    /// One learning step on data from `buffer`
    fn update(&mut self, buffer: &mut Self::Buffer) -> Result<Diagnostics>;

    fn create_buffer(&self) -> Result<Self::Buffer>;

    fn training_state(&self) -> TrainingState;

    /// Replace the trainable state; its structure must match the current one
    fn set_training_state(&mut self, state: TrainingState) -> Result<()>;

    fn regime(&self) -> ShapeRegime {
        let env = self.env_config();
        ShapeRegime::for_counts(env.n_envs, env.n_agents)
    }
}

/// Experience stages reading a snapshot of the whole training state, followed by
/// named update modules
pub struct LearningPipeline<E> {
    transforms: Vec<ExperienceTransform<TrainingState, E>>,
    modules: Vec<UpdateModule<TrainState, E>>,
}

impl<E: TensorTree> LearningPipeline<E> {
    pub fn new(transforms: Vec<ExperienceTransform<TrainingState, E>>, modules: Vec<UpdateModule<TrainState, E>>) -> Self {
        LearningPipeline { transforms, modules }
    }

    pub fn training_state(&self) -> TrainingState {
        self.modules
            .iter()
            .fold(TrainingState::new(), |tree, m| tree.with(m.name.clone(), m.state.clone()))
    }

    pub fn state(&self, name: &str) -> Result<&TrainState> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.state)
            .ok_or_else(|| PallasError::TrainingError(format!("no update module named '{}'", name)))
    }

    pub fn set_training_state(&mut self, state: TrainingState) -> Result<()> {
        state.check_matches(&self.training_state())?;
        for module in self.modules.iter_mut() {
            module.state = state.get(&module.name)?.clone();
        }
        Ok(())
    }

    /// Process `records` and apply every update module once.
    ///
    /// The modules keep their previous states when any stage fails.
    pub fn run(&mut self, regime: ShapeRegime, seeds: &mut SeedStream, records: &[AgentData<E>]) -> Result<Diagnostics> {
        let snapshot = self.training_state();
        let transforms: Vec<ExperienceTransform<TrainingState, E>> = self
            .transforms
            .iter()
            .map(|t| {
                let mut t = t.clone();
                t.state = snapshot.clone();
                t
            })
            .collect();
        let batch = process_records(&transforms, regime, seeds.next_seed(), records)?;
        let (modules, mut diagnostics) = update_pipeline(&self.modules, seeds.next_seed(), &batch)?;
        self.modules = modules;
        diagnostics.insert("total_loss".to_string(), total_loss(&diagnostics));
        Ok(diagnostics)
    }
}

/// Sum of every `loss_*` diagnostic
pub fn total_loss(diagnostics: &Diagnostics) -> f32 {
    diagnostics
        .iter()
        .filter(|(k, _)| k.starts_with("loss_"))
        .map(|(_, v)| *v)
        .sum()
}

/// View a `[B, ...]` tensor as a `[B, features]` matrix
pub fn as_matrix(t: &Tensor) -> Result<Array2<f32>> {
    if t.ndim() == 0 {
        return Err(PallasError::dimension_mismatch(
            "a batched tensor".to_string(),
            "a 0-d tensor".to_string(),
        ));
    }
    let rows = t.shape()[0];
    let cols = if rows == 0 { 0 } else { t.len() / rows };
    Ok(Array2::from_shape_vec((rows, cols.max(1)), t.iter().cloned().collect())?)
}

/// Drop the environment axis of a single-environment tensor
pub fn squeeze_env(t: Tensor, vectorized: bool) -> Tensor {
    if vectorized || t.ndim() == 0 {
        t
    } else {
        t.index_axis(Axis(0), 0).to_owned()
    }
}

/// Per-environment flags as 0.0 / 1.0
pub fn flags(values: &Array1<bool>) -> Tensor {
    values.mapv(|v| if v { 1.0 } else { 0.0 }).into_dyn()
}

/// Wrap per-agent records according to the agent count
pub fn agent_data<E>(mut records: AgentMap<E>, parallel: bool) -> Result<AgentData<E>> {
    if parallel {
        return Ok(AgentData::Parallel(records));
    }
    if records.len() != 1 {
        return Err(PallasError::dimension_mismatch(
            "1 agent".to_string(),
            format!("{} agents", records.len()),
        ));
    }
    let key = records.keys().next().cloned().unwrap_or_default();
    records
        .remove(&key)
        .map(AgentData::Single)
        .ok_or_else(|| PallasError::EmptyBatch("no agent records".to_string()))
}

/// Number of rows of an observation batch
pub(crate) fn batch_rows(observations: &Tensor) -> Result<usize> {
    observations.shape().first().copied().ok_or_else(|| {
        PallasError::dimension_mismatch("batched observations".to_string(), "a 0-d tensor".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_total_loss() {
        let mut d = Diagnostics::new();
        d.insert("loss_policy".to_string(), 1.5);
        d.insert("loss_qvalue".to_string(), 2.0);
        d.insert("alpha".to_string(), 10.0);
        assert_eq!(total_loss(&d), 3.5);
    }

    #[test]
    fn test_as_matrix() {
        let m = as_matrix(&arr1(&[1.0f32, 2.0, 3.0]).into_dyn()).unwrap();
        assert_eq!(m.dim(), (3, 1));
        let m = as_matrix(&arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn()).unwrap();
        assert_eq!(m[[1, 0]], 3.0);
    }

    #[test]
    fn test_squeeze_env() {
        let t = arr2(&[[1.0f32, 2.0]]).into_dyn();
        assert_eq!(squeeze_env(t.clone(), false).shape(), &[2]);
        assert_eq!(squeeze_env(t, true).shape(), &[1, 2]);
    }

    #[test]
    fn test_agent_data_single() {
        let mut records = AgentMap::new();
        records.insert("agent_0".to_string(), 1);
        assert_eq!(agent_data(records.clone(), false).unwrap(), AgentData::Single(1));
        records.insert("agent_1".to_string(), 2);
        assert!(agent_data(records.clone(), false).is_err());
        assert!(agent_data(records, true).unwrap().is_parallel());
    }
}
