//! Deep Q-learning over discrete actions.
//!
//! Exploration is epsilon-greedy. The temporal-difference target
//! `r + gamma * (1 - terminated) * max_a Q_target(s', a)` is attached to each
//! sampled record by an experience stage; the `qvalue` update module then
//! regresses the Q-value of the taken action on it and moves the target network
//! toward the live one.

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, Axis, Ix1, Zip};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::algorithms::{agent_data, as_matrix, batch_rows, squeeze_env, Algorithm, LearningPipeline, PolicyOutput, Transition};
use crate::builders::ReplayBufferBuilder;
use crate::config::{AlgoConfig, EnvConfig, TrainConfig};
use crate::error::{PallasError, Result};
use crate::experience::{AgentData, Experience};
use crate::loss::RegressionLoss;
use crate::network::{Activation, Differentiable, Mlp, Model};
use crate::pipeline::{Diagnostics, ExperienceTransform, UpdateModule};
use crate::replay_buffer::{ExperienceBuffer, ReplayBuffer};
use crate::seed::{split_seed, SeedStream};
use crate::train_state::{check_tau, TrainState, TrainingState};
use crate::types::{AgentMap, Space, Tensor};

const QVALUE: &str = "qvalue";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DqnParams {
    /// Probability of a uniformly random action while exploring
    pub exploration: f32,
    pub gamma: f32,
    /// Update every `skip_steps` environment steps
    pub skip_steps: usize,
    pub tau: f32,
    pub loss: RegressionLoss,
}

impl Default for DqnParams {
    fn default() -> Self {
        DqnParams {
            exploration: 0.1,
            gamma: 0.99,
            skip_steps: 1,
            tau: 0.01,
            loss: RegressionLoss::Mse,
        }
    }
}

pub struct Dqn {
    config: AlgoConfig<DqnParams>,
    network: Arc<Mlp>,
    n_actions: usize,
    pipeline: LearningPipeline<Experience>,
    seeds: SeedStream,
    rng: StdRng,
}

fn greedy(q_values: &Array2<f32>) -> Array1<f32> {
    q_values.map_axis(Axis(1), |row| argmax(row) as f32)
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| if v > best_v { (i, v) } else { (best, best_v) })
        .0
}

fn td_target_stage(network: Arc<Mlp>, gamma: f32) -> ExperienceTransform<TrainingState, Experience> {
    ExperienceTransform::from_fn(TrainingState::new(), move |state: &TrainingState, _seed, e: Experience| {
        let next = as_matrix(&e.next_observation)?;
        let next_q = network.apply(state.get(QVALUE)?.target()?, next.view())?;
        let max_next = next_q.map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |m, &v| m.max(v)));
        let reward = e.reward.view().into_dimensionality::<Ix1>()?;
        let done = e.done.view().into_dimensionality::<Ix1>()?;
        let target = Zip::from(&reward)
            .and(&done)
            .and(&max_next)
            .map_collect(|r, d, q| r + gamma * (1.0 - d) * q);
        Ok(e.with_extra("target", target.into_dyn()))
    })
}

fn qvalue_module(network: Arc<Mlp>, n_actions: usize, loss: RegressionLoss, tau: f32, state: TrainState) -> UpdateModule<TrainState, Experience> {
    UpdateModule::from_fn(QVALUE, state, move |state: &TrainState, _seed, batch: &Experience, _peers| {
        let obs = as_matrix(&batch.observation)?;
        let q = network.apply(&state.params, obs.view())?;
        let target = batch.extra("target")?;
        let actions: Vec<usize> = batch.action.iter().map(|&a| a as usize).collect();
        if actions.len() != q.nrows() || target.len() != q.nrows() {
            return Err(PallasError::dimension_mismatch(
                format!("{} actions and targets", q.nrows()),
                format!("{} actions, {} targets", actions.len(), target.len()),
            ));
        }
        if let Some(&bad) = actions.iter().find(|&&a| a >= n_actions) {
            return Err(PallasError::invalid_parameter(
                "action".to_string(),
                format!("index {} outside of {} actions", bad, n_actions),
            ));
        }

        let chosen = Array2::from_shape_fn((q.nrows(), 1), |(i, _)| q[[i, actions[i]]]);
        let target = Array2::from_shape_vec((q.nrows(), 1), target.iter().cloned().collect())?;
        let (value, chosen_grad) = loss.value_and_gradient(chosen.view(), target.view());

        let mut output_grad = Array2::zeros(q.raw_dim());
        for (i, &a) in actions.iter().enumerate() {
            output_grad[[i, a]] = chosen_grad[[i, 0]];
        }
        let (gradients, _) = network.backward(&state.params, obs.view(), output_grad.view())?;
        let next = state.apply_gradients(&gradients)?.soft_update(tau)?;

        let mut info = Diagnostics::new();
        info.insert("loss_qvalue".to_string(), value);
        info.insert("q_mean".to_string(), chosen.mean().unwrap_or(0.0));
        Ok((next, info))
    })
}

impl Dqn {
    pub fn new(config: AlgoConfig<DqnParams>) -> Result<Self> {
        config.validate()?;
        let params = &config.algo_params;
        check_tau(params.tau)?;
        if !(0.0..=1.0).contains(&params.exploration) {
            return Err(PallasError::invalid_parameter(
                "exploration".to_string(),
                format!("must be in [0, 1], got {}", params.exploration),
            ));
        }
        if params.skip_steps == 0 {
            return Err(PallasError::invalid_parameter("skip_steps".to_string(), "must be positive".to_string()));
        }
        let n_actions = match config.env_cfg.action_space {
            Space::Discrete { n } if n > 0 => n,
            ref other => return Err(PallasError::unsupported_space("action".to_string(), format!("{:?}", other))),
        };
        let obs_dim = config.env_cfg.observation_space.flat_dim("observation")?;

        let network = Arc::new(Mlp::with_hidden(
            obs_dim,
            &config.update_cfg.hidden_sizes,
            n_actions,
            Activation::Linear,
            "q.",
        )?);
        let mut seeds = SeedStream::new(config.seed);
        let state = TrainState::with_target(network.init(&mut seeds.next_rng()), config.optimizer());
        let pipeline = LearningPipeline::new(
            vec![td_target_stage(Arc::clone(&network), params.gamma)],
            vec![qvalue_module(Arc::clone(&network), n_actions, params.loss, params.tau, state)],
        );
        let rng = seeds.next_rng();

        Ok(Dqn {
            config,
            network,
            n_actions,
            pipeline,
            seeds,
            rng,
        })
    }

    pub fn params(&self) -> &DqnParams {
        &self.config.algo_params
    }

    fn q_values(&self, observations: &Tensor) -> Result<Array2<f32>> {
        let obs = as_matrix(observations)?;
        self.network.apply(&self.pipeline.state(QVALUE)?.params, obs.view())
    }
}

impl Algorithm for Dqn {
    type Experience = Experience;
    type Buffer = ReplayBuffer<AgentData<Experience>>;

    fn name(&self) -> &'static str {
        "dqn"
    }

    fn env_config(&self) -> &EnvConfig {
        &self.config.env_cfg
    }

    fn train_config(&self) -> &TrainConfig {
        &self.config.train_cfg
    }

    fn seed(&self) -> u64 {
        self.config.seed
    }

    fn config_json(&self) -> Result<serde_json::Value> {
        self.config.to_json_without_env()
    }

    fn select_action(&mut self, observations: &AgentMap<Tensor>) -> Result<AgentMap<PolicyOutput>> {
        let mut outputs = AgentMap::new();
        for (agent, obs) in observations {
            let actions = greedy(&self.q_values(obs)?);
            let n = actions.len();
            outputs.insert(agent.clone(), PolicyOutput::deterministic(actions.into_dyn(), n));
        }
        Ok(outputs)
    }

    fn explore(&mut self, _step: usize, observations: &AgentMap<Tensor>) -> Result<AgentMap<PolicyOutput>> {
        let epsilon = self.config.algo_params.exploration;
        let mut outputs = AgentMap::new();
        for (agent, obs) in observations {
            let q = self.q_values(obs)?;
            let n_envs = batch_rows(obs)?;
            let mut actions = greedy(&q);
            for a in actions.iter_mut() {
                if self.rng.gen::<f32>() < epsilon {
                    *a = self.rng.gen_range(0..self.n_actions) as f32;
                }
            }
            outputs.insert(agent.clone(), PolicyOutput::deterministic(actions.into_dyn(), n_envs));
        }
        Ok(outputs)
    }

    fn make_experience(&self, transitions: AgentMap<Transition>) -> Result<AgentData<Experience>> {
        let vectorized = self.regime().vectorized;
        let records = transitions
            .into_iter()
            .map(|(agent, t)| {
                let e = Experience::new(
                    squeeze_env(t.observation, vectorized),
                    squeeze_env(t.action, vectorized),
                    squeeze_env(t.reward, vectorized),
                    squeeze_env(t.next_observation, vectorized),
                    squeeze_env(t.terminated, vectorized),
                );
                (agent, e)
            })
            .collect();
        agent_data(records, self.regime().parallel)
    }

    fn should_update(&mut self, step: usize, buffer: &Self::Buffer) -> bool {
        buffer.len() >= self.config.update_cfg.batch_size && step % self.config.algo_params.skip_steps == 0
    }

    fn update(&mut self, buffer: &mut Self::Buffer) -> Result<Diagnostics> {
        let records = buffer.sample(self.config.update_cfg.batch_size)?;
        let regime = self.regime();
        self.pipeline.run(regime, &mut self.seeds, &records)
    }

    fn create_buffer(&self) -> Result<Self::Buffer> {
        ReplayBufferBuilder::new()
            .capacity(self.config.update_cfg.max_buffer_size)
            .seed(split_seed(self.config.seed, 2)[1])
            .build()
    }

    fn training_state(&self) -> TrainingState {
        self.pipeline.training_state()
    }

    fn set_training_state(&mut self, state: TrainingState) -> Result<()> {
        self.pipeline.set_training_state(state)
    }
}

/// Builder for Dqn
pub struct DqnBuilder {
    config: AlgoConfig<DqnParams>,
}

impl DqnBuilder {
    pub fn new(env: EnvConfig) -> Self {
        DqnBuilder {
            config: AlgoConfig::new(0, DqnParams::default(), env),
        }
    }

    pub fn exploration(mut self, epsilon: f32) -> Self {
        self.config.algo_params.exploration = epsilon;
        self
    }

    pub fn gamma(mut self, gamma: f32) -> Self {
        self.config.algo_params.gamma = gamma;
        self
    }

    pub fn tau(mut self, tau: f32) -> Self {
        self.config.algo_params.tau = tau;
        self
    }

    pub fn skip_steps(mut self, skip_steps: usize) -> Self {
        self.config.algo_params.skip_steps = skip_steps;
        self
    }

    pub fn loss(mut self, loss: RegressionLoss) -> Self {
        self.config.algo_params.loss = loss;
        self
    }

    pub fn build(self) -> Result<Dqn> {
        Dqn::new(self.config)
    }
}

impl_common_setters!(DqnBuilder);
