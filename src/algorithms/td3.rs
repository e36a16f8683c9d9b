//! Twin Delayed Deep Deterministic Policy Gradient.
//!
//! The policy is a tanh MLP whose outputs live in `[-1, 1]` and are mapped onto
//! the action box when sent to the environment. Critic targets use target
//! policy smoothing and the minimum of the twin target critics. The policy and
//! both target networks only move every `policy_update_frequency` critic steps.

use std::sync::Arc;

use ndarray::{Array2, Ix1, Zip};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand_distr::{StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

use crate::algorithms::{
    agent_data, as_matrix, batch_rows, squeeze_env, Algorithm, LearningPipeline, PolicyOutput, Transition, TwinCritic,
};
use crate::builders::ReplayBufferBuilder;
use crate::config::{AlgoConfig, EnvConfig, TrainConfig};
use crate::error::{PallasError, Result};
use crate::experience::{AgentData, Experience};
use crate::loss::RegressionLoss;
use crate::network::{Activation, Differentiable, Mlp, Model};
use crate::pipeline::{Diagnostics, ExperienceTransform, UpdateModule};
use crate::replay_buffer::{ExperienceBuffer, ReplayBuffer};
use crate::seed::{rng_from_seed, split_seed, SeedStream};
use crate::train_state::{check_tau, TrainState, TrainingState};
use crate::transformation::scale_to_box;
use crate::types::{AgentMap, Tensor};

const QVALUE: &str = "qvalue";
const POLICY: &str = "policy";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Td3Params {
    pub gamma: f32,
    pub tau: f32,
    /// Standard deviation of the exploration noise, in policy units
    pub action_noise: f32,
    /// Critic steps between two policy and target updates
    pub policy_update_frequency: u64,
    pub target_noise_std: f32,
    pub target_noise_clip: f32,
    /// Uniformly random actions and no updates before this step
    pub start_step: usize,
    pub skip_steps: usize,
}

impl Default for Td3Params {
    fn default() -> Self {
        Td3Params {
            gamma: 0.99,
            tau: 0.005,
            action_noise: 0.1,
            policy_update_frequency: 2,
            target_noise_std: 0.2,
            target_noise_clip: 0.5,
            start_step: 1000,
            skip_steps: 1,
        }
    }
}

pub struct Td3 {
    config: AlgoConfig<Td3Params>,
    policy: Arc<Mlp>,
    act_dim: usize,
    pipeline: LearningPipeline<Experience>,
    seeds: SeedStream,
    rng: StdRng,
}

fn gaussian(shape: (usize, usize), std: f32, rng: &mut StdRng) -> Array2<f32> {
    Array2::<f32>::random_using(shape, StandardNormal, rng) * std
}

fn column(values: &Tensor) -> Result<Array2<f32>> {
    Ok(Array2::from_shape_vec((values.len(), 1), values.iter().cloned().collect())?)
}

fn target_stage(
    policy: Arc<Mlp>,
    critic: Arc<TwinCritic>,
    params: &Td3Params,
) -> ExperienceTransform<TrainingState, Experience> {
    let (gamma, noise_std, noise_clip) = (params.gamma, params.target_noise_std, params.target_noise_clip);
    ExperienceTransform::from_fn(TrainingState::new(), move |state: &TrainingState, seed, e: Experience| {
        let next = as_matrix(&e.next_observation)?;
        let mut rng = rng_from_seed(seed);
        let next_action = policy.apply(state.get(POLICY)?.target()?, next.view())?;
        let noise = gaussian(next_action.dim(), noise_std, &mut rng).mapv(|n| n.clamp(-noise_clip, noise_clip));
        let smoothed = (next_action + noise).mapv(|a| a.clamp(-1.0, 1.0));
        let next_q = critic.min_q(state.get(QVALUE)?.target()?, next.view(), smoothed.view())?;

        let reward = e.reward.view().into_dimensionality::<Ix1>()?;
        let done = e.done.view().into_dimensionality::<Ix1>()?;
        let target = Zip::from(&reward)
            .and(&done)
            .and(next_q.column(0))
            .map_collect(|r, d, q| r + gamma * (1.0 - d) * q);
        Ok(e.with_extra("target", target.into_dyn()))
    })
}

fn qvalue_module(critic: Arc<TwinCritic>, tau: f32, delay: u64, state: TrainState) -> UpdateModule<TrainState, Experience> {
    UpdateModule::from_fn(QVALUE, state, move |state: &TrainState, _seed, batch: &Experience, _peers| {
        let obs = as_matrix(&batch.observation)?;
        let actions = as_matrix(&batch.action)?;
        let target = column(batch.extra("target")?)?;
        let (loss, gradients) = critic.regression(&state.params, obs.view(), actions.view(), target.view(), RegressionLoss::Mse)?;
        let mut next = state.apply_gradients(&gradients)?;
        if next.step % delay == 0 {
            next = next.soft_update(tau)?;
        }
        let mut info = Diagnostics::new();
        info.insert("loss_qvalue".to_string(), loss);
        Ok((next, info))
    })
}

fn policy_module(
    policy: Arc<Mlp>,
    critic: Arc<TwinCritic>,
    tau: f32,
    delay: u64,
    state: TrainState,
) -> UpdateModule<TrainState, Experience> {
    UpdateModule::from_fn(POLICY, state, move |state: &TrainState, _seed, batch: &Experience, peers| {
        let qvalue = peers.get(QVALUE)?;
        if qvalue.step % delay != 0 {
            return Ok((state.clone(), Diagnostics::new()));
        }
        let obs = as_matrix(&batch.observation)?;
        let actions = policy.apply(&state.params, obs.view())?;
        let (q1, _) = critic.q_values(&qvalue.params, obs.view(), actions.view())?;
        let n = q1.nrows().max(1) as f32;
        let q_grad = Array2::from_elem(q1.raw_dim(), -1.0 / n);
        let action_grad = critic.q1_action_gradient(&qvalue.params, obs.view(), actions.view(), q_grad.view())?;
        let (gradients, _) = policy.backward(&state.params, obs.view(), action_grad.view())?;
        let next = state.apply_gradients(&gradients)?.soft_update(tau)?;

        let mut info = Diagnostics::new();
        info.insert("loss_policy".to_string(), -q1.mean().unwrap_or(0.0));
        Ok((next, info))
    })
}

impl Td3 {
    pub fn new(config: AlgoConfig<Td3Params>) -> Result<Self> {
        config.validate()?;
        let params = &config.algo_params;
        check_tau(params.tau)?;
        if params.policy_update_frequency == 0 || params.skip_steps == 0 {
            return Err(PallasError::invalid_parameter(
                "policy_update_frequency".to_string(),
                "update frequencies must be positive".to_string(),
            ));
        }
        if params.action_noise < 0.0 || params.target_noise_std < 0.0 || params.target_noise_clip < 0.0 {
            return Err(PallasError::invalid_parameter(
                "noise".to_string(),
                "noise scales must be non-negative".to_string(),
            ));
        }
        if config.env_cfg.action_space.is_discrete() {
            return Err(PallasError::unsupported_space(
                "action".to_string(),
                format!("{:?}", config.env_cfg.action_space),
            ));
        }
        let obs_dim = config.env_cfg.observation_space.flat_dim("observation")?;
        let act_dim = config.env_cfg.action_space.flat_dim("action")?;
        let hidden = &config.update_cfg.hidden_sizes;

        let policy = Arc::new(Mlp::with_hidden(obs_dim, hidden, act_dim, Activation::Tanh, "policy.")?);
        let critic = Arc::new(TwinCritic::new(obs_dim, act_dim, hidden)?);
        let mut seeds = SeedStream::new(config.seed);
        let qvalue = TrainState::with_target(critic.init(&mut seeds.next_rng()), config.optimizer());
        let policy_state = TrainState::with_target(policy.init(&mut seeds.next_rng()), config.optimizer());
        let delay = params.policy_update_frequency;

        let pipeline = LearningPipeline::new(
            vec![target_stage(Arc::clone(&policy), Arc::clone(&critic), params)],
            vec![
                qvalue_module(Arc::clone(&critic), params.tau, delay, qvalue),
                policy_module(Arc::clone(&policy), Arc::clone(&critic), params.tau, delay, policy_state),
            ],
        );
        let rng = seeds.next_rng();

        Ok(Td3 {
            config,
            policy,
            act_dim,
            pipeline,
            seeds,
            rng,
        })
    }

    pub fn params(&self) -> &Td3Params {
        &self.config.algo_params
    }

    fn policy_actions(&self, observations: &Tensor) -> Result<Array2<f32>> {
        let obs = as_matrix(observations)?;
        self.policy.apply(&self.pipeline.state(POLICY)?.params, obs.view())
    }

    fn output(&self, actions: Array2<f32>) -> Result<PolicyOutput> {
        let n_envs = actions.nrows();
        let action = actions.into_dyn();
        let env_action = scale_to_box(&action, &self.config.env_cfg.action_space)?;
        Ok(PolicyOutput {
            env_action,
            ..PolicyOutput::deterministic(action, n_envs)
        })
    }
}

impl Algorithm for Td3 {
    type Experience = Experience;
    type Buffer = ReplayBuffer<AgentData<Experience>>;

    fn name(&self) -> &'static str {
        "td3"
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
        observations
            .iter()
            .map(|(agent, obs)| Ok((agent.clone(), self.output(self.policy_actions(obs)?)?)))
            .collect()
    }

    fn explore(&mut self, step: usize, observations: &AgentMap<Tensor>) -> Result<AgentMap<PolicyOutput>> {
        let mut outputs = AgentMap::new();
        for (agent, obs) in observations {
            let actions = if step < self.config.algo_params.start_step {
                let n_envs = batch_rows(obs)?;
                Array2::random_using((n_envs, self.act_dim), Uniform::new_inclusive(-1.0f32, 1.0), &mut self.rng)
            } else {
                let mean = self.policy_actions(obs)?;
                let noise = gaussian(mean.dim(), self.config.algo_params.action_noise, &mut self.rng);
                (mean + noise).mapv(|a| a.clamp(-1.0, 1.0))
            };
            outputs.insert(agent.clone(), self.output(actions)?);
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
        let params = &self.config.algo_params;
        buffer.len() >= self.config.update_cfg.batch_size && step % params.skip_steps == 0 && step >= params.start_step
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

/// Builder for Td3
pub struct Td3Builder {
    config: AlgoConfig<Td3Params>,
}

impl Td3Builder {
    pub fn new(env: EnvConfig) -> Self {
        Td3Builder {
            config: AlgoConfig::new(0, Td3Params::default(), env),
        }
    }

    pub fn gamma(mut self, gamma: f32) -> Self {
        self.config.algo_params.gamma = gamma;
        self
    }

    pub fn tau(mut self, tau: f32) -> Self {
        self.config.algo_params.tau = tau;
        self
    }

    pub fn policy_update_frequency(mut self, frequency: u64) -> Self {
        self.config.algo_params.policy_update_frequency = frequency;
        self
    }

    pub fn noise_params(mut self, action_noise: f32, target_noise_std: f32, target_noise_clip: f32) -> Self {
        self.config.algo_params.action_noise = action_noise;
        self.config.algo_params.target_noise_std = target_noise_std;
        self.config.algo_params.target_noise_clip = target_noise_clip;
        self
    }

    pub fn start_step(mut self, start_step: usize) -> Self {
        self.config.algo_params.start_step = start_step;
        self
    }

    pub fn skip_steps(mut self, skip_steps: usize) -> Self {
        self.config.algo_params.skip_steps = skip_steps;
        self
    }

    pub fn build(self) -> Result<Td3> {
        Td3::new(self.config)
    }
}

impl_common_setters!(Td3Builder);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Space;
    use ndarray::{arr0, arr1, arr2};

    fn env() -> EnvConfig {
        EnvConfig::new(
            Space::uniform_box(-5.0, 5.0, &[3]),
            Space::Box {
                low: vec![0.0, -2.0],
                high: vec![1.0, 2.0],
                shape: vec![2],
            },
        )
    }

    fn observations(n: usize) -> AgentMap<Tensor> {
        let mut obs = AgentMap::new();
        obs.insert(
            "agent_0".to_string(),
            Array2::from_shape_fn((n, 3), |(i, j)| (i + j) as f32 * 0.1).into_dyn(),
        );
        obs
    }

    fn record(i: usize) -> AgentData<Experience> {
        let x = i as f32 * 0.1;
        AgentData::Single(Experience::new(
            arr1(&[x, -x, 0.5]).into_dyn(),
            arr1(&[0.2, -0.3]).into_dyn(),
            arr0(1.0f32).into_dyn(),
            arr1(&[x + 0.1, -x, 0.5]).into_dyn(),
            arr0(0.0f32).into_dyn(),
        ))
    }

    #[test]
    fn test_td3_builder() {
        let td3 = Td3Builder::new(env()).gamma(0.95).policy_update_frequency(3).build().unwrap();
        assert_eq!(td3.params().gamma, 0.95);
        assert_eq!(td3.params().policy_update_frequency, 3);
        let state = td3.training_state();
        assert_eq!(state.names().collect::<Vec<_>>(), vec!["policy", "qvalue"]);
        for (_, sub) in state.iter() {
            assert_eq!(sub.target_params.as_ref(), Some(&sub.params));
        }
    }

    #[test]
    fn test_rejects_discrete_actions() {
        let discrete = EnvConfig::new(Space::uniform_box(-1.0, 1.0, &[3]), Space::Discrete { n: 2 });
        assert!(matches!(Td3Builder::new(discrete).build(), Err(PallasError::UnsupportedSpace { .. })));
    }

    #[test]
    fn test_env_actions_are_scaled() {
        let mut td3 = Td3Builder::new(env()).start_step(0).build().unwrap();
        let outputs = td3.select_action(&observations(4)).unwrap();
        let out = &outputs["agent_0"];
        assert_eq!(out.action.shape(), &[4, 2]);
        assert!(out.action.iter().all(|a| a.abs() <= 1.0));
        for row in out.env_action.outer_iter() {
            assert!(row[0] >= 0.0 && row[0] <= 1.0);
            assert!(row[1] >= -2.0 && row[1] <= 2.0);
        }
    }

    #[test]
    fn test_warmup_is_uniform_and_deterministic() {
        let mut a = Td3Builder::new(env()).start_step(10).seed(1).build().unwrap();
        let mut b = Td3Builder::new(env()).start_step(10).seed(1).build().unwrap();
        let obs = observations(8);
        let first = a.explore(0, &obs).unwrap();
        assert_eq!(first, b.explore(0, &obs).unwrap());
        let greedy = a.select_action(&obs).unwrap();
        assert_ne!(first["agent_0"].action, greedy["agent_0"].action);
    }

    #[test]
    fn test_should_update_waits_for_start_step() {
        let mut td3 = Td3Builder::new(env()).start_step(5).batch_size(2).build().unwrap();
        let mut buffer = td3.create_buffer().unwrap();
        buffer.add(record(0));
        buffer.add(record(1));
        assert!(!td3.should_update(4, &buffer));
        assert!(td3.should_update(5, &buffer));
    }

    #[test]
    fn test_policy_and_targets_are_delayed() {
        let mut td3 = Td3Builder::new(env())
            .batch_size(4)
            .start_step(0)
            .policy_update_frequency(2)
            .learning_rate(1e-2)
            .build()
            .unwrap();
        let mut buffer = td3.create_buffer().unwrap();
        for i in 0..8 {
            buffer.add(record(i));
        }
        let initial = td3.training_state();

        let info = td3.update(&mut buffer).unwrap();
        let first = td3.training_state();
        assert!(info.contains_key("loss_qvalue"));
        assert!(!info.contains_key("loss_policy"));
        assert_eq!(first.get(POLICY).unwrap(), initial.get(POLICY).unwrap());
        assert_eq!(
            first.get(QVALUE).unwrap().target_params,
            initial.get(QVALUE).unwrap().target_params
        );

        let info = td3.update(&mut buffer).unwrap();
        let second = td3.training_state();
        assert!(info.contains_key("loss_policy"));
        assert_eq!(second.get(POLICY).unwrap().step, 1);
        assert_ne!(second.get(POLICY).unwrap().params, initial.get(POLICY).unwrap().params);
        assert_ne!(
            second.get(QVALUE).unwrap().target_params,
            initial.get(QVALUE).unwrap().target_params
        );
    }

    #[test]
    fn test_make_experience_keeps_env_axis_when_vectorized() {
        let td3 = Td3Builder::new(env().with_counts(2, 1)).build().unwrap();
        let mut transitions = AgentMap::new();
        transitions.insert(
            "agent_0".to_string(),
            Transition {
                observation: arr2(&[[0.0f32, 0.0, 0.0], [1.0, 1.0, 1.0]]).into_dyn(),
                action: arr2(&[[0.0f32, 0.0], [0.5, 0.5]]).into_dyn(),
                log_prob: arr1(&[0.0f32, 0.0]).into_dyn(),
                value: arr1(&[0.0f32, 0.0]).into_dyn(),
                reward: arr1(&[1.0f32, 2.0]).into_dyn(),
                next_observation: arr2(&[[0.0f32, 0.0, 1.0], [1.0, 1.0, 2.0]]).into_dyn(),
                terminated: arr1(&[0.0f32, 1.0]).into_dyn(),
                truncated: arr1(&[0.0f32, 0.0]).into_dyn(),
            },
        );
        match td3.make_experience(transitions).unwrap() {
            AgentData::Single(e) => assert_eq!(e.observation.shape(), &[2, 3]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
