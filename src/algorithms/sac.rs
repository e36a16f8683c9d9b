//! Soft Actor-Critic with a learned temperature.
//!
//! The policy head outputs a mean and a log standard deviation per action
//! coordinate; actions are `tanh(mean + std * eps)`. Critic targets subtract the
//! entropy bonus `alpha * log_prob` of the next action, and the `alpha` module
//! drives the policy entropy toward `-act_dim / 2`.

use std::sync::Arc;

use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis, Ix1, Zip};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
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
use crate::params::Params;
use crate::pipeline::{Diagnostics, ExperienceTransform, UpdateModule};
use crate::replay_buffer::{ExperienceBuffer, ReplayBuffer};
use crate::seed::{rng_from_seed, split_seed, SeedStream};
use crate::train_state::{check_tau, TrainState, TrainingState};
use crate::transformation::scale_to_box;
use crate::types::{AgentMap, Tensor};

const QVALUE: &str = "qvalue";
const POLICY: &str = "policy";
const ALPHA: &str = "alpha";
const LOG_ALPHA: &str = "log_alpha";

const HALF_LOG_TWO_PI: f32 = 0.918_938_5;
const TANH_EPS: f32 = 1e-6;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SacParams {
    pub gamma: f32,
    pub tau: f32,
    pub log_std_min: f32,
    pub log_std_max: f32,
    pub initial_alpha: f32,
    /// Uniformly random actions and no updates before this step
    pub start_step: usize,
    pub skip_steps: usize,
}

impl Default for SacParams {
    fn default() -> Self {
        SacParams {
            gamma: 0.99,
            tau: 0.005,
            log_std_min: -20.0,
            log_std_max: 2.0,
            initial_alpha: 0.2,
            start_step: 1000,
            skip_steps: 1,
        }
    }
}

/// Tanh-squashed diagonal Gaussian policy
#[derive(Clone, Debug)]
struct SquashedGaussian {
    net: Mlp,
    act_dim: usize,
    log_std_min: f32,
    log_std_max: f32,
}

/// One reparameterised draw and what its gradient needs
struct Draw {
    log_std: Array2<f32>,
    /// Pre-clamp log std inside the clamp range
    in_range: Array2<bool>,
    eps: Array2<f32>,
    action: Array2<f32>,
    log_prob: Array1<f32>,
}

impl SquashedGaussian {
    fn heads(&self, params: &Params, obs: ArrayView2<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let out = self.net.apply(params, obs)?;
        let mean = out.slice(s![.., ..self.act_dim]).to_owned();
        let raw_log_std = out.slice(s![.., self.act_dim..]).to_owned();
        Ok((mean, raw_log_std))
    }

    fn mean_action(&self, params: &Params, obs: ArrayView2<f32>) -> Result<Array2<f32>> {
        Ok(self.heads(params, obs)?.0.mapv(f32::tanh))
    }

    fn sample(&self, params: &Params, obs: ArrayView2<f32>, rng: &mut StdRng) -> Result<Draw> {
        let (mean, raw_log_std) = self.heads(params, obs)?;
        let (lo, hi) = (self.log_std_min, self.log_std_max);
        let log_std = raw_log_std.mapv(|v| v.clamp(lo, hi));
        let in_range = raw_log_std.mapv(|v| v >= lo && v <= hi);
        let eps = Array2::<f32>::random_using(mean.dim(), StandardNormal, rng);
        let pre_tanh = &mean + &(log_std.mapv(f32::exp) * &eps);
        let action = pre_tanh.mapv(f32::tanh);
        let per_coord = Zip::from(&eps)
            .and(&log_std)
            .and(&action)
            .map_collect(|e, ls, a| -0.5 * e * e - ls - HALF_LOG_TWO_PI - (1.0 - a * a + TANH_EPS).ln());
        let log_prob = per_coord.sum_axis(Axis(1));
        Ok(Draw {
            log_std,
            in_range,
            eps,
            action,
            log_prob,
        })
    }

    /// dLoss/dOutputs given dLoss/dAction and the weight of `log_prob` in the
    /// loss (the same for every row)
    fn output_gradient(&self, draw: &Draw, action_grad: ArrayView2<f32>, log_prob_weight: f32) -> Result<Array2<f32>> {
        let pre_tanh_grad = Zip::from(&draw.action)
            .and(action_grad)
            .map_collect(|a, g| {
                let slope = 1.0 - a * a;
                log_prob_weight * 2.0 * a * slope / (slope + TANH_EPS) + g * slope
            });
        let log_std_grad = Zip::from(&pre_tanh_grad)
            .and(&draw.log_std)
            .and(&draw.eps)
            .and(&draw.in_range)
            .map_collect(|g, ls, e, &inside| if inside { g * ls.exp() * e - log_prob_weight } else { 0.0 });
        Ok(concatenate(Axis(1), &[pre_tanh_grad.view(), log_std_grad.view()])?)
    }
}

pub struct Sac {
    config: AlgoConfig<SacParams>,
    policy: Arc<SquashedGaussian>,
    pipeline: LearningPipeline<Experience>,
    seeds: SeedStream,
    rng: StdRng,
}

fn alpha_value(state: &TrainState) -> Result<f32> {
    Ok(state.params.get(LOG_ALPHA)?.iter().next().copied().unwrap_or(0.0).exp())
}

fn column(values: &Tensor) -> Result<Array2<f32>> {
    Ok(Array2::from_shape_vec((values.len(), 1), values.iter().cloned().collect())?)
}

fn target_stage(
    policy: Arc<SquashedGaussian>,
    critic: Arc<TwinCritic>,
    gamma: f32,
) -> ExperienceTransform<TrainingState, Experience> {
    ExperienceTransform::from_fn(TrainingState::new(), move |state: &TrainingState, seed, e: Experience| {
        let next = as_matrix(&e.next_observation)?;
        let mut rng = rng_from_seed(seed);
        let draw = policy.sample(state.get(POLICY)?.target()?, next.view(), &mut rng)?;
        let next_q = critic.min_q(state.get(QVALUE)?.target()?, next.view(), draw.action.view())?;
        let alpha = alpha_value(state.get(ALPHA)?)?;

        let reward = e.reward.view().into_dimensionality::<Ix1>()?;
        let done = e.done.view().into_dimensionality::<Ix1>()?;
        let target = Zip::from(&reward)
            .and(&done)
            .and(next_q.column(0))
            .and(&draw.log_prob)
            .map_collect(|r, d, q, lp| r + gamma * (1.0 - d) * (q - alpha * lp));
        Ok(e.with_extra("target", target.into_dyn()))
    })
}

fn qvalue_module(critic: Arc<TwinCritic>, tau: f32, state: TrainState) -> UpdateModule<TrainState, Experience> {
    UpdateModule::from_fn(QVALUE, state, move |state: &TrainState, _seed, batch: &Experience, _peers| {
        let obs = as_matrix(&batch.observation)?;
        let actions = as_matrix(&batch.action)?;
        let target = column(batch.extra("target")?)?;
        let (loss, gradients) = critic.regression(&state.params, obs.view(), actions.view(), target.view(), RegressionLoss::Mse)?;
        let next = state.apply_gradients(&gradients)?.soft_update(tau)?;
        let mut info = Diagnostics::new();
        info.insert("loss_qvalue".to_string(), loss);
        Ok((next, info))
    })
}

fn policy_module(
    policy: Arc<SquashedGaussian>,
    critic: Arc<TwinCritic>,
    tau: f32,
    state: TrainState,
) -> UpdateModule<TrainState, Experience> {
    UpdateModule::from_fn(POLICY, state, move |state: &TrainState, seed, batch: &Experience, peers| {
        let qvalue = peers.get(QVALUE)?;
        let alpha = alpha_value(peers.get(ALPHA)?)?;
        let obs = as_matrix(&batch.observation)?;
        let mut rng = rng_from_seed(seed);
        let draw = policy.sample(&state.params, obs.view(), &mut rng)?;
        let (q1, _) = critic.q_values(&qvalue.params, obs.view(), draw.action.view())?;
        let n = q1.nrows().max(1) as f32;

        let q_grad = Array2::from_elem(q1.raw_dim(), -1.0 / n);
        let action_grad = critic.q1_action_gradient(&qvalue.params, obs.view(), draw.action.view(), q_grad.view())?;
        let output_grad = policy.output_gradient(&draw, action_grad.view(), alpha / n)?;
        let (gradients, _) = policy.net.backward(&state.params, obs.view(), output_grad.view())?;
        let next = state.apply_gradients(&gradients)?.soft_update(tau)?;

        let loss = Zip::from(&draw.log_prob)
            .and(q1.column(0))
            .fold(0.0, |acc, lp, q| acc + alpha * lp - q)
            / n;
        let mut info = Diagnostics::new();
        info.insert("loss_policy".to_string(), loss);
        info.insert("entropy".to_string(), -draw.log_prob.mean().unwrap_or(0.0));
        Ok((next, info))
    })
}

fn alpha_module(policy: Arc<SquashedGaussian>, target_entropy: f32, state: TrainState) -> UpdateModule<TrainState, Experience> {
    UpdateModule::from_fn(ALPHA, state, move |state: &TrainState, seed, batch: &Experience, peers| {
        let obs = as_matrix(&batch.observation)?;
        let mut rng = rng_from_seed(seed);
        let draw = policy.sample(&peers.get(POLICY)?.params, obs.view(), &mut rng)?;
        let alpha = alpha_value(state)?;
        let gap = draw.log_prob.mean().unwrap_or(0.0) + target_entropy;
        // d/dlog_alpha of alpha * -gap
        let loss = -alpha * gap;
        let mut gradients = Params::new();
        gradients.insert(LOG_ALPHA, Array1::from_elem(1, loss).into_dyn());
        let next = state.apply_gradients(&gradients)?;

        let mut info = Diagnostics::new();
        info.insert("loss_alpha".to_string(), loss);
        info.insert("alpha".to_string(), alpha_value(&next)?);
        Ok((next, info))
    })
}

impl Sac {
    pub fn new(config: AlgoConfig<SacParams>) -> Result<Self> {
        config.validate()?;
        let params = &config.algo_params;
        check_tau(params.tau)?;
        if !(params.initial_alpha > 0.0) {
            return Err(PallasError::invalid_parameter(
                "initial_alpha".to_string(),
                format!("must be positive, got {}", params.initial_alpha),
            ));
        }
        if params.log_std_min > params.log_std_max || params.skip_steps == 0 {
            return Err(PallasError::invalid_parameter(
                "log_std_min".to_string(),
                "needs log_std_min <= log_std_max and a positive skip_steps".to_string(),
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

        let policy = Arc::new(SquashedGaussian {
            net: Mlp::with_hidden(obs_dim, hidden, 2 * act_dim, Activation::Linear, "policy.")?,
            act_dim,
            log_std_min: params.log_std_min,
            log_std_max: params.log_std_max,
        });
        let critic = Arc::new(TwinCritic::new(obs_dim, act_dim, hidden)?);
        let mut seeds = SeedStream::new(config.seed);
        let qvalue = TrainState::with_target(critic.init(&mut seeds.next_rng()), config.optimizer());
        let policy_state = TrainState::with_target(policy.net.init(&mut seeds.next_rng()), config.optimizer());
        let mut log_alpha = Params::new();
        log_alpha.insert(LOG_ALPHA, Array1::from_elem(1, params.initial_alpha.ln()).into_dyn());
        let alpha = TrainState::create(log_alpha, config.optimizer());
        let target_entropy = -(act_dim as f32) / 2.0;

        let pipeline = LearningPipeline::new(
            vec![target_stage(Arc::clone(&policy), Arc::clone(&critic), params.gamma)],
            vec![
                qvalue_module(Arc::clone(&critic), params.tau, qvalue),
                policy_module(Arc::clone(&policy), Arc::clone(&critic), params.tau, policy_state),
                alpha_module(Arc::clone(&policy), target_entropy, alpha),
            ],
        );
        let rng = seeds.next_rng();

        Ok(Sac {
            config,
            policy,
            pipeline,
            seeds,
            rng,
        })
    }

    pub fn params(&self) -> &SacParams {
        &self.config.algo_params
    }

    /// Current temperature
    pub fn alpha(&self) -> Result<f32> {
        alpha_value(self.pipeline.state(ALPHA)?)
    }

    fn output(&self, actions: Array2<f32>, log_prob: Array1<f32>) -> Result<PolicyOutput> {
        let action = actions.into_dyn();
        Ok(PolicyOutput {
            env_action: scale_to_box(&action, &self.config.env_cfg.action_space)?,
            value: Array1::<f32>::zeros(log_prob.len()).into_dyn(),
            log_prob: log_prob.into_dyn(),
            action,
        })
    }
}

impl Algorithm for Sac {
    type Experience = Experience;
    type Buffer = ReplayBuffer<AgentData<Experience>>;

    fn name(&self) -> &'static str {
        "sac"
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
        let params = &self.pipeline.state(POLICY)?.params;
        let mut outputs = AgentMap::new();
        for (agent, obs) in observations {
            let actions = self.policy.mean_action(params, as_matrix(obs)?.view())?;
            let n_envs = actions.nrows();
            outputs.insert(agent.clone(), self.output(actions, Array1::zeros(n_envs))?);
        }
        Ok(outputs)
    }

    fn explore(&mut self, step: usize, observations: &AgentMap<Tensor>) -> Result<AgentMap<PolicyOutput>> {
        let mut outputs = AgentMap::new();
        for (agent, obs) in observations {
            let output = if step < self.config.algo_params.start_step {
                let n_envs = batch_rows(obs)?;
                let actions = Array2::random_using(
                    (n_envs, self.policy.act_dim),
                    Uniform::new_inclusive(-1.0f32, 1.0),
                    &mut self.rng,
                );
                self.output(actions, Array1::zeros(n_envs))?
            } else {
                let draw = self
                    .policy
                    .sample(&self.pipeline.state(POLICY)?.params, as_matrix(obs)?.view(), &mut self.rng)?;
                self.output(draw.action, draw.log_prob)?
            };
            outputs.insert(agent.clone(), output);
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

/// Builder for Sac
pub struct SacBuilder {
    config: AlgoConfig<SacParams>,
}

impl SacBuilder {
    pub fn new(env: EnvConfig) -> Self {
        SacBuilder {
            config: AlgoConfig::new(0, SacParams::default(), env),
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

    pub fn log_std_bounds(mut self, min: f32, max: f32) -> Self {
        self.config.algo_params.log_std_min = min;
        self.config.algo_params.log_std_max = max;
        self
    }

    pub fn initial_alpha(mut self, alpha: f32) -> Self {
        self.config.algo_params.initial_alpha = alpha;
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

    pub fn build(self) -> Result<Sac> {
        Sac::new(self.config)
    }
}

impl_common_setters!(SacBuilder);
