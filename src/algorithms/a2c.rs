//! Advantage Actor-Critic (A2C), on-policy.
//!
//! Separate policy and value networks live in a single `policy_value` sub-state.
//! Discrete action spaces use a categorical policy over logits; box action
//! spaces use a diagonal Gaussian with a state-independent learned log std.
//!
//! A full rollout is processed per environment trajectory to compute
//! generalized advantage estimates, then optimised for several epochs of
//! shuffled minibatches. The rollout buffer is emptied by every update.

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView2, Axis, Ix1, Zip};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::algorithms::{agent_data, as_matrix, squeeze_env, total_loss, Algorithm, PolicyOutput, Transition};
use crate::builders::RolloutBufferBuilder;
use crate::config::{AlgoConfig, EnvConfig, TrainConfig};
use crate::error::{PallasError, Result};
use crate::experience::{AgentData, RolloutExperience};
use crate::loss::{Loss, MSE};
use crate::network::{Activation, Differentiable, Mlp, Model};
use crate::params::Params;
use crate::pipeline::{process_records, update_pipeline, Diagnostics, ModuleStates, PipelineModule, ProcessFn, UpdateFn};
use crate::replay_buffer::{shuffled_minibatches, RolloutBuffer};
use crate::seed::{rng_from_seed, SeedStream};
use crate::tensor;
use crate::train_state::{TrainState, TrainingState};
use crate::transformation::scale_to_box;
use crate::types::{AgentMap, Space, Tensor};

const POLICY_VALUE: &str = "policy_value";
const LOG_STD: &str = "policy.log_std";
const HALF_LOG_TWO_PI: f32 = 0.918_938_5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct A2cParams {
    pub gamma: f32,
    pub gae_lambda: f32,
    pub value_coef: f32,
    pub entropy_coef: f32,
    /// Normalise advantages within each minibatch
    pub normalize_advantages: bool,
}

impl Default for A2cParams {
    fn default() -> Self {
        A2cParams {
            gamma: 0.99,
            gae_lambda: 0.95,
            value_coef: 0.5,
            entropy_coef: 0.0,
            normalize_advantages: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum PolicyHead {
    Categorical { n_actions: usize },
    Gaussian { act_dim: usize },
}

/// Policy and value networks sharing one parameter tree
#[derive(Clone, Debug)]
struct ActorCritic {
    policy: Mlp,
    value: Mlp,
    head: PolicyHead,
}

fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum = row.fold(0.0, |s, &v| s + (v - max).exp()).ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

fn to_vec1(t: &Tensor) -> Vec<f32> {
    t.iter().cloned().collect()
}

impl ActorCritic {
    fn new(obs_dim: usize, action_space: &Space, hidden: &[usize]) -> Result<Self> {
        let (head, outputs) = match action_space {
            Space::Discrete { n } if *n > 0 => (PolicyHead::Categorical { n_actions: *n }, *n),
            Space::Discrete { .. } => {
                return Err(PallasError::unsupported_space("action".to_string(), format!("{:?}", action_space)))
            }
            Space::Box { .. } => {
                let act_dim = action_space.flat_dim("action")?;
                (PolicyHead::Gaussian { act_dim }, act_dim)
            }
        };
        Ok(ActorCritic {
            policy: Mlp::with_hidden(obs_dim, hidden, outputs, Activation::Linear, "policy.")?,
            value: Mlp::with_hidden(obs_dim, hidden, 1, Activation::Linear, "value.")?,
            head,
        })
    }

    fn init(&self, rng: &mut StdRng) -> Params {
        let mut params = self.policy.init(rng).merge(&self.value.init(rng));
        if let PolicyHead::Gaussian { act_dim } = self.head {
            params.insert(LOG_STD, Array1::<f32>::zeros(act_dim).into_dyn());
        }
        params
    }

    fn values(&self, params: &Params, obs: ArrayView2<f32>) -> Result<Array1<f32>> {
        Ok(self.value.apply(params, obs)?.column(0).to_owned())
    }

    fn log_std(&self, params: &Params) -> Result<Array1<f32>> {
        Ok(params.get(LOG_STD)?.view().into_dimensionality::<Ix1>()?.to_owned())
    }

    /// Sampled (or, without a generator, most likely) actions and their log-probabilities
    fn act(&self, params: &Params, obs: ArrayView2<f32>, rng: Option<&mut StdRng>) -> Result<(Tensor, Array1<f32>)> {
        let out = self.policy.apply(params, obs)?;
        match self.head {
            PolicyHead::Categorical { .. } => {
                let log_probs = log_softmax(&out);
                let mut rng = rng;
                let mut actions = Array1::<f32>::zeros(out.nrows());
                let mut chosen = Array1::<f32>::zeros(out.nrows());
                for (i, row) in log_probs.rows().into_iter().enumerate() {
                    let index = match rng.as_deref_mut() {
                        Some(rng) => {
                            let u: f32 = rng.gen();
                            let mut cumulative = 0.0;
                            let mut pick = row.len() - 1;
                            for (k, lp) in row.iter().enumerate() {
                                cumulative += lp.exp();
                                if u < cumulative {
                                    pick = k;
                                    break;
                                }
                            }
                            pick
                        }
                        None => row
                            .iter()
                            .enumerate()
                            .fold((0, f32::NEG_INFINITY), |(b, bv), (k, &v)| if v > bv { (k, v) } else { (b, bv) })
                            .0,
                    };
                    actions[i] = index as f32;
                    chosen[i] = row[index];
                }
                Ok((actions.into_dyn(), chosen))
            }
            PolicyHead::Gaussian { .. } => {
                let log_std = self.log_std(params)?;
                let (actions, eps) = match rng {
                    Some(rng) => {
                        let eps = Array2::<f32>::random_using(out.dim(), StandardNormal, rng);
                        (&out + &(&eps * &log_std.mapv(f32::exp)), eps)
                    }
                    None => (out.clone(), Array2::zeros(out.dim())),
                };
                let log_prob = eps
                    .rows()
                    .into_iter()
                    .map(|z| {
                        z.iter()
                            .zip(log_std.iter())
                            .map(|(z, ls)| -0.5 * z * z - ls - HALF_LOG_TWO_PI)
                            .sum::<f32>()
                    })
                    .collect::<Array1<f32>>();
                Ok((actions.into_dyn(), log_prob))
            }
        }
    }

    /// Loss gradients for one minibatch with `advantage` and `return` extras
    fn loss_and_gradients(&self, params: &Params, batch: &RolloutExperience, p: &A2cParams) -> Result<(Params, Diagnostics)> {
        let obs = as_matrix(&batch.observation)?;
        let n = obs.nrows();
        if n == 0 {
            return Err(PallasError::EmptyBatch("empty minibatch".to_string()));
        }
        let nf = n as f32;
        let mut advantages = Array1::from(to_vec1(batch.extra("advantage")?));
        if p.normalize_advantages && n > 1 {
            let mean = advantages.mean().unwrap_or(0.0);
            let std = advantages.std(0.0);
            advantages.mapv_inplace(|a| (a - mean) / (std + 1e-8));
        }
        let returns = Array2::from_shape_vec((n, 1), to_vec1(batch.extra("return")?))?;

        let values = self.value.apply(params, obs.view())?;
        let (value_loss, value_grad) = MSE.value_and_gradient(values.view(), returns.view());
        let (value_grads, _) = self.value.backward(params, obs.view(), (value_grad * p.value_coef).view())?;

        let out = self.policy.apply(params, obs.view())?;
        let c = p.entropy_coef;
        let (policy_grads, log_prob, entropy) = match self.head {
            PolicyHead::Categorical { n_actions } => {
                let log_probs = log_softmax(&out);
                let probs = log_probs.mapv(f32::exp);
                let actions: Vec<usize> = batch.action.iter().map(|&a| a as usize).collect();
                if actions.len() != n || actions.iter().any(|&a| a >= n_actions) {
                    return Err(PallasError::invalid_parameter(
                        "action".to_string(),
                        format!("expected {} indices below {}", n, n_actions),
                    ));
                }
                let entropy: Array1<f32> = Zip::from(probs.rows())
                    .and(log_probs.rows())
                    .map_collect(|probs, log_probs| -probs.dot(&log_probs));
                let mut grad = Array2::<f32>::zeros(out.raw_dim());
                for i in 0..n {
                    for k in 0..n_actions {
                        let indicator = if k == actions[i] { 1.0 } else { 0.0 };
                        let pk = probs[[i, k]];
                        grad[[i, k]] = -(advantages[i] / nf) * (indicator - pk) + (c / nf) * pk * (log_probs[[i, k]] + entropy[i]);
                    }
                }
                let log_prob = Array1::from_shape_fn(n, |i| log_probs[[i, actions[i]]]);
                let (grads, _) = self.policy.backward(params, obs.view(), grad.view())?;
                (grads, log_prob, entropy.mean().unwrap_or(0.0))
            }
            PolicyHead::Gaussian { act_dim } => {
                let log_std = self.log_std(params)?;
                let std = log_std.mapv(f32::exp);
                let actions = as_matrix(&batch.action)?;
                if actions.dim() != (n, act_dim) {
                    return Err(PallasError::dimension_mismatch(
                        format!("actions of shape {:?}", (n, act_dim)),
                        format!("{:?}", actions.dim()),
                    ));
                }
                let z = (&actions - &out) / &std;
                let log_prob = z.map_axis(Axis(1), |row| {
                    row.iter()
                        .zip(log_std.iter())
                        .map(|(z, ls)| -0.5 * z * z - ls - HALF_LOG_TWO_PI)
                        .sum::<f32>()
                });
                let mut mean_grad = &z / &std;
                let mut log_std_grad = Array1::<f32>::from_elem(act_dim, -c);
                for i in 0..n {
                    let weight = -advantages[i] / nf;
                    for j in 0..act_dim {
                        log_std_grad[j] += weight * (z[[i, j]] * z[[i, j]] - 1.0);
                    }
                    mean_grad.row_mut(i).mapv_inplace(|g| g * weight);
                }
                let (mut grads, _) = self.policy.backward(params, obs.view(), mean_grad.view())?;
                grads.insert(LOG_STD, log_std_grad.into_dyn());
                let entropy = log_std.sum() + act_dim as f32 * (0.5 + HALF_LOG_TWO_PI);
                (grads, log_prob, entropy)
            }
        };

        let policy_loss = -(&advantages * &log_prob).mean().unwrap_or(0.0) - c * entropy;
        let mut info = Diagnostics::new();
        info.insert("loss_policy".to_string(), policy_loss);
        info.insert("loss_value".to_string(), p.value_coef * value_loss);
        info.insert("entropy".to_string(), entropy);
        Ok((policy_grads.merge(&value_grads), info))
    }
}

/// GAE over one environment trajectory, time along the leading axis
fn advantage_stage(model: Arc<ActorCritic>, gamma: f32, lambda: f32) -> ProcessFn<TrainState, RolloutExperience> {
    Arc::new(move |state: &TrainState, _seed: u64, e: RolloutExperience| -> Result<RolloutExperience> {
        let next_obs = as_matrix(e.extra("next_observation")?)?;
        let next_values = model.values(&state.params, next_obs.view())?;
        let values = to_vec1(&e.value);
        let rewards = to_vec1(&e.reward);
        let terminated = to_vec1(&e.done);
        let ended = to_vec1(e.extra("episode_end")?);
        let len = values.len();
        if [rewards.len(), terminated.len(), ended.len(), next_values.len()].iter().any(|&l| l != len) {
            return Err(PallasError::dimension_mismatch(
                format!("{} steps in every field", len),
                format!("{} rewards, {} next values", rewards.len(), next_values.len()),
            ));
        }

        let mut advantages = Array1::<f32>::zeros(len);
        let mut last = 0.0;
        for t in (0..len).rev() {
            let delta = rewards[t] + gamma * (1.0 - terminated[t]) * next_values[t] - values[t];
            last = delta + gamma * lambda * (1.0 - ended[t]) * last;
            advantages[t] = last;
        }
        let returns = &advantages + &Array1::from(values);
        Ok(e.with_extra("advantage", advantages.into_dyn()).with_extra("return", returns.into_dyn()))
    })
}

fn policy_value_update(
    model: Arc<ActorCritic>,
    params: A2cParams,
    n_epochs: usize,
    batch_size: usize,
) -> UpdateFn<TrainState, RolloutExperience> {
    Arc::new(move |state: &TrainState, seed: u64, batch: &RolloutExperience, _peers: &ModuleStates<'_, TrainState>| -> Result<(TrainState, Diagnostics)> {
        let len = tensor::leading_len(batch)?;
        let mut rng = rng_from_seed(seed);
        let mut state = state.clone();
        let mut info = Diagnostics::new();
        for _ in 0..n_epochs {
            for indices in shuffled_minibatches(len, batch_size, &mut rng) {
                let minibatch = tensor::select_rows(batch, &indices)?;
                let (gradients, minibatch_info) = model.loss_and_gradients(&state.params, &minibatch, &params)?;
                state = state.apply_gradients(&gradients)?;
                info = minibatch_info;
            }
        }
        Ok((state, info))
    })
}

pub struct A2c {
    config: AlgoConfig<A2cParams>,
    model: Arc<ActorCritic>,
    module: PipelineModule<TrainState, RolloutExperience, RolloutExperience>,
    seeds: SeedStream,
    rng: StdRng,
}

impl A2c {
    pub fn new(config: AlgoConfig<A2cParams>) -> Result<Self> {
        config.validate()?;
        let params = &config.algo_params;
        if !(0.0..=1.0).contains(&params.gae_lambda) || !(0.0..=1.0).contains(&params.gamma) {
            return Err(PallasError::invalid_parameter(
                "gae_lambda".to_string(),
                "gamma and gae_lambda must be in [0, 1]".to_string(),
            ));
        }
        let obs_dim = config.env_cfg.observation_space.flat_dim("observation")?;
        let model = Arc::new(ActorCritic::new(obs_dim, &config.env_cfg.action_space, &config.update_cfg.hidden_sizes)?);
        let mut seeds = SeedStream::new(config.seed);
        let optimizer = config.optimizer().with_epsilon(1e-5);
        let state = TrainState::create(model.init(&mut seeds.next_rng()), optimizer);
        let module = PipelineModule::new(
            POLICY_VALUE,
            state,
            advantage_stage(Arc::clone(&model), params.gamma, params.gae_lambda),
            policy_value_update(
                Arc::clone(&model),
                params.clone(),
                config.update_cfg.n_epochs,
                config.update_cfg.batch_size,
            ),
        );
        let rng = seeds.next_rng();
        Ok(A2c {
            config,
            model,
            module,
            seeds,
            rng,
        })
    }

    pub fn params(&self) -> &A2cParams {
        &self.config.algo_params
    }

    fn policy_output(&mut self, obs: &Tensor, sample: bool) -> Result<PolicyOutput> {
        let obs = as_matrix(obs)?;
        let params = &self.module.state.params;
        let value = self.model.values(params, obs.view())?;
        let rng = if sample { Some(&mut self.rng) } else { None };
        let (action, log_prob) = self.model.act(params, obs.view(), rng)?;
        Ok(PolicyOutput {
            env_action: self.env_action(&action)?,
            action,
            log_prob: log_prob.into_dyn(),
            value: value.into_dyn(),
        })
    }

    fn env_action(&self, action: &Tensor) -> Result<Tensor> {
        match self.model.head {
            PolicyHead::Categorical { .. } => Ok(action.clone()),
            PolicyHead::Gaussian { .. } => {
                scale_to_box(&action.mapv(|a| a.clamp(-1.0, 1.0)), &self.config.env_cfg.action_space)
            }
        }
    }
}

impl Algorithm for A2c {
    type Experience = RolloutExperience;
    type Buffer = RolloutBuffer<AgentData<RolloutExperience>>;

    fn name(&self) -> &'static str {
        "a2c"
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
            outputs.insert(agent.clone(), self.policy_output(obs, false)?);
        }
        Ok(outputs)
    }

    fn explore(&mut self, _step: usize, observations: &AgentMap<Tensor>) -> Result<AgentMap<PolicyOutput>> {
        let mut outputs = AgentMap::new();
        for (agent, obs) in observations {
            outputs.insert(agent.clone(), self.policy_output(obs, true)?);
        }
        Ok(outputs)
    }

    fn make_experience(&self, transitions: AgentMap<Transition>) -> Result<AgentData<RolloutExperience>> {
        let vectorized = self.regime().vectorized;
        let records = transitions
            .into_iter()
            .map(|(agent, t)| {
                let episode_end = Zip::from(&t.terminated)
                    .and(&t.truncated)
                    .map_collect(|a, b| (*a).max(*b));
                let e = RolloutExperience::new(
                    squeeze_env(t.observation, vectorized),
                    squeeze_env(t.action, vectorized),
                    squeeze_env(t.log_prob, vectorized),
                    squeeze_env(t.value, vectorized),
                    squeeze_env(t.reward, vectorized),
                    squeeze_env(t.terminated, vectorized),
                )
                .with_extra("next_observation", squeeze_env(t.next_observation, vectorized))
                .with_extra("episode_end", squeeze_env(episode_end, vectorized));
                (agent, e)
            })
            .collect();
        agent_data(records, self.regime().parallel)
    }

    fn should_update(&mut self, _step: usize, buffer: &Self::Buffer) -> bool {
        buffer.is_full()
    }

    fn update(&mut self, buffer: &mut Self::Buffer) -> Result<Diagnostics> {
        let records = buffer.take_all();
        if records.is_empty() {
            return Err(PallasError::EmptyBatch("rollout buffer is empty".to_string()));
        }
        let regime = self.regime();
        let transforms = vec![self.module.experience_transform()];
        let batch = process_records(&transforms, regime, self.seeds.next_seed(), &records)?;
        let (updated, mut diagnostics) = update_pipeline(&[self.module.update_module()], self.seeds.next_seed(), &batch)?;
        let state = updated
            .into_iter()
            .next()
            .map(|m| m.state)
            .ok_or_else(|| PallasError::TrainingError("update pipeline returned no module".to_string()))?;
        self.module = self.module.with_state(state);
        diagnostics.insert("total_loss".to_string(), total_loss(&diagnostics));
        Ok(diagnostics)
    }

    fn create_buffer(&self) -> Result<Self::Buffer> {
        RolloutBufferBuilder::new().capacity(self.config.update_cfg.max_buffer_size).build()
    }

    fn training_state(&self) -> TrainingState {
        TrainingState::new().with(POLICY_VALUE, self.module.state.clone())
    }

    fn set_training_state(&mut self, state: TrainingState) -> Result<()> {
        state.check_matches(&self.training_state())?;
        self.module = self.module.with_state(state.get(POLICY_VALUE)?.clone());
        Ok(())
    }
}

/// Builder for A2c
pub struct A2cBuilder {
    config: AlgoConfig<A2cParams>,
}

impl A2cBuilder {
    pub fn new(env: EnvConfig) -> Self {
        let mut config = AlgoConfig::new(0, A2cParams::default(), env);
        config.update_cfg.max_buffer_size = 128;
        config.update_cfg.n_epochs = 4;
        A2cBuilder { config }
    }

    pub fn gamma(mut self, gamma: f32) -> Self {
        self.config.algo_params.gamma = gamma;
        self
    }

    pub fn gae_lambda(mut self, lambda: f32) -> Self {
        self.config.algo_params.gae_lambda = lambda;
        self
    }

    pub fn value_coef(mut self, coef: f32) -> Self {
        self.config.algo_params.value_coef = coef;
        self
    }

    pub fn entropy_coef(mut self, coef: f32) -> Self {
        self.config.algo_params.entropy_coef = coef;
        self
    }

    pub fn normalize_advantages(mut self, normalize: bool) -> Self {
        self.config.algo_params.normalize_advantages = normalize;
        self
    }

    pub fn build(self) -> Result<A2c> {
        A2c::new(self.config)
    }
}

impl_common_setters!(A2cBuilder);
