//! Training loop driver.
//!
//! Every environment step goes through four phases: the algorithm explores,
//! the vectorized environment steps, the transition is stored in the buffer,
//! and then the algorithm may update and the saver may checkpoint. Training
//! ends with a final checkpoint.

use log::{debug, info};
use ndarray::Axis;

use crate::algorithms::{flags, Algorithm, PolicyOutput, Transition};
use crate::error::{PallasError, Result};
use crate::metrics::{MetricsSummary, MetricsTracker};
use crate::pipeline::Diagnostics;
use crate::replay_buffer::ExperienceBuffer;
use crate::saver::{Saver, SaverContext};
use crate::types::{AgentMap, Tensor};
use crate::vec_env::{VecEnv, VecStep};

const HISTORY_SIZE: usize = 100;

/// Hooks called by [`train`] and [`resume`]; every method defaults to a no-op
pub trait Callback {
    fn on_step(&mut self, _step: usize, _result: &VecStep) -> Result<()> {
        Ok(())
    }

    fn on_episode_end(&mut self, _step: usize, _env_index: usize, _episode_return: f32, _length: usize) -> Result<()> {
        Ok(())
    }

    fn on_update(&mut self, _step: usize, _diagnostics: &Diagnostics) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _report: &TrainReport) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a training run
#[derive(Clone, Debug, PartialEq)]
pub struct TrainReport {
    /// Step the run started after; 0 unless resumed
    pub start_step: usize,
    pub final_step: usize,
    pub metrics: MetricsSummary,
    pub last_diagnostics: Option<Diagnostics>,
}

/// Outcome of [`evaluate`]
#[derive(Clone, Debug, PartialEq)]
pub struct EvalReport {
    pub episode_returns: Vec<f32>,
    pub episode_lengths: Vec<usize>,
}

impl EvalReport {
    pub fn mean_return(&self) -> f32 {
        if self.episode_returns.is_empty() {
            return 0.0;
        }
        self.episode_returns.iter().sum::<f32>() / self.episode_returns.len() as f32
    }
}

fn agent_entry<'a, T>(map: &'a AgentMap<T>, agent: &str) -> Result<&'a T> {
    map.get(agent)
        .ok_or_else(|| PallasError::Protocol(format!("no step result for agent '{}'", agent)))
}

fn check_env<A: Algorithm>(algo: &A, env: &dyn VecEnv) -> Result<()> {
    let cfg = algo.env_config();
    if env.num_envs() != cfg.n_envs || env.agents().len() != cfg.n_agents {
        return Err(PallasError::dimension_mismatch(
            format!("{} environments with {} agents", cfg.n_envs, cfg.n_agents),
            format!("{} environments with {} agents", env.num_envs(), env.agents().len()),
        ));
    }
    Ok(())
}

/// Environment actions of every agent
fn env_actions(outputs: &AgentMap<PolicyOutput>) -> AgentMap<Tensor> {
    outputs
        .iter()
        .map(|(agent, out)| (agent.clone(), out.env_action.clone()))
        .collect()
}

/// Per environment: reward summed over agents, and whether the episode ended
fn episode_signals(result: &VecStep) -> (Vec<f32>, Vec<bool>) {
    let n = result.infos.num_envs();
    let rewards = (0..n)
        .map(|i| result.rewards.values().map(|r| r[i]).sum())
        .collect();
    (rewards, result.dones().to_vec())
}

/// Observations that follow each action: the pre-reset observation for every
/// environment whose episode just ended
pub fn next_observations(result: &VecStep) -> Result<AgentMap<Tensor>> {
    let mut next = result.observations.clone();
    for env_index in result.infos.ended_envs() {
        let last = result.infos.final_observation(env_index).ok_or_else(|| {
            PallasError::Protocol(format!("environment {} ended without a final observation", env_index))
        })?;
        for (agent, obs) in next.iter_mut() {
            let final_obs = agent_entry(&last, agent)?;
            let mut row = obs.index_axis_mut(Axis(0), env_index);
            if row.shape() != final_obs.shape() {
                return Err(PallasError::dimension_mismatch(
                    format!("{:?}", row.shape()),
                    format!("{:?}", final_obs.shape()),
                ));
            }
            row.assign(final_obs);
        }
    }
    Ok(next)
}

fn transitions(
    observations: &AgentMap<Tensor>,
    outputs: AgentMap<PolicyOutput>,
    result: &VecStep,
    next_observations: &mut AgentMap<Tensor>,
) -> Result<AgentMap<Transition>> {
    let mut transitions = AgentMap::new();
    for (agent, out) in outputs {
        let transition = Transition {
            observation: agent_entry(observations, &agent)?.clone(),
            action: out.action,
            log_prob: out.log_prob,
            value: out.value,
            reward: agent_entry(&result.rewards, &agent)?.clone().into_dyn(),
            next_observation: next_observations
                .remove(&agent)
                .ok_or_else(|| PallasError::Protocol(format!("no observation for agent '{}'", agent)))?,
            terminated: flags(agent_entry(&result.terminated, &agent)?),
            truncated: flags(agent_entry(&result.truncated, &agent)?),
        };
        transitions.insert(agent, transition);
    }
    Ok(transitions)
}

fn run_loop<A: Algorithm>(
    algo: &mut A,
    env: &mut dyn VecEnv,
    saver: Option<&Saver>,
    callbacks: &mut [Box<dyn Callback>],
    start_step: usize,
) -> Result<TrainReport> {
    check_env(algo, env)?;
    let n_env_steps = algo.train_config().n_env_steps;
    let save_frequency = algo.train_config().save_frequency;
    let mut buffer = algo.create_buffer()?;
    let mut tracker = MetricsTracker::new(env.num_envs(), HISTORY_SIZE);
    let mut ctx = saver.map(|s| SaverContext::new(s, save_frequency));
    let mut last_diagnostics = None;

    info!(
        "Training {} on {} environments from step {} to {}",
        algo.name(),
        env.num_envs(),
        start_step,
        n_env_steps
    );
    let (mut observations, _) = env.reset(Some(algo.seed().wrapping_add(start_step as u64)))?;

    for step in start_step + 1..=n_env_steps {
        let outputs = algo.explore(step, &observations)?;
        let result = env.step(&env_actions(&outputs))?;

        let mut next = next_observations(&result)?;
        let record = algo.make_experience(transitions(&observations, outputs, &result, &mut next)?)?;
        buffer.add(record);

        let (rewards, dones) = episode_signals(&result);
        for callback in callbacks.iter_mut() {
            callback.on_step(step, &result)?;
        }
        for (env_index, episode_return, length) in tracker.step(&rewards, &dones)? {
            debug!(
                "Step {}: episode of environment {} ended with return {:.3} after {} steps",
                step, env_index, episode_return, length
            );
            for callback in callbacks.iter_mut() {
                callback.on_episode_end(step, env_index, episode_return, length)?;
            }
        }

        if algo.should_update(step, &buffer) {
            let diagnostics = algo.update(&mut buffer)?;
            debug!("Step {}: update {:?}", step, diagnostics);
            tracker.record_update(&diagnostics);
            for callback in callbacks.iter_mut() {
                callback.on_update(step, &diagnostics)?;
            }
            last_diagnostics = Some(diagnostics);
        }

        if let Some(ctx) = ctx.as_mut() {
            ctx.update(step, || algo.training_state())?;
        }
        observations = result.observations;
    }

    let final_step = n_env_steps.max(start_step);
    if let Some(ctx) = ctx {
        ctx.finish(final_step, &algo.training_state())?;
    }
    let report = TrainReport {
        start_step,
        final_step,
        metrics: tracker.summary(),
        last_diagnostics,
    };
    info!(
        "Finished training {} at step {}: {} episodes, mean return {:?}",
        algo.name(),
        final_step,
        report.metrics.episodes,
        report.metrics.mean_return
    );
    for callback in callbacks.iter_mut() {
        callback.on_train_end(&report)?;
    }
    Ok(report)
}

/// Train `algo` from scratch for its configured number of environment steps
pub fn train<A: Algorithm>(
    algo: &mut A,
    env: &mut dyn VecEnv,
    saver: Option<&Saver>,
    callbacks: &mut [Box<dyn Callback>],
) -> Result<TrainReport> {
    run_loop(algo, env, saver, callbacks, 0)
}

/// Restore the latest checkpoint of `saver` and continue training after its step
pub fn resume<A: Algorithm>(
    algo: &mut A,
    env: &mut dyn VecEnv,
    saver: &Saver,
    callbacks: &mut [Box<dyn Callback>],
) -> Result<TrainReport> {
    let (step, state) = saver.restore_latest_step(&algo.training_state())?;
    algo.set_training_state(state)?;
    info!("Resuming {} from step {}", algo.name(), step);
    run_loop(algo, env, Some(saver), callbacks, step)
}

/// Run `n_episodes` episodes with the algorithm's noise-free actions
pub fn evaluate<A: Algorithm>(algo: &mut A, env: &mut dyn VecEnv, n_episodes: usize) -> Result<EvalReport> {
    if n_episodes == 0 {
        return Err(PallasError::invalid_parameter(
            "n_episodes".to_string(),
            "must be positive".to_string(),
        ));
    }
    check_env(algo, env)?;
    let mut tracker = MetricsTracker::new(env.num_envs(), n_episodes);
    let mut report = EvalReport {
        episode_returns: Vec::with_capacity(n_episodes),
        episode_lengths: Vec::with_capacity(n_episodes),
    };
    let (mut observations, _) = env.reset(Some(algo.seed()))?;
    while report.episode_returns.len() < n_episodes {
        let outputs = algo.select_action(&observations)?;
        let result = env.step(&env_actions(&outputs))?;
        let (rewards, dones) = episode_signals(&result);
        for (_, episode_return, length) in tracker.step(&rewards, &dones)? {
            if report.episode_returns.len() < n_episodes {
                report.episode_returns.push(episode_return);
                report.episode_lengths.push(length);
            }
        }
        observations = result.observations;
    }
    info!(
        "Evaluated {} over {} episodes: mean return {:.3}",
        algo.name(),
        n_episodes,
        report.mean_return()
    );
    Ok(report)
}
