//! Vectorized environments.
//!
//! A [`VecEnv`] steps `num_envs` copies of a parallel environment in lock-step
//! and returns per-agent arrays whose leading axis is the environment index.
//! [`VecEnvPool`] hosts each copy in its own worker (child process or thread)
//! and drives them through the [`protocol`] messages; [`SyncVecEnv`] steps them
//! one after the other in the calling thread.
//!
//! Both implementations reset a worker as soon as any of its agents finishes an
//! episode, and stash the last observation of the finished episode in the
//! `final_observation` info key.

pub mod connection;
pub mod info;
pub mod pool;
pub mod protocol;
pub mod sync;
pub mod worker;

use ndarray::{Array1, ArrayViewD, Axis};

use crate::env::StepResult;
use crate::error::{PallasError, Result};
use crate::types::{AgentId, AgentMap, Info, Space, Tensor};

pub use connection::{ProcessConnection, ThreadConnection, WorkerConnection};
pub use info::{MaskedColumn, VecInfo, FINAL_INFO, FINAL_OBSERVATION};
pub use pool::VecEnvPool;
pub use protocol::{Command, Reply};
pub use sync::SyncVecEnv;
pub use worker::{run_worker, serve_stdio, step_with_autoreset, WorkerEndpoint};

/// Stacked outcome of one step of every environment
#[derive(Clone, Debug, PartialEq)]
pub struct VecStep {
    /// `[num_envs, ...]` per agent
    pub observations: AgentMap<Tensor>,
    pub rewards: AgentMap<Array1<f32>>,
    pub terminated: AgentMap<Array1<bool>>,
    pub truncated: AgentMap<Array1<bool>>,
    pub infos: VecInfo,
}

impl VecStep {
    /// Per environment, whether any agent's episode ended
    pub fn dones(&self) -> Array1<bool> {
        let n = self.infos.num_envs();
        Array1::from_shape_fn(n, |i| {
            self.terminated.values().any(|t| t[i]) || self.truncated.values().any(|t| t[i])
        })
    }
}

/// Lock-step collection of environments
pub trait VecEnv {
    fn num_envs(&self) -> usize;

    fn agents(&self) -> &[AgentId];

    fn observation_space(&self, agent: &str) -> Result<&Space>;

    fn action_space(&self, agent: &str) -> Result<&Space>;

    /// Reset every environment; environment `i` gets `seed + i` when seeded
    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, VecInfo)>;

    /// Start a step; actions are `[num_envs, ...]` per agent
    fn step_async(&mut self, actions: &AgentMap<Tensor>) -> Result<()>;

    /// Collect the step started by `step_async`
    fn step_wait(&mut self) -> Result<VecStep>;

    fn step(&mut self, actions: &AgentMap<Tensor>) -> Result<VecStep> {
        self.step_async(actions)?;
        self.step_wait()
    }

    fn close(&mut self) -> Result<()>;
}

impl<V: VecEnv + ?Sized> VecEnv for Box<V> {
    fn num_envs(&self) -> usize {
        (**self).num_envs()
    }

    fn agents(&self) -> &[AgentId] {
        (**self).agents()
    }

    fn observation_space(&self, agent: &str) -> Result<&Space> {
        (**self).observation_space(agent)
    }

    fn action_space(&self, agent: &str) -> Result<&Space> {
        (**self).action_space(agent)
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, VecInfo)> {
        (**self).reset(seed)
    }

    fn step_async(&mut self, actions: &AgentMap<Tensor>) -> Result<()> {
        (**self).step_async(actions)
    }

    fn step_wait(&mut self) -> Result<VecStep> {
        (**self).step_wait()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

pub(crate) fn env_seed(seed: Option<u64>, index: usize) -> Option<u64> {
    seed.map(|s| s.wrapping_add(index as u64))
}

pub(crate) fn lookup_space<'a>(spaces: &'a AgentMap<Space>, agent: &str) -> Result<&'a Space> {
    spaces.get(agent).ok_or_else(|| {
        PallasError::invalid_parameter("agent".to_string(), format!("unknown agent '{}'", agent))
    })
}

fn agent_entry<'a, T>(map: &'a AgentMap<T>, agent: &str, env_index: usize) -> Result<&'a T> {
    map.get(agent).ok_or_else(|| {
        PallasError::Protocol(format!("environment {} returned nothing for agent '{}'", env_index, agent))
    })
}

/// Split `[num_envs, ...]` actions into one agent map per environment
pub(crate) fn unstack_actions(actions: &AgentMap<Tensor>, agents: &[AgentId], num_envs: usize) -> Result<Vec<AgentMap<Tensor>>> {
    let mut per_env = vec![AgentMap::new(); num_envs];
    for agent in agents {
        let action = actions.get(agent).ok_or_else(|| {
            PallasError::invalid_parameter("actions".to_string(), format!("missing action for '{}'", agent))
        })?;
        if action.ndim() == 0 || action.shape()[0] != num_envs {
            return Err(PallasError::dimension_mismatch(
                format!("leading dimension {}", num_envs),
                format!("shape {:?} for agent '{}'", action.shape(), agent),
            ));
        }
        for (i, row) in action.axis_iter(Axis(0)).enumerate() {
            per_env[i].insert(agent.clone(), row.to_owned());
        }
    }
    Ok(per_env)
}

/// Stack per-environment observations along a new leading axis
pub(crate) fn stack_observations(agents: &[AgentId], per_env: &[AgentMap<Tensor>]) -> Result<AgentMap<Tensor>> {
    let mut stacked = AgentMap::new();
    for agent in agents {
        let views = per_env
            .iter()
            .enumerate()
            .map(|(i, obs)| agent_entry(obs, agent, i).map(|t| t.view()))
            .collect::<Result<Vec<ArrayViewD<f32>>>>()?;
        stacked.insert(agent.clone(), ndarray::stack(Axis(0), &views)?);
    }
    Ok(stacked)
}

/// Merge reset results of every environment, in environment order
pub(crate) fn stack_resets(agents: &[AgentId], resets: Vec<(AgentMap<Tensor>, Info)>) -> Result<(AgentMap<Tensor>, VecInfo)> {
    let (observations, infos): (Vec<_>, Vec<_>) = resets.into_iter().unzip();
    Ok((stack_observations(agents, &observations)?, VecInfo::from_infos(infos)?))
}

/// Merge step results of every environment, in environment order
pub(crate) fn stack_steps(agents: &[AgentId], results: Vec<StepResult>) -> Result<VecStep> {
    let mut rewards = AgentMap::new();
    let mut terminated = AgentMap::new();
    let mut truncated = AgentMap::new();
    for agent in agents {
        let mut r = Vec::with_capacity(results.len());
        let mut term = Vec::with_capacity(results.len());
        let mut trunc = Vec::with_capacity(results.len());
        for (i, result) in results.iter().enumerate() {
            r.push(*agent_entry(&result.rewards, agent, i)?);
            term.push(*agent_entry(&result.terminated, agent, i)?);
            trunc.push(*agent_entry(&result.truncated, agent, i)?);
        }
        rewards.insert(agent.clone(), Array1::from(r));
        terminated.insert(agent.clone(), Array1::from(term));
        truncated.insert(agent.clone(), Array1::from(trunc));
    }

    let mut per_env_obs = Vec::with_capacity(results.len());
    let mut infos = Vec::with_capacity(results.len());
    for result in results {
        per_env_obs.push(result.observations);
        infos.push(result.info);
    }
    Ok(VecStep {
        observations: stack_observations(agents, &per_env_obs)?,
        rewards,
        terminated,
        truncated,
        infos: VecInfo::from_infos(infos)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::scalar;
    use ndarray::arr1;

    fn agents() -> Vec<AgentId> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_unstack_actions() {
        let mut actions = AgentMap::new();
        actions.insert("a".to_string(), arr1(&[1.0f32, 2.0, 3.0]).into_dyn());
        actions.insert("b".to_string(), arr1(&[4.0f32, 5.0, 6.0]).into_dyn());
        let per_env = unstack_actions(&actions, &agents(), 3).unwrap();
        assert_eq!(per_env.len(), 3);
        assert_eq!(per_env[1]["b"], scalar(5.0));

        assert!(matches!(
            unstack_actions(&actions, &agents(), 2),
            Err(PallasError::DimensionMismatch { .. })
        ));
        actions.remove("b");
        assert!(unstack_actions(&actions, &agents(), 3).is_err());
    }

    #[test]
    fn test_stack_observations_is_env_major() {
        let per_env: Vec<AgentMap<Tensor>> = (0..2)
            .map(|i| {
                agents()
                    .into_iter()
                    .map(|a| (a, arr1(&[i as f32, 10.0 + i as f32]).into_dyn()))
                    .collect()
            })
            .collect();
        let stacked = stack_observations(&agents(), &per_env).unwrap();
        assert_eq!(stacked["a"].shape(), &[2, 2]);
        assert_eq!(stacked["a"][[1, 1]], 11.0);
    }

    #[test]
    fn test_env_seed() {
        assert_eq!(env_seed(Some(10), 3), Some(13));
        assert_eq!(env_seed(None, 3), None);
    }
}
