use crate::env::ParallelEnvironment;
use crate::error::{PallasError, Result};
use crate::types::{AgentId, AgentMap, Space, Tensor};
use crate::vec_env::worker::step_with_autoreset;
use crate::vec_env::{env_seed, lookup_space, stack_resets, stack_steps, unstack_actions, VecEnv, VecInfo, VecStep};

/// Environments stepped one after the other in the calling thread.
///
/// Same auto-reset and pending-step rules as `VecEnvPool`; the step itself
/// runs inside `step_async`.
pub struct SyncVecEnv {
    envs: Vec<Box<dyn ParallelEnvironment>>,
    agents: Vec<AgentId>,
    observation_spaces: AgentMap<Space>,
    action_spaces: AgentMap<Space>,
    pending: Option<Result<VecStep>>,
    closed: bool,
}

impl SyncVecEnv {
    pub fn new(mut envs: Vec<Box<dyn ParallelEnvironment>>) -> Result<Self> {
        let first = envs.first_mut().ok_or_else(|| {
            PallasError::invalid_parameter("envs".to_string(), "need at least one environment".to_string())
        })?;
        let agents = first.agents();
        let mut observation_spaces = AgentMap::new();
        let mut action_spaces = AgentMap::new();
        for agent in &agents {
            observation_spaces.insert(agent.clone(), first.observation_space(agent)?);
            action_spaces.insert(agent.clone(), first.action_space(agent)?);
        }
        for env in envs.iter_mut() {
            env.reset(None)?;
        }
        Ok(SyncVecEnv {
            envs,
            agents,
            observation_spaces,
            action_spaces,
            pending: None,
            closed: false,
        })
    }

    /// Build `num_envs` environments with `make_env(i)`
    pub fn from_fn<F>(num_envs: usize, make_env: F) -> Result<Self>
    where
        F: Fn(usize) -> Result<Box<dyn ParallelEnvironment>>,
    {
        SyncVecEnv::new((0..num_envs).map(make_env).collect::<Result<Vec<_>>>()?)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PallasError::PoolClosed);
        }
        Ok(())
    }
}

impl VecEnv for SyncVecEnv {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    fn observation_space(&self, agent: &str) -> Result<&Space> {
        lookup_space(&self.observation_spaces, agent)
    }

    fn action_space(&self, agent: &str) -> Result<&Space> {
        lookup_space(&self.action_spaces, agent)
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, VecInfo)> {
        self.check_open()?;
        if self.pending.is_some() {
            return Err(PallasError::StepPending);
        }
        let resets = self
            .envs
            .iter_mut()
            .enumerate()
            .map(|(i, env)| env.reset(env_seed(seed, i)))
            .collect::<Result<Vec<_>>>()?;
        stack_resets(&self.agents, resets)
    }

    fn step_async(&mut self, actions: &AgentMap<Tensor>) -> Result<()> {
        self.check_open()?;
        if self.pending.is_some() {
            return Err(PallasError::StepPending);
        }
        let per_env = unstack_actions(actions, &self.agents, self.envs.len())?;
        let results = self
            .envs
            .iter_mut()
            .zip(per_env.iter())
            .map(|(env, actions)| step_with_autoreset(env, actions))
            .collect::<Result<Vec<_>>>();
        let agents = &self.agents;
        self.pending = Some(results.and_then(|results| stack_steps(agents, results)));
        Ok(())
    }

    fn step_wait(&mut self) -> Result<VecStep> {
        self.check_open()?;
        self.pending.take().ok_or(PallasError::NoPendingStep)?
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending = None;
        for env in self.envs.iter_mut() {
            env.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{ActionKind, EnvSpec};
    use crate::env::make_env;
    use ndarray::arr1;

    fn multi_counter(n_envs: usize) -> SyncVecEnv {
        let spec = EnvSpec::MultiCounter {
            n_agents: 2,
            episode_length: 2,
            action: ActionKind::Continuous,
        };
        SyncVecEnv::from_fn(n_envs, |_| make_env(&spec)).unwrap()
    }

    fn actions(value: f32, n_envs: usize) -> AgentMap<Tensor> {
        ["agent_0", "agent_1"]
            .iter()
            .map(|a| (a.to_string(), arr1(&vec![value; n_envs]).into_shape((n_envs, 1)).unwrap().into_dyn()))
            .collect()
    }

    #[test]
    fn test_multi_agent_vectorized_step() {
        let mut env = multi_counter(3);
        let (obs, _) = env.reset(Some(1)).unwrap();
        assert_eq!(obs["agent_1"].shape(), &[3, 1]);

        let step = env.step(&actions(0.5, 3)).unwrap();
        assert_eq!(step.rewards["agent_0"].to_vec(), vec![0.5; 3]);
        assert!(!step.dones().iter().any(|&d| d));

        let step = env.step(&actions(0.5, 3)).unwrap();
        assert!(step.dones().iter().all(|&d| d));
        assert_eq!(step.infos.ended_envs(), vec![0, 1, 2]);
        assert_eq!(step.infos.final_observation(2).unwrap()["agent_1"][[0]], 1.0);
        assert_eq!(step.observations["agent_1"][[2, 0]], 0.0);
    }

    #[test]
    fn test_pending_rules_match_pool() {
        let mut env = multi_counter(1);
        assert!(matches!(env.step_wait(), Err(PallasError::NoPendingStep)));
        env.step_async(&actions(0.1, 1)).unwrap();
        assert!(matches!(env.step_async(&actions(0.1, 1)), Err(PallasError::StepPending)));
        assert!(matches!(env.reset(None), Err(PallasError::StepPending)));
        env.step_wait().unwrap();
        env.close().unwrap();
        assert!(matches!(env.step_async(&actions(0.1, 1)), Err(PallasError::PoolClosed)));
    }
}
