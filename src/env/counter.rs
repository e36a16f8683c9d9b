//! Deterministic counter environments used by tests, benchmarks and the worker binary.

use crate::env::{Environment, ParallelEnvironment, Step, StepResult};
use crate::error::{PallasError, Result};
use crate::types::{AgentId, AgentMap, Info, InfoValue, Space, Tensor};

use ndarray::arr1;

/// Adds the action to a running count.
///
/// The observation is `[count]`, the reward is the applied increment and the
/// episode terminates after `episode_length` steps. With a discrete action
/// space the increment is the action index; with a box it is `action[0]`.
#[derive(Clone, Debug)]
pub struct CounterEnv {
    episode_length: usize,
    action_space: Space,
    count: f32,
    t: usize,
}

impl CounterEnv {
    pub fn discrete(episode_length: usize, n_actions: usize) -> Self {
        CounterEnv::new(episode_length, Space::Discrete { n: n_actions })
    }

    pub fn continuous(episode_length: usize) -> Self {
        CounterEnv::new(episode_length, Space::uniform_box(-1.0, 1.0, &[1]))
    }

    fn new(episode_length: usize, action_space: Space) -> Self {
        CounterEnv {
            episode_length: episode_length.max(1),
            action_space,
            count: 0.0,
            t: 0,
        }
    }

    pub fn count(&self) -> f32 {
        self.count
    }

    fn observation(&self) -> Tensor {
        arr1(&[self.count]).into_dyn()
    }

    fn increment(&self, action: &Tensor) -> Result<f32> {
        if !self.action_space.contains(action) {
            return Err(PallasError::Environment(format!(
                "action {:?} outside of {:?}",
                action.iter().collect::<Vec<_>>(),
                self.action_space
            )));
        }
        action
            .iter()
            .next()
            .copied()
            .ok_or_else(|| PallasError::Environment("empty action".to_string()))
    }
}

impl Environment for CounterEnv {
    fn observation_space(&self) -> Space {
        Space::uniform_box(-1.0e6, 1.0e6, &[1])
    }

    fn action_space(&self) -> Space {
        self.action_space.clone()
    }

    fn reset(&mut self, _seed: Option<u64>) -> Result<(Tensor, Info)> {
        self.count = 0.0;
        self.t = 0;
        let mut info = Info::new();
        info.insert("episode_length".to_string(), InfoValue::Int(self.episode_length as i64));
        Ok((self.observation(), info))
    }

    fn step(&mut self, action: &Tensor) -> Result<Step> {
        let increment = self.increment(action)?;
        self.count += increment;
        self.t += 1;
        let mut info = Info::new();
        info.insert("t".to_string(), InfoValue::Int(self.t as i64));
        Ok(Step {
            observation: self.observation(),
            reward: increment,
            terminated: self.t >= self.episode_length,
            truncated: false,
            info,
        })
    }
}

/// Several independent counters, one per agent, ending together
#[derive(Clone, Debug)]
pub struct MultiCounterEnv {
    agents: AgentMap<CounterEnv>,
}

impl MultiCounterEnv {
    pub fn new(n_agents: usize, template: CounterEnv) -> Self {
        let agents = (0..n_agents)
            .map(|i| (format!("agent_{}", i), template.clone()))
            .collect();
        MultiCounterEnv { agents }
    }

    fn agent(&self, agent: &str) -> Result<&CounterEnv> {
        self.agents.get(agent).ok_or_else(|| {
            PallasError::invalid_parameter("agent".to_string(), format!("unknown agent '{}'", agent))
        })
    }
}

impl ParallelEnvironment for MultiCounterEnv {
    fn agents(&self) -> Vec<AgentId> {
        self.agents.keys().cloned().collect()
    }

    fn observation_space(&self, agent: &str) -> Result<Space> {
        Ok(self.agent(agent)?.observation_space())
    }

    fn action_space(&self, agent: &str) -> Result<Space> {
        Ok(self.agent(agent)?.action_space())
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, Info)> {
        let mut observations = AgentMap::new();
        for (agent, env) in self.agents.iter_mut() {
            let (obs, _) = env.reset(seed)?;
            observations.insert(agent.clone(), obs);
        }
        Ok((observations, Info::new()))
    }

    fn step(&mut self, actions: &AgentMap<Tensor>) -> Result<StepResult> {
        let mut result = StepResult {
            observations: AgentMap::new(),
            rewards: AgentMap::new(),
            terminated: AgentMap::new(),
            truncated: AgentMap::new(),
            info: Info::new(),
        };
        for (agent, env) in self.agents.iter_mut() {
            let action = actions.get(agent).ok_or_else(|| {
                PallasError::Environment(format!("missing action for '{}'", agent))
            })?;
            let step = env.step(action)?;
            result.observations.insert(agent.clone(), step.observation);
            result.rewards.insert(agent.clone(), step.reward);
            result.terminated.insert(agent.clone(), step.terminated);
            result.truncated.insert(agent.clone(), step.truncated);
        }
        Ok(result)
    }
}
