//! Environment contracts.
//!
//! Observations and actions are opaque tensors. Single-agent environments
//! implement [`Environment`]; multi-agent ones implement
//! [`ParallelEnvironment`], where every agent acts at every step. The pool and
//! the training loop only speak `ParallelEnvironment`, so single-agent
//! environments are wrapped in [`SingleAgent`].

pub mod counter;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::types::{AgentId, AgentMap, Info, Space, Tensor, DEFAULT_AGENT};

pub use counter::{CounterEnv, MultiCounterEnv};
pub use registry::{make_env, ActionKind, EnvSpec};

/// Outcome of one single-agent step
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub observation: Tensor,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
    pub info: Info,
}

/// Single-agent environment
pub trait Environment: Send {
    fn observation_space(&self) -> Space;

    fn action_space(&self) -> Space;

    fn reset(&mut self, seed: Option<u64>) -> Result<(Tensor, Info)>;

    fn step(&mut self, action: &Tensor) -> Result<Step>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one step of every agent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub observations: AgentMap<Tensor>,
    pub rewards: AgentMap<f32>,
    pub terminated: AgentMap<bool>,
    pub truncated: AgentMap<bool>,
    pub info: Info,
}

impl StepResult {
    /// True when any agent's episode ended
    pub fn episode_ended(&self) -> bool {
        self.terminated.values().any(|&t| t) || self.truncated.values().any(|&t| t)
    }
}

/// Environment in which every agent acts simultaneously
pub trait ParallelEnvironment: Send {
    /// Agents in a stable order
    fn agents(&self) -> Vec<AgentId>;

    fn num_agents(&self) -> usize {
        self.agents().len()
    }

    fn observation_space(&self, agent: &str) -> Result<Space>;

    fn action_space(&self, agent: &str) -> Result<Space>;

    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, Info)>;

    fn step(&mut self, actions: &AgentMap<Tensor>) -> Result<StepResult>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: ParallelEnvironment + ?Sized> ParallelEnvironment for Box<P> {
    fn agents(&self) -> Vec<AgentId> {
        (**self).agents()
    }

    fn num_agents(&self) -> usize {
        (**self).num_agents()
    }

    fn observation_space(&self, agent: &str) -> Result<Space> {
        (**self).observation_space(agent)
    }

    fn action_space(&self, agent: &str) -> Result<Space> {
        (**self).action_space(agent)
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, Info)> {
        (**self).reset(seed)
    }

    fn step(&mut self, actions: &AgentMap<Tensor>) -> Result<StepResult> {
        (**self).step(actions)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Exposes a single-agent environment as a one-agent parallel environment
pub struct SingleAgent<E> {
    env: E,
}

impl<E: Environment> SingleAgent<E> {
    pub fn new(env: E) -> Self {
        SingleAgent { env }
    }

    pub fn into_inner(self) -> E {
        self.env
    }

    fn check_agent(&self, agent: &str) -> Result<()> {
        if agent != DEFAULT_AGENT {
            return Err(PallasError::invalid_parameter(
                "agent".to_string(),
                format!("unknown agent '{}'", agent),
            ));
        }
        Ok(())
    }
}

fn single<T>(value: T) -> AgentMap<T> {
    let mut map = AgentMap::new();
    map.insert(DEFAULT_AGENT.to_string(), value);
    map
}

impl<E: Environment> ParallelEnvironment for SingleAgent<E> {
    fn agents(&self) -> Vec<AgentId> {
        vec![DEFAULT_AGENT.to_string()]
    }

    fn observation_space(&self, agent: &str) -> Result<Space> {
        self.check_agent(agent)?;
        Ok(self.env.observation_space())
    }

    fn action_space(&self, agent: &str) -> Result<Space> {
        self.check_agent(agent)?;
        Ok(self.env.action_space())
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<(AgentMap<Tensor>, Info)> {
        let (observation, info) = self.env.reset(seed)?;
        Ok((single(observation), info))
    }

    fn step(&mut self, actions: &AgentMap<Tensor>) -> Result<StepResult> {
        let action = actions.get(DEFAULT_AGENT).ok_or_else(|| {
            PallasError::invalid_parameter("actions".to_string(), format!("missing action for '{}'", DEFAULT_AGENT))
        })?;
        let step = self.env.step(action)?;
        Ok(StepResult {
            observations: single(step.observation),
            rewards: single(step.reward),
            terminated: single(step.terminated),
            truncated: single(step.truncated),
            info: step.info,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.env.close()
    }
}
