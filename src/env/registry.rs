use serde::{Deserialize, Serialize};

use crate::env::{CounterEnv, MultiCounterEnv, ParallelEnvironment, SingleAgent};
use crate::error::Result;

/// Action space flavour of the built-in environments
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Discrete { n: usize },
    Continuous,
}

/// Serializable description of a built-in environment.
///
/// Worker processes and threads receive a spec and build their own instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnvSpec {
    Counter {
        episode_length: usize,
        action: ActionKind,
    },
    MultiCounter {
        n_agents: usize,
        episode_length: usize,
        action: ActionKind,
    },
}

fn counter(episode_length: usize, action: ActionKind) -> CounterEnv {
    match action {
        ActionKind::Discrete { n } => CounterEnv::discrete(episode_length, n),
        ActionKind::Continuous => CounterEnv::continuous(episode_length),
    }
}

/// Build the environment a spec describes
pub fn make_env(spec: &EnvSpec) -> Result<Box<dyn ParallelEnvironment>> {
    let env: Box<dyn ParallelEnvironment> = match spec {
        EnvSpec::Counter { episode_length, action } => {
            Box::new(SingleAgent::new(counter(*episode_length, *action)))
        }
        EnvSpec::MultiCounter {
            n_agents,
            episode_length,
            action,
        } => Box::new(MultiCounterEnv::new(*n_agents, counter(*episode_length, *action))),
    };
    Ok(env)
}
