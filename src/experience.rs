//! Experience records and the agent-keyed wrapper used by buffers and pipelines.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::tensor::{self, TensorTree};
use crate::types::{AgentMap, Tensor};

/// Off-policy transition.
///
/// Every field shares the same leading (batch or time) dimension once records
/// are stacked. `extras` carries tensors attached by pipeline stages, such as
/// regression targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub observation: Tensor,
    pub action: Tensor,
    pub reward: Tensor,
    pub next_observation: Tensor,
    pub done: Tensor,
    #[serde(default)]
    pub extras: BTreeMap<String, Tensor>,
}

impl Experience {
    pub fn new(
        observation: Tensor,
        action: Tensor,
        reward: Tensor,
        next_observation: Tensor,
        done: Tensor,
    ) -> Self {
        Experience {
            observation,
            action,
            reward,
            next_observation,
            done,
            extras: BTreeMap::new(),
        }
    }

    /// Attach a derived tensor
    pub fn with_extra<S: Into<String>>(mut self, key: S, value: Tensor) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    pub fn extra(&self, key: &str) -> Result<&Tensor> {
        lookup_extra(&self.extras, key)
    }
}

impl TensorTree for Experience {
    fn leaves(&self) -> Vec<&Tensor> {
        let mut leaves = vec![
            &self.observation,
            &self.action,
            &self.reward,
            &self.next_observation,
            &self.done,
        ];
        leaves.extend(self.extras.values());
        leaves
    }

    fn with_leaves(&self, leaves: Vec<Tensor>) -> Result<Self> {
        check_leaf_count(5 + self.extras.len(), leaves.len())?;
        let mut it = leaves.into_iter();
        let mut next = || it.next().ok_or_else(|| PallasError::EmptyBatch("leaf".to_string()));
        let observation = next()?;
        let action = next()?;
        let reward = next()?;
        let next_observation = next()?;
        let done = next()?;
        let mut extras = BTreeMap::new();
        for key in self.extras.keys() {
            extras.insert(key.clone(), next()?);
        }
        Ok(Experience {
            observation,
            action,
            reward,
            next_observation,
            done,
            extras,
        })
    }
}

/// On-policy transition with the behaviour policy's log-probability and value estimate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloutExperience {
    pub observation: Tensor,
    pub action: Tensor,
    pub log_prob: Tensor,
    pub value: Tensor,
    pub reward: Tensor,
    pub done: Tensor,
    #[serde(default)]
    pub extras: BTreeMap<String, Tensor>,
}

impl RolloutExperience {
    pub fn new(
        observation: Tensor,
        action: Tensor,
        log_prob: Tensor,
        value: Tensor,
        reward: Tensor,
        done: Tensor,
    ) -> Self {
        RolloutExperience {
            observation,
            action,
            log_prob,
            value,
            reward,
            done,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra<S: Into<String>>(mut self, key: S, value: Tensor) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    pub fn extra(&self, key: &str) -> Result<&Tensor> {
        lookup_extra(&self.extras, key)
    }
}

impl TensorTree for RolloutExperience {
    fn leaves(&self) -> Vec<&Tensor> {
        let mut leaves = vec![
            &self.observation,
            &self.action,
            &self.log_prob,
            &self.value,
            &self.reward,
            &self.done,
        ];
        leaves.extend(self.extras.values());
        leaves
    }

    fn with_leaves(&self, leaves: Vec<Tensor>) -> Result<Self> {
        check_leaf_count(6 + self.extras.len(), leaves.len())?;
        let mut it = leaves.into_iter();
        let mut next = || it.next().ok_or_else(|| PallasError::EmptyBatch("leaf".to_string()));
        let observation = next()?;
        let action = next()?;
        let log_prob = next()?;
        let value = next()?;
        let reward = next()?;
        let done = next()?;
        let mut extras = BTreeMap::new();
        for key in self.extras.keys() {
            extras.insert(key.clone(), next()?);
        }
        Ok(RolloutExperience {
            observation,
            action,
            log_prob,
            value,
            reward,
            done,
            extras,
        })
    }
}

fn lookup_extra<'a>(extras: &'a BTreeMap<String, Tensor>, key: &str) -> Result<&'a Tensor> {
    extras.get(key).ok_or_else(|| {
        PallasError::invalid_parameter(key.to_string(), "missing from experience extras".to_string())
    })
}

fn check_leaf_count(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(PallasError::dimension_mismatch(
            format!("{} leaves", expected),
            format!("{} leaves", actual),
        ));
    }
    Ok(())
}

/// Experience of a single agent, or one experience per agent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AgentData<E> {
    Single(E),
    Parallel(AgentMap<E>),
}

impl<E> AgentData<E> {
    pub fn is_parallel(&self) -> bool {
        matches!(self, AgentData::Parallel(_))
    }
}

impl<E: TensorTree> AgentData<E> {
    /// Stack a list of per-step records along a new leading (time) axis
    pub fn stack(records: &[AgentData<E>]) -> Result<AgentData<E>> {
        let first = records
            .first()
            .ok_or_else(|| PallasError::EmptyBatch("no records to stack".to_string()))?;
        match first {
            AgentData::Single(_) => {
                let items = records
                    .iter()
                    .map(|r| match r {
                        AgentData::Single(e) => Ok(e.clone()),
                        AgentData::Parallel(_) => Err(mixed_records()),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(AgentData::Single(tensor::stack(&items)?))
            }
            AgentData::Parallel(agents) => {
                let mut stacked = AgentMap::new();
                for agent in agents.keys() {
                    let items = records
                        .iter()
                        .map(|r| match r {
                            AgentData::Parallel(map) => map.get(agent).cloned().ok_or_else(|| {
                                PallasError::invalid_parameter(
                                    "agent".to_string(),
                                    format!("record missing agent '{}'", agent),
                                )
                            }),
                            AgentData::Single(_) => Err(mixed_records()),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    stacked.insert(agent.clone(), tensor::stack(&items)?);
                }
                Ok(AgentData::Parallel(stacked))
            }
        }
    }
}

fn mixed_records() -> PallasError {
    PallasError::dimension_mismatch(
        "records of one kind".to_string(),
        "mixed single-agent and multi-agent records".to_string(),
    )
}
