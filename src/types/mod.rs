//! Core value types shared by environments, buffers and algorithms.

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};

/// Opaque tensor passed between environments, buffers and models
pub type Tensor = ArrayD<f32>;

/// Identifier of an agent in a parallel environment
pub type AgentId = String;

/// Agent-keyed mapping; iteration order is the sorted agent order
pub type AgentMap<T> = BTreeMap<AgentId, T>;

/// Agent id used by single-agent environments
pub const DEFAULT_AGENT: &str = "agent_0";

/// Build a 0-d tensor
pub fn scalar(value: f32) -> Tensor {
    ArrayD::from_elem(IxDyn(&[]), value)
}

/// Description of an observation or action space
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Space {
    /// `n` discrete choices, encoded as a 0-d tensor holding the index
    Discrete { n: usize },
    /// Bounded box of floats
    Box {
        low: Vec<f32>,
        high: Vec<f32>,
        shape: Vec<usize>,
    },
}

impl Space {
    /// Box with the same bounds on every coordinate
    pub fn uniform_box(low: f32, high: f32, shape: &[usize]) -> Self {
        let size = shape.iter().product();
        Space::Box {
            low: vec![low; size],
            high: vec![high; size],
            shape: shape.to_vec(),
        }
    }

    /// Shape of a single element of the space
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Space::Discrete { .. } => Vec::new(),
            Space::Box { shape, .. } => shape.clone(),
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, Space::Discrete { .. })
    }

    /// Width of the flat vector the models consume for this space.
    ///
    /// Only one-dimensional boxes (and discrete spaces used as actions) are supported.
    pub fn flat_dim(&self, role: &str) -> Result<usize> {
        match self {
            Space::Discrete { n } if role == "action" => Ok(*n),
            Space::Box { shape, .. } if shape.len() == 1 => Ok(shape[0]),
            other => Err(PallasError::unsupported_space(role.to_string(), format!("{:?}", other))),
        }
    }

    /// Check that `value` is a member of the space
    pub fn contains(&self, value: &Tensor) -> bool {
        match self {
            Space::Discrete { n } => {
                value.ndim() == 0 && value.iter().all(|&v| v >= 0.0 && (v as usize) < *n && v.fract() == 0.0)
            }
            Space::Box { low, high, shape } => {
                value.shape() == shape.as_slice()
                    && value
                        .iter()
                        .zip(low.iter().zip(high.iter()))
                        .all(|(&v, (&lo, &hi))| v >= lo && v <= hi)
            }
        }
    }
}

/// A value stored in an environment info map
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Tensor(Tensor),
    Map(BTreeMap<String, InfoValue>),
}

impl InfoValue {
    /// Filler used for environments that did not report a key.
    ///
    /// Numeric kinds default to zero of the same kind, everything else to `Null`.
    pub fn default_like(&self) -> InfoValue {
        match self {
            InfoValue::Bool(_) => InfoValue::Bool(false),
            InfoValue::Int(_) => InfoValue::Int(0),
            InfoValue::Float(_) => InfoValue::Float(0.0),
            _ => InfoValue::Null,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            InfoValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, InfoValue>> {
        match self {
            InfoValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn from_observations(observations: AgentMap<Tensor>) -> InfoValue {
        InfoValue::Map(
            observations
                .into_iter()
                .map(|(agent, obs)| (agent, InfoValue::Tensor(obs)))
                .collect(),
        )
    }
}

/// Info dictionary returned by `reset` and `step`
pub type Info = BTreeMap<String, InfoValue>;
