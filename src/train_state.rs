//! Trainable sub-states and their target copies.
//!
//! A `TrainState` is an immutable value: applying gradients or smoothing the
//! target returns a new state, leaving the old one intact for the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::optimizer::{Optimizer, OptimizerState};
use crate::params::Params;

/// Polyak averaging: `tau * live + (1 - tau) * target`, leaf by leaf
pub fn incremental_update(live: &Params, target: &Params, tau: f32) -> Result<Params> {
    check_tau(tau)?;
    live.zip_with(target, |l, t| l * tau + t * (1.0 - tau))
}

pub fn check_tau(tau: f32) -> Result<()> {
    if !(tau > 0.0 && tau <= 1.0) {
        return Err(PallasError::invalid_parameter(
            "tau".to_string(),
            format!("must be in (0, 1], got {}", tau),
        ));
    }
    Ok(())
}

/// Live parameters, optional target parameters and optimizer moments
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub params: Params,
    pub target_params: Option<Params>,
    pub optimizer: Optimizer,
    pub opt_state: OptimizerState,
    /// Gradient steps applied so far
    pub step: u64,
}

impl TrainState {
    /// State without a target copy
    pub fn create(params: Params, optimizer: Optimizer) -> Self {
        let opt_state = optimizer.init(&params);
        TrainState {
            params,
            target_params: None,
            optimizer,
            opt_state,
            step: 0,
        }
    }

    /// State whose target starts equal to the live parameters
    pub fn with_target(params: Params, optimizer: Optimizer) -> Self {
        let mut state = TrainState::create(params, optimizer);
        state.target_params = Some(state.params.clone());
        state
    }

    pub fn has_target(&self) -> bool {
        self.target_params.is_some()
    }

    pub fn target(&self) -> Result<&Params> {
        self.target_params
            .as_ref()
            .ok_or_else(|| PallasError::TrainingError("sub-state has no target parameters".to_string()))
    }

    /// One optimizer step; the target is left untouched
    pub fn apply_gradients(&self, gradients: &Params) -> Result<TrainState> {
        let (params, opt_state) = self.optimizer.update(&self.opt_state, &self.params, gradients)?;
        Ok(TrainState {
            params,
            target_params: self.target_params.clone(),
            optimizer: self.optimizer.clone(),
            opt_state,
            step: self.step + 1,
        })
    }

    /// Move the target toward the live parameters
    pub fn soft_update(&self, tau: f32) -> Result<TrainState> {
        let target = incremental_update(&self.params, self.target()?, tau)?;
        let mut next = self.clone();
        next.target_params = Some(target);
        Ok(next)
    }

    fn structure_difference(&self, template: &TrainState) -> Option<String> {
        if let Some(diff) = self.params.structure_difference(&template.params) {
            return Some(format!("params: {}", diff));
        }
        match (&self.target_params, &template.target_params) {
            (Some(a), Some(b)) => {
                if let Some(diff) = a.structure_difference(b) {
                    return Some(format!("target params: {}", diff));
                }
            }
            (None, None) => {}
            _ => return Some("target parameters present in only one tree".to_string()),
        }
        self.opt_state.structure_difference(&template.opt_state)
    }
}

/// Named sub-states of one algorithm, for example `qvalue` and `policy`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    sub_states: BTreeMap<String, TrainState>,
}

impl TrainingState {
    pub fn new() -> Self {
        TrainingState::default()
    }

    pub fn with<S: Into<String>>(mut self, name: S, state: TrainState) -> Self {
        self.sub_states.insert(name.into(), state);
        self
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, state: TrainState) {
        self.sub_states.insert(name.into(), state);
    }

    pub fn get(&self, name: &str) -> Result<&TrainState> {
        self.sub_states.get(name).ok_or_else(|| {
            PallasError::TrainingError(format!("no sub-state named '{}'", name))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.sub_states.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TrainState)> {
        self.sub_states.iter()
    }

    pub fn len(&self) -> usize {
        self.sub_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_states.is_empty()
    }

    /// Fail unless `self` has exactly the structure of `template`
    pub fn check_matches(&self, template: &TrainingState) -> Result<()> {
        let names: Vec<&String> = self.sub_states.keys().collect();
        let expected: Vec<&String> = template.sub_states.keys().collect();
        if names != expected {
            return Err(PallasError::RestoreMismatch(format!(
                "sub-states {:?}, expected {:?}",
                names, expected
            )));
        }
        for (name, state) in &self.sub_states {
            if let Some(diff) = template
                .sub_states
                .get(name)
                .and_then(|t| state.structure_difference(t))
            {
                return Err(PallasError::RestoreMismatch(format!("'{}': {}", name, diff)));
            }
        }
        Ok(())
    }
}
