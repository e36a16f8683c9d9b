use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::types::{AgentMap, Info, InfoValue, Tensor};

/// Key under which a worker stashes the pre-reset observations of an ended episode
pub const FINAL_OBSERVATION: &str = "final_observation";

/// Key under which a worker stashes the pre-reset info of an ended episode
pub const FINAL_INFO: &str = "final_info";

/// One info key across every environment of a pool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskedColumn {
    pub values: Vec<InfoValue>,
    pub present: Vec<bool>,
}

/// Infos of `num_envs` environments merged key by key.
///
/// Slots of environments that did not report a key hold a default of the
/// same kind as the first reported value, with `present` set to false.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VecInfo {
    num_envs: usize,
    entries: BTreeMap<String, MaskedColumn>,
}

impl VecInfo {
    pub fn new(num_envs: usize) -> Self {
        VecInfo {
            num_envs,
            entries: BTreeMap::new(),
        }
    }

    /// Merge every info in worker order
    pub fn from_infos(infos: Vec<Info>) -> Result<Self> {
        let mut merged = VecInfo::new(infos.len());
        for (i, info) in infos.into_iter().enumerate() {
            merged.add(i, info)?;
        }
        Ok(merged)
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    /// Record the info reported by environment `env_index`
    pub fn add(&mut self, env_index: usize, info: Info) -> Result<()> {
        if env_index >= self.num_envs {
            return Err(PallasError::invalid_parameter(
                "env_index".to_string(),
                format!("{} out of range for {} environments", env_index, self.num_envs),
            ));
        }
        let num_envs = self.num_envs;
        for (key, value) in info {
            let column = self.entries.entry(key).or_insert_with(|| MaskedColumn {
                values: vec![value.default_like(); num_envs],
                present: vec![false; num_envs],
            });
            column.values[env_index] = value;
            column.present[env_index] = true;
        }
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&MaskedColumn> {
        self.entries.get(key)
    }

    pub fn is_present(&self, key: &str, env_index: usize) -> bool {
        self.entries
            .get(key)
            .and_then(|c| c.present.get(env_index).copied())
            .unwrap_or(false)
    }

    /// Value reported by one environment, if it reported the key
    pub fn value(&self, key: &str, env_index: usize) -> Option<&InfoValue> {
        let column = self.entries.get(key)?;
        if *column.present.get(env_index)? {
            column.values.get(env_index)
        } else {
            None
        }
    }

    /// Pre-reset observations of environment `env_index`, when its episode just ended
    pub fn final_observation(&self, env_index: usize) -> Option<AgentMap<Tensor>> {
        let map = self.value(FINAL_OBSERVATION, env_index)?.as_map()?;
        map.iter()
            .map(|(agent, value)| value.as_tensor().map(|t| (agent.clone(), t.clone())))
            .collect()
    }

    /// Indices of the environments whose episode just ended
    pub fn ended_envs(&self) -> Vec<usize> {
        (0..self.num_envs)
            .filter(|&i| self.is_present(FINAL_OBSERVATION, i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::scalar;

    #[test]
    fn test_missing_slots_are_masked() {
        let mut a = Info::new();
        a.insert("t".to_string(), InfoValue::Int(3));
        let mut b = Info::new();
        b.insert("flag".to_string(), InfoValue::Bool(true));
        let merged = VecInfo::from_infos(vec![a, b, Info::new()]).unwrap();

        let t = merged.get("t").unwrap();
        assert_eq!(t.values, vec![InfoValue::Int(3), InfoValue::Int(0), InfoValue::Int(0)]);
        assert_eq!(t.present, vec![true, false, false]);
        assert_eq!(merged.get("flag").unwrap().values[0], InfoValue::Bool(false));
        assert_eq!(merged.value("flag", 1), Some(&InfoValue::Bool(true)));
        assert_eq!(merged.value("flag", 0), None);
    }

    #[test]
    fn test_final_observation_lookup() {
        let mut obs = AgentMap::new();
        obs.insert("agent_0".to_string(), scalar(4.0));
        let mut info = Info::new();
        info.insert(FINAL_OBSERVATION.to_string(), InfoValue::from_observations(obs.clone()));
        let merged = VecInfo::from_infos(vec![Info::new(), info]).unwrap();

        assert_eq!(merged.ended_envs(), vec![1]);
        assert_eq!(merged.final_observation(1), Some(obs));
        assert_eq!(merged.final_observation(0), None);
    }

    #[test]
    fn test_out_of_range_env() {
        let mut merged = VecInfo::new(1);
        assert!(merged.add(1, Info::new()).is_err());
    }
}
