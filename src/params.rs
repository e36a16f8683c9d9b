//! Flat parameter trees.
//!
//! Model parameters are an ordered map from a dotted path (`q1.layer0.weight`)
//! to an array. Polyak smoothing, optimizer updates and checkpointing only ever
//! operate leaf-wise over this map, so the contents stay opaque to them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::types::Tensor;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    leaves: BTreeMap<String, Tensor>,
}

impl Params {
    pub fn new() -> Self {
        Params::default()
    }

    pub fn insert<S: Into<String>>(&mut self, key: S, value: Tensor) {
        self.leaves.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.leaves.get(key).ok_or_else(|| {
            PallasError::invalid_parameter(key.to_string(), "no such parameter".to_string())
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.leaves.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.leaves.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.leaves.keys()
    }

    /// Same keys, every leaf zero
    pub fn zeros_like(&self) -> Params {
        self.map(|t| Tensor::zeros(t.raw_dim()))
    }

    pub fn map<F: Fn(&Tensor) -> Tensor>(&self, f: F) -> Params {
        Params {
            leaves: self.leaves.iter().map(|(k, v)| (k.clone(), f(v))).collect(),
        }
    }

    /// Combine two trees with identical keys and shapes leaf by leaf
    pub fn zip_with<F: Fn(&Tensor, &Tensor) -> Tensor>(&self, other: &Params, f: F) -> Result<Params> {
        self.check_same_structure(other)?;
        let leaves = self
            .leaves
            .iter()
            .zip(other.leaves.values())
            .map(|((k, a), b)| (k.clone(), f(a, b)))
            .collect();
        Ok(Params { leaves })
    }

    pub fn scale(&self, factor: f32) -> Params {
        self.map(|t| t * factor)
    }

    /// L2 norm over every leaf
    pub fn global_norm(&self) -> f32 {
        self.leaves
            .values()
            .map(|t| t.iter().map(|&x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Union of two trees; keys of `other` win
    pub fn merge(&self, other: &Params) -> Params {
        let mut leaves = self.leaves.clone();
        leaves.extend(other.leaves.iter().map(|(k, v)| (k.clone(), v.clone())));
        Params { leaves }
    }

    /// Leaves whose key starts with `prefix`
    pub fn subtree(&self, prefix: &str) -> Params {
        Params {
            leaves: self
                .leaves
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Describe the first structural difference with `other`, if any
    pub fn structure_difference(&self, other: &Params) -> Option<String> {
        if self.leaves.len() != other.leaves.len() {
            return Some(format!(
                "{} parameter leaves vs {}",
                self.leaves.len(),
                other.leaves.len()
            ));
        }
        for ((ka, a), (kb, b)) in self.leaves.iter().zip(other.leaves.iter()) {
            if ka != kb {
                return Some(format!("parameter '{}' vs '{}'", ka, kb));
            }
            if a.shape() != b.shape() {
                return Some(format!("parameter '{}' has shape {:?} vs {:?}", ka, a.shape(), b.shape()));
            }
        }
        None
    }

    pub fn check_same_structure(&self, other: &Params) -> Result<()> {
        match self.structure_difference(other) {
            Some(diff) => Err(PallasError::dimension_mismatch("identical parameter trees".to_string(), diff)),
            None => Ok(()),
        }
    }
}

impl FromIterator<(String, Tensor)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Params {
            leaves: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn tree(values: &[f32]) -> Params {
        let mut p = Params::new();
        p.insert("a.weight", arr1(values).into_dyn());
        p.insert("b.bias", arr1(&[1.0]).into_dyn());
        p
    }

    #[test]
    fn test_zip_with_requires_same_structure() {
        let a = tree(&[1.0, 2.0]);
        let b = tree(&[3.0, 4.0]);
        let sum = a.zip_with(&b, |x, y| x + y).unwrap();
        assert_eq!(sum.get("a.weight").unwrap(), &arr1(&[4.0, 6.0]).into_dyn());

        let c = tree(&[1.0]);
        assert!(a.zip_with(&c, |x, y| x + y).is_err());
    }

    #[test]
    fn test_global_norm() {
        let mut p = Params::new();
        p.insert("w", arr1(&[3.0, 4.0]).into_dyn());
        assert!((p.global_norm() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_subtree_and_merge() {
        let mut p = tree(&[1.0]);
        p.insert("a.bias", arr1(&[0.0]).into_dyn());
        let a = p.subtree("a.");
        assert_eq!(a.len(), 2);
        let merged = a.merge(&p.subtree("b."));
        assert_eq!(merged, p);
    }
}
