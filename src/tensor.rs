//! Leaf-wise operations over records made of tensors.
//!
//! Experiences are small trees of `ArrayD<f32>` leaves. The helpers here stack,
//! split and reshape every leaf of such a tree the same way, which is all the
//! experience pipeline needs to broadcast stage functions across environments
//! and agents.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

use crate::error::{PallasError, Result};
use crate::types::Tensor;

/// A record whose leaves are tensors, in a fixed order
pub trait TensorTree: Clone + Send + Sync + Sized {
    /// Leaves in a stable order
    fn leaves(&self) -> Vec<&Tensor>;

    /// Rebuild a record with the structure of `self` from new leaves
    fn with_leaves(&self, leaves: Vec<Tensor>) -> Result<Self>;
}

impl TensorTree for Tensor {
    fn leaves(&self) -> Vec<&Tensor> {
        vec![self]
    }

    fn with_leaves(&self, mut leaves: Vec<Tensor>) -> Result<Self> {
        if leaves.len() != 1 {
            return Err(PallasError::dimension_mismatch(
                "1 leaf".to_string(),
                format!("{} leaves", leaves.len()),
            ));
        }
        Ok(leaves.remove(0))
    }
}

/// Apply `f` to every leaf
pub fn map_leaves<T, F>(tree: &T, mut f: F) -> Result<T>
where
    T: TensorTree,
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    let leaves = tree.leaves().into_iter().map(&mut f).collect::<Result<Vec<_>>>()?;
    tree.with_leaves(leaves)
}

/// Length of the leading dimension shared by every leaf
pub fn leading_len<T: TensorTree>(tree: &T) -> Result<usize> {
    axis_len(tree, 0)
}

/// Length of `axis`, checked to be identical across leaves
pub fn axis_len<T: TensorTree>(tree: &T, axis: usize) -> Result<usize> {
    let mut len = None;
    for leaf in tree.leaves() {
        if leaf.ndim() <= axis {
            return Err(PallasError::dimension_mismatch(
                format!("at least {} dimensions", axis + 1),
                format!("shape {:?}", leaf.shape()),
            ));
        }
        let n = leaf.len_of(Axis(axis));
        match len {
            None => len = Some(n),
            Some(m) if m != n => {
                return Err(PallasError::dimension_mismatch(
                    format!("axis {} of length {}", axis, m),
                    format!("length {}", n),
                ))
            }
            _ => {}
        }
    }
    len.ok_or_else(|| PallasError::EmptyBatch("record has no leaves".to_string()))
}

/// Stack records along a new axis
pub fn stack_axis<T: TensorTree>(trees: &[T], axis: usize) -> Result<T> {
    let first = trees
        .first()
        .ok_or_else(|| PallasError::EmptyBatch("nothing to stack".to_string()))?;
    let per_tree: Vec<Vec<&Tensor>> = trees.iter().map(|t| t.leaves()).collect();
    let n_leaves = per_tree[0].len();
    if per_tree.iter().any(|l| l.len() != n_leaves) {
        return Err(PallasError::dimension_mismatch(
            format!("{} leaves per record", n_leaves),
            "records with differing structure".to_string(),
        ));
    }
    let mut stacked = Vec::with_capacity(n_leaves);
    for i in 0..n_leaves {
        let views: Vec<ArrayViewD<f32>> = per_tree.iter().map(|l| l[i].view()).collect();
        stacked.push(ndarray::stack(Axis(axis), &views)?);
    }
    first.with_leaves(stacked)
}

/// Stack records along a new leading axis
pub fn stack<T: TensorTree>(trees: &[T]) -> Result<T> {
    stack_axis(trees, 0)
}

/// Concatenate records along an existing axis
pub fn concatenate_axis<T: TensorTree>(trees: &[T], axis: usize) -> Result<T> {
    let first = trees
        .first()
        .ok_or_else(|| PallasError::EmptyBatch("nothing to concatenate".to_string()))?;
    let per_tree: Vec<Vec<&Tensor>> = trees.iter().map(|t| t.leaves()).collect();
    let n_leaves = per_tree[0].len();
    let mut joined = Vec::with_capacity(n_leaves);
    for i in 0..n_leaves {
        let views = per_tree
            .iter()
            .map(|l| {
                l.get(i).map(|t| t.view()).ok_or_else(|| {
                    PallasError::dimension_mismatch(
                        format!("{} leaves per record", n_leaves),
                        "records with differing structure".to_string(),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        joined.push(ndarray::concatenate(Axis(axis), &views)?);
    }
    first.with_leaves(joined)
}

/// Split a record into its slices along `axis`, dropping that axis
pub fn unstack_axis<T: TensorTree>(tree: &T, axis: usize) -> Result<Vec<T>> {
    let n = axis_len(tree, axis)?;
    (0..n)
        .map(|i| map_leaves(tree, |leaf| Ok(leaf.index_axis(Axis(axis), i).to_owned())))
        .collect()
}

/// Merge the two leading dimensions: `[a, b, ...]` becomes `[a*b, ...]` in row-major order
pub fn merge_leading<T: TensorTree>(tree: &T) -> Result<T> {
    map_leaves(tree, |leaf| {
        if leaf.ndim() < 2 {
            return Err(PallasError::dimension_mismatch(
                "at least 2 dimensions".to_string(),
                format!("shape {:?}", leaf.shape()),
            ));
        }
        let shape = leaf.shape();
        let mut merged = vec![shape[0] * shape[1]];
        merged.extend_from_slice(&shape[2..]);
        Ok(ArrayD::from_shape_vec(IxDyn(&merged), leaf.iter().cloned().collect())?)
    })
}

/// Gather rows of every leaf
pub fn select_rows<T: TensorTree>(tree: &T, indices: &[usize]) -> Result<T> {
    let len = leading_len(tree)?;
    if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
        return Err(PallasError::dimension_mismatch(
            format!("row index below {}", len),
            format!("{}", bad),
        ));
    }
    map_leaves(tree, |leaf| Ok(leaf.select(Axis(0), indices)))
}
