//! Affine maps between the unit interval and bounded action boxes.

use ndarray::Axis;

use crate::error::{PallasError, Result};
use crate::types::{Space, Tensor};

/// `low + clip(x, 0, 1) * (high - low)`
pub fn linear_interpolation(x: f32, low: f32, high: f32) -> f32 {
    low + x.clamp(0.0, 1.0) * (high - low)
}

fn box_bounds<'a>(space: &'a Space) -> Result<(&'a [f32], &'a [f32])> {
    match space {
        Space::Box { low, high, shape } if shape.len() == 1 => Ok((low, high)),
        other => Err(PallasError::unsupported_space("action".to_string(), format!("{:?}", other))),
    }
}

fn map_rows<F>(actions: &Tensor, space: &Space, f: F) -> Result<Tensor>
where
    F: Fn(f32, f32, f32) -> f32,
{
    let (low, high) = box_bounds(space)?;
    let width = low.len();
    if actions.ndim() == 0 || actions.shape()[actions.ndim() - 1] != width {
        return Err(PallasError::dimension_mismatch(
            format!("trailing dimension {}", width),
            format!("shape {:?}", actions.shape()),
        ));
    }
    let mut out = actions.clone();
    let last = Axis(out.ndim() - 1);
    for mut lane in out.lanes_mut(last) {
        for (j, v) in lane.iter_mut().enumerate() {
            *v = f(*v, low[j], high[j]);
        }
    }
    Ok(out)
}

/// Map actions in `[-1, 1]` onto the bounds of a box space, per coordinate
pub fn scale_to_box(actions: &Tensor, space: &Space) -> Result<Tensor> {
    map_rows(actions, space, |a, lo, hi| linear_interpolation((a + 1.0) / 2.0, lo, hi))
}
