use serde::{Deserialize, Serialize};

use crate::params::Params;

/// Gradient clipping methods
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GradientClipper {
    /// Clip every gradient component into [min, max]
    ClipByValue { min: f32, max: f32 },

    /// Rescale all gradients when their global norm exceeds `max_norm`
    ClipByGlobalNorm { max_norm: f32 },

    /// No clipping
    None,
}

impl GradientClipper {
    pub fn clip(&self, gradients: &Params) -> Params {
        match self {
            GradientClipper::ClipByValue { min, max } => {
                gradients.map(|g| g.mapv(|x| x.max(*min).min(*max)))
            }

            GradientClipper::ClipByGlobalNorm { max_norm } => {
                let global_norm = gradients.global_norm();
                if global_norm > *max_norm {
                    gradients.scale(max_norm / global_norm)
                } else {
                    gradients.clone()
                }
            }

            GradientClipper::None => gradients.clone(),
        }
    }
}
