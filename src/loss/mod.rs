//! Regression losses and their gradients.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Batch loss with respect to a prediction matrix
pub trait Loss: Send + Sync {
    /// Mean loss over every element
    fn compute_batch(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32;

    /// dLoss/dPredictions for `compute_batch`
    fn gradient_batch(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> Array2<f32>;

    fn value_and_gradient(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> (f32, Array2<f32>) {
        (
            self.compute_batch(predictions, targets),
            self.gradient_batch(predictions, targets),
        )
    }
}

/// Mean squared error
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MSE;

impl Loss for MSE {
    fn compute_batch(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
        let diff = &predictions - &targets;
        (&diff * &diff).sum() / diff.len().max(1) as f32
    }

    fn gradient_batch(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> Array2<f32> {
        let n = predictions.len().max(1) as f32;
        (&predictions - &targets) * (2.0 / n)
    }
}

/// Huber loss (smooth L1)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HuberLoss {
    pub delta: f32,
}

impl HuberLoss {
    pub fn new(delta: f32) -> Self {
        HuberLoss { delta }
    }
}

impl Loss for HuberLoss {
    fn compute_batch(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
        let diff = &predictions - &targets;
        let n = diff.len().max(1) as f32;
        diff.mapv(|x| {
            let abs_x = x.abs();
            if abs_x <= self.delta {
                0.5 * x * x
            } else {
                self.delta * abs_x - 0.5 * self.delta * self.delta
            }
        })
        .sum()
            / n
    }

    fn gradient_batch(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> Array2<f32> {
        let n = predictions.len().max(1) as f32;
        (&predictions - &targets).mapv(|x| x.clamp(-self.delta, self.delta) / n)
    }
}

/// Loss used to regress Q-values
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RegressionLoss {
    Mse,
    Huber { delta: f32 },
}

impl Default for RegressionLoss {
    fn default() -> Self {
        RegressionLoss::Mse
    }
}

impl RegressionLoss {
    pub fn value_and_gradient(&self, predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> (f32, Array2<f32>) {
        match *self {
            RegressionLoss::Mse => MSE.value_and_gradient(predictions, targets),
            RegressionLoss::Huber { delta } => HuberLoss::new(delta).value_and_gradient(predictions, targets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mse() {
        let p = array![[1.0f32, 2.0], [3.0, 4.0]];
        let t = array![[1.0f32, 0.0], [3.0, 6.0]];
        let (loss, grad) = MSE.value_and_gradient(p.view(), t.view());
        assert!((loss - 2.0).abs() < 1e-6);
        assert_eq!(grad, array![[0.0f32, 1.0], [0.0, -1.0]]);
    }

    #[test]
    fn test_huber_is_linear_in_the_tails() {
        let huber = HuberLoss::new(1.0);
        let p = array![[0.5f32, 3.0]];
        let t = array![[0.0f32, 0.0]];
        let loss = huber.compute_batch(p.view(), t.view());
        assert!((loss - (0.125 + 2.5) / 2.0).abs() < 1e-6);
        let grad = huber.gradient_batch(p.view(), t.view());
        assert_eq!(grad, array![[0.25f32, 0.5]]);
    }
}
