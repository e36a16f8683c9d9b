//! Twin Q-networks over concatenated observations and actions.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis, Zip};
use rand::rngs::StdRng;

use crate::error::{PallasError, Result};
use crate::loss::RegressionLoss;
use crate::network::{Activation, Differentiable, Mlp, Model};
use crate::params::Params;

/// Two independent Q heads, `q1.*` and `q2.*`, stored in one parameter tree
#[derive(Clone, Debug)]
pub struct TwinCritic {
    pub q1: Mlp,
    pub q2: Mlp,
    obs_dim: usize,
}

impl TwinCritic {
    pub fn new(obs_dim: usize, act_dim: usize, hidden: &[usize]) -> Result<Self> {
        Ok(TwinCritic {
            q1: Mlp::with_hidden(obs_dim + act_dim, hidden, 1, Activation::Linear, "q1.")?,
            q2: Mlp::with_hidden(obs_dim + act_dim, hidden, 1, Activation::Linear, "q2.")?,
            obs_dim,
        })
    }

    pub fn init(&self, rng: &mut StdRng) -> Params {
        let q1 = self.q1.init(rng);
        q1.merge(&self.q2.init(rng))
    }

    fn inputs(&self, observations: ArrayView2<f32>, actions: ArrayView2<f32>) -> Result<Array2<f32>> {
        if observations.nrows() != actions.nrows() {
            return Err(PallasError::dimension_mismatch(
                format!("{} action rows", observations.nrows()),
                format!("{}", actions.nrows()),
            ));
        }
        Ok(concatenate(Axis(1), &[observations.view(), actions.view()])?)
    }

    /// `(Q1, Q2)`, each `[B, 1]`
    pub fn q_values(
        &self,
        params: &Params,
        observations: ArrayView2<f32>,
        actions: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let x = self.inputs(observations, actions)?;
        Ok((self.q1.apply(params, x.view())?, self.q2.apply(params, x.view())?))
    }

    pub fn min_q(&self, params: &Params, observations: ArrayView2<f32>, actions: ArrayView2<f32>) -> Result<Array2<f32>> {
        let (q1, q2) = self.q_values(params, observations, actions)?;
        Ok(Zip::from(&q1).and(&q2).map_collect(|a, b| a.min(*b)))
    }

    /// Regress both heads on `targets`; returns the summed loss and gradients for every critic leaf
    pub fn regression(
        &self,
        params: &Params,
        observations: ArrayView2<f32>,
        actions: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        loss: RegressionLoss,
    ) -> Result<(f32, Params)> {
        let x = self.inputs(observations, actions)?;
        let mut total = 0.0;
        let mut gradients = Params::new();
        for head in [&self.q1, &self.q2] {
            let q = head.apply(params, x.view())?;
            let (value, grad) = loss.value_and_gradient(q.view(), targets);
            let (head_grads, _) = head.backward(params, x.view(), grad.view())?;
            total += value;
            gradients = gradients.merge(&head_grads);
        }
        Ok((total, gradients))
    }

    /// Action columns of dLoss/dInputs of the first head, given dLoss/dQ1
    pub fn q1_action_gradient(
        &self,
        params: &Params,
        observations: ArrayView2<f32>,
        actions: ArrayView2<f32>,
        q_grad: ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        let x = self.inputs(observations, actions)?;
        let (_, input_grad) = self.q1.backward(params, x.view(), q_grad)?;
        Ok(input_grad.slice(s![.., self.obs_dim..]).to_owned())
    }
}
