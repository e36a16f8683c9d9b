use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{PallasError, Result};
use crate::params::Params;

/// A function approximator whose parameters live outside of it.
///
/// Models are stateless descriptions: `apply` reads weights from a `Params`
/// tree, so the same model value serves live and target parameters alike.
pub trait Model: Send + Sync {
    /// Fresh parameters
    fn init(&self, rng: &mut StdRng) -> Params;

    /// Batched forward pass, one row per sample
    fn apply(&self, params: &Params, inputs: ArrayView2<f32>) -> Result<Array2<f32>>;
}

/// A model that can propagate gradients back to its parameters and inputs
pub trait Differentiable: Model {
    /// Given dLoss/dOutput, return (dLoss/dParams, dLoss/dInputs)
    fn backward(
        &self,
        params: &Params,
        inputs: ArrayView2<f32>,
        output_grad: ArrayView2<f32>,
    ) -> Result<(Params, Array2<f32>)>;
}

/// Element-wise activation of a dense layer
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Tanh,
    Linear,
}

impl Activation {
    /// Apply the activation function to a batch in place
    fn apply_minibatch(&self, inputs: &mut Array2<f32>) {
        match self {
            Activation::Relu => inputs.mapv_inplace(|v| v.max(0.0)),
            Activation::Tanh => inputs.mapv_inplace(|v| v.tanh()),
            Activation::Linear => {}
        }
    }

    /// Derivative with respect to the pre-activation values
    fn derivative_minibatch(&self, pre_activation: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => pre_activation.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::Tanh => pre_activation.mapv(|v| 1.0 - v.tanh().powi(2)),
            Activation::Linear => Array2::ones(pre_activation.raw_dim()),
        }
    }
}

/// Fully connected network.
///
/// Parameters are stored as `{prefix}layer{i}.weight` with shape `[in, out]`
/// and `{prefix}layer{i}.bias` with shape `[out]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    pub layer_sizes: Vec<usize>,
    pub activations: Vec<Activation>,
    pub prefix: String,
}

impl Mlp {
    pub fn new(layer_sizes: &[usize], activations: &[Activation], prefix: &str) -> Result<Self> {
        if layer_sizes.len() < 2 {
            return Err(PallasError::invalid_parameter(
                "layer_sizes".to_string(),
                "need at least an input and an output size".to_string(),
            ));
        }
        if activations.len() != layer_sizes.len() - 1 {
            return Err(PallasError::dimension_mismatch(
                format!("{} activations", layer_sizes.len() - 1),
                format!("{}", activations.len()),
            ));
        }
        if layer_sizes.iter().any(|&s| s == 0) {
            return Err(PallasError::invalid_parameter(
                "layer_sizes".to_string(),
                "sizes must be positive".to_string(),
            ));
        }
        Ok(Mlp {
            layer_sizes: layer_sizes.to_vec(),
            activations: activations.to_vec(),
            prefix: prefix.to_string(),
        })
    }

    /// Relu hidden layers followed by `output` on the last layer
    pub fn with_hidden(
        input: usize,
        hidden: &[usize],
        output: usize,
        output_activation: Activation,
        prefix: &str,
    ) -> Result<Self> {
        let mut sizes = vec![input];
        sizes.extend_from_slice(hidden);
        sizes.push(output);
        let activations = vec![Activation::Relu; hidden.len()]
            .into_iter()
            .chain(std::iter::once(output_activation))
            .collect::<Vec<_>>();
        Mlp::new(&sizes, &activations, prefix)
    }

    pub fn input_size(&self) -> usize {
        self.layer_sizes[0]
    }

    pub fn output_size(&self) -> usize {
        self.layer_sizes[self.layer_sizes.len() - 1]
    }

    fn weight_key(&self, layer: usize) -> String {
        format!("{}layer{}.weight", self.prefix, layer)
    }

    fn bias_key(&self, layer: usize) -> String {
        format!("{}layer{}.bias", self.prefix, layer)
    }

    fn weights<'a>(&self, params: &'a Params, layer: usize) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let weights = params.get(&self.weight_key(layer))?.view().into_dimensionality::<Ix2>()?;
        let biases = params.get(&self.bias_key(layer))?.view().into_dimensionality::<Ix1>()?;
        Ok((weights, biases))
    }

    fn check_inputs(&self, inputs: &ArrayView2<f32>) -> Result<()> {
        if inputs.ncols() != self.input_size() {
            return Err(PallasError::dimension_mismatch(
                format!("{} input features", self.input_size()),
                format!("{}", inputs.ncols()),
            ));
        }
        Ok(())
    }

    /// Forward pass keeping every layer input and pre-activation
    fn forward_trace(&self, params: &Params, inputs: ArrayView2<f32>) -> Result<(Vec<Array2<f32>>, Vec<Array2<f32>>)> {
        self.check_inputs(&inputs)?;
        let mut layer_inputs = Vec::with_capacity(self.activations.len());
        let mut pre_activations = Vec::with_capacity(self.activations.len());
        let mut current = inputs.to_owned();
        for (i, activation) in self.activations.iter().enumerate() {
            let (weights, biases) = self.weights(params, i)?;
            let pre = current.dot(&weights) + &biases.insert_axis(Axis(0));
            let mut out = pre.clone();
            activation.apply_minibatch(&mut out);
            layer_inputs.push(current);
            pre_activations.push(pre);
            current = out;
        }
        layer_inputs.push(current);
        Ok((layer_inputs, pre_activations))
    }
}

impl Model for Mlp {
    fn init(&self, rng: &mut StdRng) -> Params {
        let mut params = Params::new();
        for i in 0..self.activations.len() {
            let (fan_in, fan_out) = (self.layer_sizes[i], self.layer_sizes[i + 1]);
            let bound = 1.0 / (fan_in as f32).sqrt();
            let weights = Array2::random_using((fan_in, fan_out), Uniform::new(-bound, bound), rng);
            params.insert(self.weight_key(i), weights.into_dyn());
            params.insert(self.bias_key(i), Array1::<f32>::zeros(fan_out).into_dyn());
        }
        params
    }

    fn apply(&self, params: &Params, inputs: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_inputs(&inputs)?;
        let mut current = inputs.to_owned();
        for (i, activation) in self.activations.iter().enumerate() {
            let (weights, biases) = self.weights(params, i)?;
            let mut out = current.dot(&weights) + &biases.insert_axis(Axis(0));
            activation.apply_minibatch(&mut out);
            current = out;
        }
        Ok(current)
    }
}

impl Differentiable for Mlp {
    fn backward(
        &self,
        params: &Params,
        inputs: ArrayView2<f32>,
        output_grad: ArrayView2<f32>,
    ) -> Result<(Params, Array2<f32>)> {
        let (layer_inputs, pre_activations) = self.forward_trace(params, inputs)?;
        if output_grad.dim() != (inputs.nrows(), self.output_size()) {
            return Err(PallasError::dimension_mismatch(
                format!("output gradient of shape {:?}", (inputs.nrows(), self.output_size())),
                format!("{:?}", output_grad.dim()),
            ));
        }
        let mut grads = Params::new();
        let mut error = output_grad.to_owned();
        for i in (0..self.activations.len()).rev() {
            let adjusted = error * &self.activations[i].derivative_minibatch(pre_activations[i].view());
            let weight_gradients = layer_inputs[i].t().dot(&adjusted);
            let bias_gradients = adjusted.sum_axis(Axis(0));
            let (weights, _) = self.weights(params, i)?;
            error = adjusted.dot(&weights.t());
            grads.insert(self.weight_key(i), weight_gradients.into_dyn());
            grads.insert(self.bias_key(i), bias_gradients.into_dyn());
        }
        Ok((grads, error))
    }
}
