use crate::architecture::{Activation, LayerSpec, NetworkArchitecture, Shape};
use crate::error::Result;
use crate::layers::{
    Conv2dLayer, FcLayer, FlattenLayer, Layer, MaxPoolLayer, ParamMut, ReluLayer, SoftMaxLayer,
};
use log::debug;
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;

pub trait Module {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32>; // Input is (batch_size, features)
    /// Forward pass that caches nothing, so it only needs `&self`.
    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32>;
    /// Backward pass
    ///
    /// The `backward` function receives a gradient `dz` which corresponds to dLoss/dz,
    /// where z is the current layer output.
    /// The job of the backward pass is to combine its 'local gradients' - namely dz/dx, dz/dw -
    /// with this incoming gradient - dLoss/dz - using the chain rule.
    /// The backward should:
    /// - return dLoss/dx = dz/dx * dLoss/dz
    /// - fill in the gradients for the layer's own weights dLoss/dw = dz/dw * dLoss/dz
    ///
    /// Note:
    /// - the dz/dx Jacobian matrix is not materialized (too wasteful). Instead, each layer
    ///   directly computes the matrix-vector product of interest.
    /// - the shape of the function output - which corresponds to dLoss/dx - is the same shape
    ///   as the layer inputs.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32>;
    fn zero_grad(&mut self);
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Network {
    pub layers: Vec<Layer>,
}

impl Module for Network {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = input;
        for layer in &mut self.layers {
            x = layer.forward(x);
        }
        x
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.layers.iter().fold(input, |x, layer| layer.infer(x))
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = dz;
        // Iterate layers in reverse order, mutate each as we go
        for layer in self.layers.iter_mut().rev() {
            x = layer.backward(x);
        }
        x
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }
}

impl Network {
    /// Lower an architecture description into runtime layers with freshly initialized weights.
    ///
    /// Activations become their own layers (identity adds nothing) and a flatten layer is
    /// inserted where a dense layer follows spatial feature maps.
    pub fn from_architecture<R: Rng + ?Sized>(
        arch: &NetworkArchitecture,
        rng: &mut R,
    ) -> Result<Network> {
        arch.validate()?;
        let mut layers = Vec::new();
        let mut shape = arch.input_shape();

        for spec in arch.layers() {
            match *spec {
                LayerSpec::Convolution {
                    in_channels,
                    out_channels,
                    kernel,
                    ..
                } => {
                    layers.push(Layer::Conv(Conv2dLayer::new(
                        in_channels,
                        out_channels,
                        kernel,
                        rng,
                    )?));
                }
                LayerSpec::MaxPool { kernel, stride } => {
                    layers.push(Layer::Pool(MaxPoolLayer::new(kernel, stride)));
                }
                LayerSpec::Dense {
                    inputs, outputs, ..
                }
                | LayerSpec::Output {
                    inputs, outputs, ..
                } => {
                    if matches!(shape, Shape::Spatial { .. }) {
                        layers.push(Layer::Flatten(FlattenLayer::new()));
                    }
                    layers.push(Layer::FC(FcLayer::new(inputs, outputs, rng)?));
                }
            }
            match spec.activation() {
                Activation::Identity => {}
                Activation::Relu => layers.push(Layer::ReLU(ReluLayer::new())),
                Activation::Softmax => layers.push(Layer::Softmax(SoftMaxLayer::new())),
            }
            let next = spec.shape_out(shape)?;
            debug!("{shape} -> {next} ({spec:?})");
            shape = next;
        }

        Ok(Network { layers })
    }

    /// Batched class probabilities without touching any backprop cache.
    ///
    /// Input: (batch_size, 1, 28, 28). Output: (batch_size, num_classes).
    pub fn predict_proba(&self, input: Array4<f32>) -> Array2<f32> {
        self.infer(input.into_dyn())
            .into_dimensionality::<Ix2>()
            .expect("Network output should be 2D: (batch_size, num_classes)")
    }

    /// Forward pass for training. Caches activations for the following backward.
    pub fn forward_batch(&mut self, input: Array4<f32>) -> Array2<f32> {
        self.forward(input.into_dyn())
            .into_dimensionality::<Ix2>()
            .expect("Network output should be 2D: (batch_size, num_classes)")
    }

    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.params_mut())
            .collect()
    }

    pub fn signature(&self) -> Vec<(&'static str, Vec<Vec<usize>>)> {
        self.layers.iter().map(Layer::signature).collect()
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(Layer::is_finite)
    }
}
