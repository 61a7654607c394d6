pub use crate::layers::activations::{ReluLayer, SoftMaxLayer};
pub use crate::layers::conv::{Conv2dLayer, FlattenLayer, MaxPoolLayer};
pub use crate::layers::fc::FcLayer;
pub use crate::model::Module;

use crate::error::{Error, Result};
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;

pub mod activations;
pub mod conv;
pub mod fc;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Layer {
    FC(FcLayer),
    Conv(Conv2dLayer),
    Pool(MaxPoolLayer),
    ReLU(ReluLayer),
    Softmax(SoftMaxLayer),
    Flatten(FlattenLayer),
}

/// Trainable tensor paired with its gradient (absent before the first backward).
pub type ParamMut<'a> = (ArrayViewMutD<'a, f32>, Option<ArrayViewD<'a, f32>>);

impl Layer {
    /// Kind name, the shape of every trainable tensor, then the layer's own geometry.
    /// Two networks with equal signatures can hold each other's weights.
    pub fn signature(&self) -> (&'static str, Vec<Vec<usize>>) {
        match self {
            Layer::FC(l) => (
                "fc",
                vec![
                    l.weights.shape().to_vec(),
                    l.bias.shape().to_vec(),
                    vec![l.input_size(), l.output_size()],
                ],
            ),
            Layer::Conv(l) => {
                let (kh, kw) = l.kernel_size();
                (
                    "conv",
                    vec![
                        l.kernels_mat.shape().to_vec(),
                        l.b.shape().to_vec(),
                        vec![l.in_channels(), l.out_channels(), kh, kw],
                    ],
                )
            }
            Layer::Pool(l) => {
                let ((kh, kw), (sh, sw)) = (l.pool_size(), l.stride());
                ("pool", vec![vec![kh, kw, sh, sw]])
            }
            Layer::ReLU(_) => ("relu", vec![]),
            Layer::Softmax(_) => ("softmax", vec![]),
            Layer::Flatten(_) => ("flatten", vec![]),
        }
    }

    /// Weights then bias, each with its current gradient.
    pub fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        match self {
            Layer::FC(l) => vec![
                (
                    l.weights.view_mut().into_dyn(),
                    l.w_grad.as_ref().map(|g| g.view().into_dyn()),
                ),
                (
                    l.bias.view_mut().into_dyn(),
                    l.b_grad.as_ref().map(|g| g.view().into_dyn()),
                ),
            ],
            Layer::Conv(l) => vec![
                (
                    l.kernels_mat.view_mut().into_dyn(),
                    l.k_grad.as_ref().map(|g| g.view().into_dyn()),
                ),
                (
                    l.b.view_mut().into_dyn(),
                    l.b_grad.as_ref().map(|g| g.view().into_dyn()),
                ),
            ],
            _ => vec![], // no weights in other layers
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Layer::FC(l) => l.weights.iter().chain(l.bias.iter()).all(|x| x.is_finite()),
            Layer::Conv(l) => l.kernels_mat.iter().chain(l.b.iter()).all(|x| x.is_finite()),
            _ => true,
        }
    }
}

impl Module for Layer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.forward(input),
            Layer::Conv(l) => l.forward(input),
            Layer::Pool(l) => l.forward(input),
            Layer::ReLU(l) => l.forward(input),
            Layer::Softmax(l) => l.forward(input),
            Layer::Flatten(l) => l.forward(input),
        }
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.infer(input),
            Layer::Conv(l) => l.infer(input),
            Layer::Pool(l) => l.infer(input),
            Layer::ReLU(l) => l.infer(input),
            Layer::Softmax(l) => l.infer(input),
            Layer::Flatten(l) => l.infer(input),
        }
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.backward(dz),
            Layer::Conv(l) => l.backward(dz),
            Layer::Pool(l) => l.backward(dz),
            Layer::ReLU(l) => l.backward(dz),
            Layer::Softmax(l) => l.backward(dz),
            Layer::Flatten(l) => l.backward(dz),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Layer::FC(l) => l.zero_grad(),
            Layer::Conv(l) => l.zero_grad(),
            Layer::Pool(l) => l.zero_grad(),
            Layer::ReLU(l) => l.zero_grad(),
            Layer::Softmax(l) => l.zero_grad(),
            Layer::Flatten(l) => l.zero_grad(),
        }
    }
}

/// Xavier (Glorot) normal initialization: N(0, 2 / (fan_in + fan_out)).
pub(crate) fn xavier_normal<Sh, D, R>(
    shape: Sh,
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
) -> Result<Array<f32, D>>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    let std = (2.0 / (fan_in + fan_out) as f32).sqrt();
    let normal = Normal::new(0.0, std).map_err(|e| {
        Error::InvalidArchitecture(format!("xavier init (fan_in={fan_in}, fan_out={fan_out}): {e}"))
    })?;
    Ok(Array::random_using(shape, normal, rng))
}
