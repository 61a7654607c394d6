//! Immutable description of the network topology.
//!
//! An architecture is an input shape followed by an ordered list of [`LayerSpec`]s. It is
//! validated once, when built, by propagating the input shape through every layer.

use crate::error::{Error, Result};
use crate::{IMAGE_SIDE, NUM_CLASSES};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Relu,
    Softmax,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    NegativeLogLikelihood,
}

/// Shape of the activations flowing between two layers (batch dimension omitted).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

impl Shape {
    pub fn size(&self) -> usize {
        match *self {
            Shape::Spatial {
                channels,
                height,
                width,
            } => channels * height * width,
            Shape::Flat(n) => n,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Spatial {
                channels,
                height,
                width,
            } => write!(f, "{channels}x{height}x{width}"),
            Shape::Flat(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Convolution {
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        activation: Activation,
    },
    MaxPool {
        kernel: (usize, usize),
        stride: (usize, usize),
    },
    Dense {
        inputs: usize,
        outputs: usize,
        activation: Activation,
    },
    Output {
        inputs: usize,
        outputs: usize,
        activation: Activation,
        loss: Loss,
    },
}

impl LayerSpec {
    /// Shape produced by this layer for `input`, or why the layer cannot accept it.
    pub fn shape_out(&self, input: Shape) -> Result<Shape> {
        match *self {
            LayerSpec::Convolution {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                stride,
                activation,
            } => {
                let Shape::Spatial {
                    channels,
                    height,
                    width,
                } = input
                else {
                    return Err(invalid(format!("convolution needs a spatial input, got {input}")));
                };
                if channels != in_channels {
                    return Err(invalid(format!(
                        "convolution expects {in_channels} input channels, got {channels}"
                    )));
                }
                if stride != (1, 1) {
                    return Err(invalid(format!(
                        "convolution stride must be 1x1, got {}x{}",
                        stride.0, stride.1
                    )));
                }
                if activation == Activation::Softmax {
                    return Err(invalid("softmax is only allowed on the output layer".into()));
                }
                if kh == 0 || kw == 0 || kh > height || kw > width || out_channels == 0 {
                    return Err(invalid(format!(
                        "convolution kernel {kh}x{kw} does not fit input {input}"
                    )));
                }
                Ok(Shape::Spatial {
                    channels: out_channels,
                    height: height - kh + 1,
                    width: width - kw + 1,
                })
            }
            LayerSpec::MaxPool {
                kernel: (kh, kw),
                stride: (sh, sw),
            } => {
                let Shape::Spatial {
                    channels,
                    height,
                    width,
                } = input
                else {
                    return Err(invalid(format!("max-pool needs a spatial input, got {input}")));
                };
                if kh == 0 || kw == 0 || sh == 0 || sw == 0 || kh > height || kw > width {
                    return Err(invalid(format!(
                        "max-pool kernel {kh}x{kw} stride {sh}x{sw} does not fit input {input}"
                    )));
                }
                Ok(Shape::Spatial {
                    channels,
                    height: (height - kh) / sh + 1,
                    width: (width - kw) / sw + 1,
                })
            }
            LayerSpec::Dense {
                inputs,
                outputs,
                activation,
            } => {
                if activation == Activation::Softmax {
                    return Err(invalid("softmax is only allowed on the output layer".into()));
                }
                dense_shape_out(input, inputs, outputs)
            }
            LayerSpec::Output {
                inputs,
                outputs,
                activation,
                ..
            } => {
                if activation != Activation::Softmax {
                    return Err(invalid("the output layer must use softmax".into()));
                }
                dense_shape_out(input, inputs, outputs)
            }
        }
    }

    /// Shapes of the trainable tensors: weights first, then bias.
    pub fn param_shapes(&self) -> Vec<Vec<usize>> {
        match *self {
            LayerSpec::Convolution {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                ..
            } => vec![vec![out_channels, in_channels * kh * kw], vec![out_channels]],
            LayerSpec::MaxPool { .. } => vec![],
            LayerSpec::Dense {
                inputs, outputs, ..
            }
            | LayerSpec::Output {
                inputs, outputs, ..
            } => vec![vec![inputs, outputs], vec![outputs]],
        }
    }

    pub fn activation(&self) -> Activation {
        match *self {
            LayerSpec::Convolution { activation, .. }
            | LayerSpec::Dense { activation, .. }
            | LayerSpec::Output { activation, .. } => activation,
            LayerSpec::MaxPool { .. } => Activation::Identity,
        }
    }
}

fn dense_shape_out(input: Shape, inputs: usize, outputs: usize) -> Result<Shape> {
    if input.size() != inputs {
        return Err(invalid(format!(
            "dense layer expects {inputs} inputs, got {input} ({} values)",
            input.size()
        )));
    }
    if outputs == 0 {
        return Err(invalid("dense layer needs at least one output".into()));
    }
    Ok(Shape::Flat(outputs))
}

fn invalid(msg: String) -> Error {
    Error::InvalidArchitecture(msg)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NetworkArchitecture {
    input: Shape,
    layers: Vec<LayerSpec>,
}

impl NetworkArchitecture {
    pub fn new(input: Shape, layers: Vec<LayerSpec>) -> Result<Self> {
        let arch = NetworkArchitecture { input, layers };
        arch.validate()?;
        Ok(arch)
    }

    /// The fixed digit-recognition network: two identity-activated 5x5 convolutions, each
    /// followed by 2x2 max-pooling, then dense 800 -> 128 -> 64 (ReLU) and a 10-way softmax.
    pub fn mnist() -> Self {
        let arch = NetworkArchitecture {
            input: Shape::Spatial {
                channels: 1,
                height: IMAGE_SIDE,
                width: IMAGE_SIDE,
            },
            layers: vec![
                LayerSpec::Convolution {
                    in_channels: 1,
                    out_channels: 20,
                    kernel: (5, 5),
                    stride: (1, 1),
                    activation: Activation::Identity,
                }, // 1x28x28 -> 20x24x24
                LayerSpec::MaxPool {
                    kernel: (2, 2),
                    stride: (2, 2),
                }, // -> 20x12x12
                LayerSpec::Convolution {
                    in_channels: 20,
                    out_channels: 50,
                    kernel: (5, 5),
                    stride: (1, 1),
                    activation: Activation::Identity,
                }, // -> 50x8x8
                LayerSpec::MaxPool {
                    kernel: (2, 2),
                    stride: (2, 2),
                }, // -> 50x4x4
                LayerSpec::Dense {
                    inputs: 800,
                    outputs: 128,
                    activation: Activation::Relu,
                },
                LayerSpec::Dense {
                    inputs: 128,
                    outputs: 64,
                    activation: Activation::Relu,
                },
                LayerSpec::Output {
                    inputs: 64,
                    outputs: NUM_CLASSES,
                    activation: Activation::Softmax,
                    loss: Loss::NegativeLogLikelihood,
                },
            ],
        };
        debug_assert!(arch.validate().is_ok());
        arch
    }

    /// Propagate the input shape through every layer; returns the output shape.
    pub fn validate(&self) -> Result<Shape> {
        let Some(last) = self.layers.last() else {
            return Err(invalid("architecture has no layers".into()));
        };
        if !matches!(last, LayerSpec::Output { .. }) {
            return Err(invalid("the last layer must be an output layer".into()));
        }
        let outputs = self
            .layers
            .iter()
            .filter(|l| matches!(l, LayerSpec::Output { .. }))
            .count();
        if outputs != 1 {
            return Err(invalid(format!("expected one output layer, found {outputs}")));
        }

        let mut shape = self.input;
        for (idx, layer) in self.layers.iter().enumerate() {
            shape = layer.shape_out(shape).map_err(|e| match e {
                Error::InvalidArchitecture(msg) => invalid(format!("layer {idx}: {msg}")),
                other => other,
            })?;
        }
        Ok(shape)
    }

    pub fn input_shape(&self) -> Shape {
        self.input
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn num_classes(&self) -> usize {
        match self.layers.last() {
            Some(LayerSpec::Output { outputs, .. }) => *outputs,
            _ => 0,
        }
    }

    pub fn param_shapes(&self) -> Vec<Vec<usize>> {
        self.layers.iter().flat_map(LayerSpec::param_shapes).collect()
    }
}
