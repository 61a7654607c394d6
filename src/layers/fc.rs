pub use crate::model::Module;

use crate::error::Result;
use crate::layers::xavier_normal;
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone)]
///  z = a_prev.W + b
pub struct FcLayer {
    input_size: usize,
    output_size: usize,
    //
    pub weights: Array2<f32>, // (input_size, output_size)
    pub bias: Array1<f32>,    //  (output_size)
    // for backprop
    #[serde(skip)]
    last_input: Option<Array2<f32>>, // (batch_size, input_size), this is the prev layer activation
    //
    #[serde(skip)]
    pub w_grad: Option<Array2<f32>>, // (input_size, output_size)
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>, // (output_size)
}

impl FcLayer {
    pub fn new<R: Rng + ?Sized>(input_size: usize, output_size: usize, rng: &mut R) -> Result<FcLayer> {
        Ok(FcLayer {
            input_size,
            output_size,
            weights: xavier_normal((input_size, output_size), input_size, output_size, rng)?,
            bias: Array1::zeros(output_size),
            //
            last_input: None,
            //
            w_grad: None,
            b_grad: None,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    fn affine(&self, input: &Array2<f32>) -> Array2<f32> {
        // (batch_size, input_size) X (input_size, output_size) = (batch_size, output_size)
        input.dot(&self.weights) + &self.bias
    }
}

impl Module for FcLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("FC layer input should be 2D");
        let out = self.affine(&input);
        // store input for backprop computations
        self.last_input = Some(input);
        out.into_dyn()
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("FC layer input should be 2D");
        self.affine(&input).into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let dz = dz
            .into_dimensionality::<Ix2>()
            .expect("FC layer backward input should be 2D");

        let last_input = self
            .last_input
            .take()
            .expect("Need to do a forward pass before the backward");

        // Gradients for this layer weights (dz is already averaged over the batch by the loss)
        // w: (batch_size, input_size)^T X (batch_size, output_size) = (input_size, output_size)
        self.w_grad = Some(last_input.t().dot(&dz));
        // b: (batch_size, output_size) summed over batch-axis = (output_size)
        self.b_grad = Some(dz.sum_axis(Axis(0)));

        //  What needs to be passed on to the 'previous' layer in the network
        //  (batch_size, output_size) X (input_size, output_size)^T = (batch_size, input_size)
        dz.dot(&self.weights.t()).into_dyn()
    }

    fn zero_grad(&mut self) {
        self.w_grad = None;
        self.b_grad = None;
    }
}
