use crate::error::Result;
use crate::layers::xavier_normal;
use crate::model::Module;
use log::trace;
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;

/// 2D convolution layer (without padding and with stride=1).
/// pytorch doc: https://docs.pytorch.org/docs/stable/generated/torch.nn.Conv2d.html
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2dLayer {
    in_channels: usize,          // Number of channels in the input image
    out_channels: usize,         // Number of channels produced by the convolution
    kernel_size: (usize, usize), // (kh, kw)
    // weights
    pub kernels_mat: Array2<f32>, // Layout for img2col: (out_channels, in_channels*kh*kw)
    pub b: Array1<f32>,           // One bias per output channel: (output_channels)
    // for backprop
    #[serde(skip)]
    last_input: Option<Array3<f32>>, // The 'patches' matrix in img2col: (batch_size, locations, in_channels*kh*kw)
    //
    #[serde(skip)]
    pub k_grad: Option<Array2<f32>>, // (out_channels, in_channels*kh*kw)
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>, // (out_channels)
}

impl Conv2dLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        rng: &mut R,
    ) -> Result<Conv2dLayer> {
        let (kh, kw) = kernel_size;
        // Xavier fan-out for a stride-1 convolution: every output channel sees kh*kw weights.
        let fan_in = in_channels * kh * kw;
        let fan_out = out_channels * kh * kw;
        Ok(Conv2dLayer {
            in_channels,
            out_channels,
            kernel_size,
            kernels_mat: xavier_normal((out_channels, fan_in), fan_in, fan_out, rng)?,
            b: Array1::zeros(out_channels),
            //
            last_input: None,
            //
            k_grad: None,
            b_grad: None,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        self.kernel_size
    }

    /// Build the img2col 'patches' tensor for the whole batch.
    ///
    /// Input: (batch_size, in_channels, height, width)
    /// Output: (batch_size, locations, in_channels*kh*kw), plus (out_height, out_width).
    ///
    /// Each row of a batch item's patch matrix is one flattened (in_channels, kh, kw) window;
    /// rows are ordered row-major over the window's top-left corner.
    fn patches(&self, input: &Array4<f32>) -> (Array3<f32>, usize, usize) {
        let (batch_size, in_channels, in_height, in_width) = input.dim();
        assert_eq!(
            in_channels, self.in_channels,
            "conv layer expects {} input channels",
            self.in_channels
        );
        let (kh, kw) = self.kernel_size;
        let out_height = in_height - kh + 1;
        let out_width = in_width - kw + 1;
        let nb_locations = out_height * out_width;

        let mut patches = Array3::<f32>::zeros((batch_size, nb_locations, in_channels * kh * kw));
        for (mut patches_mat, input_feature_maps) in patches.outer_iter_mut().zip(input.outer_iter())
        {
            // There are L windows of size (in_channels, kh, kw)
            let windows = input_feature_maps.windows((in_channels, kh, kw));
            for (mut row, window) in patches_mat.rows_mut().into_iter().zip(windows) {
                row.assign(&window.flatten());
            }
        }
        (patches, out_height, out_width)
    }

    /// The "img2col" matmul which implements the convolution as a single GEMM per batch item.
    /// (out_channels, L) = (out_channels, in_channels*kh*kw) dot (L, in_channels*kh*kw)^T
    fn convolve(&self, patches: &Array3<f32>, out_height: usize, out_width: usize) -> Array4<f32> {
        let batch_size = patches.dim().0;
        let mut out = Array4::zeros((batch_size, self.out_channels, out_height, out_width));
        for (mut out_maps, patches_mat) in out.outer_iter_mut().zip(patches.outer_iter()) {
            let mut flattened = self.kernels_mat.dot(&patches_mat.t());
            // same bias per output channel: (out_channels, 1) broadcast to (out_channels, L)
            flattened += &self.b.view().insert_axis(Axis(1));
            let maps = flattened
                .into_shape_with_order((self.out_channels, out_height, out_width))
                .expect("(out_channels, L) reshapes to (out_channels, out_height, out_width)");
            out_maps.assign(&maps);
        }
        out
    }
}

impl Module for Conv2dLayer {
    /// Forward for the convolution layer using the 'img2col' method.
    ///
    /// The 'img2col' idea is to map the convolution operation to a single matmul.
    /// OUT = kernels_mat x patches_mat^T, with (ignoring the batch dim):
    /// - kernels_mat: (out_channels, in_channels*kh*kw)
    /// - patches_mat: (locations, in_channels*kh*kw)
    ///
    /// Input: (batch_size, in_channels, height, width)
    /// Output: (batch_size, out_channels, height-kh+1, width-kw+1)
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        trace!("[forward] [conv] input: {:?}", input.shape());
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Conv layer input should be 4D");
        let (patches, out_height, out_width) = self.patches(&input);
        let out = self.convolve(&patches, out_height, out_width);
        // Cache the input patches matrix for the backward
        self.last_input = Some(patches);
        out.into_dyn()
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Conv layer input should be 4D");
        let (patches, out_height, out_width) = self.patches(&input);
        self.convolve(&patches, out_height, out_width).into_dyn()
    }

    /// Backward for the convolution layer using the 'img2col' method.
    ///
    /// The incoming dz (batch_size, out_channels, out_h, out_w) is viewed as
    /// (batch_size, out_channels, locations).
    ///
    /// Gradients:
    /// - dL/dkernels_mat = sum over batch of dz dot patches_mat,
    ///   (out_channels, in_channels*kh*kw) = (out_channels, L) dot (L, in_channels*kh*kw).
    /// - dL/dbias = dz summed over locations and batch.
    /// - dL/dpatches_mat = kernels_mat^T dot dz, (in_channels*kh*kw, L), which is then scattered
    ///   back (+=, windows overlap) onto the input volume: the patch for location l has its top
    ///   left corner at (l / out_w, l % out_w).
    ///
    /// dz already carries the 1/batch_size factor from the loss, so gradients are plain sums.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        trace!("[backward] [conv] incoming dz: {:?}", dz.shape());
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [conv] incoming dz is 4D");
        let (batch_size, out_channels, out_height, out_width) = dz.dim();
        let nb_locations = out_height * out_width;
        let dz = dz
            .to_shape((batch_size, out_channels, nb_locations))
            .expect("[backward] [conv] incoming dz is compatible with img2col shape");

        let last_patches_mat = self
            .last_input
            .take()
            .expect("Run forward before the backward");

        let (kh, kw) = self.kernel_size;
        let patch_len = self.in_channels * kh * kw;

        let mut dkernels_mat: Array2<f32> = Array2::zeros((out_channels, patch_len));
        for batch_idx in 0..batch_size {
            dkernels_mat += &dz
                .slice(s![batch_idx, .., ..])
                .dot(&last_patches_mat.slice(s![batch_idx, .., ..]));
        }
        self.k_grad = Some(dkernels_mat);

        // dL/dbias: sum over locations, then over batch
        self.b_grad = Some(dz.sum_axis(Axis(2)).sum_axis(Axis(0)));

        // dL/dinput, to be returned for the prev. layer to use for its own backprop
        let height = out_height + kh - 1;
        let width = out_width + kw - 1;
        let mut dinput = Array4::zeros((batch_size, self.in_channels, height, width));
        for batch_idx in 0..batch_size {
            // (in_channels*kh*kw, L) = (out_channels, in_channels*kh*kw)^T dot (out_channels, L)
            let dpatches = self.kernels_mat.t().dot(&dz.slice(s![batch_idx, .., ..]));
            // (L, in_channels, kh, kw)
            let dpatches = dpatches.t();
            let grad_patches = dpatches
                .to_shape((nb_locations, self.in_channels, kh, kw))
                .expect("img2col patch gradient reshapes to (L, in_channels, kh, kw)");
            for (patch_idx, patch_grad) in grad_patches.outer_iter().enumerate() {
                let top_y = patch_idx / out_width;
                let top_x = patch_idx % out_width;
                let mut dinput_slice =
                    dinput.slice_mut(s![batch_idx, .., top_y..top_y + kh, top_x..top_x + kw]);
                dinput_slice += &patch_grad;
            }
        }

        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.k_grad = None;
        self.b_grad = None;
    }
}

/// Max pooling over (kh, kw) windows moved by (sh, sw), no padding.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MaxPoolLayer {
    pool_size: (usize, usize),
    stride: (usize, usize),
    // for backprop: input dims and, per output cell, the flat index of the winner in its window
    #[serde(skip)]
    last_input_dim: Option<(usize, usize, usize, usize)>,
    #[serde(skip)]
    last_argmax: Option<Array4<usize>>,
}

impl MaxPoolLayer {
    pub fn new(pool_size: (usize, usize), stride: (usize, usize)) -> MaxPoolLayer {
        MaxPoolLayer {
            pool_size,
            stride,
            last_input_dim: None,
            last_argmax: None,
        }
    }

    pub fn pool_size(&self) -> (usize, usize) {
        self.pool_size
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    fn pool(&self, input: &Array4<f32>) -> (Array4<f32>, Array4<usize>) {
        let (batch_size, channels, height, width) = input.dim();
        let (kh, kw) = self.pool_size;
        let (sh, sw) = self.stride;
        let out_height = (height - kh) / sh + 1;
        let out_width = (width - kw) / sw + 1;

        let mut pooled = Array4::zeros((batch_size, channels, out_height, out_width));
        let mut argmax = Array4::zeros((batch_size, channels, out_height, out_width));
        for ((b, c, oy, ox), out) in pooled.indexed_iter_mut() {
            let window = input.slice(s![b, c, oy * sh..oy * sh + kh, ox * sw..ox * sw + kw]);
            // First maximum wins, so equal values (flat background) route the gradient once.
            let (idx, max) = window.iter().enumerate().fold(
                (0, f32::NEG_INFINITY),
                |(best_idx, best), (i, &v)| if v > best { (i, v) } else { (best_idx, best) },
            );
            *out = max;
            argmax[[b, c, oy, ox]] = idx;
        }
        (pooled, argmax)
    }
}

impl Module for MaxPoolLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("[forward] [maxPool] input is a 4D tensor");
        let (pooled, argmax) = self.pool(&input);
        self.last_input_dim = Some(input.dim());
        self.last_argmax = Some(argmax);
        pooled.into_dyn()
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("[infer] [maxPool] input is a 4D tensor");
        self.pool(&input).0.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        // dz: (batch_size, channels, out_height, out_width)
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [maxPool] dz is 4D");
        let input_dim = self
            .last_input_dim
            .take()
            .expect("[backward] [maxPool] Run forward before backward");
        let argmax = self
            .last_argmax
            .take()
            .expect("[backward] [maxPool] Run forward before backward");

        let (_, kw) = self.pool_size;
        let (sh, sw) = self.stride;
        let mut dinput = Array4::<f32>::zeros(input_dim);
        for ((b, c, oy, ox), &idx) in argmax.indexed_iter() {
            let y = oy * sh + idx / kw;
            let x = ox * sw + idx % kw;
            dinput[[b, c, y, x]] += dz[[b, c, oy, ox]];
        }
        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.last_input_dim = None;
        self.last_argmax = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FlattenLayer {
    #[serde(skip)]
    last_input_shape: Option<Vec<usize>>,
}

impl FlattenLayer {
    pub fn new() -> FlattenLayer {
        FlattenLayer {
            last_input_shape: None,
        }
    }
}

fn flatten(input: ArrayD<f32>) -> ArrayD<f32> {
    // Assuming the input is a batch of feature maps
    let input = input
        .into_dimensionality::<Ix4>()
        .expect("Flatten layer input should be 4D");
    let (batch_size, in_channels, height, width) = input.dim();
    input
        .to_shape((batch_size, in_channels * height * width))
        .expect("flatten input to 2D array should not fail")
        .to_owned()
        .into_dyn()
}

impl Module for FlattenLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.last_input_shape = Some(input.shape().to_vec());
        flatten(input)
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        flatten(input)
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let shape = self
            .last_input_shape
            .take()
            .expect("Need to do a forward pass before the backward");
        dz.to_shape(shape)
            .expect("should be able to reshape the incoming gradient")
            .to_owned()
    }

    fn zero_grad(&mut self) {
        self.last_input_shape = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Direct (non img2col) valid convolution, for comparison.
    fn naive_conv(layer: &Conv2dLayer, input: &Array4<f32>) -> Array4<f32> {
        let (batch, in_c, h, w) = input.dim();
        let (kh, kw) = layer.kernel_size;
        let kernels = layer
            .kernels_mat
            .to_shape((layer.out_channels, in_c, kh, kw))
            .unwrap();
        Array4::from_shape_fn(
            (batch, layer.out_channels, h - kh + 1, w - kw + 1),
            |(b, o, y, x)| {
                let window = input.slice(s![b, .., y..y + kh, x..x + kw]);
                (&window * &kernels.slice(s![o, .., .., ..])).sum() + layer.b[o]
            },
        )
    }

    #[test]
    fn img2col_forward_matches_direct_convolution() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layer = Conv2dLayer::new(2, 3, (3, 3), &mut rng).unwrap();
        layer.b = array![0.1, -0.2, 0.3];
        // non-square input catches height/width mix-ups
        let input = Array4::from_shape_fn((2, 2, 6, 7), |(b, c, y, x)| {
            (b as f32 + 1.0) * ((c * 31 + y * 7 + x) as f32 * 0.37).sin()
        });

        let out = layer.forward(input.clone().into_dyn());
        let expected = naive_conv(&layer, &input);
        assert_eq!(out.shape(), &[2, 3, 4, 5]);
        let diff = (&out.clone().into_dimensionality::<Ix4>().unwrap() - &expected)
            .mapv(f32::abs)
            .fold(0.0f32, |a, &b| a.max(b));
        assert!(diff < 1e-5, "max diff {diff}");

        // inference path gives the same result
        assert_eq!(layer.infer(input.into_dyn()), out);
    }

    #[test]
    fn conv_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Conv2dLayer::new(1, 2, (2, 2), &mut rng).unwrap();
        let input = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| ((y * 4 + x) as f32).cos());
        // loss = sum(out * weights_out)
        let weights_out = Array4::from_shape_fn((1, 2, 3, 3), |(_, c, y, x)| {
            (c as f32 + 1.0) * 0.1 * (y as f32 - x as f32)
        });
        let loss = |l: &Conv2dLayer, inp: &Array4<f32>| -> f32 {
            (&l.infer(inp.clone().into_dyn()).into_dimensionality::<Ix4>().unwrap() * &weights_out)
                .sum()
        };

        layer.forward(input.clone().into_dyn());
        let dinput = layer.backward(weights_out.clone().into_dyn());
        let dinput = dinput.into_dimensionality::<Ix4>().unwrap();
        let eps = 1e-2;

        for (y, x) in [(0, 0), (1, 2), (3, 3)] {
            let mut plus = input.clone();
            plus[[0, 0, y, x]] += eps;
            let mut minus = input.clone();
            minus[[0, 0, y, x]] -= eps;
            let numeric = (loss(&layer, &plus) - loss(&layer, &minus)) / (2.0 * eps);
            assert!((numeric - dinput[[0, 0, y, x]]).abs() < 1e-3);
        }

        let k_grad = layer.k_grad.clone().unwrap();
        for (o, p) in [(0, 0), (1, 3)] {
            let mut plus = layer.clone();
            plus.kernels_mat[[o, p]] += eps;
            let mut minus = layer.clone();
            minus.kernels_mat[[o, p]] -= eps;
            let numeric = (loss(&plus, &input) - loss(&minus, &input)) / (2.0 * eps);
            assert!((numeric - k_grad[[o, p]]).abs() < 1e-3);
        }

        let b_grad = layer.b_grad.clone().unwrap();
        assert!((b_grad[0] - weights_out.slice(s![0, 0, .., ..]).sum()).abs() < 1e-5);
    }

    #[test]
    fn max_pool_routes_gradient_to_first_maximum_only() {
        let mut pool = MaxPoolLayer::new((2, 2), (2, 2));
        let input = array![[[[1.0, 1.0, 0.0, 5.0], [1.0, 1.0, 2.0, 3.0]]]].into_dyn();
        let out = pool.forward(input);
        assert_eq!(out, array![[[[1.0, 5.0]]]].into_dyn());

        let dinput = pool.backward(array![[[[10.0, 20.0]]]].into_dyn());
        assert_eq!(
            dinput,
            array![[[[10.0, 0.0, 0.0, 20.0], [0.0, 0.0, 0.0, 0.0]]]].into_dyn()
        );
    }

    #[test]
    fn flatten_round_trips_shape() {
        let mut flatten = FlattenLayer::new();
        let input = Array4::<f32>::ones((3, 2, 4, 4)).into_dyn();
        let out = flatten.forward(input);
        assert_eq!(out.shape(), &[3, 32]);
        let back = flatten.backward(out);
        assert_eq!(back.shape(), &[3, 2, 4, 4]);
    }
}
