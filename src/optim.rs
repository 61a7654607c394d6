use crate::model::Network;

use ndarray::prelude::*;
use ndarray::Zip;

/// Negative log-likelihood of softmax probabilities.
///
/// Returns the per-sample loss `-ln(p[label])` and the one-hot targets, which is what the
/// softmax layer's backward expects as its incoming "gradient".
pub fn negative_log_likelihood(labels: &[u8], probs: &Array2<f32>) -> (Array1<f32>, Array2<f32>) {
    let batch_size = labels.len();
    let num_classes = probs.ncols();

    // Convert labels to one-hot encoding Array2
    let mut expected_y = Array2::zeros((batch_size, num_classes));
    for (i, &label) in labels.iter().enumerate() {
        expected_y[(i, label as usize)] = 1.0;
    }

    let loss = Array1::from_iter(
        labels
            .iter()
            .enumerate()
            .map(|(i, &label)| -(probs[(i, label as usize)] + 1e-10).ln()),
    );

    (loss, expected_y)
}

pub trait Optimizer {
    /// Run one optimization step.
    /// Note:
    /// - Assumes forward+backward pass have been done.
    /// - May mutate the optimizer internal state (e.g. momentum).
    fn step(&mut self, nn: &mut Network);
}

/// SGD with Nesterov momentum, in the "look-ahead folded into the update" form:
///
/// ```text
/// v_new = mu * v - lr * g
/// w    += -mu * v + (1 + mu) * v_new
/// ```
pub struct NesterovSgd {
    pub learning_rate: f32,
    pub momentum: f32,
    velocity: Vec<ArrayD<f32>>, // one per trainable tensor, in `Network::params_mut` order
}

impl NesterovSgd {
    pub fn new(learning_rate: f32, momentum: f32) -> NesterovSgd {
        NesterovSgd {
            learning_rate,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for NesterovSgd {
    fn step(&mut self, nn: &mut Network) {
        let params = nn.params_mut();
        if self.velocity.len() != params.len() {
            // First step ever. No velocities yet.
            self.velocity = params.iter().map(|(p, _)| ArrayD::zeros(p.raw_dim())).collect();
        }

        let (lr, mu) = (self.learning_rate, self.momentum);
        for ((mut param, grad), velocity) in params.into_iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = grad else {
                continue; // no backward through this tensor
            };
            Zip::from(&mut param)
                .and(&grad)
                .and(velocity)
                .for_each(|w, &g, v| {
                    let v_prev = *v;
                    *v = mu * v_prev - lr * g;
                    *w += -mu * v_prev + (1.0 + mu) * *v;
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{FcLayer, Layer, SoftMaxLayer};
    use crate::model::Module;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn nll_is_minus_log_of_true_class_probability() {
        let probs = array![[0.5, 0.25, 0.25], [0.1, 0.8, 0.1]];
        let (loss, one_hot) = negative_log_likelihood(&[0, 1], &probs);
        assert!((loss[0] - 2.0f32.ln()).abs() < 1e-6);
        assert!((loss[1] + 0.8f32.ln()).abs() < 1e-6);
        assert_eq!(one_hot, array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
    }

    fn single_weight_net(w: f32) -> Network {
        let mut fc = FcLayer::new(1, 1, &mut StdRng::seed_from_u64(0)).unwrap();
        fc.weights = array![[w]];
        Network {
            layers: vec![Layer::FC(fc)],
        }
    }

    fn set_grad(nn: &mut Network, g: f32) {
        if let Layer::FC(fc) = &mut nn.layers[0] {
            fc.w_grad = Some(array![[g]]);
            fc.b_grad = Some(array![0.0]);
        }
    }

    fn weight(nn: &Network) -> f32 {
        match &nn.layers[0] {
            Layer::FC(fc) => fc.weights[[0, 0]],
            _ => unreachable!(),
        }
    }

    #[test]
    fn nesterov_update_rule() {
        let mut nn = single_weight_net(1.0);
        let mut opt = NesterovSgd::new(0.1, 0.9);

        // step 1: v = -0.1, w += (1.9)(-0.1)
        set_grad(&mut nn, 1.0);
        opt.step(&mut nn);
        assert!((weight(&nn) - (1.0 - 0.19)).abs() < 1e-6);

        // step 2: v_prev = -0.1, v = -0.09 - 0.1 = -0.19, w += 0.09 + 1.9 * -0.19
        set_grad(&mut nn, 1.0);
        opt.step(&mut nn);
        assert!((weight(&nn) - (0.81 + 0.09 - 0.361)).abs() < 1e-6);
    }

    #[test]
    fn nesterov_reduces_loss_of_a_tiny_classifier() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut nn = Network {
            layers: vec![
                Layer::FC(FcLayer::new(2, 2, &mut rng).unwrap()),
                Layer::Softmax(SoftMaxLayer::new()),
            ],
        };
        let input = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.2], [0.1, 1.0]];
        let labels = [0u8, 1, 0, 1];
        let mut opt = NesterovSgd::new(0.2, 0.9);

        let loss_at = |nn: &Network| {
            let probs = nn.infer(input.clone().into_dyn()).into_dimensionality::<Ix2>().unwrap();
            negative_log_likelihood(&labels, &probs).0.mean().unwrap()
        };
        let initial = loss_at(&nn);
        for _ in 0..100 {
            nn.zero_grad();
            let probs = nn
                .forward(input.clone().into_dyn())
                .into_dimensionality::<Ix2>()
                .unwrap();
            let (_, one_hot) = negative_log_likelihood(&labels, &probs);
            nn.backward(one_hot.into_dyn());
            opt.step(&mut nn);
        }
        assert!(loss_at(&nn) < initial * 0.5);
    }
}
