use super::layers::{
    Conv, Dense, Layer, LayerOps, LogSoftmax, Param, Relu, Residual, Tanh, BOARD_SIZE,
};
use super::{Architecture, ArchitectureError, POLICY_CHANNELS, POLICY_SIZE, VALUE_HIDDEN};
use crate::feature_set::{FeatureVector, NUM_FEATURES, NUM_PLANES};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::io::{self, Read, Write};

const BOARD_AREA: usize = BOARD_SIZE * BOARD_SIZE;

/// Result of a forward pass over one example
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    /// Evaluation in [-1, 1] from the side to move's perspective
    pub value: f32,
    /// Log-probabilities over moves, only for policy-value networks
    pub policy: Option<Vec<f32>>,
}

/// A trainable evaluator: a shared trunk followed by a value head and,
/// for policy-value networks, a policy head.
///
/// Inputs are the dense 768 features. Convolutional networks read them as
/// 12 planes of 8x8, which is the same memory layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    architecture: Architecture,
    pub(crate) trunk: Vec<Layer>,
    pub(crate) value_head: Vec<Layer>,
    pub(crate) policy_head: Option<Vec<Layer>>,
}

impl Network {
    /// Builds a freshly initialized network. The same seed always yields the same parameters
    pub fn new(architecture: Architecture, seed: u64) -> Result<Self, ArchitectureError> {
        architecture.validate()?;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let (trunk, value_head, policy_head) = match &architecture {
            Architecture::Plain { hidden_layers } => {
                let mut value_head = vec![];
                let mut inputs = NUM_FEATURES;
                for &units in hidden_layers {
                    value_head.push(Dense::new(inputs, units, &mut rng).into());
                    value_head.push(Relu.into());
                    inputs = units;
                }
                value_head.push(Dense::new(inputs, 1, &mut rng).into());
                value_head.push(Tanh.into());

                (vec![], value_head, None)
            }
            Architecture::Convolutional { filters, blocks }
            | Architecture::PolicyValue { filters, blocks } => {
                let mut trunk: Vec<Layer> = vec![
                    Conv::new(NUM_PLANES, *filters, 3, &mut rng).into(),
                    Relu.into(),
                ];
                for _ in 0..*blocks {
                    trunk.push(Residual::new(*filters, &mut rng).into());
                }

                let value_head = vec![
                    Conv::new(*filters, 1, 1, &mut rng).into(),
                    Relu.into(),
                    Dense::new(BOARD_AREA, VALUE_HIDDEN, &mut rng).into(),
                    Relu.into(),
                    Dense::new(VALUE_HIDDEN, 1, &mut rng).into(),
                    Tanh.into(),
                ];

                let policy_head = if architecture.has_policy() {
                    Some(vec![
                        Conv::new(*filters, POLICY_CHANNELS, 1, &mut rng).into(),
                        Relu.into(),
                        Dense::new(POLICY_CHANNELS * BOARD_AREA, POLICY_SIZE, &mut rng).into(),
                        LogSoftmax.into(),
                    ])
                } else {
                    None
                };

                (trunk, value_head, policy_head)
            }
        };

        Ok(Self {
            architecture,
            trunk,
            value_head,
            policy_head,
        })
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    /// Value of an encoded position
    pub fn evaluate(&self, features: &FeatureVector) -> f32 {
        self.value(&features.to_dense())
    }

    /// Value of a dense input
    pub fn value(&self, input: &[f32]) -> f32 {
        let trunk = forward_all(&self.trunk, input);
        let value = forward_all(&self.value_head, last(&trunk, input));
        last(&value, input)[0]
    }

    /// Full forward pass, including the policy head when there is one
    pub fn infer(&self, input: &[f32]) -> Output {
        let trunk = forward_all(&self.trunk, input);
        let body = last(&trunk, input);

        let value = forward_all(&self.value_head, body);
        let policy = self
            .policy_head
            .as_ref()
            .map(|head| last(&forward_all(head, body), body).to_vec());

        Output {
            value: last(&value, body)[0],
            policy,
        }
    }

    /// Forward and backward pass of the squared error `(value - target)^2`.
    /// Gradients are accumulated scaled by `scale` (usually 1 / batch size).
    /// Returns the unscaled squared error
    pub fn accumulate_gradients(&mut self, input: &[f32], target: f32, scale: f32) -> f32 {
        let trunk = forward_all(&self.trunk, input);
        let body = last(&trunk, input).to_vec();
        let value = forward_all(&self.value_head, &body);

        let prediction = last(&value, &body)[0];
        let error = prediction - target;

        let grad = backward_all(&mut self.value_head, &body, &value, vec![2.0 * error * scale]);
        backward_all(&mut self.trunk, input, &trunk, grad);

        error * error
    }

    pub fn zero_grad(&mut self) {
        for param in self.params_mut() {
            param.zero_grad();
        }
    }

    /// Every parameter, in a fixed order (trunk, value head, policy head)
    pub fn params(&self) -> Vec<&Param> {
        self.layers().flat_map(|layer| layer.params()).collect()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![];
        for layer in self.trunk.iter_mut().chain(self.value_head.iter_mut()) {
            params.extend(layer.params_mut());
        }
        if let Some(head) = self.policy_head.as_mut() {
            for layer in head.iter_mut() {
                params.extend(layer.params_mut());
            }
        }
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.trunk
            .iter()
            .chain(self.value_head.iter())
            .chain(self.policy_head.iter().flatten())
    }

    /// Writes every parameter value (not the gradients)
    pub fn write_params(&self, write: &mut dyn Write) -> io::Result<()> {
        for param in self.params() {
            param.write_to(write)?;
        }
        Ok(())
    }

    /// Reads parameters written by `write_params` from a network of the same architecture
    pub fn read_params(&mut self, read: &mut dyn Read) -> io::Result<()> {
        for param in self.params_mut() {
            param.read_from(read)?;
        }
        Ok(())
    }
}

/// Activations after each layer
fn forward_all(layers: &[Layer], input: &[f32]) -> Vec<Vec<f32>> {
    let mut activations: Vec<Vec<f32>> = Vec::with_capacity(layers.len());

    for layer in layers {
        let x = activations.last().map(|a| a.as_slice()).unwrap_or(input);
        let mut y = vec![0.0; layer.output_len(x.len())];
        layer.forward(x, &mut y);
        activations.push(y);
    }

    activations
}

fn last<'a>(activations: &'a [Vec<f32>], input: &'a [f32]) -> &'a [f32] {
    activations.last().map(|a| a.as_slice()).unwrap_or(input)
}

/// Backpropagates through a stack, returns the gradient w.r.t. the stack input
fn backward_all(
    layers: &mut [Layer],
    input: &[f32],
    activations: &[Vec<f32>],
    mut grad: Vec<f32>,
) -> Vec<f32> {
    for i in (0..layers.len()).rev() {
        let x = if i == 0 { input } else { &activations[i - 1] };
        grad = layers[i].backward(x, &activations[i], &grad);
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_set::basic::Basic;
    use shakmaty::Chess;

    fn small_architectures() -> Vec<Architecture> {
        vec![
            Architecture::Plain {
                hidden_layers: vec![16, 8],
            },
            Architecture::Convolutional { filters: 4, blocks: 1 },
            Architecture::PolicyValue { filters: 4, blocks: 1 },
        ]
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        for arch in small_architectures() {
            let a = Network::new(arch.clone(), 42).unwrap();
            let b = Network::new(arch.clone(), 42).unwrap();
            let c = Network::new(arch, 43).unwrap();

            assert_eq!(a, b);
            assert_ne!(a, c);
        }
    }

    #[test]
    fn test_outputs() {
        let input = Basic::encode(&Chess::default()).to_dense();

        for arch in small_architectures() {
            let net = Network::new(arch.clone(), 1).unwrap();
            let out = net.infer(&input);

            assert!((-1.0..=1.0).contains(&out.value));
            assert_eq!(out.value, net.value(&input));

            match out.policy {
                Some(policy) => {
                    assert!(arch.has_policy());
                    assert_eq!(policy.len(), POLICY_SIZE);
                    let total: f32 = policy.iter().map(|p| p.exp()).sum();
                    assert!((total - 1.0).abs() < 1e-3);
                }
                None => assert!(!arch.has_policy()),
            }
        }
    }

    #[test]
    fn test_gradient_descent_reduces_error() {
        let input = Basic::encode(&Chess::default()).to_dense();

        for arch in small_architectures() {
            let mut net = Network::new(arch, 3).unwrap();
            let target = 0.5;

            let before = (net.value(&input) - target).powi(2);
            for _ in 0..20 {
                net.zero_grad();
                net.accumulate_gradients(&input, target, 1.0);
                for param in net.params_mut() {
                    for (v, g) in param.value.iter_mut().zip(&param.grad) {
                        *v -= 0.01 * g;
                    }
                }
            }
            let after = (net.value(&input) - target).powi(2);

            assert!(after < before, "{} -> {}", before, after);
        }
    }

    #[test]
    fn test_params_roundtrip() {
        let arch = Architecture::PolicyValue { filters: 2, blocks: 1 };
        let net = Network::new(arch.clone(), 5).unwrap();

        let mut bytes = vec![];
        net.write_params(&mut bytes).unwrap();

        let mut other = Network::new(arch, 6).unwrap();
        other.read_params(&mut bytes.as_slice()).unwrap();
        assert_eq!(other, net);

        // a different architecture is rejected
        let mut plain = Network::new(Architecture::default(), 5).unwrap();
        assert!(plain.read_params(&mut bytes.as_slice()).is_err());
    }
}
