use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use enum_dispatch::enum_dispatch;
use rand::Rng;
use std::io::{self, Read, Write};

/// Side of the (square) board every convolution works on
pub const BOARD_SIZE: usize = 8;
const BOARD_AREA: usize = BOARD_SIZE * BOARD_SIZE;

/// A trainable tensor and its accumulated gradient
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Param {
    pub fn zeros(len: usize) -> Self {
        Self {
            value: vec![0.0; len],
            grad: vec![0.0; len],
        }
    }

    /// He (uniform) initialization
    fn init_he<R: Rng>(&mut self, fan_in: usize, rng: &mut R) {
        let limit = (6.0 / fan_in as f32).sqrt();
        for w in &mut self.value {
            *w = rng.gen_range(-limit..limit);
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn write_to(&self, write: &mut dyn Write) -> io::Result<()> {
        write.write_u64::<LittleEndian>(self.value.len() as u64)?;
        for &v in &self.value {
            write.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    /// Reads values written by `write_to` into this param, which must have the same length
    pub fn read_from(&mut self, read: &mut dyn Read) -> io::Result<()> {
        let len = read.read_u64::<LittleEndian>()? as usize;
        if len != self.value.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("parameter length mismatch: expected {}, found {}", self.value.len(), len),
            ));
        }
        read.read_f32_into::<LittleEndian>(&mut self.value)?;
        self.zero_grad();
        Ok(())
    }
}

/// Forward and backward passes of a single example through a layer.
/// Tensors are flat f32 slices; spatial tensors are laid out `[channel][rank][file]`.
#[enum_dispatch]
pub trait LayerOps {
    /// Size of the output given the layer input
    fn output_len(&self, input_len: usize) -> usize;

    /// Computes the output of the layer
    fn forward(&self, input: &[f32], output: &mut [f32]);

    /// Accumulates parameter gradients and returns the gradient w.r.t. the input.
    /// `output` is the value computed by `forward` for the same input.
    fn backward(&mut self, input: &[f32], output: &[f32], output_grad: &[f32]) -> Vec<f32>;

    fn params(&self) -> Vec<&Param> {
        vec![]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![]
    }
}

/// A layer of a network
#[enum_dispatch(LayerOps)]
#[derive(Clone, Debug, PartialEq)]
pub enum Layer {
    Dense,
    Conv,
    Residual,
    Relu,
    Tanh,
    LogSoftmax,
}

/// Fully connected layer. Weight is row-major `[outputs][inputs]`
#[derive(Clone, Debug, PartialEq)]
pub struct Dense {
    pub inputs: usize,
    pub outputs: usize,
    pub weight: Param,
    pub bias: Param,
}

impl Dense {
    pub fn new<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let mut weight = Param::zeros(inputs * outputs);
        weight.init_he(inputs, rng);

        Self {
            inputs,
            outputs,
            weight,
            bias: Param::zeros(outputs),
        }
    }
}

pub(crate) fn dense_forward(
    inputs: usize,
    weight: &[f32],
    bias: &[f32],
    input: &[f32],
    output: &mut [f32],
) {
    debug_assert_eq!(input.len(), inputs);

    for (j, out) in output.iter_mut().enumerate() {
        let row = &weight[j * inputs..(j + 1) * inputs];
        let mut sum = bias[j];
        for (&w, &x) in row.iter().zip(input) {
            // one-hot inputs are mostly zeros
            if x != 0.0 {
                sum += w * x;
            }
        }
        *out = sum;
    }
}

impl LayerOps for Dense {
    fn output_len(&self, _input_len: usize) -> usize {
        self.outputs
    }

    fn forward(&self, input: &[f32], output: &mut [f32]) {
        dense_forward(self.inputs, &self.weight.value, &self.bias.value, input, output);
    }

    fn backward(&mut self, input: &[f32], _output: &[f32], output_grad: &[f32]) -> Vec<f32> {
        let mut input_grad = vec![0.0; self.inputs];

        for (j, &grad) in output_grad.iter().enumerate() {
            if grad == 0.0 {
                continue;
            }
            self.bias.grad[j] += grad;

            let offset = j * self.inputs;
            for i in 0..self.inputs {
                self.weight.grad[offset + i] += grad * input[i];
                input_grad[i] += grad * self.weight.value[offset + i];
            }
        }

        input_grad
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// 2D convolution over the 8x8 board, stride 1, zero "same" padding.
/// Weight is `[out_channels][in_channels][kernel][kernel]`
#[derive(Clone, Debug, PartialEq)]
pub struct Conv {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub weight: Param,
    pub bias: Param,
}

impl Conv {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        rng: &mut R,
    ) -> Self {
        assert!(kernel % 2 == 1, "only odd kernels keep the board size");

        let mut weight = Param::zeros(out_channels * in_channels * kernel * kernel);
        weight.init_he(in_channels * kernel * kernel, rng);

        Self {
            in_channels,
            out_channels,
            kernel,
            weight,
            bias: Param::zeros(out_channels),
        }
    }
}

/// Calls `f(input_index, output_index, weight_index)` for every valid tap of the convolution
#[inline]
fn for_each_tap(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    mut f: impl FnMut(usize, usize, usize),
) {
    let pad = (kernel / 2) as isize;
    let size = BOARD_SIZE as isize;

    for oc in 0..out_channels {
        for ic in 0..in_channels {
            for ky in 0..kernel {
                for kx in 0..kernel {
                    let w = ((oc * in_channels + ic) * kernel + ky) * kernel + kx;

                    for y in 0..size {
                        let iy = y + ky as isize - pad;
                        if iy < 0 || iy >= size {
                            continue;
                        }
                        for x in 0..size {
                            let ix = x + kx as isize - pad;
                            if ix < 0 || ix >= size {
                                continue;
                            }
                            let i = ic * BOARD_AREA + (iy * size + ix) as usize;
                            let o = oc * BOARD_AREA + (y * size + x) as usize;
                            f(i, o, w);
                        }
                    }
                }
            }
        }
    }
}

pub(crate) fn conv_forward(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    weight: &[f32],
    bias: &[f32],
    input: &[f32],
    output: &mut [f32],
) {
    debug_assert_eq!(input.len(), in_channels * BOARD_AREA);
    debug_assert_eq!(output.len(), out_channels * BOARD_AREA);

    for (oc, plane) in output.chunks_mut(BOARD_AREA).enumerate() {
        plane.fill(bias[oc]);
    }
    for_each_tap(in_channels, out_channels, kernel, |i, o, w| {
        output[o] += weight[w] * input[i];
    });
}

impl LayerOps for Conv {
    fn output_len(&self, _input_len: usize) -> usize {
        self.out_channels * BOARD_AREA
    }

    fn forward(&self, input: &[f32], output: &mut [f32]) {
        conv_forward(
            self.in_channels,
            self.out_channels,
            self.kernel,
            &self.weight.value,
            &self.bias.value,
            input,
            output,
        );
    }

    fn backward(&mut self, input: &[f32], _output: &[f32], output_grad: &[f32]) -> Vec<f32> {
        let mut input_grad = vec![0.0; self.in_channels * BOARD_AREA];

        for (oc, plane) in output_grad.chunks(BOARD_AREA).enumerate() {
            self.bias.grad[oc] += plane.iter().sum::<f32>();
        }

        let weight = &self.weight.value;
        let weight_grad = &mut self.weight.grad;
        for_each_tap(self.in_channels, self.out_channels, self.kernel, |i, o, w| {
            weight_grad[w] += output_grad[o] * input[i];
            input_grad[i] += output_grad[o] * weight[w];
        });

        input_grad
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Two 3x3 convolutions with a skip connection:
/// `relu(conv2(relu(conv1(x))) + x)`
#[derive(Clone, Debug, PartialEq)]
pub struct Residual {
    pub conv1: Conv,
    pub conv2: Conv,
}

impl Residual {
    pub fn new<R: Rng>(channels: usize, rng: &mut R) -> Self {
        Self {
            conv1: Conv::new(channels, channels, 3, rng),
            conv2: Conv::new(channels, channels, 3, rng),
        }
    }

    /// Hidden activation `relu(conv1(x))`
    fn hidden(&self, input: &[f32]) -> Vec<f32> {
        let mut hidden = vec![0.0; input.len()];
        self.conv1.forward(input, &mut hidden);
        relu_in_place(&mut hidden);
        hidden
    }
}

impl LayerOps for Residual {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn forward(&self, input: &[f32], output: &mut [f32]) {
        let hidden = self.hidden(input);
        self.conv2.forward(&hidden, output);
        for (out, &x) in output.iter_mut().zip(input) {
            *out = (*out + x).max(0.0);
        }
    }

    fn backward(&mut self, input: &[f32], output: &[f32], output_grad: &[f32]) -> Vec<f32> {
        // recomputed instead of cached, the block stays a plain single-input layer
        let hidden = self.hidden(input);

        let sum_grad: Vec<f32> = output_grad
            .iter()
            .zip(output)
            .map(|(&g, &y)| if y > 0.0 { g } else { 0.0 })
            .collect();

        let mut hidden_grad = self.conv2.backward(&hidden, &[], &sum_grad);
        for (g, &h) in hidden_grad.iter_mut().zip(&hidden) {
            if h <= 0.0 {
                *g = 0.0;
            }
        }

        let mut input_grad = self.conv1.backward(input, &[], &hidden_grad);
        for (g, &s) in input_grad.iter_mut().zip(&sum_grad) {
            *g += s;
        }
        input_grad
    }

    fn params(&self) -> Vec<&Param> {
        let mut params = self.conv1.params();
        params.extend(self.conv2.params());
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.conv1.params_mut();
        params.extend(self.conv2.params_mut());
        params
    }
}

pub(crate) fn relu_in_place(values: &mut [f32]) {
    for v in values {
        *v = v.max(0.0);
    }
}

pub(crate) fn log_softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = values.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
    for v in values {
        *v = *v - max - log_sum;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Relu;

impl LayerOps for Relu {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn forward(&self, input: &[f32], output: &mut [f32]) {
        output.copy_from_slice(input);
        relu_in_place(output);
    }

    fn backward(&mut self, _input: &[f32], output: &[f32], output_grad: &[f32]) -> Vec<f32> {
        output_grad
            .iter()
            .zip(output)
            .map(|(&g, &y)| if y > 0.0 { g } else { 0.0 })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tanh;

impl LayerOps for Tanh {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn forward(&self, input: &[f32], output: &mut [f32]) {
        for (out, &x) in output.iter_mut().zip(input) {
            *out = x.tanh();
        }
    }

    fn backward(&mut self, _input: &[f32], output: &[f32], output_grad: &[f32]) -> Vec<f32> {
        output_grad
            .iter()
            .zip(output)
            .map(|(&g, &y)| g * (1.0 - y * y))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogSoftmax;

impl LayerOps for LogSoftmax {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn forward(&self, input: &[f32], output: &mut [f32]) {
        output.copy_from_slice(input);
        log_softmax_in_place(output);
    }

    fn backward(&mut self, _input: &[f32], output: &[f32], output_grad: &[f32]) -> Vec<f32> {
        let grad_sum: f32 = output_grad.iter().sum();
        output_grad
            .iter()
            .zip(output)
            .map(|(&g, &y)| g - y.exp() * grad_sum)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn check_input_grad(layer: Layer, input: Vec<f32>) {
        check_input_grad_with_step(layer, input, 1e-2);
    }

    /// Compares the analytic input gradient of `sum(output * weights)` against
    /// central differences of size `eps`
    fn check_input_grad_with_step(mut layer: Layer, input: Vec<f32>, eps: f32) {
        let out_len = layer.output_len(input.len());
        let weights: Vec<f32> = (0..out_len).map(|i| ((i % 7) as f32 - 3.0) * 0.1).collect();

        let objective = |layer: &Layer, x: &[f32]| {
            let mut out = vec![0.0; out_len];
            layer.forward(x, &mut out);
            out.iter().zip(&weights).map(|(a, b)| a * b).sum::<f32>()
        };

        let mut output = vec![0.0; out_len];
        layer.forward(&input, &mut output);
        let analytic = layer.backward(&input, &output, &weights);

        for i in (0..input.len()).step_by(5) {
            let mut plus = input.clone();
            plus[i] += eps;
            let mut minus = input.clone();
            minus[i] -= eps;

            let numeric = (objective(&layer, &plus) - objective(&layer, &minus)) / (2.0 * eps);
            assert!(
                (numeric - analytic[i]).abs() < 2e-2,
                "input {}: numeric {} analytic {}",
                i,
                numeric,
                analytic[i]
            );
        }
    }

    fn random_input(len: usize, rng: &mut ChaCha8Rng) -> Vec<f32> {
        // keep away from the relu kink so finite differences stay valid
        (0..len)
            .map(|_| {
                let v: f32 = rng.gen_range(0.2..1.0);
                if rng.gen_bool(0.5) {
                    v
                } else {
                    -v
                }
            })
            .collect()
    }

    #[test]
    fn test_dense_forward() {
        let dense = Dense {
            inputs: 3,
            outputs: 2,
            weight: Param {
                value: vec![1.0, 2.0, 3.0, -1.0, 0.5, 0.0],
                grad: vec![0.0; 6],
            },
            bias: Param {
                value: vec![0.5, -0.5],
                grad: vec![0.0; 2],
            },
        };

        let mut out = vec![0.0; 2];
        dense.forward(&[1.0, 0.0, 2.0], &mut out);
        assert_eq!(out, vec![7.5, -1.5]);
    }

    #[test]
    fn test_gradients() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let input = random_input(12, &mut rng);
        check_input_grad(Dense::new(12, 5, &mut rng).into(), input);

        let input = random_input(2 * 64, &mut rng);
        check_input_grad(Conv::new(2, 3, 3, &mut rng).into(), input);

        let input = random_input(3 * 64, &mut rng);
        check_input_grad(Conv::new(3, 1, 1, &mut rng).into(), input);

        // small step: the skip sum and both relus have kinks inside the block
        let input = random_input(2 * 64, &mut rng);
        check_input_grad_with_step(Residual::new(2, &mut rng).into(), input, 1e-3);

        let input = random_input(10, &mut rng);
        check_input_grad(Tanh.into(), input);

        let input = random_input(10, &mut rng);
        check_input_grad(LogSoftmax.into(), input);
    }

    #[test]
    fn test_conv_padding() {
        // a 3x3 kernel of ones sums the neighbourhood, corners only see 4 squares
        let mut conv = Conv::new(1, 1, 3, &mut ChaCha8Rng::seed_from_u64(0));
        conv.weight.value.fill(1.0);

        let input = vec![1.0; 64];
        let mut out = vec![0.0; 64];
        conv.forward(&input, &mut out);

        assert_eq!(out[0], 4.0);
        assert_eq!(out[1], 6.0);
        assert_eq!(out[9], 9.0);
        assert_eq!(out[63], 4.0);
    }

    #[test]
    fn test_log_softmax_normalized() {
        let mut out = vec![0.0; 4];
        LogSoftmax.forward(&[1.0, 2.0, 3.0, 4.0], &mut out);

        let total: f32 = out.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_param_roundtrip_rejects_wrong_length() {
        let param = Param {
            value: vec![1.0, 2.0, 3.0],
            grad: vec![0.0; 3],
        };
        let mut bytes = vec![];
        param.write_to(&mut bytes).unwrap();

        let mut other = Param::zeros(3);
        other.read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(other, param);

        let mut wrong = Param::zeros(4);
        assert!(wrong.read_from(&mut bytes.as_slice()).is_err());
    }
}
