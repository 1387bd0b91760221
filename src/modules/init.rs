//! Linear-layer constructors for the initialization schemes Lumina uses.
//!
//! Burn applies one initializer to both weight and bias; every Lumina linear
//! layer with a bias starts from a zero bias, so it is reset after init.

use burn::module::Param;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;

fn linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    bias: bool,
    initializer: Initializer,
    device: &B::Device,
) -> Linear<B> {
    let mut layer = LinearConfig::new(d_input, d_output)
        .with_bias(bias)
        .with_initializer(initializer)
        .init(device);
    if bias {
        layer.bias = Some(Param::from_tensor(Tensor::zeros([d_output], device)));
    }
    layer
}

/// Xavier-uniform weight, zero bias
pub fn xavier_linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    bias: bool,
    device: &B::Device,
) -> Linear<B> {
    linear(d_input, d_output, bias, Initializer::XavierUniform { gain: 1.0 }, device)
}

/// Normal(0, std) weight, zero bias
pub fn normal_linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    std: f64,
    device: &B::Device,
) -> Linear<B> {
    linear(d_input, d_output, true, Initializer::Normal { mean: 0.0, std }, device)
}

/// All-zero weight and bias (AdaLN-Zero modulation and output heads)
pub fn zero_linear<B: Backend>(d_input: usize, d_output: usize, device: &B::Device) -> Linear<B> {
    linear(d_input, d_output, true, Initializer::Zeros, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_zero_linear_outputs_zero() {
        let device = Default::default();
        let layer = zero_linear::<TestBackend>(8, 4, &device);
        let x = Tensor::<TestBackend, 2>::ones([3, 8], &device);
        let sum: f32 = layer.forward(x).abs().sum().into_scalar();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_bias_starts_at_zero() {
        let device = Default::default();
        let layer = xavier_linear::<TestBackend>(8, 4, true, &device);
        let bias = layer.bias.expect("bias requested");
        let sum: f32 = bias.val().abs().sum().into_scalar();
        assert_eq!(sum, 0.0);

        let layer = xavier_linear::<TestBackend>(8, 4, false, &device);
        assert!(layer.bias.is_none());
    }
}
