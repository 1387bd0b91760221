//! Normalization layers for Lumina
//!
//! RMSNorm is used around every attention and feed-forward sub-layer, on the
//! caption features, and (optionally) per head on queries and keys. The final
//! layer uses a plain LayerNorm without affine parameters.

use burn::module::{Ignored, Module, Param};
use burn::prelude::*;

/// RMS Layer Normalization
///
/// Normalizes by the root mean square of the last dimension, without
/// subtracting the mean, then applies a learned per-channel scale.
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    /// Scale parameter (gamma)
    weight: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    eps: Ignored<f64>,
}

impl<B: Backend> RmsNorm<B> {
    /// Create a new RMS normalization layer with unit scale
    pub fn new(size: usize, eps: f64, device: &B::Device) -> Self {
        let weight = Param::from_tensor(Tensor::ones([size], device));
        Self {
            weight,
            eps: Ignored(eps),
        }
    }

    /// Normalize over the last dimension of a tensor of any rank
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let variance = x.clone().powf_scalar(2.0).mean_dim(D - 1);
        let x_norm = x / (variance + self.eps.0).sqrt();
        x_norm * self.weight.val().unsqueeze::<D>()
    }
}

/// Per-head normalization of queries and keys
///
/// Applied before the rotary embedding to keep attention logits bounded.
#[derive(Module, Debug)]
pub struct QkNorm<B: Backend> {
    /// Query normalization
    q_norm: RmsNorm<B>,
    /// Key normalization
    k_norm: RmsNorm<B>,
}

impl<B: Backend> QkNorm<B> {
    /// Create QK normalization layers
    pub fn new(head_dim: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            q_norm: RmsNorm::new(head_dim, eps, device),
            k_norm: RmsNorm::new(head_dim, eps, device),
        }
    }

    /// Normalize query and key tensors
    /// Input shape: [batch, seq_len, heads, head_dim]
    pub fn forward(&self, q: Tensor<B, 4>, k: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        (self.q_norm.forward(q), self.k_norm.forward(k))
    }
}

/// LayerNorm over the last dimension without a learned scale or shift
pub fn layer_norm_no_affine<B: Backend, const D: usize>(x: Tensor<B, D>, eps: f64) -> Tensor<B, D> {
    let mean = x.clone().mean_dim(D - 1);
    let centered = x - mean;
    let variance = centered.clone().powf_scalar(2.0).mean_dim(D - 1);
    centered / (variance + eps).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_rms_norm_unit_rms() {
        let device = Default::default();
        let norm = RmsNorm::<TestBackend>::new(4, 1e-6, &device);
        let x = Tensor::<TestBackend, 3>::from_floats([[[1.0, -2.0, 3.0, -4.0]]], &device);

        let out = norm.forward(x);
        let rms: f32 = out.powf_scalar(2.0).mean().into_scalar();
        assert!((rms - 1.0).abs() < 1e-4, "rms = {rms}");
    }

    #[test]
    fn test_rms_norm_4d_shape() {
        let device = Default::default();
        let norm = QkNorm::<TestBackend>::new(8, 1e-6, &device);
        let q = Tensor::<TestBackend, 4>::ones([2, 3, 4, 8], &device);
        let k = Tensor::<TestBackend, 4>::ones([2, 3, 4, 8], &device);

        let (q, k) = norm.forward(q, k);
        assert_eq!(q.dims(), [2, 3, 4, 8]);
        assert_eq!(k.dims(), [2, 3, 4, 8]);
    }

    #[test]
    fn test_layer_norm_zero_mean() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0, 6.0]], &device);

        let out = layer_norm_no_affine(x, 1e-6);
        let mean: f32 = out.clone().mean().into_scalar();
        let var: f32 = out.powf_scalar(2.0).mean().into_scalar();
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }
}
