//! Timestep conditioning for Lumina
//!
//! The timestep embedding drives AdaLN-style scale modulation and tanh gates in
//! every modulated block. The modulation projections are zero-initialized, so
//! a freshly built block starts as the identity on its residual stream.

use burn::module::{Ignored, Module};
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::activation::silu;

use super::init::{normal_linear, zero_linear};
use crate::config::ExecutionStrategy;

/// Scale normalized activations: `x * (1 + scale)`
///
/// # Arguments
/// * `x` - Activations [batch, seq_len, dim]
/// * `scale` - Per-sample scale [batch, dim]
pub fn modulate<B: Backend>(
    x: Tensor<B, 3>,
    scale: Tensor<B, 2>,
    strategy: ExecutionStrategy,
) -> Tensor<B, 3> {
    match strategy {
        ExecutionStrategy::Eager => x.clone() * scale.unsqueeze_dim::<3>(1) + x,
        // Add the unit offset on the [batch, dim] vector, not the whole sequence
        ExecutionStrategy::Fused => x * (scale + 1.0).unsqueeze_dim::<3>(1),
    }
}

/// AdaLN modulation head: `Linear(SiLU(c))`
///
/// Matches the checkpoint structure: adaLN_modulation.1 (index 0 is the SiLU)
#[derive(Module, Debug)]
pub struct AdaLnModulation<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> AdaLnModulation<B> {
    /// Zero-initialized head mapping `cond_dim` to `out_dim`
    pub fn new(cond_dim: usize, out_dim: usize, device: &B::Device) -> Self {
        Self {
            linear: zero_linear(cond_dim, out_dim, device),
        }
    }

    /// Modulation parameters [batch, out_dim]
    pub fn forward(&self, cond: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(silu(cond))
    }
}

/// Timestep Embedder
///
/// Converts scalar timesteps to embeddings using sinusoidal encoding + MLP.
#[derive(Module, Debug)]
pub struct TimestepEmbedder<B: Backend> {
    /// MLP module containing the two linear layers
    mlp: TimestepMlp<B>,
    /// Sinusoidal feature width (256)
    freq_embed_size: Ignored<usize>,
}

/// MLP for timestep embedding: t_embedder.mlp
#[derive(Module, Debug)]
pub struct TimestepMlp<B: Backend> {
    /// First linear layer: t_embedder.mlp.0 [freq_embed_size -> hidden]
    linear1: Linear<B>,
    /// Second linear layer: t_embedder.mlp.2 [hidden -> hidden]
    linear2: Linear<B>,
}

impl<B: Backend> TimestepEmbedder<B> {
    /// Sinusoidal feature width used by Lumina
    pub const FREQ_EMBED_SIZE: usize = 256;

    /// Create a new timestep embedder producing `hidden_size` features
    pub fn new(hidden_size: usize, device: &B::Device) -> Self {
        let freq_embed_size = Self::FREQ_EMBED_SIZE;
        Self {
            mlp: TimestepMlp {
                linear1: normal_linear(freq_embed_size, hidden_size, 0.02, device),
                linear2: normal_linear(hidden_size, hidden_size, 0.02, device),
            },
            freq_embed_size: Ignored(freq_embed_size),
        }
    }

    /// Convert timesteps to embeddings
    ///
    /// # Arguments
    /// * `t` - Timesteps [batch]; may be fractional
    pub fn forward(&self, t: Tensor<B, 1>) -> Tensor<B, 2> {
        let t_freq = timestep_embedding(t, self.freq_embed_size.0, 10000.0);
        let t_emb = self.mlp.linear1.forward(t_freq);
        let t_emb = silu(t_emb);
        self.mlp.linear2.forward(t_emb)
    }
}

/// Sinusoidal timestep features `[cos(t * f), sin(t * f)]`
///
/// Frequencies are `exp(-ln(max_period) * i / half)` for `i < dim / 2`; an odd
/// `dim` gets a trailing zero column.
pub fn timestep_embedding<B: Backend>(t: Tensor<B, 1>, dim: usize, max_period: f64) -> Tensor<B, 2> {
    let device = t.device();
    let [batch] = t.dims();
    let half = dim / 2;

    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_data(TensorData::new(freqs, [half]), &device);

    // [batch, half]
    let args = t.unsqueeze_dim::<2>(1) * freqs.unsqueeze_dim::<2>(0);

    let mut parts = vec![args.clone().cos(), args.sin()];
    if dim % 2 == 1 {
        parts.push(Tensor::zeros([batch, 1], &device));
    }
    Tensor::cat(parts, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_timestep_embedding_layout() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device);
        let emb = timestep_embedding(t, 8, 10000.0);
        assert_eq!(emb.dims(), [2, 8]);

        let values: Vec<f32> = emb.into_data().to_vec().unwrap();
        // t = 0: cos half is all ones, sin half all zeros
        assert_eq!(&values[0..4], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&values[4..8], &[0.0, 0.0, 0.0, 0.0]);
        // t = 1, i = 0: frequency 1
        assert!((values[8] - 1.0f32.cos()).abs() < 1e-6);
        assert!((values[12] - 1.0f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_timestep_embedding_odd_dim() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([0.5], &device);
        let emb = timestep_embedding(t, 5, 10000.0);
        assert_eq!(emb.dims(), [1, 5]);
    }

    #[test]
    fn test_timestep_embedder_shape() {
        let device = Default::default();
        let embedder = TimestepEmbedder::<TestBackend>::new(64, &device);
        let t = Tensor::<TestBackend, 1>::from_floats([0.1, 0.9, 0.5], &device);
        assert_eq!(embedder.forward(t).dims(), [3, 64]);
    }

    #[test]
    fn test_modulation_starts_at_zero() {
        let device = Default::default();
        let modulation = AdaLnModulation::<TestBackend>::new(16, 32, &device);
        let cond = Tensor::<TestBackend, 2>::ones([2, 16], &device);

        let out = modulation.forward(cond);
        assert_eq!(out.dims(), [2, 32]);
        let sum: f32 = out.abs().sum().into_scalar();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_modulate_strategies_agree() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::random(
            [2, 3, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let scale = Tensor::<TestBackend, 2>::random(
            [2, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let eager = modulate(x.clone(), scale.clone(), ExecutionStrategy::Eager);
        let fused = modulate(x, scale, ExecutionStrategy::Fused);
        let diff: f32 = (eager - fused).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }
}
