//! Patch and caption embeddings for Lumina
//!
//! Converts image latents into patch tokens, projects caption features into
//! the model width, and maps final hidden states back to patch pixels.

use burn::module::{Ignored, Module};
use burn::nn::Linear;
use burn::prelude::*;

use super::init::{normal_linear, zero_linear};
use super::modulation::{modulate, AdaLnModulation};
use super::normalization::{layer_norm_no_affine, RmsNorm};
use crate::config::ExecutionStrategy;
use crate::LuminaConfig;

/// Split one latent image into flattened patches
///
/// `[C, H, W]` is viewed as `[C, H/p, p, W/p, p]`, permuted to
/// `[H/p, W/p, p, p, C]` and flattened to `[(H/p) * (W/p), p * p * C]`,
/// so patches run row-major over the grid and features run
/// (row-in-patch, column-in-patch, channel).
///
/// Height and width must be multiples of `patch_size`.
pub fn patchify<B: Backend>(image: Tensor<B, 3>, patch_size: usize) -> Tensor<B, 2> {
    let [channels, height, width] = image.dims();
    let p = patch_size;
    let (rows, cols) = (height / p, width / p);

    image
        .reshape([channels, rows, p, cols, p])
        .permute([1, 3, 2, 4, 0])
        .reshape([rows * cols, p * p * channels])
}

/// Inverse of [`patchify`]
///
/// # Arguments
/// * `tokens` - Patch features [rows * cols, p * p * channels]
/// * `grid` - Patch grid `(rows, cols)`
pub fn unpatchify<B: Backend>(
    tokens: Tensor<B, 2>,
    grid: (usize, usize),
    patch_size: usize,
    channels: usize,
) -> Tensor<B, 3> {
    let (rows, cols) = grid;
    let p = patch_size;

    tokens
        .reshape([rows, cols, p, p, channels])
        .permute([4, 0, 2, 1, 3])
        .reshape([channels, rows * p, cols * p])
}

/// Caption feature projection: cap_embedder.0 (RMSNorm), cap_embedder.1 (Linear)
#[derive(Module, Debug)]
pub struct CaptionEmbedder<B: Backend> {
    norm: RmsNorm<B>,
    linear: Linear<B>,
}

impl<B: Backend> CaptionEmbedder<B> {
    pub fn new(config: &LuminaConfig, device: &B::Device) -> Self {
        Self {
            norm: RmsNorm::new(config.cap_feat_dim, config.norm_eps, device),
            linear: normal_linear(config.cap_feat_dim, config.dim, 0.02, device),
        }
    }

    /// Project caption features [batch, cap_len, cap_feat_dim] to [batch, cap_len, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.linear.forward(self.norm.forward(x))
    }
}

/// Final layer: modulated LayerNorm, then projection back to patch features
///
/// Matches the checkpoint structure: final_layer.linear,
/// final_layer.adaLN_modulation.1
#[derive(Module, Debug)]
pub struct FinalLayer<B: Backend> {
    /// Output projection [dim -> p * p * out_channels]
    linear: Linear<B>,
    /// Scale-only AdaLN head
    adaln_modulation: AdaLnModulation<B>,
    strategy: Ignored<ExecutionStrategy>,
}

impl<B: Backend> FinalLayer<B> {
    /// Create the final layer
    pub fn new(config: &LuminaConfig, device: &B::Device) -> Self {
        let out_dim = config.patch_size * config.patch_size * config.out_channels();

        Self {
            linear: zero_linear(config.dim, out_dim, device),
            adaln_modulation: AdaLnModulation::new(config.adaln_dim(), config.dim, device),
            strategy: Ignored(config.execution),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Hidden states [batch, seq_len, dim]
    /// * `cond` - Timestep conditioning [batch, adaln_dim]
    ///
    /// # Returns
    /// Patch features [batch, seq_len, p * p * out_channels]
    pub fn forward(&self, x: Tensor<B, 3>, cond: Tensor<B, 2>) -> Tensor<B, 3> {
        let scale = self.adaln_modulation.forward(cond);
        let x = layer_norm_no_affine(x, 1e-6);
        let x = modulate(x, scale, self.strategy.0);
        self.linear.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_patchify_layout() {
        let device = Default::default();
        // [C=1, H=4, W=4] holding 0..16 row-major
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let image = Tensor::<TestBackend, 3>::from_data(TensorData::new(values, [1, 4, 4]), &device);

        let tokens = patchify(image, 2);
        assert_eq!(tokens.dims(), [4, 4]);

        let flat: Vec<f32> = tokens.into_data().to_vec().unwrap();
        // Patch (0, 0) covers pixels (0,0) (0,1) (1,0) (1,1)
        assert_eq!(&flat[0..4], &[0.0, 1.0, 4.0, 5.0]);
        // Patch (0, 1) covers the top-right block
        assert_eq!(&flat[4..8], &[2.0, 3.0, 6.0, 7.0]);
        // Patch (1, 0)
        assert_eq!(&flat[8..12], &[8.0, 9.0, 12.0, 13.0]);
    }

    #[test]
    fn test_patchify_channels_last() {
        let device = Default::default();
        // Channel c holds the constant c
        let values: Vec<f32> = (0..3).flat_map(|c| vec![c as f32; 4]).collect();
        let image = Tensor::<TestBackend, 3>::from_data(TensorData::new(values, [3, 2, 2]), &device);

        let flat: Vec<f32> = patchify(image, 2).into_data().to_vec().unwrap();
        assert_eq!(flat, vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_unpatchify_inverts_patchify() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 3>::random([3, 6, 4], Distribution::Normal(0.0, 1.0), &device);

        let tokens = patchify(image.clone(), 2);
        assert_eq!(tokens.dims(), [6, 12]);
        let restored = unpatchify(tokens, (3, 2), 2, 3);

        assert_eq!(restored.dims(), [3, 6, 4]);
        let diff: f32 = (restored - image).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_caption_embedder_shape() {
        let device = Default::default();
        let config = LuminaConfig::tiny();
        let embedder = CaptionEmbedder::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 3>::ones([2, 5, config.cap_feat_dim], &device);
        assert_eq!(embedder.forward(x).dims(), [2, 5, config.dim]);
    }

    #[test]
    fn test_final_layer_starts_at_zero() {
        let device = Default::default();
        let config = LuminaConfig::tiny();
        let layer = FinalLayer::<TestBackend>::new(&config, &device);

        let x = Tensor::<TestBackend, 3>::random([2, 3, config.dim], Distribution::Normal(0.0, 1.0), &device);
        let cond = Tensor::<TestBackend, 2>::ones([2, config.adaln_dim()], &device);
        let out = layer.forward(x, cond);

        assert_eq!(out.dims(), [2, 3, config.patch_dim()]);
        let sum: f32 = out.abs().sum().into_scalar();
        assert_eq!(sum, 0.0);
    }
}
