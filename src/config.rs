//! Lumina model configuration

use burn::config::Config;

use crate::error::LuminaError;

/// How element-wise glue around the matmuls is evaluated.
///
/// Both strategies compute the same function with a different kernel grouping:
/// `Fused` runs the feed-forward gate and up projections as one wider matmul
/// and adds modulation's unit offset to the per-sample scale instead of the
/// sequence.
#[derive(Config, Debug, PartialEq, Eq, Copy)]
pub enum ExecutionStrategy {
    Eager,
    Fused,
}

/// Configuration for the Lumina diffusion transformer
#[derive(Config, Debug)]
pub struct LuminaConfig {
    /// Spatial patch size (default: 2)
    #[config(default = 2)]
    pub patch_size: usize,

    /// Number of latent channels in and out (default: 4)
    #[config(default = 4)]
    pub in_channels: usize,

    /// Hidden dimension (default: 4096)
    #[config(default = 4096)]
    pub dim: usize,

    /// Number of main transformer layers (default: 32)
    #[config(default = 32)]
    pub n_layers: usize,

    /// Number of layers in each of the noise and context refiners (default: 2)
    #[config(default = 2)]
    pub n_refiner_layers: usize,

    /// Number of query heads (default: 32)
    #[config(default = 32)]
    pub n_heads: usize,

    /// Number of key/value heads; `None` means plain multi-head attention
    pub n_kv_heads: Option<usize>,

    /// FFN hidden size is rounded up to a multiple of this (default: 256)
    #[config(default = 256)]
    pub multiple_of: usize,

    /// Optional multiplier applied to the 4 * dim FFN width
    pub ffn_dim_multiplier: Option<f64>,

    /// RMSNorm epsilon (default: 1e-5)
    #[config(default = 1e-5)]
    pub norm_eps: f64,

    /// Per-head RMSNorm on queries and keys (default: false)
    #[config(default = false)]
    pub qk_norm: bool,

    /// Caption feature dimension from the text encoder (default: 5120)
    #[config(default = 5120)]
    pub cap_feat_dim: usize,

    /// Rotary dimensions per axis (caption position, row, column)
    #[config(default = "[16, 56, 56]")]
    pub axes_dims: [usize; 3],

    /// Rotary table length per axis
    #[config(default = "[1, 512, 512]")]
    pub axes_lens: [usize; 3],

    /// RoPE theta base (default: 10000.0)
    #[config(default = 10000.0)]
    pub rope_theta: f64,

    /// Kernel grouping used by feed-forward and modulation
    #[config(default = "ExecutionStrategy::Eager")]
    pub execution: ExecutionStrategy,

    /// Chunk attention along the query axis when the sequence is longer
    pub attention_slice_size: Option<usize>,
}

impl Default for LuminaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LuminaConfig {
    /// Lumina-Image 2.0 (2B) configuration
    pub fn lumina_2b() -> Self {
        Self::new()
            .with_patch_size(2)
            .with_in_channels(16)
            .with_dim(2304)
            .with_n_layers(26)
            .with_n_heads(24)
            .with_n_kv_heads(Some(8))
            .with_axes_dims([32, 32, 32])
            .with_axes_lens([300, 512, 512])
            .with_qk_norm(true)
            .with_cap_feat_dim(2304)
    }

    /// Small configuration for tests and smoke runs
    pub fn tiny() -> Self {
        Self::new()
            .with_patch_size(2)
            .with_in_channels(4)
            .with_dim(64)
            .with_n_layers(2)
            .with_n_refiner_layers(1)
            .with_n_heads(4)
            .with_n_kv_heads(Some(2))
            .with_multiple_of(16)
            .with_qk_norm(true)
            .with_cap_feat_dim(32)
            .with_axes_dims([4, 6, 6])
            .with_axes_lens([64, 64, 64])
    }

    /// Attention head dimension
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Number of key/value heads after resolving the GQA default
    pub fn kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// Width of the timestep conditioning vector
    pub fn adaln_dim(&self) -> usize {
        self.dim.min(1024)
    }

    /// Output channels (the model predicts in latent space)
    pub fn out_channels(&self) -> usize {
        self.in_channels
    }

    /// Width of one patch token before embedding
    pub fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.in_channels
    }

    /// SwiGLU hidden width: 4 * dim, optionally scaled, rounded up to `multiple_of`
    pub fn ffn_hidden_dim(&self) -> usize {
        let mut hidden = 4 * self.dim;
        if let Some(multiplier) = self.ffn_dim_multiplier {
            hidden = (multiplier * hidden as f64) as usize;
        }
        self.multiple_of * hidden.div_ceil(self.multiple_of)
    }

    /// Check the invariants every sub-module relies on
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(LuminaError::InvalidConfig(msg));

        if self.patch_size == 0 {
            return invalid("patch_size must be positive".into());
        }
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return invalid(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            ));
        }
        let kv_heads = self.kv_heads();
        if kv_heads == 0 || self.n_heads % kv_heads != 0 {
            return invalid(format!(
                "n_heads {} is not a multiple of n_kv_heads {}",
                self.n_heads, kv_heads
            ));
        }
        if let Some(axis) = self.axes_dims.iter().position(|d| d % 2 != 0) {
            return invalid(format!(
                "rotary axis {} has odd dimension {}",
                axis, self.axes_dims[axis]
            ));
        }
        let axes_sum: usize = self.axes_dims.iter().sum();
        if axes_sum != self.head_dim() {
            return invalid(format!(
                "head_dim {} must equal sum(axes_dims) {}",
                self.head_dim(),
                axes_sum
            ));
        }
        if self.multiple_of == 0 {
            return invalid("multiple_of must be positive".into());
        }
        if self.attention_slice_size == Some(0) {
            return invalid("attention_slice_size must be positive when set".into());
        }
        Ok(())
    }

    /// Get the total number of parameters (approximate)
    pub fn num_params(&self) -> usize {
        let dim = self.dim;
        let head_dim = self.head_dim();
        let kv_heads = self.kv_heads();
        let ffn = self.ffn_hidden_dim();
        let adaln = self.adaln_dim();

        let attention = dim * (self.n_heads + 2 * kv_heads) * head_dim
            + self.n_heads * head_dim * dim
            + if self.qk_norm { 2 * head_dim } else { 0 };
        let block = attention + 3 * dim * ffn + 4 * dim;
        let modulation = adaln * 4 * dim + 4 * dim;

        let refiners = self.n_refiner_layers * (2 * block + modulation);
        let layers = self.n_layers * (block + modulation);
        let embedders = self.patch_dim() * dim
            + dim
            + self.cap_feat_dim
            + self.cap_feat_dim * dim
            + dim
            + 256 * adaln
            + adaln * adaln
            + 2 * adaln;
        let final_layer = adaln * dim + dim + dim * self.patch_dim() + self.patch_dim();

        refiners + layers + embedders + final_layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_reference() {
        let config = LuminaConfig::default();
        assert_eq!(config.dim, 4096);
        assert_eq!(config.axes_dims, [16, 56, 56]);
        assert_eq!(config.kv_heads(), 32);
        assert_eq!(config.adaln_dim(), 1024);
        // 4096 / 32 = 128 = 16 + 56 + 56
        config.validate().unwrap();
    }

    #[test]
    fn test_default_caption_axis_holds_one_position() {
        use crate::modules::packing::{OutputMode, PackLayout};
        use crate::modules::rope::{RotaryEmbedder, RotaryPositionTable};

        let config = LuminaConfig::default();
        let table =
            RotaryPositionTable::new(config.axes_dims, config.axes_lens, config.rope_theta).unwrap();
        let rope = RotaryEmbedder::new(table);

        let layout = PackLayout::new(vec![(4, 4)], vec![0], 0, 2, OutputMode::List).unwrap();
        rope.gather(&layout.position_ids()).unwrap();

        let layout = PackLayout::new(vec![(4, 4)], vec![1], 1, 2, OutputMode::List).unwrap();
        let err = rope.gather(&layout.position_ids()).unwrap_err();
        assert_eq!(
            err,
            LuminaError::PositionOutOfRange {
                axis: 0,
                position: 1,
                limit: 1
            }
        );
    }

    #[test]
    fn test_lumina_2b_is_valid() {
        let config = LuminaConfig::lumina_2b();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 96);
        assert_eq!(config.kv_heads(), 8);
        assert_eq!(config.patch_dim(), 64);
        // 4 * 2304 = 9216 is already a multiple of 256
        assert_eq!(config.ffn_hidden_dim(), 9216);
    }

    #[test]
    fn test_tiny_is_valid() {
        LuminaConfig::tiny().validate().unwrap();
    }

    #[test]
    fn test_ffn_hidden_rounding() {
        let config = LuminaConfig::tiny()
            .with_dim(100)
            .with_multiple_of(64)
            .with_ffn_dim_multiplier(Some(1.3));
        // int(1.3 * 400) = 520 -> next multiple of 64 is 576
        assert_eq!(config.ffn_hidden_dim(), 576);
    }

    #[test]
    fn test_rejects_axis_sum_mismatch() {
        let config = LuminaConfig::tiny().with_axes_dims([4, 4, 4]);
        assert!(matches!(
            config.validate(),
            Err(LuminaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_odd_axis() {
        let config = LuminaConfig::tiny().with_axes_dims([3, 7, 6]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("odd"));
    }

    #[test]
    fn test_rejects_bad_kv_grouping() {
        let config = LuminaConfig::tiny().with_n_kv_heads(Some(3));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_num_params_scale() {
        let params = LuminaConfig::lumina_2b().num_params();
        assert!(params > 2_000_000_000 && params < 3_000_000_000, "{params}");
    }
}
