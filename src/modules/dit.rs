//! Lumina DiT (Diffusion Transformer) model
//!
//! A joint caption/image transformer: captions and image patches are refined
//! separately, packed into one sequence and processed by a shared stack of
//! timestep-modulated blocks. Matches the Lumina-Image checkpoint structure.

use burn::module::{Ignored, Module};
use burn::nn::Linear;
use burn::prelude::*;
use tracing::info;

use super::attention::JointAttention;
use super::embeddings::{CaptionEmbedder, FinalLayer};
use super::feed_forward::FeedForward;
use super::init::xavier_linear;
use super::modulation::{modulate, AdaLnModulation, TimestepEmbedder};
use super::normalization::RmsNorm;
use super::packing::{ImageBatch, PackStages, SequencePacker};
use super::rope::{RotaryEmbedder, RotaryFreqs, RotaryPositionTable};
use crate::config::ExecutionStrategy;
use crate::error::LuminaError;
use crate::LuminaConfig;

/// Single joint transformer block
///
/// Contains:
/// 1. Sandwich-normed self-attention with RoPE
/// 2. Sandwich-normed SwiGLU feed-forward network
/// 3. Optional AdaLN modulation (4 params: scale and gate for each sub-layer)
#[derive(Module, Debug)]
pub struct JointTransformerBlock<B: Backend> {
    attention: JointAttention<B>,
    feed_forward: FeedForward<B>,
    attention_norm1: RmsNorm<B>,
    attention_norm2: RmsNorm<B>,
    ffn_norm1: RmsNorm<B>,
    ffn_norm2: RmsNorm<B>,
    /// adaLN_modulation.1, output 4 * dim; absent in the context refiner
    adaln_modulation: Option<AdaLnModulation<B>>,
    dim: usize,
    strategy: Ignored<ExecutionStrategy>,
}

impl<B: Backend> JointTransformerBlock<B> {
    /// Create a new block, with a modulation head when `modulated`
    pub fn new(config: &LuminaConfig, modulated: bool, device: &B::Device) -> Self {
        let norm = || RmsNorm::new(config.dim, config.norm_eps, device);

        Self {
            attention: JointAttention::new(config, device),
            feed_forward: FeedForward::new(config, device),
            attention_norm1: norm(),
            attention_norm2: norm(),
            ffn_norm1: norm(),
            ffn_norm2: norm(),
            adaln_modulation: modulated
                .then(|| AdaLnModulation::new(config.adaln_dim(), 4 * config.dim, device)),
            dim: config.dim,
            strategy: Ignored(config.execution),
        }
    }

    pub fn is_modulated(&self) -> bool {
        self.adaln_modulation.is_some()
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Hidden states [batch, seq_len, dim]
    /// * `mask` - True for real tokens [batch, seq_len]
    /// * `freqs` - Rotations for every token
    /// * `cond` - Timestep conditioning [batch, adaln_dim]; must be given
    ///   to modulated blocks and withheld from the others
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
        freqs: &RotaryFreqs<B>,
        cond: Option<Tensor<B, 2>>,
    ) -> Tensor<B, 3> {
        debug_assert_eq!(
            self.is_modulated(),
            cond.is_some(),
            "conditioning must be given exactly to modulated blocks"
        );
        match (&self.adaln_modulation, cond) {
            (Some(modulation), Some(cond)) => {
                let [batch, _seq, _dim] = x.dims();
                let dim = self.dim;
                let strategy = self.strategy.0;

                // Split into 4 parts: (scale_msa, gate_msa, scale_mlp, gate_mlp)
                let mod_out = modulation.forward(cond);
                let scale_msa = mod_out.clone().slice([0..batch, 0..dim]);
                let gate_msa = mod_out.clone().slice([0..batch, dim..2 * dim]);
                let scale_mlp = mod_out.clone().slice([0..batch, 2 * dim..3 * dim]);
                let gate_mlp = mod_out.slice([0..batch, 3 * dim..4 * dim]);

                let h = modulate(self.attention_norm1.forward(x.clone()), scale_msa, strategy);
                let h = self.attention_norm2.forward(self.attention.forward(h, mask, freqs));
                let x = x + gate_msa.tanh().unsqueeze_dim::<3>(1) * h;

                let h = modulate(self.ffn_norm1.forward(x.clone()), scale_mlp, strategy);
                let h = self.ffn_norm2.forward(self.feed_forward.forward(h));
                x + gate_mlp.tanh().unsqueeze_dim::<3>(1) * h
            }
            (None, _) | (Some(_), None) => {
                let h = self.attention_norm1.forward(x.clone());
                let h = self.attention_norm2.forward(self.attention.forward(h, mask, freqs));
                let x = x + h;

                let h = self.ffn_norm1.forward(x.clone());
                let h = self.ffn_norm2.forward(self.feed_forward.forward(h));
                x + h
            }
        }
    }
}

/// A sequence of joint transformer blocks sharing one mask and rotary table
#[derive(Module, Debug)]
pub struct TransformerStack<B: Backend> {
    blocks: Vec<JointTransformerBlock<B>>,
}

impl<B: Backend> TransformerStack<B> {
    pub fn new(config: &LuminaConfig, depth: usize, modulated: bool, device: &B::Device) -> Self {
        let blocks = (0..depth)
            .map(|_| JointTransformerBlock::new(config, modulated, device))
            .collect();
        Self { blocks }
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
        freqs: &RotaryFreqs<B>,
        cond: Option<Tensor<B, 2>>,
    ) -> Tensor<B, 3> {
        self.blocks.iter().fold(x, |x, block| {
            block.forward(x, mask.clone(), freqs, cond.clone())
        })
    }
}

/// Lumina DiT model
///
/// Matches the checkpoint structure: x_embedder, t_embedder, cap_embedder,
/// noise_refiner, context_refiner, layers, final_layer.
#[derive(Module, Debug)]
pub struct Lumina<B: Backend> {
    /// Patch projection [p * p * in_channels -> dim]
    x_embedder: Linear<B>,
    /// Timestep MLP: t_embedder.mlp.0/2
    t_embedder: TimestepEmbedder<B>,
    /// Caption projection: cap_embedder.0/1
    cap_embedder: CaptionEmbedder<B>,
    /// Timestep-modulated refiner over image tokens
    noise_refiner: TransformerStack<B>,
    /// Unmodulated refiner over caption tokens
    context_refiner: TransformerStack<B>,
    /// Main joint stack
    layers: TransformerStack<B>,
    final_layer: FinalLayer<B>,
    /// Layout logic and the shared rotary table (not a module parameter)
    packer: Ignored<SequencePacker>,
    /// Model configuration (not a module parameter)
    config: Ignored<LuminaConfig>,
}

impl<B: Backend> Lumina<B> {
    /// Initialize the model from a validated config
    pub fn new(config: &LuminaConfig, device: &B::Device) -> crate::Result<Self> {
        config.validate()?;

        let table = RotaryPositionTable::new(config.axes_dims, config.axes_lens, config.rope_theta)?;
        let packer = SequencePacker::new(
            RotaryEmbedder::new(table),
            config.patch_size,
            config.in_channels,
        );

        Ok(Self {
            x_embedder: xavier_linear(config.patch_dim(), config.dim, true, device),
            t_embedder: TimestepEmbedder::new(config.adaln_dim(), device),
            cap_embedder: CaptionEmbedder::new(config, device),
            noise_refiner: TransformerStack::new(config, config.n_refiner_layers, true, device),
            context_refiner: TransformerStack::new(config, config.n_refiner_layers, false, device),
            layers: TransformerStack::new(config, config.n_layers, true, device),
            final_layer: FinalLayer::new(config, device),
            packer: Ignored(packer),
            config: Ignored(config.clone()),
        })
    }

    /// Forward pass - predict the denoising target for every image
    ///
    /// # Arguments
    /// * `images` - Noisy latents, stacked or as a list of [C, H, W]
    /// * `t` - Diffusion timesteps [batch]
    /// * `cap_feats` - Caption encoder features [batch, cap_len, cap_feat_dim]
    /// * `cap_mask` - Caption validity [batch, cap_len]
    ///
    /// # Returns
    /// Predictions in the same list-or-stacked convention as `images`
    pub fn forward(
        &self,
        images: ImageBatch<B>,
        t: Tensor<B, 1>,
        cap_feats: Tensor<B, 3>,
        cap_mask: Tensor<B, 2, Bool>,
    ) -> crate::Result<ImageBatch<B>> {
        if images.is_empty() {
            return Err(LuminaError::EmptyBatch);
        }
        let [t_batch] = t.dims();
        if t_batch != images.len() {
            return Err(LuminaError::TimestepShapeMismatch {
                expected: images.len(),
                found: t_batch,
            });
        }
        let [feat_batch, feat_len, feat_dim] = cap_feats.dims();
        if feat_dim != self.config.0.cap_feat_dim {
            return Err(LuminaError::CaptionFeatureDim {
                expected: self.config.0.cap_feat_dim,
                found: feat_dim,
            });
        }

        // Embed timestep and captions
        let cond = self.t_embedder.forward(t);
        let cap_feats = if feat_len == 0 {
            Tensor::zeros([feat_batch, 0, self.config.0.dim], &cap_feats.device())
        } else {
            self.cap_embedder.forward(cap_feats)
        };

        // Refine and pack into one joint sequence
        let packed = self.packer.0.pack(images, cap_feats, cap_mask, cond.clone(), self)?;

        let x = self
            .layers
            .forward(packed.tokens, packed.mask, &packed.freqs, Some(cond.clone()));
        let x = self.final_layer.forward(x, cond);

        self.packer.0.unpack(x, &packed.layout)
    }

    /// Get model configuration
    pub fn config(&self) -> &LuminaConfig {
        &self.config.0
    }

    /// Sequence packer holding the shared rotary table
    pub fn packer(&self) -> &SequencePacker {
        &self.packer.0
    }
}

impl<B: Backend> PackStages<B> for Lumina<B> {
    fn embed_patches(&self, patches: Tensor<B, 3>) -> Tensor<B, 3> {
        self.x_embedder.forward(patches)
    }

    fn refine_image(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
        freqs: &RotaryFreqs<B>,
        cond: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        self.noise_refiner.forward(x, mask, freqs, Some(cond))
    }

    fn refine_caption(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
        freqs: &RotaryFreqs<B>,
    ) -> Tensor<B, 3> {
        self.context_refiner.forward(x, mask, freqs, None)
    }
}

impl LuminaConfig {
    /// Initialize the DiT model
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<Lumina<B>> {
        let model = Lumina::new(self, device)?;
        info!(
            dim = self.dim,
            layers = self.n_layers,
            refiner_layers = self.n_refiner_layers,
            heads = self.n_heads,
            kv_heads = self.kv_heads(),
            params = self.num_params(),
            "initialized Lumina"
        );
        Ok(model)
    }
}
