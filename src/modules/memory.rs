//! Memory planning for Lumina forward passes
//!
//! Attention score matrices dominate peak memory on long joint sequences.
//! Query-chunked attention bounds them; the profiles below pick a chunk size
//! and [`MemoryEstimate`] predicts what a batch will need.

use crate::LuminaConfig;

/// Attention slicing presets
///
/// Smaller slices use less memory but are slower:
/// - `Full`: no slicing (fastest, most memory)
/// - `High`: 2048 queries per chunk, 32GB+ VRAM
/// - `Medium`: 1024, 16-32GB VRAM
/// - `Low`: 512, under 16GB VRAM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryProfile {
    #[default]
    Full,
    High,
    Medium,
    Low,
}

impl MemoryProfile {
    /// Query chunk length, `None` for full attention
    pub fn attention_slice_size(self) -> Option<usize> {
        match self {
            Self::Full => None,
            Self::High => Some(2048),
            Self::Medium => Some(1024),
            Self::Low => Some(512),
        }
    }

    /// Copy of `config` using this profile's slicing
    pub fn apply(self, config: &LuminaConfig) -> LuminaConfig {
        config
            .clone()
            .with_attention_slice_size(self.attention_slice_size())
    }
}

/// Memory usage estimate for one forward pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEstimate {
    /// Model weights memory in bytes
    pub model_memory_bytes: usize,
    /// Peak activation memory in bytes
    pub peak_activation_bytes: usize,
    /// Attention score memory per layer in bytes
    pub attention_memory_per_layer: usize,
    /// Joint sequence length
    pub num_tokens: usize,
    /// Recommended attention slice size
    pub recommended_slice_size: usize,
}

impl MemoryEstimate {
    /// Estimate peak memory for a batch of `batch` samples packed to
    /// `num_tokens` joint tokens, with `elem_bytes` per element (2 for bf16)
    pub fn new(config: &LuminaConfig, batch: usize, num_tokens: usize, elem_bytes: usize) -> Self {
        let model_memory = config.num_params() * elem_bytes;

        // [batch, heads, queries, keys]
        let heads = config.n_heads;
        let queries = match config.attention_slice_size {
            Some(slice) if num_tokens > slice => slice,
            _ => num_tokens,
        };
        let attention_memory = batch * heads * queries * num_tokens * elem_bytes;

        // Q, K, V and the attention output, plus the FFN hidden activations
        let qkv_memory = 4 * batch * num_tokens * config.dim * elem_bytes;
        let ffn_memory = 2 * batch * num_tokens * config.ffn_hidden_dim() * elem_bytes;
        let per_layer = qkv_memory + attention_memory.max(ffn_memory);

        Self {
            model_memory_bytes: model_memory,
            peak_activation_bytes: per_layer,
            attention_memory_per_layer: attention_memory,
            num_tokens,
            recommended_slice_size: recommend_slice_size(heads, num_tokens),
        }
    }

    /// Total estimated memory in bytes
    pub fn total_bytes(&self) -> usize {
        self.model_memory_bytes + self.peak_activation_bytes
    }

    /// Total estimated memory in GB
    pub fn total_gb(&self) -> f64 {
        self.total_bytes() as f64 / 1e9
    }
}

/// Largest power-of-two slice in [256, 2048] keeping one layer's bf16 scores
/// under 2GB
pub fn recommend_slice_size(heads: usize, num_tokens: usize) -> usize {
    let per_query = (num_tokens * heads * 2).max(1);
    let recommended = (2_000_000_000 / per_query).clamp(256, 2048);

    let mut pow2 = 256;
    while pow2 * 2 <= recommended {
        pow2 *= 2;
    }
    pow2
}
