//! Joint self-attention for Lumina
//!
//! One attention layer serves caption tokens, image tokens and the packed joint
//! sequence alike: rotary embeddings carry the 3-axis positions and a padding
//! mask removes filler tokens from every softmax.
//!
//! Supports grouped-query attention and memory-efficient sliced attention.

use burn::module::{Ignored, Module};
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::activation::softmax;

use super::init::xavier_linear;
use super::normalization::QkNorm;
use super::rope::RotaryFreqs;
use crate::LuminaConfig;

/// Additive logit bias for padded keys. Finite, so a row without any valid key
/// becomes a uniform average instead of NaN.
const MASKED_LOGIT: f32 = -1.0e9;

/// Multi-head self-attention with RoPE and grouped-query key/value heads
///
/// Matches the checkpoint structure: attention.qkv, attention.out,
/// attention.q_norm, attention.k_norm.
#[derive(Module, Debug)]
pub struct JointAttention<B: Backend> {
    /// Fused query/key/value projection
    qkv: Linear<B>,
    /// Output projection
    out: Linear<B>,
    /// Optional per-head RMSNorm on queries and keys
    qk_norm: Option<QkNorm<B>>,
    /// Number of query heads
    n_heads: usize,
    /// Number of key/value heads
    n_kv_heads: usize,
    /// Head dimension
    head_dim: usize,
    /// Query chunk length for sliced attention
    slice_size: Ignored<Option<usize>>,
}

impl<B: Backend> JointAttention<B> {
    /// Create a new attention module
    pub fn new(config: &LuminaConfig, device: &B::Device) -> Self {
        let dim = config.dim;
        let n_heads = config.n_heads;
        let n_kv_heads = config.kv_heads();
        let head_dim = config.head_dim();

        Self {
            qkv: xavier_linear(dim, (n_heads + 2 * n_kv_heads) * head_dim, false, device),
            out: xavier_linear(n_heads * head_dim, dim, false, device),
            qk_norm: config
                .qk_norm
                .then(|| QkNorm::new(head_dim, 1e-6, device)),
            n_heads,
            n_kv_heads,
            head_dim,
            slice_size: Ignored(config.attention_slice_size),
        }
    }

    /// Number of query heads
    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Number of key/value heads
    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, dim]
    /// * `mask` - True for real tokens [batch, seq_len]
    /// * `freqs` - Rotations for every token
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
        freqs: &RotaryFreqs<B>,
    ) -> Tensor<B, 3> {
        let [batch, seq_len, _dim] = x.dims();
        let q_width = self.n_heads * self.head_dim;
        let kv_width = self.n_kv_heads * self.head_dim;

        let qkv = self.qkv.forward(x);
        let q = qkv.clone().slice([0..batch, 0..seq_len, 0..q_width]);
        let k = qkv
            .clone()
            .slice([0..batch, 0..seq_len, q_width..q_width + kv_width]);
        let v = qkv.slice([0..batch, 0..seq_len, q_width + kv_width..q_width + 2 * kv_width]);

        // [batch, seq_len, heads, head_dim]
        let q = q.reshape([batch, seq_len, self.n_heads, self.head_dim]);
        let k = k.reshape([batch, seq_len, self.n_kv_heads, self.head_dim]);
        let v = v.reshape([batch, seq_len, self.n_kv_heads, self.head_dim]);

        let (q, k) = match &self.qk_norm {
            Some(norm) => norm.forward(q, k),
            None => (q, k),
        };

        // Rotate queries and keys, never values
        let q = freqs.apply(q);
        let k = freqs.apply(k);

        let n_rep = self.n_heads / self.n_kv_heads;
        let k = repeat_kv(k, n_rep);
        let v = repeat_kv(v, n_rep);

        // [batch, heads, seq_len, head_dim]
        let q = q.swap_dims(1, 2);
        let k = k.swap_dims(1, 2);
        let v = v.swap_dims(1, 2);

        // [batch, 1, 1, seq_len]: 0 for real keys, MASKED_LOGIT for padding
        let bias = (mask.float() - 1.0).neg() * MASKED_LOGIT;
        let bias = bias.reshape([batch, 1, 1, seq_len]);

        let out = match self.slice_size.0 {
            Some(slice_size) if seq_len > slice_size => {
                self.sliced_attention(q, k, v, bias, slice_size)
            }
            _ => self.full_attention(q, k, v, bias),
        };

        // Reshape back to [batch, seq_len, heads * head_dim]
        let out = out
            .swap_dims(1, 2)
            .reshape([batch, seq_len, self.n_heads * self.head_dim]);

        self.out.forward(out)
    }

    fn scale(&self) -> f64 {
        (1.0 / self.head_dim as f64).sqrt()
    }

    /// Full attention computation
    fn full_attention(
        &self,
        q: Tensor<B, 4>,
        k: Tensor<B, 4>,
        v: Tensor<B, 4>,
        bias: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let attn = q.matmul(k.transpose()) * self.scale() + bias;
        let attn = softmax(attn, 3);
        attn.matmul(v)
    }

    /// Sliced attention computation (memory-efficient)
    ///
    /// Computes attention in query chunks against all keys to bound the size
    /// of the score matrix.
    fn sliced_attention(
        &self,
        q: Tensor<B, 4>,
        k: Tensor<B, 4>,
        v: Tensor<B, 4>,
        bias: Tensor<B, 4>,
        slice_size: usize,
    ) -> Tensor<B, 4> {
        let [batch, n_heads, seq_len, head_dim] = q.dims();
        let k_t = k.transpose();

        let outputs: Vec<Tensor<B, 4>> = (0..seq_len)
            .step_by(slice_size)
            .map(|start| {
                let end = (start + slice_size).min(seq_len);
                let q_slice = q
                    .clone()
                    .slice([0..batch, 0..n_heads, start..end, 0..head_dim]);
                let attn = q_slice.matmul(k_t.clone()) * self.scale() + bias.clone();
                softmax(attn, 3).matmul(v.clone())
            })
            .collect();

        Tensor::cat(outputs, 2)
    }
}

/// Repeat each key/value head `n_rep` times so every query head has a partner
///
/// Query head `h` pairs with key/value head `h / n_rep`.
///
/// # Arguments
/// * `x` - Keys or values [batch, seq_len, kv_heads, head_dim]
pub fn repeat_kv<B: Backend>(x: Tensor<B, 4>, n_rep: usize) -> Tensor<B, 4> {
    if n_rep == 1 {
        return x;
    }
    let [batch, seq_len, kv_heads, head_dim] = x.dims();
    x.unsqueeze_dim::<5>(3)
        .repeat_dim(3, n_rep)
        .reshape([batch, seq_len, kv_heads * n_rep, head_dim])
}
