//! Feed-forward network for Lumina
//!
//! Uses SwiGLU activation (gated linear unit with Swish/SiLU).
//! Matches the checkpoint naming: feed_forward.w1, w2, w3

use burn::module::{Ignored, Module};
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::activation::silu;

use super::init::xavier_linear;
use crate::config::ExecutionStrategy;
use crate::LuminaConfig;

/// SwiGLU Feed-Forward Network
///
/// FFN(x) = w2 * (SiLU(w1 * x) * w3 * x)
///
/// - w1: gate projection [dim -> hidden]
/// - w2: down projection [hidden -> dim]
/// - w3: up projection [dim -> hidden]
///
/// `Fused` groups the gate and up projections into one matmul; it does not
/// reduce the arithmetic.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// Gate projection
    w1: Linear<B>,
    /// Down projection
    w2: Linear<B>,
    /// Up projection
    w3: Linear<B>,
    strategy: Ignored<ExecutionStrategy>,
}

impl<B: Backend> FeedForward<B> {
    /// Create a new SwiGLU feed-forward network
    pub fn new(config: &LuminaConfig, device: &B::Device) -> Self {
        Self::with_hidden(config.dim, config.ffn_hidden_dim(), config.execution, device)
    }

    /// Create a network with an explicit hidden width
    pub fn with_hidden(
        dim: usize,
        hidden: usize,
        strategy: ExecutionStrategy,
        device: &B::Device,
    ) -> Self {
        Self {
            w1: xavier_linear(dim, hidden, false, device),
            w2: xavier_linear(hidden, dim, false, device),
            w3: xavier_linear(dim, hidden, false, device),
            strategy: Ignored(strategy),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, dim]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = match self.strategy.0 {
            ExecutionStrategy::Eager => {
                let gate = silu(self.w1.forward(x.clone()));
                let up = self.w3.forward(x);
                gate * up
            }
            ExecutionStrategy::Fused => {
                // One wider matmul against [w1 | w3], then split. The join
                // runs per call as w1 and w3 load as separate tensors.
                let weight = Tensor::cat(vec![self.w1.weight.val(), self.w3.weight.val()], 1);
                let [batch, seq_len, _] = x.dims();
                let [_, width] = weight.dims();
                let hidden = width / 2;
                let projected = x.matmul(weight.unsqueeze::<3>());
                let gate = projected.clone().slice([0..batch, 0..seq_len, 0..hidden]);
                let up = projected.slice([0..batch, 0..seq_len, hidden..width]);
                silu(gate) * up
            }
        };
        self.w2.forward(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_ffn_shape() {
        let device = Default::default();
        let config = LuminaConfig::tiny();
        let ffn = FeedForward::<TestBackend>::new(&config, &device);
        let x = Tensor::<TestBackend, 3>::ones([2, 5, config.dim], &device);
        assert_eq!(ffn.forward(x).dims(), [2, 5, config.dim]);
    }

    #[test]
    fn test_fused_matches_eager() {
        let device = Default::default();
        let eager = FeedForward::<TestBackend>::with_hidden(16, 48, ExecutionStrategy::Eager, &device);
        let fused = FeedForward {
            strategy: Ignored(ExecutionStrategy::Fused),
            ..eager.clone()
        };

        let x = Tensor::<TestBackend, 3>::random(
            [2, 3, 16],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let diff: f32 = (eager.forward(x.clone()) - fused.forward(x))
            .abs()
            .max()
            .into_scalar();
        assert!(diff < 1e-4, "diff = {diff}");
    }
}
