//! Backend and device selection based on features
//!
//! Gradient checkpointing comes from the autodiff backend: wrapping a backend
//! in [`CheckpointedBackend`] drops intermediate activations after the forward
//! pass and recomputes them during backpropagation.

use burn::backend::autodiff::checkpoint::strategy::BalancedCheckpointing;
use burn::backend::Autodiff;

/// Autodiff backend that recomputes activations instead of retaining them
pub type CheckpointedBackend<B> = Autodiff<B, BalancedCheckpointing>;

#[cfg(feature = "metal")]
mod selected {
    use half::bf16;

    /// Candle with BF16 to match the checkpoint weights
    pub type DefaultBackend = burn::backend::candle::Candle<bf16, i64>;
    pub type DefaultDevice = burn::backend::candle::CandleDevice;

    pub fn default_device() -> DefaultDevice {
        DefaultDevice::metal(0)
    }
}

#[cfg(all(feature = "cuda", not(feature = "metal")))]
mod selected {
    use half::bf16;

    /// Candle with BF16 to match the checkpoint weights
    pub type DefaultBackend = burn::backend::candle::Candle<bf16, i64>;
    pub type DefaultDevice = burn::backend::candle::CandleDevice;

    pub fn default_device() -> DefaultDevice {
        DefaultDevice::cuda(0)
    }
}

#[cfg(all(feature = "cpu", not(feature = "metal"), not(feature = "cuda")))]
mod selected {
    pub type DefaultBackend = burn::backend::ndarray::NdArray<f32>;
    pub type DefaultDevice = burn::backend::ndarray::NdArrayDevice;

    pub fn default_device() -> DefaultDevice {
        DefaultDevice::Cpu
    }
}

#[cfg(any(feature = "metal", feature = "cuda", feature = "cpu"))]
pub use selected::{default_device, DefaultBackend, DefaultDevice};
