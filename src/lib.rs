//! Lumina Image Diffusion Transformer in Burn
//!
//! Lumina is a Next-DiT diffusion transformer for text-to-image generation.
//! Captions and images of different lengths and sizes share one batch: both
//! are packed into a single padded, masked, position-tagged sequence and
//! unpacked again after the transformer.
//!
//! ## Architecture
//!
//! - **Packing**: variable-length caption and image tokens joined per sample
//! - **RoPE**: 3-axis rotary positions (caption index, patch row, patch column)
//! - **Refiners**: separate noise (image) and context (caption) stacks before joining
//! - **Blocks**: sandwich RMSNorm, grouped-query attention, SwiGLU feed-forward
//! - **Conditioning**: AdaLN scale and tanh gates from the diffusion timestep
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lumina_burn::{ImageBatch, LuminaBuilder, LuminaConfig};
//!
//! let model = LuminaBuilder::new(device)
//!     .with_config(LuminaConfig::lumina_2b())
//!     .with_weights("lumina_2b.safetensors")
//!     .build()?;
//!
//! // Images may differ in size when passed as a list
//! let out = model.forward(ImageBatch::List(latents), t, cap_feats, cap_mask)?;
//! ```

pub mod backend;
pub mod builder;
pub mod config;
pub mod error;
pub mod load;
pub mod modules;

// Re-export main types
pub use backend::CheckpointedBackend;
pub use builder::{BuildError, LuminaBuilder};
pub use config::{ExecutionStrategy, LuminaConfig};
pub use error::{LuminaError, Result};
pub use load::ModelLoadError;
pub use modules::dit::Lumina;
pub use modules::memory::{MemoryEstimate, MemoryProfile};
pub use modules::packing::{ImageBatch, OutputMode, PackLayout, SequencePacker};
pub use modules::rope::{RotaryEmbedder, RotaryPositionTable};
