//! Error types for Lumina model construction and forward passes.

use thiserror::Error;

/// Errors raised while validating configuration or packing a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LuminaError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("empty batch: at least one sample is required")]
    EmptyBatch,
    #[error(
        "image {index} has size {height}x{width}, which is not a multiple of patch size {patch_size}"
    )]
    PatchMisaligned {
        index: usize,
        height: usize,
        width: usize,
        patch_size: usize,
    },
    #[error("image {index} has {found} channels, expected {expected}")]
    ChannelMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error(
        "caption shape mismatch: features are [{feat_batch}, {feat_len}, _], mask is [{mask_batch}, {mask_len}], images {images}"
    )]
    CaptionShapeMismatch {
        feat_batch: usize,
        feat_len: usize,
        mask_batch: usize,
        mask_len: usize,
        images: usize,
    },
    #[error("caption features have width {found}, expected {expected}")]
    CaptionFeatureDim { expected: usize, found: usize },
    #[error("timestep batch {found} does not match image batch {expected}")]
    TimestepShapeMismatch { expected: usize, found: usize },
    #[error("position {position} on rotary axis {axis} is outside the table (length {limit})")]
    PositionOutOfRange {
        axis: usize,
        position: usize,
        limit: usize,
    },
    #[error("stacked output requires every image in the batch to share one size")]
    HeterogeneousBatch,
    #[error("batch has no caption or image tokens to attend to")]
    EmptySequence,
    #[error("failed to read tensor data: {0}")]
    TensorData(String),
}

pub type Result<T> = std::result::Result<T, LuminaError>;
