//! Weight loading utilities for Lumina models.

use std::path::PathBuf;

use burn::{
    prelude::Backend,
    store::{BurnpackStore, ModuleStore, PyTorchToBurnAdapter, SafetensorsStore},
};
use thiserror::Error;
use tracing::debug;

use crate::modules::dit::Lumina;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Error while loading weights: {0}")]
    LoadError(String),
    #[error("Unrecognised file extension")]
    UnknownExtension,
}

/// Create a SafetensorsStore mapping Lumina-Image checkpoint keys
///
/// Maps from safetensors keys to Burn module structure:
/// - t_embedder.mlp.0/2 -> t_embedder.mlp.linear1/linear2
/// - cap_embedder.0/1 -> cap_embedder.norm/linear
/// - {noise_refiner,context_refiner,layers}.X -> {..}.blocks.X
/// - *.adaLN_modulation.1 -> *.adaln_modulation.linear
/// - x_embedder, final_layer.linear, attention.qkv/out, q_norm/k_norm,
///   feed_forward.w1/w2/w3, *_norm1/2 keep their names
fn create_safetensors_store(path: PathBuf) -> SafetensorsStore {
    SafetensorsStore::from_file(path)
        .with_from_adapter(PyTorchToBurnAdapter::default())
        // Timestep MLP
        .with_key_remapping(r"^t_embedder\.mlp\.0\.", "t_embedder.mlp.linear1.")
        .with_key_remapping(r"^t_embedder\.mlp\.2\.", "t_embedder.mlp.linear2.")
        // Caption embedder: Sequential(RMSNorm, Linear)
        .with_key_remapping(r"^cap_embedder\.0\.", "cap_embedder.norm.")
        .with_key_remapping(r"^cap_embedder\.1\.", "cap_embedder.linear.")
        // Block lists live inside a TransformerStack
        .with_key_remapping(
            r"^(noise_refiner|context_refiner|layers)\.(\d+)\.",
            "$1.blocks.$2.",
        )
        // Modulation: adaLN_modulation.1 -> adaln_modulation.linear (SiLU stripped)
        .with_key_remapping(r"\.adaLN_modulation\.1\.", ".adaln_modulation.linear.")
        // QK norm lives in an Option<QkNorm> wrapper
        .with_key_remapping(r"\.attention\.q_norm\.", ".attention.qk_norm.q_norm.")
        .with_key_remapping(r"\.attention\.k_norm\.", ".attention.qk_norm.k_norm.")
}

impl<B: Backend> Lumina<B> {
    /// Load weights and return self (builder pattern)
    pub fn with_weights(
        mut self,
        path: impl Into<PathBuf>,
    ) -> Result<Self, ModelLoadError> {
        self.load_weights(path)?;
        Ok(self)
    }

    /// Load weights from a file
    ///
    /// Supports:
    /// - `.safetensors` - Lumina-Image checkpoint layout
    /// - `.bpk` - Burn native format
    pub fn load_weights(&mut self, path: impl Into<PathBuf>) -> Result<(), ModelLoadError> {
        let path = path.into();
        let extension = path.extension().map(|s| s.to_string_lossy().to_lowercase());

        match extension.as_deref() {
            Some("safetensors") => {
                debug!(path = %path.display(), "loading weights from safetensors");
                let mut weights = create_safetensors_store(path);
                weights.apply_to(self)
                    .map_err(|e| ModelLoadError::LoadError(e.to_string()))?;
            }
            Some("bpk") | None => {
                debug!(path = %path.display(), "loading weights from bpk");
                let mut weights = BurnpackStore::from_file(path)
                    .auto_extension(false);
                weights.apply_to(self)
                    .map_err(|e| ModelLoadError::LoadError(e.to_string()))?;
            }
            _ => {
                return Err(ModelLoadError::UnknownExtension);
            }
        }

        Ok(())
    }

    /// Save weights in Burn's native format
    pub fn save_weights(&self, path: impl Into<PathBuf>) -> Result<(), ModelLoadError> {
        let path = path.into();
        debug!(path = %path.display(), "saving weights to bpk");
        let mut store = BurnpackStore::from_file(path).auto_extension(false);
        store
            .collect_from(self)
            .map_err(|e| ModelLoadError::LoadError(e.to_string()))
    }
}
