//! Builder for a ready-to-run Lumina model

use std::path::PathBuf;

use burn::prelude::*;

use crate::config::{ExecutionStrategy, LuminaConfig};
use crate::error::LuminaError;
use crate::load::ModelLoadError;
use crate::modules::dit::Lumina;
use crate::modules::memory::MemoryProfile;

/// Builder for Lumina
///
/// Execution strategy and attention slicing reach every sub-module through the
/// config at construction time.
pub struct LuminaBuilder<B: Backend> {
    config: LuminaConfig,
    execution: Option<ExecutionStrategy>,
    memory: Option<MemoryProfile>,
    weights: Option<PathBuf>,
    device: B::Device,
}

impl<B: Backend> LuminaBuilder<B> {
    /// Create a new builder with the default configuration
    pub fn new(device: B::Device) -> Self {
        Self {
            config: LuminaConfig::default(),
            execution: None,
            memory: None,
            weights: None,
            device,
        }
    }

    /// Set model configuration
    pub fn with_config(mut self, config: LuminaConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the execution strategy
    pub fn with_execution(mut self, execution: ExecutionStrategy) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Override attention slicing with a memory profile
    pub fn with_memory_profile(mut self, profile: MemoryProfile) -> Self {
        self.memory = Some(profile);
        self
    }

    /// Set weights path (`.safetensors` or `.bpk`)
    pub fn with_weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights = Some(path.into());
        self
    }

    /// Final configuration after overrides
    pub fn config(&self) -> LuminaConfig {
        let mut config = self.config.clone();
        if let Some(execution) = self.execution {
            config = config.with_execution(execution);
        }
        if let Some(profile) = self.memory {
            config = profile.apply(&config);
        }
        config
    }

    /// Build the model
    pub fn build(self) -> Result<Lumina<B>, BuildError> {
        let mut model = self.config().init(&self.device)?;

        if let Some(path) = self.weights {
            model.load_weights(path)?;
        }

        Ok(model)
    }
}

/// Model build errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Invalid model: {0}")]
    Model(#[from] LuminaError),
    #[error("Failed to load weights: {0}")]
    Weights(#[from] ModelLoadError),
}
