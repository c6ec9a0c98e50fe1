//! Model handle
//!
//! Owns the loaded weights. Session contexts take their own reference to the
//! backend, so releasing the handle never pulls the weights out from under a
//! running turn; memory is freed once the last context ends.

use std::sync::{Arc, RwLock};

use encoding_rs::Encoding;

use crate::inference::backend::Backend;
use crate::inference::error::EngineError;
use crate::inference::llama::LlamaCppBackend;
use crate::types::{ContextConfig, ModelInfo, ModelParams};

/// Handle to a loaded model
pub struct ModelHandle {
    backend: RwLock<Option<Arc<dyn Backend>>>,
    info: ModelInfo,
    context: ContextConfig,
    encoding: &'static Encoding,
    seed: u32,
}

impl ModelHandle {
    /// Loads GGUF weights through llama.cpp
    pub fn load(params: &ModelParams) -> Result<Self, EngineError> {
        let encoding = resolve_encoding(&params.encoding)?;
        let backend = LlamaCppBackend::load(params)?;
        Self::with_encoding(Arc::new(backend), params, encoding)
    }

    /// Wraps an already loaded backend
    pub fn from_backend(
        backend: Arc<dyn Backend>,
        params: &ModelParams,
    ) -> Result<Self, EngineError> {
        let encoding = resolve_encoding(&params.encoding)?;
        Self::with_encoding(backend, params, encoding)
    }

    fn with_encoding(
        backend: Arc<dyn Backend>,
        params: &ModelParams,
        encoding: &'static Encoding,
    ) -> Result<Self, EngineError> {
        if params.context_size == 0 {
            return Err(EngineError::LoadFailure(
                "context size must be greater than zero".into(),
            ));
        }
        let info = backend.info().clone();
        tracing::info!(
            "Model ready: {} ({} vocab, {} ctx, vision: {})",
            info.path,
            info.vocab_size,
            params.context_size,
            info.has_vision
        );
        Ok(Self {
            backend: RwLock::new(Some(backend)),
            info,
            context: params.context_config(),
            encoding,
            seed: params.seed,
        })
    }

    /// Shared reference to the backend, failing once the handle is released
    pub fn acquire(&self) -> Result<Arc<dyn Backend>, EngineError> {
        let guard = self.backend.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| EngineError::LoadFailure("model handle has been released".into()))
    }

    /// Releases the handle. Returns false if it was already released.
    pub fn release(&self) -> bool {
        let mut guard = self.backend.write().unwrap_or_else(|e| e.into_inner());
        let released = guard.take().is_some();
        if released {
            tracing::info!("Model handle released: {}", self.info.path);
        }
        released
    }

    pub fn is_released(&self) -> bool {
        self.backend
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Configuration session contexts are created with
    pub fn context_config(&self) -> ContextConfig {
        self.context.clone()
    }

    /// Encoding used to decode token bytes
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Default sampling seed from the load parameters (0 = random)
    pub fn default_seed(&self) -> u32 {
        self.seed
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn resolve_encoding(label: &str) -> Result<&'static Encoding, EngineError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| EngineError::LoadFailure(format!("unknown text encoding '{label}'")))
}
