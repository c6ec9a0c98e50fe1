//! Native backend seam
//!
//! The generation loop only talks to the engine through these two traits.
//! [`Backend`] is the loaded model (shared, read-only after load) and
//! [`EvalContext`] is one evaluation context with its KV cache.
//!
//! A context only exists for the duration of [`Backend::with_context`], so it
//! can never outlive the weights it was created from.

use std::path::Path;

use crate::inference::error::EngineError;
use crate::inference::vision::ImageInput;
use crate::types::{ContextConfig, InferenceParams, ModelInfo};

/// Token id in the model vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub i32);

impl Token {
    /// Index into a logits row
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

/// A loaded model
pub trait Backend: Send + Sync + 'static {
    /// Metadata captured at load time
    fn info(&self) -> &ModelInfo;

    /// Creates a context, runs `job` against it, then frees it.
    ///
    /// Fails with [`EngineError::ContextFailure`] if the context cannot be
    /// created; `job` is not called in that case.
    fn with_context(
        &self,
        config: &ContextConfig,
        job: &mut dyn FnMut(&mut dyn EvalContext),
    ) -> Result<(), EngineError>;
}

/// One evaluation context. Not shared between threads.
pub trait EvalContext {
    /// Context window in tokens
    fn context_size(&self) -> u32;

    /// Maximum tokens per [`EvalContext::evaluate`] call
    fn batch_size(&self) -> u32;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError>;

    /// Raw bytes of a token's text piece
    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Evaluates `tokens` at positions `start..start + tokens.len()`.
    /// Logits are produced for the last token only.
    fn evaluate(&mut self, tokens: &[Token], start: u32) -> Result<(), EngineError>;

    /// Projects `image` with the model's vision projector and evaluates it
    /// from `start`. Returns the number of positions it occupies.
    ///
    /// Projector failures are reported as [`EngineError::EmbedFailure`].
    fn evaluate_image(&mut self, _image: &ImageInput, _start: u32) -> Result<u32, EngineError> {
        Err(EngineError::EmbedFailure(
            "model has no vision projector".into(),
        ))
    }

    /// Logits of the last evaluated token
    fn logits(&self) -> Result<&[f32], EngineError>;

    /// Builds the backend's own sampler for the coming turn.
    ///
    /// `recent` is the prompt, oldest first. Returns false when the backend
    /// has no sampler of its own; the portable one is used instead.
    fn prepare_sampler(
        &mut self,
        _params: &InferenceParams,
        _seed: u64,
        _recent: &[Token],
    ) -> Result<bool, EngineError> {
        Ok(false)
    }

    /// Picks and accepts the next token with the sampler built by
    /// [`EvalContext::prepare_sampler`]
    fn sample(&mut self) -> Result<Token, EngineError> {
        Err(EngineError::ContextFailure(
            "backend has no native sampler".into(),
        ))
    }

    /// Pooled embedding of sequence 0 (contexts created in embedding mode)
    fn embeddings(&self) -> Result<Vec<f32>, EngineError>;

    /// Writes the KV cache for `tokens` to `path`.
    /// `tokens` must be what the cache currently holds, from position 0.
    fn save_state(&self, path: &Path, tokens: &[Token]) -> Result<(), EngineError>;

    /// Restores a file written by [`EvalContext::save_state`], replacing the
    /// KV cache. Returns the tokens it holds.
    fn load_state(&mut self, path: &Path) -> Result<Vec<Token>, EngineError>;

    /// Drops the KV cache
    fn clear(&mut self);
}

/// Evaluates `tokens` in `batch_size` chunks starting at `start`.
///
/// Returns the position after the last evaluated token.
pub fn evaluate_chunked(
    ctx: &mut dyn EvalContext,
    tokens: &[Token],
    start: u32,
) -> Result<u32, EngineError> {
    let n_ctx = ctx.context_size();
    let end = start as usize + tokens.len();
    if end > n_ctx as usize {
        return Err(EngineError::ContextFailure(format!(
            "{} tokens do not fit in a context of {} (position {})",
            tokens.len(),
            n_ctx,
            start
        )));
    }

    let batch = ctx.batch_size().max(1) as usize;
    let mut pos = start;
    for chunk in tokens.chunks(batch) {
        ctx.evaluate(chunk, pos)?;
        pos += chunk.len() as u32;
    }
    Ok(pos)
}
