//! Text embeddings
//!
//! Runs the whole input through a short-lived context created in embedding
//! mode and returns the pooled vector of sequence 0.

use crate::inference::backend::{evaluate_chunked, EvalContext};
use crate::inference::error::EngineError;
use crate::inference::handle::ModelHandle;

/// Embeds `text` with the model behind `handle`.
///
/// The input must fit in one batch since pooling happens per decode call.
pub fn embed_text(
    handle: &ModelHandle,
    text: &str,
    normalize: bool,
) -> Result<Vec<f32>, EngineError> {
    let backend = handle.acquire()?;
    let mut config = handle.context_config();
    config.embeddings = true;

    let mut result = None;
    backend.with_context(&config, &mut |ctx| {
        result = Some(pooled_embedding(ctx, text));
    })?;

    let mut embedding = result
        .ok_or_else(|| EngineError::ContextFailure("embedding context did not run".into()))??;
    if normalize {
        l2_normalize(&mut embedding);
    }
    tracing::debug!("Embedded {} bytes into {} dims", text.len(), embedding.len());
    Ok(embedding)
}

fn pooled_embedding(ctx: &mut dyn EvalContext, text: &str) -> Result<Vec<f32>, EngineError> {
    let tokens = ctx.tokenize(text, true)?;
    if tokens.len() > ctx.batch_size() as usize {
        return Err(EngineError::ContextFailure(format!(
            "{} tokens exceed the batch size of {}",
            tokens.len(),
            ctx.batch_size()
        )));
    }
    evaluate_chunked(ctx, &tokens, 0)?;
    ctx.embeddings()
}

/// Scales `values` to unit length. Zero vectors are left alone.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}
