//! Scripted backend for tests
//!
//! Byte-level vocabulary: ids 0..=255 are raw bytes, then BOS and EOS. After
//! a prompt ending in the assistant cue the logits spell out a fixed reply,
//! then EOS (or the reply again when looping).

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbImage;

use crate::inference::backend::{Backend, EvalContext, Token};
use crate::inference::error::EngineError;
use crate::inference::template::assistant_cue;
use crate::inference::vision::{ImageInput, NativeStatus};
use crate::types::{ContextConfig, InferenceParams, ModelInfo};

pub(crate) const BOS: Token = Token(256);
pub(crate) const EOS: Token = Token(257);
pub(crate) const VOCAB: usize = 258;
pub(crate) const EMBD: usize = 4;

/// Images this wide make the scripted projector fail
pub(crate) const FAILING_IMAGE_WIDTH: u32 = 13;

/// Positions every projected image occupies
pub(crate) const IMAGE_POSITIONS: u32 = 2;

#[derive(Default)]
struct Counters {
    live_contexts: AtomicUsize,
    contexts_created: AtomicUsize,
    evaluated_tokens: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    embedded_positions: AtomicUsize,
    native_samples: AtomicUsize,
    grammars: Mutex<Vec<String>>,
}

pub(crate) struct ScriptedBackend {
    info: ModelInfo,
    reply: Vec<u8>,
    looping: bool,
    fail_context: bool,
    native_sampler: bool,
    create_delay: Duration,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    pub(crate) fn new(reply: &str) -> Self {
        Self {
            info: ModelInfo {
                path: "scripted.gguf".into(),
                vocab_size: VOCAB as i32,
                embedding_dim: EMBD as i32,
                train_context_length: 4096,
                context_size: 4096,
                gpu_layers: 0,
                has_vision: false,
            },
            reply: reply.as_bytes().to_vec(),
            looping: false,
            fail_context: false,
            native_sampler: false,
            create_delay: Duration::ZERO,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Repeat the reply forever instead of ending with EOS
    pub(crate) fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub(crate) fn with_vision(mut self) -> Self {
        self.info.has_vision = true;
        self
    }

    pub(crate) fn failing_context(mut self) -> Self {
        self.fail_context = true;
        self
    }

    /// Sample inside the context instead of through the portable sampler
    pub(crate) fn with_native_sampler(mut self) -> Self {
        self.native_sampler = true;
        self
    }

    /// Context creation takes at least `delay`
    pub(crate) fn slow_contexts(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub(crate) fn live_contexts(&self) -> usize {
        self.counters.live_contexts.load(Ordering::SeqCst)
    }

    pub(crate) fn contexts_created(&self) -> usize {
        self.counters.contexts_created.load(Ordering::SeqCst)
    }

    pub(crate) fn evaluated_tokens(&self) -> usize {
        self.counters.evaluated_tokens.load(Ordering::SeqCst)
    }

    pub(crate) fn embedded_positions(&self) -> usize {
        self.counters.embedded_positions.load(Ordering::SeqCst)
    }

    pub(crate) fn native_samples(&self) -> usize {
        self.counters.native_samples.load(Ordering::SeqCst)
    }

    /// Grammars handed to the native sampler, in order
    pub(crate) fn grammars(&self) -> Vec<String> {
        self.counters
            .grammars
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.counters
            .batches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

impl Backend for ScriptedBackend {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn with_context(
        &self,
        config: &ContextConfig,
        job: &mut dyn FnMut(&mut dyn EvalContext),
    ) -> Result<(), EngineError> {
        if !self.create_delay.is_zero() {
            std::thread::sleep(self.create_delay);
        }
        if self.fail_context {
            return Err(EngineError::ContextFailure("scripted failure".into()));
        }
        self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        self.counters.live_contexts.fetch_add(1, Ordering::SeqCst);

        let mut ctx = ScriptedContext {
            config: config.clone(),
            reply: &self.reply,
            looping: self.looping,
            vision: self.info.has_vision,
            native_sampler: self.native_sampler,
            cue: assistant_cue().bytes().map(|b| Token(b as i32)).collect(),
            seen: Vec::new(),
            n_past: 0,
            cursor: usize::MAX,
            logits: Vec::new(),
            counters: &self.counters,
        };
        job(&mut ctx);

        self.counters.live_contexts.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedContext<'a> {
    config: ContextConfig,
    reply: &'a [u8],
    looping: bool,
    vision: bool,
    native_sampler: bool,
    cue: Vec<Token>,
    seen: Vec<Token>,
    n_past: u32,
    cursor: usize,
    logits: Vec<f32>,
    counters: &'a Counters,
}

impl ScriptedContext<'_> {
    fn next_target(&self) -> Token {
        if self.cursor < self.reply.len() {
            Token(self.reply[self.cursor] as i32)
        } else if self.looping && !self.reply.is_empty() && self.cursor != usize::MAX {
            Token(self.reply[self.cursor % self.reply.len()] as i32)
        } else {
            EOS
        }
    }

    fn check_positions(&self, start: u32, len: usize) -> Result<(), EngineError> {
        if start != self.n_past {
            return Err(EngineError::ContextFailure(format!(
                "evaluation at {start}, expected {}",
                self.n_past
            )));
        }
        if start as usize + len > self.config.context_size as usize {
            return Err(EngineError::ContextFailure("context is full".into()));
        }
        Ok(())
    }
}

/// Rows the scripted projector produces for `image`
fn project(image: &RgbImage) -> Result<u32, NativeStatus> {
    if image.width() == FAILING_IMAGE_WIDTH {
        return Err(NativeStatus(-2));
    }
    Ok(IMAGE_POSITIONS)
}

impl EvalContext for ScriptedContext<'_> {
    fn context_size(&self) -> u32 {
        self.config.context_size
    }

    fn batch_size(&self) -> u32 {
        self.config.batch_size
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| Token(b as i32)));
        Ok(tokens)
    }

    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        match u8::try_from(token.0) {
            Ok(byte) => Ok(vec![byte]),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOS
    }

    fn evaluate(&mut self, tokens: &[Token], start: u32) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.check_positions(start, tokens.len())?;
        if tokens.len() > self.config.batch_size as usize {
            return Err(EngineError::ContextFailure("batch too large".into()));
        }

        self.seen.extend_from_slice(tokens);
        self.n_past += tokens.len() as u32;
        self.cursor = if self.seen.ends_with(&self.cue) {
            0
        } else {
            self.cursor.saturating_add(tokens.len())
        };

        let mut logits: Vec<f32> = (0..VOCAB).map(|i| (i % 5) as f32 * 0.01).collect();
        if let Some(i) = self.next_target().index() {
            logits[i] += 10.0;
        }
        self.logits = logits;

        self.counters
            .evaluated_tokens
            .fetch_add(tokens.len(), Ordering::SeqCst);
        if let Ok(mut batches) = self.counters.batches.lock() {
            batches.push(tokens.len());
        }
        Ok(())
    }

    fn evaluate_image(&mut self, image: &ImageInput, start: u32) -> Result<u32, EngineError> {
        if !self.vision {
            return Err(EngineError::EmbedFailure(
                "model has no vision projector".into(),
            ));
        }
        let positions = project(image.pixels())?;
        self.check_positions(start, positions as usize)?;
        self.n_past += positions;
        self.logits.clear();
        self.counters
            .embedded_positions
            .fetch_add(positions as usize, Ordering::SeqCst);
        Ok(positions)
    }

    fn logits(&self) -> Result<&[f32], EngineError> {
        if self.logits.is_empty() {
            return Err(EngineError::ContextFailure("no logits available".into()));
        }
        Ok(&self.logits)
    }

    fn prepare_sampler(
        &mut self,
        params: &InferenceParams,
        _seed: u64,
        _recent: &[Token],
    ) -> Result<bool, EngineError> {
        if !self.native_sampler {
            return Ok(false);
        }
        if let Some(grammar) = &params.grammar {
            if let Ok(mut grammars) = self.counters.grammars.lock() {
                grammars.push(grammar.clone());
            }
        }
        Ok(true)
    }

    fn sample(&mut self) -> Result<Token, EngineError> {
        let logits = self.logits()?;
        let mut best = 0;
        for (i, &l) in logits.iter().enumerate() {
            if l > logits[best] {
                best = i;
            }
        }
        self.counters.native_samples.fetch_add(1, Ordering::SeqCst);
        Ok(Token(best as i32))
    }

    fn embeddings(&self) -> Result<Vec<f32>, EngineError> {
        if !self.config.embeddings {
            return Err(EngineError::ContextFailure(
                "context was not created for embeddings".into(),
            ));
        }
        let sum: i64 = self.seen.iter().map(|t| t.0 as i64).sum();
        Ok(vec![self.seen.len() as f32, (sum % 7) as f32, 1.0, 0.0])
    }

    fn save_state(&self, path: &Path, tokens: &[Token]) -> Result<(), EngineError> {
        if !self.seen.starts_with(tokens) {
            return Err(EngineError::State(
                "tokens are not held by the cache".into(),
            ));
        }
        let ids: Vec<i32> = tokens.iter().map(|t| t.0).collect();
        let bytes = serde_json::to_vec(&ids).map_err(|e| EngineError::State(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| EngineError::State(e.to_string()))
    }

    fn load_state(&mut self, path: &Path) -> Result<Vec<Token>, EngineError> {
        let bytes = std::fs::read(path).map_err(|e| EngineError::State(e.to_string()))?;
        let ids: Vec<i32> =
            serde_json::from_slice(&bytes).map_err(|e| EngineError::State(e.to_string()))?;
        if ids.len() > self.config.context_size as usize {
            return Err(EngineError::State(format!(
                "{} saved tokens exceed the context of {}",
                ids.len(),
                self.config.context_size
            )));
        }

        self.clear();
        self.seen = ids.into_iter().map(Token).collect();
        self.n_past = self.seen.len() as u32;
        Ok(self.seen.clone())
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.n_past = 0;
        self.cursor = usize::MAX;
        self.logits.clear();
    }
}

/// PNG encoded test image
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 40) as u8, (y * 40) as u8, 128])
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}
