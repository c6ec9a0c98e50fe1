//! llama.cpp backend
//!
//! Implements [`Backend`] on top of `llama-cpp-2`. The native backend is
//! initialised once per process. Each session gets its own `LlamaContext`
//! created inside [`Backend::with_context`] on the session's worker thread.
//!
//! The vision projector (`mtmd`) is not thread-safe, so it is checked once at
//! load and then opened lazily per context, on the worker that owns it.

use std::ffi::CString;
use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::{LlamaContextParams, LlamaPoolingType};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdEvalError,
    MtmdInputText,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::logit_bias::LlamaLogitBias;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::inference::backend::{Backend, EvalContext, Token};
use crate::inference::error::EngineError;
use crate::inference::model::validate_gguf;
use crate::inference::sampling::penalty_window;
use crate::inference::vision::{ImageInput, NativeStatus};
use crate::types::{ContextConfig, InferenceParams, ModelInfo, ModelParams};

static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn llama_backend() -> Result<&'static LlamaBackend, EngineError> {
    LLAMA_BACKEND.get_or_try_init(|| {
        llama_cpp_2::send_logs_to_tracing(llama_cpp_2::LogOptions::default());
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::LoadFailure(format!("backend init: {e}")))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

fn projector_params(use_gpu: bool, threads: Option<i32>) -> Result<MtmdContextParams, EngineError> {
    let mut params = MtmdContextParams {
        use_gpu,
        print_timings: false,
        media_marker: CString::new(mtmd_default_marker())
            .map_err(|e| EngineError::EmbedFailure(e.to_string()))?,
        ..MtmdContextParams::default()
    };
    if let Some(threads) = threads {
        params.n_threads = threads;
    }
    Ok(params)
}

/// Model weights loaded through llama.cpp
pub struct LlamaCppBackend {
    model: LlamaModel,
    info: ModelInfo,
    mmproj: Option<String>,
}

impl LlamaCppBackend {
    pub fn load(params: &ModelParams) -> Result<Self, EngineError> {
        let metadata = validate_gguf(&params.path)?;
        tracing::debug!(
            "GGUF v{} with {} tensors: {:?}",
            metadata.version,
            metadata.tensor_count,
            params.path
        );

        let backend = llama_backend()?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(backend, &params.path, &model_params)
            .map_err(|e| EngineError::LoadFailure(e.to_string()))?;

        let mmproj = match &params.mmproj_path {
            Some(path) => Some(check_projector(&model, path, params)?),
            None => None,
        };

        let info = ModelInfo {
            path: params.path.to_string_lossy().to_string(),
            vocab_size: model.n_vocab(),
            embedding_dim: model.n_embd(),
            train_context_length: model.n_ctx_train(),
            context_size: params.context_size,
            gpu_layers: params.gpu_layers,
            has_vision: mmproj.is_some(),
        };

        if params.context_size > info.train_context_length {
            tracing::warn!(
                "Context size {} exceeds training context {}",
                params.context_size,
                info.train_context_length
            );
        }
        tracing::info!(
            "Model loaded: {} ({} vocab, {} embd, {} train ctx)",
            info.path,
            info.vocab_size,
            info.embedding_dim,
            info.train_context_length
        );

        Ok(Self {
            model,
            info,
            mmproj,
        })
    }
}

/// Opens the projector once to make sure it fits the model and handles images
fn check_projector(
    model: &LlamaModel,
    path: &Path,
    params: &ModelParams,
) -> Result<String, EngineError> {
    validate_gguf(path)?;
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::LoadFailure(format!("projector path {path:?} is not UTF-8")))?;

    let projector = MtmdContext::init_from_file(
        path_str,
        model,
        &projector_params(params.gpu_layers > 0, params.threads)?,
    )
    .map_err(|e| EngineError::LoadFailure(format!("vision projector: {e}")))?;
    if !projector.support_vision() {
        return Err(EngineError::LoadFailure(format!(
            "{path:?} is not a vision projector"
        )));
    }
    tracing::info!("Vision projector loaded: {:?}", path);
    Ok(path_str.to_string())
}

impl Backend for LlamaCppBackend {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn with_context(
        &self,
        config: &ContextConfig,
        job: &mut dyn FnMut(&mut dyn EvalContext),
    ) -> Result<(), EngineError> {
        let backend = llama_backend()?;
        let n_ctx = NonZeroU32::new(config.context_size)
            .ok_or_else(|| EngineError::ContextFailure("context size must be > 0".into()))?;
        let batch_size = config.batch_size.clamp(1, config.context_size);

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(batch_size)
            .with_embeddings(config.embeddings);
        if config.embeddings {
            ctx_params = ctx_params
                .with_n_ubatch(batch_size)
                .with_pooling_type(LlamaPoolingType::Mean);
        }
        if let Some(threads) = config.threads {
            ctx_params = ctx_params
                .with_n_threads(threads)
                .with_n_threads_batch(threads);
        }

        let ctx = self
            .model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextFailure(e.to_string()))?;
        tracing::debug!("Created llama context (n_ctx {}, n_batch {})", n_ctx, batch_size);

        let mut eval = LlamaEvalContext {
            model: &self.model,
            ctx,
            batch_size,
            logits_index: None,
            mmproj: self.mmproj.as_deref(),
            projector: None,
            use_gpu: self.info.gpu_layers > 0,
            threads: config.threads,
            sampler: None,
        };
        job(&mut eval);
        Ok(())
    }
}

struct LlamaEvalContext<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    batch_size: u32,
    logits_index: Option<i32>,
    mmproj: Option<&'a str>,
    projector: Option<MtmdContext>,
    use_gpu: bool,
    threads: Option<i32>,
    sampler: Option<LlamaSampler>,
}

impl LlamaEvalContext<'_> {
    fn open_projector(&mut self) -> Result<(), EngineError> {
        if self.projector.is_none() {
            let path = self.mmproj.ok_or_else(|| {
                EngineError::EmbedFailure("model has no vision projector".into())
            })?;
            let params = projector_params(self.use_gpu, self.threads)?;
            let projector = MtmdContext::init_from_file(path, self.model, &params)
                .map_err(|e| EngineError::EmbedFailure(format!("vision projector: {e}")))?;
            tracing::debug!("Opened vision projector for this context");
            self.projector = Some(projector);
        }
        Ok(())
    }

    fn build_sampler(
        &self,
        params: &InferenceParams,
        seed: u64,
    ) -> Result<LlamaSampler, EngineError> {
        let n_vocab = self.model.n_vocab();
        let mut chain = Vec::new();

        let biases: Vec<LlamaLogitBias> = params
            .logit_bias
            .iter()
            .filter(|&(&id, _)| (0..n_vocab).contains(&id))
            .map(|(&id, &bias)| LlamaLogitBias::new(LlamaToken::new(id), bias))
            .collect();
        if !biases.is_empty() {
            chain.push(LlamaSampler::logit_bias(n_vocab, &biases));
        }
        chain.push(LlamaSampler::penalties(
            params.repeat_last_n,
            params.repeat_penalty,
            params.frequency_penalty,
            params.presence_penalty,
        ));
        if let Some(grammar) = &params.grammar {
            let grammar = LlamaSampler::grammar(self.model, grammar, "root")
                .map_err(|e| EngineError::Grammar(e.to_string()))?;
            chain.push(grammar);
        }

        if params.temperature <= 0.0 {
            chain.push(LlamaSampler::greedy());
        } else {
            chain.extend([
                LlamaSampler::top_k(params.top_k as i32),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::min_p(params.min_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(seed as u32),
            ]);
        }
        Ok(LlamaSampler::chain_simple(chain))
    }
}

impl EvalContext for LlamaEvalContext<'_> {
    fn context_size(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn batch_size(&self) -> u32 {
        self.batch_size
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::ContextFailure(format!("tokenize: {e}")))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn token_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken::new(token.0), Special::Tokenize)
            .map_err(|e| EngineError::ContextFailure(format!("detokenize: {e}")))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken::new(token.0))
    }

    fn evaluate(&mut self, tokens: &[Token], start: u32) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Ok(());
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            let pos = i32::try_from(start as usize + i)
                .map_err(|_| EngineError::ContextFailure("position out of range".into()))?;
            batch
                .add(LlamaToken::new(token.0), pos, &[0], i == last)
                .map_err(|e| EngineError::ContextFailure(format!("batch: {e}")))?;
        }

        self.logits_index = None;
        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::ContextFailure(format!("decode: {e}")))?;
        self.logits_index = Some(batch.n_tokens() - 1);
        Ok(())
    }

    fn evaluate_image(&mut self, image: &ImageInput, start: u32) -> Result<u32, EngineError> {
        let bitmap = MtmdBitmap::from_image_data(image.width(), image.height(), image.as_rgb())
            .map_err(|e| EngineError::EmbedFailure(format!("bitmap: {e}")))?;
        let n_ctx = self.ctx.n_ctx();
        let n_batch = self.batch_size as i32;
        let start_pos = i32::try_from(start)
            .map_err(|_| EngineError::ContextFailure("position out of range".into()))?;

        self.open_projector()?;
        let projector = self
            .projector
            .as_ref()
            .ok_or_else(|| EngineError::EmbedFailure("vision projector unavailable".into()))?;
        let chunks = projector
            .tokenize(
                MtmdInputText {
                    text: mtmd_default_marker().to_string(),
                    add_special: false,
                    parse_special: true,
                },
                &[&bitmap],
            )
            .map_err(|e| EngineError::EmbedFailure(format!("image tokenize: {e}")))?;

        let positions = u32::try_from(chunks.total_positions()).unwrap_or(0);
        if start as u64 + positions as u64 > n_ctx as u64 {
            return Err(EngineError::ContextFailure(format!(
                "image needs {positions} positions at {start}, context is {n_ctx}"
            )));
        }

        let end = chunks
            .eval_chunks(projector, &self.ctx, start_pos, 0, n_batch, true)
            .map_err(|MtmdEvalError::EvalFailure(code)| EngineError::from(NativeStatus(code)))?;
        self.logits_index = None;

        let used = u32::try_from(end - start_pos)
            .map_err(|_| EngineError::EmbedFailure("projector moved backwards".into()))?;
        tracing::debug!("Evaluated {}x{} image as {} positions", image.width(), image.height(), used);
        Ok(used)
    }

    fn logits(&self) -> Result<&[f32], EngineError> {
        let index = self
            .logits_index
            .ok_or_else(|| EngineError::ContextFailure("no logits available".into()))?;
        Ok(self.ctx.get_logits_ith(index))
    }

    fn prepare_sampler(
        &mut self,
        params: &InferenceParams,
        seed: u64,
        recent: &[Token],
    ) -> Result<bool, EngineError> {
        self.sampler = None;
        let mut sampler = self.build_sampler(params, seed)?;
        // a grammar only accepts what it generated itself
        if params.grammar.is_none() {
            let window = penalty_window(recent, params.repeat_last_n);
            sampler.accept_many(window.iter().map(|t| LlamaToken::new(t.0)));
        }
        self.sampler = Some(sampler);
        Ok(true)
    }

    fn sample(&mut self) -> Result<Token, EngineError> {
        let index = self
            .logits_index
            .ok_or_else(|| EngineError::ContextFailure("no logits available".into()))?;
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| EngineError::ContextFailure("sampler was not prepared".into()))?;
        Ok(Token(sampler.sample(&self.ctx, index).0))
    }

    fn embeddings(&self) -> Result<Vec<f32>, EngineError> {
        self.ctx
            .embeddings_seq_ith(0)
            .map(|e| e.to_vec())
            .map_err(|e| EngineError::ContextFailure(format!("embeddings: {e}")))
    }

    fn save_state(&self, path: &Path, tokens: &[Token]) -> Result<(), EngineError> {
        let tokens: Vec<LlamaToken> = tokens.iter().map(|t| LlamaToken::new(t.0)).collect();
        self.ctx
            .save_session_file(path, &tokens)
            .map_err(|e| EngineError::State(format!("save {path:?}: {e}")))
    }

    fn load_state(&mut self, path: &Path) -> Result<Vec<Token>, EngineError> {
        self.clear();
        let n_ctx = self.ctx.n_ctx() as usize;
        let tokens = self
            .ctx
            .load_session_file(path, n_ctx)
            .map_err(|e| EngineError::State(format!("load {path:?}: {e}")))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn clear(&mut self) {
        self.ctx.clear_kv_cache();
        self.logits_index = None;
    }
}
