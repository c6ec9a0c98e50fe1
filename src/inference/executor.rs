//! Generation loop
//!
//! Runs one turn on the session's worker thread:
//!
//! ```text
//! Evaluating -> Sampling -> Emitting -> Evaluating ...
//!                  |            |
//!                  +--> Stopped <+
//! ```
//!
//! Cancellation is observed at the top of every `Evaluating` step and while
//! waiting for the consumer to take a fragment. The terminal event is sent
//! after the turn's finish hook has run, so the session is idle again by the
//! time the caller sees it.

use std::path::Path;
use std::time::Instant;

use encoding_rs::Encoding;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::inference::backend::{evaluate_chunked, EvalContext, Token};
use crate::inference::error::EngineError;
use crate::inference::sampling::Sampler;
use crate::inference::stop::{should_stop, StopCheck, StopDetector};
use crate::inference::streaming::{StopReason, StreamToken, TokenDecoder, TurnSummary};
use crate::inference::vision::ImageInput;
use crate::types::{AntipromptMatch, InferenceParams};

/// Called on the worker thread when a turn ends, before the terminal event
pub type FinishHook = Box<dyn FnOnce(&TurnOutcome) + Send>;

/// How a turn ended
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Everything emitted to the caller
    pub text: String,
    pub result: Result<TurnSummary, EngineError>,
}

impl TurnOutcome {
    /// Whether the turn produced a complete reply worth recording
    pub fn is_complete(&self) -> bool {
        matches!(&self.result, Ok(summary) if summary.reason != StopReason::Cancelled)
    }
}

pub(crate) struct Turn {
    pub prompt: String,
    pub image: Option<ImageInput>,
    pub params: InferenceParams,
    pub seed: u64,
    pub encoding: &'static Encoding,
    pub cancel: CancellationToken,
    pub shutdown: CancellationToken,
    pub events: mpsc::Sender<StreamToken>,
    pub on_finish: Option<FinishHook>,
}

/// Tokens currently held in the KV cache
#[derive(Debug, Default)]
pub(crate) struct EvaluatedPrefix {
    tokens: Vec<Token>,
    image_positions: u32,
}

impl EvaluatedPrefix {
    fn n_past(&self) -> u32 {
        self.image_positions + self.tokens.len() as u32
    }

    /// Whether `prompt` continues what is already cached
    fn extends(&self, prompt: &[Token]) -> bool {
        self.image_positions == 0
            && !self.tokens.is_empty()
            && prompt.len() > self.tokens.len()
            && prompt.starts_with(&self.tokens)
    }

    pub(crate) fn clear(&mut self) {
        self.tokens.clear();
        self.image_positions = 0;
    }

    /// Writes the cached tokens and their KV state to `path`.
    /// Returns the number of tokens saved.
    pub(crate) fn save(&self, ctx: &dyn EvalContext, path: &Path) -> Result<usize, EngineError> {
        if self.image_positions > 0 {
            return Err(EngineError::State(
                "the cache holds an image and cannot be saved".into(),
            ));
        }
        ctx.save_state(path, &self.tokens)?;
        Ok(self.tokens.len())
    }

    /// Replaces the cache with the state saved at `path`.
    /// Returns the number of tokens restored.
    pub(crate) fn load(
        &mut self,
        ctx: &mut dyn EvalContext,
        path: &Path,
    ) -> Result<usize, EngineError> {
        self.clear();
        match ctx.load_state(path) {
            Ok(tokens) => {
                self.tokens = tokens;
                Ok(self.tokens.len())
            }
            Err(e) => {
                ctx.clear();
                Err(e)
            }
        }
    }
}

/// Where the next token comes from
enum TurnSampler {
    /// The backend's own sampler, prepared for this turn
    Native,
    Portable(Sampler),
}

impl TurnSampler {
    fn prepare(
        ctx: &mut dyn EvalContext,
        params: &InferenceParams,
        seed: u64,
        recent: &[Token],
    ) -> Result<Self, EngineError> {
        if ctx.prepare_sampler(params, seed, recent)? {
            return Ok(TurnSampler::Native);
        }
        if params.grammar.is_some() {
            return Err(EngineError::Grammar(
                "this backend cannot constrain sampling with a grammar".into(),
            ));
        }
        Ok(TurnSampler::Portable(Sampler::new(params, seed)))
    }

    fn next(&mut self, ctx: &mut dyn EvalContext, recent: &[Token]) -> Result<Token, EngineError> {
        match self {
            TurnSampler::Native => ctx.sample(),
            TurnSampler::Portable(sampler) => sampler.sample(ctx.logits()?, recent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Evaluating,
    Sampling,
    Emitting(Token),
}

enum Delivery {
    Sent,
    Stopped,
}

struct Emitter {
    events: mpsc::Sender<StreamToken>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl Emitter {
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// Sends a fragment, waiting for the consumer unless the turn is cancelled
    fn fragment(&self, text: String) -> Delivery {
        if text.is_empty() {
            return Delivery::Sent;
        }
        if self.cancel.is_cancelled() {
            return Delivery::Stopped;
        }
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Delivery::Stopped,
                sent = self.events.send(StreamToken::Token(text)) => match sent {
                    Ok(()) => Delivery::Sent,
                    Err(_) => Delivery::Stopped,
                },
            }
        })
    }

    /// Sends the terminal event. Only a context shutdown with a stalled
    /// consumer abandons it.
    fn terminal(&self, event: StreamToken) {
        let event = match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(event)) => event,
        };
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("Context shutting down, terminal event dropped");
                }
                _ = self.events.send(event) => {}
            }
        })
    }
}

#[derive(Default)]
struct Generation {
    text: String,
    prompt_tokens: usize,
    reused_tokens: usize,
    generated: usize,
}

impl Generation {
    fn emit(&mut self, emitter: &Emitter, text: String) -> Delivery {
        let before = self.text.len();
        self.text.push_str(&text);
        let delivery = emitter.fragment(text);
        if let Delivery::Stopped = delivery {
            self.text.truncate(before);
        }
        delivery
    }

    /// Emits whatever is still buffered once generation ends without a match
    fn flush(
        &mut self,
        emitter: &Emitter,
        detector: &mut StopDetector,
        decoder: &mut TokenDecoder,
        reason: StopReason,
    ) -> StopReason {
        let mut rest = detector.finish();
        rest.push_str(&decoder.finish());
        match self.emit(emitter, rest) {
            Delivery::Sent => reason,
            Delivery::Stopped => StopReason::Cancelled,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        ctx: &mut dyn EvalContext,
        prefix: &mut EvaluatedPrefix,
        prompt: &str,
        image: Option<ImageInput>,
        params: &InferenceParams,
        seed: u64,
        encoding: &'static Encoding,
        emitter: &Emitter,
    ) -> Result<StopReason, EngineError> {
        let tokens = ctx.tokenize(prompt, true)?;
        self.prompt_tokens = tokens.len();

        let mut detector = match params.antiprompt_match {
            AntipromptMatch::Text => StopDetector::new(&params.antiprompts),
            AntipromptMatch::Tokens => {
                let mut sequences = Vec::with_capacity(params.antiprompts.len());
                for antiprompt in params.antiprompts.iter().filter(|a| !a.is_empty()) {
                    sequences.push((antiprompt.clone(), ctx.tokenize(antiprompt, false)?));
                }
                StopDetector::with_token_sequences(sequences)
            }
        };

        if image.is_none() && prefix.extends(&tokens) {
            self.reused_tokens = prefix.tokens.len();
            tracing::debug!("Reusing {} cached prompt tokens", self.reused_tokens);
        } else {
            ctx.clear();
            prefix.clear();
        }

        if params.token_limit() == Some(0) {
            return Ok(StopReason::MaxTokens);
        }

        let mut pending: Vec<Token> = tokens[prefix.tokens.len()..].to_vec();
        let mut recent = tokens;
        let mut image = image;
        let mut sampler = TurnSampler::prepare(ctx, params, seed, &recent)?;
        let mut decoder = TokenDecoder::new(encoding);

        let mut state = LoopState::Evaluating;
        loop {
            tracing::trace!(?state, generated = self.generated, "generation step");
            state = match state {
                LoopState::Evaluating => {
                    if emitter.is_cancelled() {
                        return Ok(StopReason::Cancelled);
                    }
                    if let Some(image) = image.take() {
                        let used = ctx.evaluate_image(&image, prefix.n_past())?;
                        prefix.image_positions += used;
                        tracing::debug!("Image evaluated into {} positions", used);
                    }
                    evaluate_chunked(ctx, &pending, prefix.n_past())?;
                    prefix.tokens.append(&mut pending);
                    LoopState::Sampling
                }
                LoopState::Sampling => {
                    let token = sampler.next(ctx, &recent)?;
                    if ctx.is_end_of_generation(token) {
                        return Ok(self.flush(
                            emitter,
                            &mut detector,
                            &mut decoder,
                            StopReason::EndOfSequence,
                        ));
                    }
                    self.generated += 1;
                    recent.push(token);
                    LoopState::Emitting(token)
                }
                LoopState::Emitting(token) => {
                    let bytes = ctx.token_bytes(token)?;
                    let piece = decoder.push(&bytes);
                    match detector.push(token, &piece) {
                        StopCheck::Stop { emit, matched } => {
                            return Ok(match self.emit(emitter, emit) {
                                Delivery::Sent => StopReason::AntiPrompt(matched),
                                Delivery::Stopped => StopReason::Cancelled,
                            });
                        }
                        StopCheck::Continue(text) => {
                            if let Delivery::Stopped = self.emit(emitter, text) {
                                return Ok(StopReason::Cancelled);
                            }
                        }
                    }
                    // Emitted text never ends in a text-policy anti-prompt,
                    // so only the budget can stop the turn here.
                    if should_stop(&self.text, self.generated, params) {
                        return Ok(self.flush(
                            emitter,
                            &mut detector,
                            &mut decoder,
                            StopReason::MaxTokens,
                        ));
                    }
                    pending.push(token);
                    LoopState::Evaluating
                }
            };
        }
    }
}

/// Runs `turn` to completion on the calling (worker) thread
pub(crate) fn run_turn(ctx: &mut dyn EvalContext, prefix: &mut EvaluatedPrefix, turn: Turn) {
    let Turn {
        prompt,
        image,
        params,
        seed,
        encoding,
        cancel,
        shutdown,
        events,
        on_finish,
    } = turn;

    let span = tracing::info_span!("turn", prompt_bytes = prompt.len());
    let _enter = span.enter();
    let started = Instant::now();
    let emitter = Emitter {
        events,
        cancel,
        shutdown,
    };

    let mut generation = Generation::default();
    let result = generation.run(
        ctx,
        prefix,
        &prompt,
        image,
        &params,
        seed,
        encoding,
        &emitter,
    );
    if result.is_err() {
        ctx.clear();
        prefix.clear();
    }

    let result = result.map(|reason| TurnSummary {
        reason,
        prompt_tokens: generation.prompt_tokens,
        reused_tokens: generation.reused_tokens,
        generated_tokens: generation.generated,
        elapsed_ms: started.elapsed().as_millis() as u64,
    });
    match &result {
        Ok(summary) => tracing::info!(
            "Turn finished: {:?}, {} prompt tokens ({} cached), {} generated in {} ms",
            summary.reason,
            summary.prompt_tokens,
            summary.reused_tokens,
            summary.generated_tokens,
            summary.elapsed_ms
        ),
        Err(e) => tracing::warn!("Turn failed: {}", e),
    }

    let outcome = TurnOutcome {
        text: generation.text,
        result,
    };
    if let Some(hook) = on_finish {
        hook(&outcome);
    }

    let terminal = match outcome.result {
        Ok(summary) => StreamToken::Done(summary),
        Err(e) => StreamToken::Error(e),
    };
    emitter.terminal(terminal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::backend::Backend;
    use crate::inference::template;
    use crate::inference::testing::{ScriptedBackend, FAILING_IMAGE_WIDTH, IMAGE_POSITIONS};
    use crate::types::{ChatHistory, ContextConfig, Message, TemplateConfig};
    use std::sync::{Arc, Mutex};

    fn prompt(user: &str) -> String {
        let history: ChatHistory = vec![Message::user(user)].into();
        template::render(&history, &TemplateConfig::default())
    }

    fn config() -> ContextConfig {
        ContextConfig {
            context_size: 256,
            batch_size: 16,
            ..ContextConfig::default()
        }
    }

    /// Runs turns back to back on one context, collecting every event
    fn run_turns(
        backend: &ScriptedBackend,
        config: &ContextConfig,
        turns: Vec<(String, InferenceParams)>,
    ) -> Vec<Vec<StreamToken>> {
        let mut all = Vec::new();
        backend
            .with_context(config, &mut |ctx| {
                let mut prefix = EvaluatedPrefix::default();
                for (prompt, params) in turns.clone() {
                    let (tx, mut rx) = mpsc::channel(256);
                    run_turn(
                        ctx,
                        &mut prefix,
                        Turn {
                            prompt,
                            image: None,
                            params,
                            seed: 1,
                            encoding: encoding_rs::UTF_8,
                            cancel: CancellationToken::new(),
                            shutdown: CancellationToken::new(),
                            events: tx,
                            on_finish: None,
                        },
                    );
                    let mut events = Vec::new();
                    while let Ok(event) = rx.try_recv() {
                        events.push(event);
                    }
                    all.push(events);
                }
            })
            .unwrap();
        all
    }

    fn text_of(events: &[StreamToken]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamToken::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn summary_of(events: &[StreamToken]) -> TurnSummary {
        match events.last() {
            Some(StreamToken::Done(summary)) => summary.clone(),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_until_end_of_sequence() {
        let backend = ScriptedBackend::new("Hello there");
        let events = run_turns(&backend, &config(), vec![(prompt("hi"), InferenceParams::greedy())]);
        assert_eq!(text_of(&events[0]), "Hello there");
        let summary = summary_of(&events[0]);
        assert_eq!(summary.reason, StopReason::EndOfSequence);
        assert_eq!(summary.generated_tokens, 11);
    }

    #[test]
    fn test_max_tokens_limits_output() {
        let backend = ScriptedBackend::new("Hello there");
        let params = InferenceParams::greedy().with_max_tokens(4);
        let events = run_turns(&backend, &config(), vec![(prompt("hi"), params)]);
        assert_eq!(text_of(&events[0]), "Hell");
        assert_eq!(summary_of(&events[0]).reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_zero_max_tokens_only_terminal() {
        let backend = ScriptedBackend::new("Hello");
        let params = InferenceParams::greedy().with_max_tokens(0);
        let events = run_turns(&backend, &config(), vec![(prompt("hi"), params)]);
        assert_eq!(events[0].len(), 1);
        assert_eq!(summary_of(&events[0]).generated_tokens, 0);
    }

    #[test]
    fn test_antiprompt_is_stripped_text_policy() {
        let backend = ScriptedBackend::new("Sure.\nUser: more");
        let params = InferenceParams::greedy().with_antiprompt("User:");
        let events = run_turns(&backend, &config(), vec![(prompt("hi"), params)]);
        assert_eq!(text_of(&events[0]), "Sure.\n");
        assert_eq!(
            summary_of(&events[0]).reason,
            StopReason::AntiPrompt("User:".into())
        );
    }

    #[test]
    fn test_antiprompt_is_stripped_token_policy() {
        let backend = ScriptedBackend::new("Sure.\nUser: more");
        let params = InferenceParams::greedy()
            .with_antiprompt("User:")
            .with_antiprompt_match(AntipromptMatch::Tokens);
        let events = run_turns(&backend, &config(), vec![(prompt("hi"), params)]);
        assert_eq!(text_of(&events[0]), "Sure.\n");
    }

    #[test]
    fn test_multibyte_reply_is_never_split() {
        let backend = ScriptedBackend::new("héllo ✓");
        let events = run_turns(&backend, &config(), vec![(prompt("hi"), InferenceParams::greedy())]);
        for event in &events[0] {
            if let StreamToken::Token(text) = event {
                assert!(!text.contains('\u{fffd}'));
            }
        }
        assert_eq!(text_of(&events[0]), "héllo ✓");
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let backend = ScriptedBackend::new("abc");
        let turns = vec![
            (prompt("x"), InferenceParams::greedy()),
            (prompt("x"), InferenceParams::greedy()),
        ];
        let events = run_turns(&backend, &config(), turns);
        assert_eq!(events[0], {
            let mut second = events[1].clone();
            if let Some(StreamToken::Done(s)) = second.last_mut() {
                s.elapsed_ms = summary_of(&events[0]).elapsed_ms;
                s.reused_tokens = 0;
            }
            second
        });
    }

    #[test]
    fn test_follow_up_reuses_cached_prefix() {
        let backend = ScriptedBackend::new("ok");
        let first = prompt("hi");
        let mut history: ChatHistory = vec![Message::user("hi"), Message::assistant("ok")].into();
        history.push(Message::user("again"));
        let second = template::render(&history, &TemplateConfig::default());

        let events = run_turns(
            &backend,
            &config(),
            vec![
                (first.clone(), InferenceParams::greedy()),
                (second, InferenceParams::greedy()),
            ],
        );
        let summary = summary_of(&events[1]);
        // BOS + first prompt + the reply tokens that were evaluated
        assert_eq!(summary.reused_tokens, 1 + first.len() + 2);
        assert_eq!(text_of(&events[1]), "ok");
    }

    #[test]
    fn test_context_overflow_is_an_error() {
        let backend = ScriptedBackend::new("ok").looping();
        // the prompt takes 53 positions
        let config = ContextConfig {
            context_size: 64,
            batch_size: 16,
            ..ContextConfig::default()
        };
        let events = run_turns(&backend, &config, vec![(prompt("hi"), InferenceParams::greedy())]);
        assert!(matches!(
            events[0].last(),
            Some(StreamToken::Error(EngineError::ContextFailure(_)))
        ));
        assert!(!text_of(&events[0]).is_empty());
    }

    #[test]
    fn test_prompt_longer_than_context_fails() {
        let backend = ScriptedBackend::new("ok");
        let config = ContextConfig {
            context_size: 8,
            batch_size: 8,
            ..ContextConfig::default()
        };
        let events = run_turns(&backend, &config, vec![(prompt("hi"), InferenceParams::greedy())]);
        assert_eq!(events[0].len(), 1);
        assert!(matches!(events[0][0], StreamToken::Error(_)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let backend = ScriptedBackend::new("Hello");
        let outcome = Arc::new(Mutex::new(None));
        let seen = outcome.clone();
        backend
            .with_context(&config(), &mut |ctx| {
                let (tx, mut rx) = mpsc::channel(8);
                let cancel = CancellationToken::new();
                cancel.cancel();
                let seen = seen.clone();
                run_turn(
                    ctx,
                    &mut EvaluatedPrefix::default(),
                    Turn {
                        prompt: prompt("hi"),
                        image: None,
                        params: InferenceParams::greedy(),
                        seed: 0,
                        encoding: encoding_rs::UTF_8,
                        cancel,
                        shutdown: CancellationToken::new(),
                        events: tx,
                        on_finish: Some(Box::new(move |o: &TurnOutcome| {
                            *seen.lock().unwrap() = Some(o.clone());
                        })),
                    },
                );
                let event = rx.try_recv().unwrap();
                assert!(matches!(
                    event,
                    StreamToken::Done(TurnSummary {
                        reason: StopReason::Cancelled,
                        ..
                    })
                ));
            })
            .unwrap();

        let outcome = outcome.lock().unwrap().clone().unwrap();
        assert!(!outcome.is_complete());
        assert!(outcome.text.is_empty());
    }

    /// Runs one turn on a fresh context
    fn run_single(
        backend: &ScriptedBackend,
        turn_prompt: String,
        params: InferenceParams,
        image: Option<ImageInput>,
    ) -> Vec<StreamToken> {
        let mut events = Vec::new();
        backend
            .with_context(&config(), &mut |ctx| {
                let (tx, mut rx) = mpsc::channel(64);
                run_turn(
                    ctx,
                    &mut EvaluatedPrefix::default(),
                    Turn {
                        prompt: turn_prompt.clone(),
                        image: image.clone(),
                        params: params.clone(),
                        seed: 0,
                        encoding: encoding_rs::UTF_8,
                        cancel: CancellationToken::new(),
                        shutdown: CancellationToken::new(),
                        events: tx,
                        on_finish: None,
                    },
                );
                while let Ok(event) = rx.try_recv() {
                    events.push(event);
                }
            })
            .unwrap();
        events
    }

    fn image(width: u32) -> ImageInput {
        ImageInput::new(image::RgbImage::new(width, 4)).unwrap()
    }

    #[test]
    fn test_image_positions_precede_prompt() {
        let backend = ScriptedBackend::new("seen").with_vision();
        let events = run_single(
            &backend,
            prompt("what is this"),
            InferenceParams::greedy(),
            Some(image(4)),
        );
        assert_eq!(backend.embedded_positions(), IMAGE_POSITIONS as usize);
        assert_eq!(text_of(&events), "seen");
    }

    #[test]
    fn test_projector_failure_ends_turn_with_embed_failure() {
        let backend = ScriptedBackend::new("seen").with_vision();
        let events = run_single(
            &backend,
            prompt("what is this"),
            InferenceParams::greedy(),
            Some(image(FAILING_IMAGE_WIDTH)),
        );
        assert_eq!(
            events,
            vec![StreamToken::Error(EngineError::EmbedFailure(
                "native status -2".into()
            ))]
        );
        assert_eq!(backend.evaluated_tokens(), 0);
    }

    #[test]
    fn test_native_sampler_drives_the_turn() {
        let backend = ScriptedBackend::new("Hello").with_native_sampler();
        let events = run_single(&backend, prompt("hi"), InferenceParams::greedy(), None);
        assert_eq!(text_of(&events), "Hello");
        // five reply tokens plus the end of sequence
        assert_eq!(backend.native_samples(), 6);
    }

    #[test]
    fn test_grammar_reaches_native_sampler() {
        let backend = ScriptedBackend::new("yes").with_native_sampler();
        let grammar = r#"root ::= "yes" | "no""#;
        let params = InferenceParams::greedy().with_grammar(grammar);
        let events = run_single(&backend, prompt("ok?"), params, None);
        assert_eq!(text_of(&events), "yes");
        assert_eq!(backend.grammars(), vec![grammar.to_string()]);
    }

    #[test]
    fn test_grammar_without_native_sampler_fails() {
        let backend = ScriptedBackend::new("yes");
        let params = InferenceParams::greedy().with_grammar(r#"root ::= "yes""#);
        let events = run_single(&backend, prompt("ok?"), params, None);
        assert!(matches!(
            events.as_slice(),
            [StreamToken::Error(EngineError::Grammar(_))]
        ));
    }

    #[test]
    fn test_saved_prefix_is_reused_by_a_new_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.bin");
        let backend = ScriptedBackend::new("ok");
        let first = prompt("hi");
        let mut history: ChatHistory = vec![Message::user("hi"), Message::assistant("ok")].into();
        history.push(Message::user("again"));
        let second = template::render(&history, &TemplateConfig::default());

        let mut saved = 0;
        backend
            .with_context(&config(), &mut |ctx| {
                let mut prefix = EvaluatedPrefix::default();
                let (tx, mut rx) = mpsc::channel(64);
                run_turn(
                    ctx,
                    &mut prefix,
                    Turn {
                        prompt: first.clone(),
                        image: None,
                        params: InferenceParams::greedy(),
                        seed: 0,
                        encoding: encoding_rs::UTF_8,
                        cancel: CancellationToken::new(),
                        shutdown: CancellationToken::new(),
                        events: tx,
                        on_finish: None,
                    },
                );
                while rx.try_recv().is_ok() {}
                saved = prefix.save(ctx, &path).unwrap();
            })
            .unwrap();
        assert_eq!(saved, 1 + first.len() + 2);

        let mut events = Vec::new();
        backend
            .with_context(&config(), &mut |ctx| {
                let mut prefix = EvaluatedPrefix::default();
                assert_eq!(prefix.load(ctx, &path).unwrap(), saved);
                let (tx, mut rx) = mpsc::channel(64);
                run_turn(
                    ctx,
                    &mut prefix,
                    Turn {
                        prompt: second.clone(),
                        image: None,
                        params: InferenceParams::greedy(),
                        seed: 0,
                        encoding: encoding_rs::UTF_8,
                        cancel: CancellationToken::new(),
                        shutdown: CancellationToken::new(),
                        events: tx,
                        on_finish: None,
                    },
                );
                while let Ok(event) = rx.try_recv() {
                    events.push(event);
                }
            })
            .unwrap();
        assert_eq!(summary_of(&events).reused_tokens, saved);
        assert_eq!(text_of(&events), "ok");
    }

    #[test]
    fn test_prefix_with_image_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new("ok");
        let mut result = None;
        backend
            .with_context(&config(), &mut |ctx| {
                let prefix = EvaluatedPrefix {
                    tokens: Vec::new(),
                    image_positions: 2,
                };
                result = Some(prefix.save(ctx, &dir.path().join("x.bin")));
            })
            .unwrap();
        assert!(matches!(result, Some(Err(EngineError::State(_)))));
    }

    #[test]
    fn test_failed_load_leaves_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new("ok");
        backend
            .with_context(&config(), &mut |ctx| {
                let mut prefix = EvaluatedPrefix {
                    tokens: vec![Token(1)],
                    image_positions: 0,
                };
                let missing = dir.path().join("missing.bin");
                assert!(matches!(
                    prefix.load(ctx, &missing),
                    Err(EngineError::State(_))
                ));
                assert_eq!(prefix.n_past(), 0);
            })
            .unwrap();
    }
}
