//! Session contexts
//!
//! Each session owns one native evaluation context. Native contexts are not
//! `Send`, so the context is created and used on a dedicated worker thread
//! for its whole life. Callers talk to the worker over a command channel and
//! receive tokens through a bounded stream.
//!
//! # Architecture
//!
//! ```text
//! caller ── WorkerCommand ──> worker thread (owns EvalContext)
//!        <── StreamToken ───  (one bounded channel per turn)
//! ```

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use encoding_rs::Encoding;
use tokio::sync::mpsc as async_mpsc;
use tokio_util::sync::CancellationToken;

use crate::inference::backend::EvalContext;
use crate::inference::error::EngineError;
use crate::inference::executor::{run_turn, EvaluatedPrefix, FinishHook, Turn};
use crate::inference::handle::ModelHandle;
use crate::inference::streaming::GenerationStream;
use crate::inference::vision::ImageInput;
use crate::types::InferenceParams;

/// Fragments buffered between the worker and the consumer
const STREAM_CAPACITY: usize = 1;

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate(Box<Turn>),
    Reset,
    SaveState {
        path: PathBuf,
        reply: Sender<Result<usize, EngineError>>,
    },
    LoadState {
        path: PathBuf,
        reply: Sender<Result<usize, EngineError>>,
    },
    Shutdown,
}

/// One generation request against a session context
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// Fully rendered prompt
    pub prompt: String,
    /// Image evaluated ahead of the prompt, consumed by this turn
    pub image: Option<ImageInput>,
    pub params: InferenceParams,
    /// Sampling seed for this turn
    pub seed: u64,
}

/// A native context running on its own worker thread
pub struct SessionContext {
    name: String,
    commands: Mutex<Option<Sender<WorkerCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    encoding: &'static Encoding,
    context_size: u32,
}

impl SessionContext {
    /// Creates a context from `handle` on a new worker thread.
    ///
    /// Blocks until the native context exists, so creation failures surface
    /// here as [`EngineError::ContextFailure`].
    pub fn create(handle: &ModelHandle, name: &str) -> Result<Self, EngineError> {
        let backend = handle.acquire()?;
        let config = handle.context_config();

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, EngineError>>();

        let worker = thread::Builder::new()
            .name(format!("llama-session-{name}"))
            .spawn(move || {
                let mut ready = Some(ready_tx);
                let result = backend.with_context(&config, &mut |ctx| {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(ctx.context_size()));
                    }
                    worker_loop(ctx, &command_rx);
                });
                match (result, ready.take()) {
                    (Err(e), Some(tx)) => {
                        let _ = tx.send(Err(e));
                    }
                    (Err(e), None) => tracing::error!("Context ended with error: {}", e),
                    (Ok(()), _) => {}
                }
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        let context_size = match ready_rx.recv() {
            Ok(Ok(size)) => size,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(EngineError::Worker(
                    "worker exited before creating the context".into(),
                ));
            }
        };

        tracing::info!("Session context {} ready (n_ctx {})", name, context_size);
        Ok(Self {
            name: name.to_string(),
            commands: Mutex::new(Some(command_tx)),
            worker: Mutex::new(Some(worker)),
            shutdown: CancellationToken::new(),
            encoding: handle.encoding(),
            context_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context_size(&self) -> u32 {
        self.context_size
    }

    /// Starts a turn. Tokens arrive on the returned stream.
    ///
    /// `on_finish` runs on the worker when the turn ends, before the
    /// terminal event is delivered. It is dropped without running if the
    /// turn never starts.
    pub fn generate(
        &self,
        request: TurnRequest,
        on_finish: Option<FinishHook>,
    ) -> Result<GenerationStream, EngineError> {
        self.generate_with_token(request, self.turn_token(), on_finish)
    }

    /// New cancellation token for a turn. Releasing the context cancels it.
    pub fn turn_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Like [`Self::generate`] with a token from [`Self::turn_token`], so the
    /// caller can cancel the turn before the stream exists.
    pub fn generate_with_token(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
        on_finish: Option<FinishHook>,
    ) -> Result<GenerationStream, EngineError> {
        let (events_tx, events_rx) = async_mpsc::channel(STREAM_CAPACITY);

        let turn = Turn {
            prompt: request.prompt,
            image: request.image,
            params: request.params,
            seed: request.seed,
            encoding: self.encoding,
            cancel: cancel.clone(),
            shutdown: self.shutdown.clone(),
            events: events_tx,
            on_finish,
        };
        self.send(WorkerCommand::Generate(Box::new(turn)))?;

        tracing::debug!("Turn submitted to {}", self.name);
        Ok(GenerationStream::new(self.name.clone(), events_rx, cancel))
    }

    /// Clears the KV cache once the current turn, if any, is over
    pub fn reset(&self) -> Result<(), EngineError> {
        self.send(WorkerCommand::Reset)
    }

    /// Writes the KV cache to `path` once queued turns are over.
    /// Returns the number of cached tokens written.
    pub fn save_state(&self, path: &Path) -> Result<usize, EngineError> {
        let (reply, result) = mpsc::channel();
        self.send(WorkerCommand::SaveState {
            path: path.to_path_buf(),
            reply,
        })?;
        self.wait(result)
    }

    /// Replaces the KV cache with the state saved at `path`.
    /// Returns the number of tokens restored.
    pub fn load_state(&self, path: &Path) -> Result<usize, EngineError> {
        let (reply, result) = mpsc::channel();
        self.send(WorkerCommand::LoadState {
            path: path.to_path_buf(),
            reply,
        })?;
        self.wait(result)
    }

    fn wait(&self, result: Receiver<Result<usize, EngineError>>) -> Result<usize, EngineError> {
        result
            .recv()
            .map_err(|_| EngineError::Worker(format!("worker for {} is gone", self.name)))?
    }

    /// Stops the worker and frees the native context.
    ///
    /// A running turn is cancelled first. Returns false if the context was
    /// already released.
    pub fn release(&self) -> bool {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(sender) = sender else {
            return false;
        };

        self.shutdown.cancel();
        let _ = sender.send(WorkerCommand::Shutdown);
        drop(sender);

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                // Last reference dropped by the worker itself; it exits on its own.
                tracing::debug!("Session context {} released from its worker", self.name);
            } else if worker.join().is_err() {
                tracing::error!("Worker thread for {} panicked", self.name);
            }
        }
        tracing::info!("Session context {} released", self.name);
        true
    }

    pub fn is_released(&self) -> bool {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        let sender = commands.as_ref().ok_or_else(|| {
            EngineError::Worker(format!("session context {} has been released", self.name))
        })?;
        sender
            .send(command)
            .map_err(|_| EngineError::Worker(format!("worker for {} is gone", self.name)))
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Worker thread main loop
///
/// Owns the evaluation context and processes commands until shutdown.
fn worker_loop(ctx: &mut dyn EvalContext, commands: &Receiver<WorkerCommand>) {
    let mut prefix = EvaluatedPrefix::default();
    loop {
        match commands.recv() {
            Ok(WorkerCommand::Generate(turn)) => run_turn(ctx, &mut prefix, *turn),
            Ok(WorkerCommand::Reset) => {
                ctx.clear();
                prefix.clear();
                tracing::debug!("Context cache cleared");
            }
            Ok(WorkerCommand::SaveState { path, reply }) => {
                let result = prefix.save(ctx, &path);
                match &result {
                    Ok(n) => tracing::info!("Saved {} cached tokens to {:?}", n, path),
                    Err(e) => tracing::warn!("Saving context state failed: {}", e),
                }
                let _ = reply.send(result);
            }
            Ok(WorkerCommand::LoadState { path, reply }) => {
                let result = prefix.load(ctx, &path);
                match &result {
                    Ok(n) => tracing::info!("Restored {} cached tokens from {:?}", n, path),
                    Err(e) => tracing::warn!("Loading context state failed: {}", e),
                }
                let _ = reply.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::debug!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Seed for a turn: explicit, then the model default, then random
pub fn resolve_seed(params: &InferenceParams, model_default: u32) -> u64 {
    params.seed.unwrap_or_else(|| {
        if model_default != 0 {
            u64::from(model_default)
        } else {
            rand::random()
        }
    })
}
