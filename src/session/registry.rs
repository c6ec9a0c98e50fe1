//! Session registry
//!
//! Maps caller-chosen session ids to live sessions. Sessions run
//! concurrently with each other; within one session turns are strictly
//! sequential and a second request while one is running is rejected.
//!
//! Each id owns a slot that is registered first and filled afterwards, so a
//! native context is never created while a map shard is locked.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};

use crate::inference::executor::FinishHook;
use crate::inference::template;
use crate::inference::{engine, vision};
use crate::inference::{
    EngineError, GenerationStream, ModelHandle, SessionContext, TurnOutcome, TurnRequest,
};
use crate::session::state::SessionState;
use crate::storage::{snapshot, StorageError};
use crate::types::{ChatHistory, InferenceParams, Message, SessionConfig};

type Slot = Arc<OnceCell<Arc<SessionState>>>;

fn snapshot_error(e: StorageError) -> EngineError {
    EngineError::State(e.to_string())
}

/// Registry of live sessions sharing one model
pub struct SessionRegistry {
    handle: Arc<ModelHandle>,
    config: SessionConfig,
    sessions: DashMap<String, Slot>,
    /// Registered slots, filled or not
    slots: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(handle: Arc<ModelHandle>, config: SessionConfig) -> Self {
        Self {
            handle,
            config,
            sessions: DashMap::new(),
            slots: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self) -> &Arc<ModelHandle> {
        &self.handle
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the session for `id`, creating its context on first use.
    ///
    /// Creating a context blocks this caller until the native context exists.
    /// Other ids, including lookups of `id` itself, are not held up.
    pub fn get_or_create(&self, id: &str) -> Result<Arc<SessionState>, EngineError> {
        loop {
            let slot = self.slot(id)?;
            let created = slot.get_or_try_init(|| {
                if !self.holds(id, &slot) {
                    return Err(None);
                }
                match SessionContext::create(&self.handle, id) {
                    Ok(context) => {
                        tracing::info!("Created session {}", id);
                        Ok(Arc::new(SessionState::new(id, context)))
                    }
                    Err(e) => {
                        self.drop_slot(id, &slot);
                        Err(Some(e))
                    }
                }
            });
            match created {
                Ok(session) => return Ok(Arc::clone(session)),
                Err(Some(e)) => return Err(e),
                // an earlier creation for this id failed and gave up the slot
                Err(None) => continue,
            }
        }
    }

    /// The slot for `id`, registering an empty one within the session limit
    fn slot(&self, id: &str) -> Result<Slot, EngineError> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let max = self.config.max_sessions;
                self.slots
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (max == 0 || n < max).then_some(n + 1)
                    })
                    .map_err(|_| {
                        EngineError::ContextFailure(format!("session limit of {max} reached"))
                    })?;
                Ok(Arc::clone(entry.insert(Arc::new(OnceCell::new())).value()))
            }
        }
    }

    fn holds(&self, id: &str, slot: &Slot) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    fn drop_slot(&self, id: &str, slot: &Slot) {
        if self
            .sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
        {
            self.slots.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// The session for `id`, if its context exists
    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions
            .get(id)
            .and_then(|slot| slot.value().get().cloned())
    }

    /// Starts a turn over `history`.
    ///
    /// The session system prompt is prepended when the history has none, and
    /// the session anti-prompts are merged into `params`. `image` is decoded
    /// before the turn starts and projected on the session worker; errors
    /// raised before the stream is returned leave the session idle.
    pub fn generate(
        &self,
        id: &str,
        history: &ChatHistory,
        params: InferenceParams,
        image: Option<&[u8]>,
    ) -> Result<GenerationStream, EngineError> {
        self.start(id, history.clone(), params, image, |_| None)
    }

    /// Continues the recorded conversation of `id` with a user message.
    ///
    /// The user message and the reply are recorded once the turn completes.
    /// Cancelled and failed turns leave the history untouched.
    pub fn chat(
        &self,
        id: &str,
        user_text: &str,
        params: InferenceParams,
        image: Option<&[u8]>,
    ) -> Result<GenerationStream, EngineError> {
        let session = self.get_or_create(id)?;
        let user = Message::user(user_text);
        let mut history = session.history();
        history.push(user.clone());

        self.start(id, history, params, image, move |session| {
            let session = Arc::clone(session);
            let hook: FinishHook = Box::new(move |outcome: &TurnOutcome| {
                if outcome.is_complete() {
                    session.append([user, Message::assistant(outcome.text.clone())]);
                }
            });
            Some(hook)
        })
    }

    fn start(
        &self,
        id: &str,
        mut history: ChatHistory,
        mut params: InferenceParams,
        image: Option<&[u8]>,
        record: impl FnOnce(&Arc<SessionState>) -> Option<FinishHook>,
    ) -> Result<GenerationStream, EngineError> {
        let session = self.get_or_create(id)?;
        let guard = session.try_begin()?;

        let image = image
            .map(|bytes| vision::prepare_image(&self.handle, bytes))
            .transpose()?;

        if let Some(system) = &self.config.system_prompt {
            if !history.has_system_message() {
                history = std::iter::once(Message::system(system.clone()))
                    .chain(history.messages().iter().cloned())
                    .collect();
            }
        }
        let prompt = template::try_render(&history, &self.config.template)?;

        params.merge_antiprompts(&self.config.antiprompts);
        params.validate();
        let seed = engine::resolve_seed(&params, self.handle.default_seed());

        let cancel = guard.cancel_token();
        let recorder = record(guard.session());
        let on_finish: FinishHook = Box::new(move |outcome: &TurnOutcome| {
            if let Some(recorder) = recorder {
                recorder(outcome);
            }
            drop(guard);
        });

        let stream = session.context().generate_with_token(
            TurnRequest {
                prompt,
                image,
                params,
                seed,
            },
            cancel,
            Some(on_finish),
        )?;

        tracing::debug!(
            "Started turn {} on session {} ({} messages)",
            session.turn_count(),
            id,
            history.len()
        );
        Ok(stream)
    }

    /// Writes the recorded conversation and KV cache of `id` into `dir`.
    /// Returns the number of cached tokens saved.
    pub fn save_session(&self, id: &str, dir: &Path) -> Result<usize, EngineError> {
        let session = self
            .get(id)
            .ok_or_else(|| EngineError::State(format!("no session named {id}")))?;
        let _hold = session.try_hold()?;

        snapshot::save_history(dir, &session.history()).map_err(snapshot_error)?;
        let tokens = session
            .context()
            .save_state(&snapshot::context_path(dir))?;
        tracing::info!("Saved session {} to {}", id, dir.display());
        Ok(tokens)
    }

    /// Restores a snapshot written by [`Self::save_session`] into `id`,
    /// creating the session if needed. Returns the number of cached tokens
    /// restored.
    ///
    /// The history is only replaced once the KV cache is restored; a failed
    /// restore leaves the session with its old history and an empty cache.
    pub fn load_session(&self, id: &str, dir: &Path) -> Result<usize, EngineError> {
        let history = snapshot::load_history(dir).map_err(snapshot_error)?;
        let session = self.get_or_create(id)?;
        let _hold = session.try_hold()?;

        let tokens = session
            .context()
            .load_state(&snapshot::context_path(dir))?;
        session.replace_history(history);
        tracing::info!("Loaded session {} from {}", id, dir.display());
        Ok(tokens)
    }

    /// Cancels the running turn of `id` and waits for the session to be idle.
    /// Returns false if nothing was running.
    pub fn cancel(&self, id: &str) -> bool {
        self.get(id).is_some_and(|session| session.cancel())
    }

    /// Removes `id`, cancelling its turn and freeing its context.
    /// Returns false if there was no such session.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, slot| slot.get().is_some())
            .and_then(|(_, slot)| slot.get().cloned());
        match removed {
            Some(session) => {
                self.slots.fetch_sub(1, Ordering::SeqCst);
                session.close();
                tracing::info!("Removed session {}", id);
                true
            }
            None => false,
        }
    }

    /// Ids of sessions whose context exists
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|slot| slot.value().get().is_some())
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .iter()
            .filter(|slot| slot.value().get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every session
    pub fn shutdown(&self) {
        for id in self.session_ids() {
            self.remove(&id);
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// New random session id
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

static GLOBAL: Lazy<RwLock<Option<Arc<SessionRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Installs `registry` as the process-wide registry, replacing and shutting
/// down any previous one
pub fn install(registry: SessionRegistry) -> Arc<SessionRegistry> {
    let registry = Arc::new(registry);
    let previous = GLOBAL
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .replace(Arc::clone(&registry));
    if let Some(previous) = previous {
        previous.shutdown();
    }
    registry
}

/// The process-wide registry, if one is installed
pub fn global() -> Option<Arc<SessionRegistry>> {
    GLOBAL.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Shuts down and removes the process-wide registry.
/// Returns false if none was installed.
pub fn teardown() -> bool {
    let registry = GLOBAL.write().unwrap_or_else(|e| e.into_inner()).take();
    match registry {
        Some(registry) => {
            registry.shutdown();
            tracing::info!("Session registry torn down");
            true
        }
        None => false,
    }
}
