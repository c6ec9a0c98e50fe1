//! Per-session state
//!
//! A session pairs one [`SessionContext`] with its chat history and the turn
//! slot that keeps turns from overlapping. The slot holds the running turn's
//! cancellation token from the moment the turn is admitted until its guard is
//! dropped, so a cancel can never miss a turn that is still being prepared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::inference::{EngineError, SessionContext};
use crate::types::{ChatHistory, Message};

/// Longest a cancel waits for the turn to wind down
const CANCEL_WAIT: Duration = Duration::from_secs(5);

struct ActiveTurn {
    number: u64,
    cancel: CancellationToken,
}

/// State of one live session
pub struct SessionState {
    id: String,
    context: SessionContext,
    history: Mutex<ChatHistory>,
    turn: Mutex<Option<ActiveTurn>>,
    idle: Condvar,
    turns: AtomicU64,
    admissions: AtomicU64,
    created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
}

impl SessionState {
    pub(crate) fn new(id: &str, context: SessionContext) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            context,
            history: Mutex::new(ChatHistory::new()),
            turn: Mutex::new(None),
            idle: Condvar::new(),
            turns: AtomicU64::new(0),
            admissions: AtomicU64::new(0),
            created_at: now,
            last_active: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Snapshot of the recorded conversation
    pub fn history(&self) -> ChatHistory {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Appends messages to the recorded conversation
    pub fn append(&self, messages: impl IntoIterator<Item = Message>) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        for message in messages {
            history.push(message);
        }
    }

    pub(crate) fn replace_history(&self, history: ChatHistory) {
        *self.history.lock().unwrap_or_else(|e| e.into_inner()) = history;
    }

    /// Drops the oldest exchanges so at most `keep` non-system messages remain
    pub fn truncate_history(&self, keep: usize) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .truncate_front(keep);
    }

    /// Forgets the conversation and clears the context cache
    pub fn reset(&self) -> Result<(), EngineError> {
        if self.is_generating() {
            return Err(EngineError::SessionBusy(self.id.clone()));
        }
        *self.history.lock().unwrap_or_else(|e| e.into_inner()) = ChatHistory::new();
        self.context.reset()
    }

    pub fn is_generating(&self) -> bool {
        self.turn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Number of turns started on this session
    pub fn turn_count(&self) -> u64 {
        self.turns.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admits a new turn. Fails if one is already running.
    ///
    /// The turn's cancellation token exists from here on; pass
    /// [`TurnGuard::cancel_token`] to the worker.
    pub(crate) fn try_begin(self: &Arc<Self>) -> Result<TurnGuard, EngineError> {
        self.admit(true)
    }

    /// Keeps turns out while the session is saved or restored.
    /// Not counted as a turn.
    pub(crate) fn try_hold(self: &Arc<Self>) -> Result<TurnGuard, EngineError> {
        self.admit(false)
    }

    fn admit(self: &Arc<Self>, counted: bool) -> Result<TurnGuard, EngineError> {
        let mut turn = self.turn.lock().unwrap_or_else(|e| e.into_inner());
        if turn.is_some() {
            return Err(EngineError::SessionBusy(self.id.clone()));
        }
        if counted {
            self.turns.fetch_add(1, Ordering::SeqCst);
        }
        let number = self.admissions.fetch_add(1, Ordering::SeqCst);
        let cancel = self.context.turn_token();
        *turn = Some(ActiveTurn {
            number,
            cancel: cancel.clone(),
        });
        drop(turn);

        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
        Ok(TurnGuard {
            session: Arc::clone(self),
            cancel,
        })
    }

    /// Cancels the running turn and waits until the session is idle again.
    /// Returns false if nothing was running.
    pub fn cancel(&self) -> bool {
        let turn = self.turn.lock().unwrap_or_else(|e| e.into_inner());
        let number = match turn.as_ref() {
            Some(active) if !active.cancel.is_cancelled() => {
                active.cancel.cancel();
                active.number
            }
            _ => return false,
        };
        tracing::info!("Cancelled turn on session {}", self.id);

        let (_turn, wait) = self
            .idle
            .wait_timeout_while(turn, CANCEL_WAIT, |t| {
                t.as_ref().is_some_and(|active| active.number == number)
            })
            .unwrap_or_else(|e| e.into_inner());
        if wait.timed_out() {
            tracing::warn!(
                "Turn on session {} still winding down after {:?}",
                self.id,
                CANCEL_WAIT
            );
        }
        true
    }

    /// Stops the worker and frees the native context
    pub(crate) fn close(&self) -> bool {
        self.cancel();
        self.context.release()
    }
}

/// Holds the session busy until dropped
pub(crate) struct TurnGuard {
    session: Arc<SessionState>,
    cancel: CancellationToken,
}

impl TurnGuard {
    pub(crate) fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Token that [`SessionState::cancel`] trips for this turn
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        *self
            .session
            .last_active
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Utc::now();
        *self
            .session
            .turn
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.session.idle.notify_all();
    }
}
