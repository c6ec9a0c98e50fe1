//! Token streaming
//!
//! A turn is delivered as a sequence of [`StreamToken::Token`] fragments
//! closed by exactly one terminal event: [`StreamToken::Done`] or
//! [`StreamToken::Error`].

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use encoding_rs::{Decoder, Encoding};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::inference::error::EngineError;

/// Why a turn ended without an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The token budget was used up
    MaxTokens,
    /// An anti-prompt was produced; it is not part of the output
    AntiPrompt(String),
    /// The model emitted an end-of-generation token
    EndOfSequence,
    /// The caller cancelled the turn
    Cancelled,
}

/// Summary attached to the final event of a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub reason: StopReason,
    /// Tokens of the rendered prompt
    pub prompt_tokens: usize,
    /// Prompt tokens served from the KV cache of a previous turn
    pub reused_tokens: usize,
    pub generated_tokens: usize,
    pub elapsed_ms: u64,
}

/// Event emitted during streaming generation
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A decoded text fragment
    Token(String),
    /// Generation completed
    Done(TurnSummary),
    /// Generation failed; the session remains usable unless the error says otherwise
    Error(EngineError),
}

impl StreamToken {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamToken::Token(_))
    }
}

/// Incremental byte-to-text decoder.
///
/// Multi-byte sequences split across tokens are carried over to the next
/// call. Malformed input becomes U+FFFD.
pub struct TokenDecoder {
    decoder: Decoder,
}

impl TokenDecoder {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_without_bom_handling(),
        }
    }

    /// Decodes the next chunk of bytes
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.decode(bytes, false)
    }

    /// Flushes a trailing incomplete sequence. The decoder is spent afterwards.
    pub fn finish(&mut self) -> String {
        self.decode(&[], true)
    }

    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 4);
        let mut out = String::with_capacity(capacity);
        let _ = self.decoder.decode_to_string(bytes, &mut out, last);
        out
    }
}

/// Receiving end of a turn
///
/// Yields fragments then one terminal event, then ends. Dropping the stream
/// stops the turn at the next fragment boundary.
pub struct GenerationStream {
    session_id: String,
    events: mpsc::Receiver<StreamToken>,
    cancel: CancellationToken,
}

impl GenerationStream {
    pub(crate) fn new(
        session_id: String,
        events: mpsc::Receiver<StreamToken>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            events,
            cancel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Requests cancellation of this turn
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event, blocking the current thread
    pub fn blocking_next(&mut self) -> Option<StreamToken> {
        self.events.blocking_recv()
    }

    /// Drains the stream into the full text and its summary
    pub async fn collect_text(mut self) -> Result<(String, TurnSummary), EngineError> {
        let mut text = String::new();
        while let Some(event) = self.events.recv().await {
            match event {
                StreamToken::Token(fragment) => text.push_str(&fragment),
                StreamToken::Done(summary) => return Ok((text, summary)),
                StreamToken::Error(e) => return Err(e),
            }
        }
        Err(EngineError::Worker(
            "stream ended without a terminal event".into(),
        ))
    }
}

impl fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationStream")
            .field("session_id", &self.session_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Stream for GenerationStream {
    type Item = StreamToken;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
