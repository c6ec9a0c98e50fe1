//! Anti-prompt detection
//!
//! Decoded pieces pass through a [`StopDetector`] before they reach the
//! caller. Text that could still turn into an anti-prompt is held back, so a
//! stop string is never emitted, not even partially.

use crate::inference::backend::Token;
use crate::types::{AntipromptMatch, InferenceParams};

/// Result of feeding one piece to the detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCheck {
    /// Keep generating. The text is safe to emit (may be empty).
    Continue(String),
    /// An anti-prompt matched. `emit` is the text before it.
    Stop { emit: String, matched: String },
}

#[derive(Debug)]
pub struct StopDetector {
    policy: AntipromptMatch,
    antiprompts: Vec<String>,
    sequences: Vec<(String, Vec<Token>)>,
    held_text: String,
    held_tokens: Vec<(Token, String)>,
}

impl StopDetector {
    /// Text-policy detector. Empty anti-prompts are ignored.
    pub fn new(antiprompts: &[String]) -> Self {
        Self {
            policy: AntipromptMatch::Text,
            antiprompts: antiprompts
                .iter()
                .filter(|a| !a.is_empty())
                .cloned()
                .collect(),
            sequences: Vec::new(),
            held_text: String::new(),
            held_tokens: Vec::new(),
        }
    }

    /// Token-policy detector over tokenized anti-prompts
    pub fn with_token_sequences(sequences: Vec<(String, Vec<Token>)>) -> Self {
        Self {
            policy: AntipromptMatch::Tokens,
            antiprompts: Vec::new(),
            sequences: sequences
                .into_iter()
                .filter(|(_, seq)| !seq.is_empty())
                .collect(),
            held_text: String::new(),
            held_tokens: Vec::new(),
        }
    }

    /// Feeds the next token and its decoded piece
    pub fn push(&mut self, token: Token, piece: &str) -> StopCheck {
        match self.policy {
            AntipromptMatch::Text => self.push_text(piece),
            AntipromptMatch::Tokens => self.push_token(token, piece),
        }
    }

    /// Releases everything still held back. Call once generation ends
    /// without a match.
    pub fn finish(&mut self) -> String {
        let mut rest = std::mem::take(&mut self.held_text);
        for (_, piece) in self.held_tokens.drain(..) {
            rest.push_str(&piece);
        }
        rest
    }

    fn push_text(&mut self, piece: &str) -> StopCheck {
        self.held_text.push_str(piece);

        if let Some((pos, matched)) = earliest_match(&self.held_text, &self.antiprompts) {
            let emit = self.held_text[..pos].to_string();
            self.held_text.clear();
            return StopCheck::Stop { emit, matched };
        }

        let keep = partial_suffix_len(&self.held_text, &self.antiprompts);
        let split = self.held_text.len() - keep;
        let emit: String = self.held_text.drain(..split).collect();
        StopCheck::Continue(emit)
    }

    fn push_token(&mut self, token: Token, piece: &str) -> StopCheck {
        self.held_tokens.push((token, piece.to_string()));
        let ids: Vec<Token> = self.held_tokens.iter().map(|(t, _)| *t).collect();

        if let Some((matched, len)) = self
            .sequences
            .iter()
            .find(|(_, seq)| ids.ends_with(seq))
            .map(|(text, seq)| (text.clone(), seq.len()))
        {
            let before = ids.len() - len;
            let emit = self.held_tokens[..before]
                .iter()
                .map(|(_, p)| p.as_str())
                .collect();
            self.held_tokens.clear();
            return StopCheck::Stop { emit, matched };
        }

        let keep = self
            .sequences
            .iter()
            .map(|(_, seq)| token_overlap(&ids, seq))
            .max()
            .unwrap_or(0);
        let release = self.held_tokens.len() - keep;
        let emit = self
            .held_tokens
            .drain(..release)
            .map(|(_, p)| p)
            .collect();
        StopCheck::Continue(emit)
    }
}

/// Position and text of the anti-prompt occurring first in `text`
fn earliest_match(text: &str, antiprompts: &[String]) -> Option<(usize, String)> {
    antiprompts
        .iter()
        .filter_map(|a| text.find(a.as_str()).map(|pos| (pos, a)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(pos, a)| (pos, a.clone()))
}

/// Byte length of the longest suffix of `text` that is a proper prefix of an
/// anti-prompt
fn partial_suffix_len(text: &str, antiprompts: &[String]) -> usize {
    for (i, _) in text.char_indices() {
        let suffix = &text[i..];
        if antiprompts
            .iter()
            .any(|a| a.len() > suffix.len() && a.starts_with(suffix))
        {
            return suffix.len();
        }
    }
    0
}

/// Longest `k < seq.len()` where the last `k` ids equal the first `k` of `seq`
fn token_overlap(ids: &[Token], seq: &[Token]) -> usize {
    let max = ids.len().min(seq.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&k| ids[ids.len() - k..] == seq[..k])
        .unwrap_or(0)
}

/// Whether generation should stop given the text produced so far.
///
/// Checks the token budget and, under the text policy, whether the text ends
/// with any anti-prompt. The token policy only matches token sequences, which
/// [`StopDetector`] tracks.
pub fn should_stop(running_text: &str, generated: usize, params: &InferenceParams) -> bool {
    if params
        .token_limit()
        .is_some_and(|limit| generated >= limit)
    {
        return true;
    }
    params.antiprompt_match == AntipromptMatch::Text
        && params
            .antiprompts
            .iter()
            .any(|a| !a.is_empty() && running_text.ends_with(a.as_str()))
}
