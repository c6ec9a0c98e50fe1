//! Inference parameters
//!
//! Per-call sampling and stopping configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How anti-prompts are matched against generated output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AntipromptMatch {
    /// Case-sensitive substring match on the tail of the decoded text
    #[default]
    Text,
    /// Match the tokenized anti-prompt against the tail of generated tokens
    Tokens,
}

/// Parameters for a single generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceParams {
    /// Maximum number of tokens to generate (negative = until the context is full)
    pub max_tokens: i32,
    /// Temperature for sampling (0.0 = greedy)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Min-p sampling parameter (0 = disabled)
    pub min_p: f32,
    /// Repetition penalty (1.0 = disabled)
    pub repeat_penalty: f32,
    /// Number of recent tokens the penalties look at (negative = whole context)
    pub repeat_last_n: i32,
    /// Subtracted once per previous occurrence of a token
    pub frequency_penalty: f32,
    /// Subtracted once if a token occurred at all
    pub presence_penalty: f32,
    /// Additive logit bias per token id
    pub logit_bias: HashMap<i32, f32>,
    /// Sampling seed (None = random)
    pub seed: Option<u64>,
    /// Ordered stop strings
    pub antiprompts: Vec<String>,
    /// Anti-prompt matching policy
    pub antiprompt_match: AntipromptMatch,
    /// GBNF grammar the output must follow, starting at its `root` rule
    pub grammar: Option<String>,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            max_tokens: -1,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            logit_bias: HashMap::new(),
            seed: None,
            antiprompts: Vec::new(),
            antiprompt_match: AntipromptMatch::Text,
            grammar: None,
        }
    }
}

impl InferenceParams {
    /// Greedy decoding with no penalties
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            repeat_penalty: 1.0,
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_antiprompt(mut self, antiprompt: impl Into<String>) -> Self {
        self.antiprompts.push(antiprompt.into());
        self
    }

    pub fn with_antiprompt_match(mut self, policy: AntipromptMatch) -> Self {
        self.antiprompt_match = policy;
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    /// Token budget for this call, `None` when unbounded
    pub fn token_limit(&self) -> Option<usize> {
        usize::try_from(self.max_tokens).ok()
    }

    /// Prepends `extra` anti-prompts, keeping the first occurrence of duplicates
    pub fn merge_antiprompts(&mut self, extra: &[String]) {
        let mut merged: Vec<String> = Vec::with_capacity(extra.len() + self.antiprompts.len());
        for antiprompt in extra.iter().chain(self.antiprompts.iter()) {
            if !antiprompt.is_empty() && !merged.contains(antiprompt) {
                merged.push(antiprompt.clone());
            }
        }
        self.antiprompts = merged;
    }

    /// Clamps values into their valid ranges
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.min_p = self.min_p.clamp(0.0, 1.0);
        self.frequency_penalty = self.frequency_penalty.clamp(-2.0, 2.0);
        self.presence_penalty = self.presence_penalty.clamp(-2.0, 2.0);
        if self.repeat_penalty <= 0.0 {
            self.repeat_penalty = 1.0;
        }
        if self.grammar.as_deref().is_some_and(|g| g.trim().is_empty()) {
            self.grammar = None;
        }
    }
}
