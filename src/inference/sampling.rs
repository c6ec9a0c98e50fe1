//! Token sampling
//!
//! Logits go through a fixed pipeline: logit bias, penalties over the recent
//! window, then either greedy argmax (temperature <= 0) or
//! top-k, temperature, softmax, top-p and min-p before a seeded draw.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::inference::backend::Token;
use crate::inference::error::EngineError;
use crate::types::InferenceParams;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: usize,
    logit: f32,
    p: f32,
}

/// Seeded sampler for one turn
#[derive(Debug)]
pub struct Sampler {
    params: InferenceParams,
    rng: StdRng,
    scratch: Vec<f32>,
}

impl Sampler {
    pub fn new(params: &InferenceParams, seed: u64) -> Self {
        Self {
            params: params.clone(),
            rng: StdRng::seed_from_u64(seed),
            scratch: Vec::new(),
        }
    }

    /// Picks the next token from `logits`. `recent` is the token history the
    /// penalties look at, oldest first.
    pub fn sample(&mut self, logits: &[f32], recent: &[Token]) -> Result<Token, EngineError> {
        if logits.is_empty() {
            return Err(EngineError::ContextFailure("empty logits row".into()));
        }

        self.scratch.clear();
        self.scratch
            .extend(logits.iter().map(|&l| if l.is_nan() { f32::NEG_INFINITY } else { l }));

        apply_logit_bias(&mut self.scratch, &self.params.logit_bias);
        let window = penalty_window(recent, self.params.repeat_last_n);
        apply_penalties(
            &mut self.scratch,
            window,
            self.params.repeat_penalty,
            self.params.frequency_penalty,
            self.params.presence_penalty,
        );

        if self.params.temperature <= 0.0 {
            return Ok(to_token(argmax(&self.scratch)));
        }

        let mut candidates: Vec<Candidate> = self
            .scratch
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate { id, logit, p: 0.0 })
            .collect();

        top_k(&mut candidates, self.params.top_k as usize);
        candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));

        for c in candidates.iter_mut() {
            c.logit /= self.params.temperature;
        }
        softmax(&mut candidates);
        top_p(&mut candidates, self.params.top_p);
        min_p(&mut candidates, self.params.min_p);

        let total: f32 = candidates.iter().map(|c| c.p).sum();
        if total.is_nan() || total <= 0.0 {
            return Ok(to_token(candidates.first().map(|c| c.id).unwrap_or(0)));
        }

        let mut target = self.rng.gen::<f32>() * total;
        for c in &candidates {
            if target < c.p {
                return Ok(to_token(c.id));
            }
            target -= c.p;
        }
        Ok(to_token(candidates.last().map(|c| c.id).unwrap_or(0)))
    }
}

fn to_token(id: usize) -> Token {
    Token(id as i32)
}

pub(crate) fn penalty_window(recent: &[Token], last_n: i32) -> &[Token] {
    match usize::try_from(last_n) {
        Ok(n) => &recent[recent.len().saturating_sub(n)..],
        Err(_) => recent,
    }
}

/// Adds per-token bias. Ids outside the vocabulary are ignored.
pub fn apply_logit_bias(logits: &mut [f32], bias: &HashMap<i32, f32>) {
    for (&id, &value) in bias {
        if let Some(logit) = usize::try_from(id).ok().and_then(|i| logits.get_mut(i)) {
            *logit += value;
        }
    }
}

/// Repeat, frequency and presence penalties over `window`.
///
/// The repeat penalty divides positive logits and multiplies negative ones,
/// once per distinct token. Frequency and presence subtract
/// `count * frequency + presence`.
pub fn apply_penalties(
    logits: &mut [f32],
    window: &[Token],
    repeat: f32,
    frequency: f32,
    presence: f32,
) {
    if window.is_empty() {
        return;
    }
    let mut counts: HashMap<usize, u32> = HashMap::new();
    for token in window {
        if let Some(id) = token.index().filter(|&i| i < logits.len()) {
            *counts.entry(id).or_default() += 1;
        }
    }

    for (id, count) in counts {
        let logit = &mut logits[id];
        if (repeat - 1.0).abs() > f32::EPSILON {
            if *logit > 0.0 {
                *logit /= repeat;
            } else {
                *logit *= repeat;
            }
        }
        *logit -= count as f32 * frequency + presence;
    }
}

/// Index of the largest logit, lowest index on ties
fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best
}

fn top_k(candidates: &mut Vec<Candidate>, k: usize) {
    if k == 0 || k >= candidates.len() {
        return;
    }
    candidates.select_nth_unstable_by(k - 1, |a, b| b.logit.total_cmp(&a.logit));
    candidates.truncate(k);
}

/// Candidates must be sorted by descending logit
fn softmax(candidates: &mut [Candidate]) {
    let Some(max) = candidates.first().map(|c| c.logit) else {
        return;
    };
    let mut sum = 0.0;
    for c in candidates.iter_mut() {
        c.p = (c.logit - max).exp();
        sum += c.p;
    }
    if sum > 0.0 {
        for c in candidates.iter_mut() {
            c.p /= sum;
        }
    }
}

/// Keeps the smallest prefix whose cumulative probability reaches `p`
fn top_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 || candidates.is_empty() {
        return;
    }
    let mut cumulative = 0.0;
    let mut keep = candidates.len();
    for (i, c) in candidates.iter().enumerate() {
        cumulative += c.p;
        if cumulative >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

/// Drops candidates below `p` times the most likely one
fn min_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p <= 0.0 {
        return;
    }
    let Some(max) = candidates.first().map(|c| c.p) else {
        return;
    };
    let threshold = max * p;
    let keep = candidates.iter().take_while(|c| c.p >= threshold).count();
    candidates.truncate(keep.max(1));
}
