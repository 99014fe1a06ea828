//! Next-token selection from raw logits.

use serde::{Deserialize, Serialize};

use crate::array::softmax;
use crate::prng::Prng;

pub const MIN_TEMPERATURE: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    Greedy,
    #[default]
    Temperature,
    TopK,
    TopP,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub strategy: SamplingStrategy,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::Temperature,
            temperature: 0.8,
            top_k: 10,
            top_p: 0.9,
        }
    }
}

pub fn argmax(xs: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in xs.iter().enumerate() {
        if v > xs[best] {
            best = i;
        }
    }
    best
}

/// Softmax of `logits / max(temperature, 1e-8)`.
pub fn probabilities(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = temperature.max(MIN_TEMPERATURE);
    let scaled: Vec<f32> = logits.iter().map(|v| v / t).collect();
    softmax(&scaled)
}

/// Indices ordered by descending value; ties keep the lower index first.
fn ranked(xs: &[f32]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..xs.len()).collect();
    idx.sort_by(|&a, &b| xs[b].total_cmp(&xs[a]).then(a.cmp(&b)));
    idx
}

pub fn sample_token(logits: &[f32], params: &SamplingParams, rng: &mut Prng) -> usize {
    if logits.is_empty() {
        return 0;
    }
    match params.strategy {
        SamplingStrategy::Greedy => argmax(logits),
        SamplingStrategy::Temperature => {
            let probs = probabilities(logits, params.temperature);
            rng.choose_weighted(&probs)
        }
        SamplingStrategy::TopK => {
            let k = params.top_k.clamp(1, logits.len());
            let top = &ranked(logits)[..k];
            let kept: Vec<f32> = top.iter().map(|&i| logits[i]).collect();
            let probs = probabilities(&kept, params.temperature);
            top[rng.choose_weighted(&probs)]
        }
        SamplingStrategy::TopP => {
            let probs = probabilities(logits, params.temperature);
            let order = ranked(&probs);
            let cutoff = nucleus_size(&order, &probs, params.top_p);
            let top = &order[..cutoff];
            let kept: Vec<f32> = top.iter().map(|&i| probs[i]).collect();
            top[rng.choose_weighted(&kept)]
        }
    }
}

/// Smallest prefix of `order` whose cumulative probability reaches `p`.
fn nucleus_size(order: &[usize], probs: &[f32], p: f32) -> usize {
    let mut cum = 0.0;
    for (n, &i) in order.iter().enumerate() {
        cum += probs[i];
        if cum >= p {
            return n + 1;
        }
    }
    order.len()
}

/// `(id, probability)` for the `n` most likely tokens, most likely first.
pub fn top_n(probs: &[f32], n: usize) -> Vec<(usize, f32)> {
    ranked(probs)
        .into_iter()
        .take(n)
        .map(|i| (i, probs[i]))
        .collect()
}
