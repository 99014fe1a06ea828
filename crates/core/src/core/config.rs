//! Model hyperparameters, validation and the built-in presets.

use serde::{Deserialize, Serialize};

use crate::optim::AdamParams;
use crate::sampling::{SamplingParams, SamplingStrategy};
use crate::schedule::LrSchedule;
use crate::tokenizer::TokenizerType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    // dimensions
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub d_ff: usize,
    pub seq_len: usize,
    /// Filled in from the tokenizer.
    pub vocab_size: usize,

    // training
    pub batch_size: usize,
    pub learning_rate: f32,
    pub max_epochs: usize,
    pub grad_clip: f32,
    pub lr_schedule: LrSchedule,

    // adam
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,

    pub tokenizer_type: TokenizerType,

    // generation
    pub max_gen_len: usize,
    pub temperature: f32,
    pub sampling_strategy: SamplingStrategy,
    pub top_k: usize,
    pub top_p: f32,

    pub seed: u64,
    pub log_every: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 64,
            n_heads: 4,
            n_layers: 2,
            d_ff: 256,
            seq_len: 64,
            vocab_size: 0,
            batch_size: 16,
            learning_rate: 1e-3,
            max_epochs: 100,
            grad_clip: 1.0,
            lr_schedule: LrSchedule::Constant,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            tokenizer_type: TokenizerType::Character,
            max_gen_len: 200,
            temperature: 0.8,
            sampling_strategy: SamplingStrategy::Temperature,
            top_k: 10,
            top_p: 0.9,
            seed: 42,
            log_every: 10,
        }
    }
}

impl ModelConfig {
    /// Every violated rule, in a stable order. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.d_model == 0 {
            errors.push("d_model must be > 0".to_string());
        }
        if self.n_heads == 0 {
            errors.push("n_heads must be > 0".to_string());
        }
        if self.d_model > 0 && self.n_heads > 0 && self.d_model % self.n_heads != 0 {
            errors.push(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            ));
        }
        if self.d_ff == 0 {
            errors.push("d_ff must be > 0".to_string());
        }
        if self.n_layers < 1 {
            errors.push("n_layers must be >= 1".to_string());
        }
        if self.seq_len < 1 {
            errors.push("seq_len must be >= 1".to_string());
        }
        if self.batch_size < 1 {
            errors.push("batch_size must be >= 1".to_string());
        }
        if !(self.learning_rate > 0.0) {
            errors.push("learning_rate must be > 0".to_string());
        }
        if !(self.beta1 > 0.0 && self.beta1 < 1.0) {
            errors.push("beta1 must be in (0, 1)".to_string());
        }
        if !(self.beta2 > 0.0 && self.beta2 < 1.0) {
            errors.push("beta2 must be in (0, 1)".to_string());
        }
        if !(self.temperature > 0.0) {
            errors.push("temperature must be > 0".to_string());
        }
        if !(self.weight_decay >= 0.0) {
            errors.push("weight_decay must be >= 0".to_string());
        }
        errors
    }

    pub fn adam(&self) -> AdamParams {
        AdamParams {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.epsilon,
            weight_decay: self.weight_decay,
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            strategy: self.sampling_strategy,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
        }
    }

    /// Same layer shapes, so saved weights and optimizer state still fit.
    pub fn same_architecture(&self, other: &ModelConfig) -> bool {
        self.d_model == other.d_model
            && self.n_heads == other.n_heads
            && self.n_layers == other.n_layers
            && self.d_ff == other.d_ff
            && self.seq_len == other.seq_len
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub description: String,
    pub config: ModelConfig,
    pub data_name: String,
    pub corpus: String,
}

const CAT_CORPUS: &str = "\
The cat sleeps on the warm mat.
The cat chases a small grey mouse.
The dog barks at the cat.
A bird sings in the old tree.
The cat watches the bird from the window.
The sun rises over the quiet field.
The rabbit eats fresh green grass.
The cat drinks milk from a blue bowl.
The fox runs through the dark forest.
Rain falls softly on the garden.
The cat climbs the tall wooden fence.
The owl wakes up when the night comes.
The fish swims in the clear river.
The cat purrs when it is happy.
The horse walks slowly across the hill.
The wind moves the leaves of the tree.
";

/// `a+b=c` for single digits. `2+1` is left out so commutativity can be
/// probed after training.
pub fn calculator_corpus() -> String {
    let mut out = String::new();
    for a in 0..10 {
        for b in 0..10 {
            if (a, b) == (2, 1) {
                continue;
            }
            out.push_str(&format!("{a}+{b}={}\n", a + b));
        }
    }
    out
}

pub fn presets() -> Vec<Preset> {
    vec![
        Preset {
            name: "Calculator".to_string(),
            description: "Learns single-digit addition (X+Y). 2+1 is held out to test commutativity."
                .to_string(),
            config: ModelConfig::default(),
            data_name: "Calculator data".to_string(),
            corpus: calculator_corpus(),
        },
        Preset {
            name: "The cat".to_string(),
            description: "Learns short sentences about animals and nature.".to_string(),
            config: ModelConfig {
                seq_len: 128,
                weight_decay: 0.01,
                ..ModelConfig::default()
            },
            data_name: "The cat data".to_string(),
            corpus: CAT_CORPUS.to_string(),
        },
    ]
}
