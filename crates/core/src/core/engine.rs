//! Per-model service object: owns the config, tokenizer, model, optimizer and
//! data loader, and exposes training steps, generation and persistence.
//!
//! Introspection queries live in [`crate::introspect`].

use std::path::Path;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::data::{encode_corpus, DataLoader};
use crate::error::EngineError;
use crate::layers::Module;
use crate::loss::cross_entropy;
use crate::model::TransformerModel;
use crate::optim::{clip_grad_norm, Adam, Optimizer};
use crate::prng::Prng;
use crate::sampling::{sample_token, SamplingParams};
use crate::storage::{self, Tensor, WeightFile};
use crate::tokenizer::{CharTokenizer, VocabJson};

/// EOS logit while generation is still below `min_new_tokens`.
const EOS_MASK: f32 = -1e9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub min_new_tokens: usize,
}

impl GenerateOptions {
    pub fn from_config(cfg: &ModelConfig) -> Self {
        Self {
            max_tokens: cfg.max_gen_len,
            sampling: cfg.sampling(),
            min_new_tokens: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Loaded {
    pub(crate) config: ModelConfig,
    pub(crate) tokenizer: CharTokenizer,
    pub(crate) model: TransformerModel,
    pub(crate) optimizer: Adam,
    pub(crate) loader: DataLoader,
    pub(crate) rng: Prng,
}

impl Loaded {
    fn build(config: ModelConfig, tokenizer: CharTokenizer) -> Self {
        let mut config = config;
        config.vocab_size = tokenizer.vocab_size();
        let mut rng = Prng::new(config.seed);
        let model = TransformerModel::new(&config, &mut rng);
        let optimizer = Adam::new(config.adam());
        let loader = DataLoader::new(Vec::new(), config.seq_len, config.batch_size);
        Self {
            config,
            tokenizer,
            model,
            optimizer,
            loader,
            rng,
        }
    }

    /// Prompt ids prefixed with BOS. An empty prompt gets one random
    /// non-special token so the model has something to condition on.
    pub(crate) fn prompt_ids(&mut self, prompt: &str) -> Result<Vec<usize>, EngineError> {
        let mut ids = vec![self.tokenizer.bos_id()];
        ids.extend(self.tokenizer.encode(prompt)?);
        if ids.len() == 1 {
            let bos = self.tokenizer.bos_id();
            ids.push(self.rng.gen_range_usize(0, bos));
        }
        Ok(ids)
    }

    /// Logits of the last position given the trailing `seq_len` tokens.
    pub(crate) fn next_logits(&mut self, ids: &[usize]) -> Vec<f32> {
        let start = ids.len().saturating_sub(self.config.seq_len);
        let ctx = &ids[start..];
        let logits = self.model.forward(ctx, 1, ctx.len());
        logits.row(ctx.len() - 1).to_vec()
    }
}

#[derive(Debug, Default)]
pub struct Engine {
    pub(crate) inner: Option<Loaded>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_some()
    }

    pub(crate) fn loaded(&self) -> Result<&Loaded, EngineError> {
        self.inner.as_ref().ok_or(EngineError::NotReady)
    }

    pub(crate) fn loaded_mut(&mut self) -> Result<&mut Loaded, EngineError> {
        self.inner.as_mut().ok_or(EngineError::NotReady)
    }

    pub fn config(&self) -> Option<&ModelConfig> {
        self.inner.as_ref().map(|l| &l.config)
    }

    pub fn tokenizer(&self) -> Option<&CharTokenizer> {
        self.inner.as_ref().map(|l| &l.tokenizer)
    }

    pub fn param_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |l| l.model.param_count())
    }

    /// Fresh model: builds the vocabulary from `corpus` and seeds every
    /// random draw from `config.seed`.
    pub fn initialize(&mut self, config: ModelConfig, corpus: &str) -> Result<(), EngineError> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(EngineError::InvalidConfig(errors));
        }
        let tokenizer = CharTokenizer::from_corpus(corpus)?;
        let mut loaded = Loaded::build(config, tokenizer);
        let data = encode_corpus(&loaded.tokenizer, corpus)?;
        loaded.loader = DataLoader::new(data, loaded.config.seq_len, loaded.config.batch_size);
        info!(
            vocab = loaded.config.vocab_size,
            params = loaded.model.param_count(),
            tokens = loaded.loader.len_tokens(),
            "engine initialized"
        );
        self.inner = Some(loaded);
        Ok(())
    }

    /// Swap the training data and the training hyperparameters while keeping
    /// the weights and optimizer moments.
    pub fn update_corpus(&mut self, corpus: &str, config: &ModelConfig) -> Result<(), EngineError> {
        let l = self.loaded_mut()?;
        let data = encode_corpus(&l.tokenizer, corpus)?;
        l.config.max_epochs = config.max_epochs;
        l.config.batch_size = config.batch_size.max(1);
        l.config.learning_rate = config.learning_rate;
        l.config.lr_schedule = config.lr_schedule;
        l.config.grad_clip = config.grad_clip;
        l.optimizer.params = l.config.adam();
        l.loader = DataLoader::new(data, l.config.seq_len, l.config.batch_size);
        debug!(tokens = l.loader.len_tokens(), "corpus updated");
        Ok(())
    }

    pub fn num_batches(&self) -> Result<usize, EngineError> {
        Ok(self.loaded()?.loader.num_batches())
    }

    /// One optimisation step at learning rate `lr`: forward, backward, clip,
    /// Adam, zero grad. Returns the batch loss.
    pub fn train_step(&mut self, lr: f32) -> Result<f32, EngineError> {
        let l = self.loaded_mut()?;
        let batch = l.loader.next_batch(&mut l.rng);
        let logits = l.model.forward(&batch.inputs, batch.batch, batch.seq);
        let (loss, d_logits) = cross_entropy(&logits, &batch.targets);
        l.model.backward(&d_logits);
        if l.config.grad_clip > 0.0 {
            clip_grad_norm(&mut l.model, l.config.grad_clip);
        }
        l.optimizer.set_lr(lr);
        l.optimizer.step(&mut l.model);
        l.model.zero_grad();
        Ok(loss)
    }

    /// Full text (prompt included) after sampling up to `max_tokens`.
    pub fn generate_text(
        &mut self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<String, EngineError> {
        self.generate_streaming(prompt, opts, |_| {})
    }

    /// Like [`generate_text`](Self::generate_text), calling `on_token` with
    /// each new token's text as it is produced.
    pub fn generate_streaming(
        &mut self,
        prompt: &str,
        opts: &GenerateOptions,
        mut on_token: impl FnMut(&str),
    ) -> Result<String, EngineError> {
        let l = self.loaded_mut()?;
        let mut ids = l.prompt_ids(prompt)?;
        let eos = l.tokenizer.eos_id();
        let mut generated = 0;
        for _ in 0..opts.max_tokens {
            let mut logits = l.next_logits(&ids);
            if generated < opts.min_new_tokens {
                logits[eos] = EOS_MASK;
            }
            let next = sample_token(&logits, &opts.sampling, &mut l.rng);
            if next == eos {
                break;
            }
            ids.push(next);
            generated += 1;
            on_token(&l.tokenizer.decode(&[next]));
        }
        Ok(l.tokenizer.decode(&ids))
    }

    pub fn tensors(&self) -> Result<Vec<Tensor>, EngineError> {
        let l = self.loaded()?;
        let mut out = Vec::new();
        l.model
            .visit_params(&mut |name, p| out.push(Tensor::from_array(name, &p.value)));
        Ok(out)
    }

    /// Write the `.mlw` file and return the vocabulary that was stored.
    pub fn save_weights(&self, path: &Path) -> Result<VocabJson, EngineError> {
        let l = self.loaded()?;
        let file = WeightFile {
            config: l.config.clone(),
            vocab: l.tokenizer.to_vocab_json(),
            tensors: self.tensors()?,
        };
        storage::save_to_path(path, &file)?;
        info!(path = %path.display(), "weights saved");
        Ok(file.vocab)
    }

    /// Rebuild the model from a weight file. `config` overrides the stored
    /// one (the vocabulary always comes from the file). Tensors are matched
    /// by name; on a shape mismatch the overlapping region is copied.
    pub fn load_weights(
        &mut self,
        path: &Path,
        config: Option<ModelConfig>,
    ) -> Result<(), EngineError> {
        let file = storage::load_from_path(path)?;
        let tokenizer = CharTokenizer::from_vocab_json(&file.vocab)?;
        let config = config.unwrap_or(file.config);
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(EngineError::InvalidConfig(errors));
        }
        let mut loaded = Loaded::build(config, tokenizer);

        let by_name: HashMap<&str, &Tensor> =
            file.tensors.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut missing = 0usize;
        loaded.model.visit_params_mut(&mut |name, p| match by_name.get(name) {
            Some(t) => {
                if !t.copy_into(&mut p.value) {
                    warn!(
                        param = name,
                        stored = ?(t.rows, t.cols),
                        expected = ?(p.value.rows(), p.value.cols()),
                        "shape mismatch; copied overlapping region"
                    );
                }
            }
            None => missing += 1,
        });
        if missing > 0 {
            debug!(missing, "parameters absent from weight file kept their init");
        }
        self.inner = Some(loaded);
        info!(path = %path.display(), "weights loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingStrategy;

    pub(crate) fn tiny_config() -> ModelConfig {
        ModelConfig {
            d_model: 16,
            n_heads: 2,
            n_layers: 1,
            d_ff: 32,
            seq_len: 16,
            batch_size: 4,
            learning_rate: 1e-2,
            ..ModelConfig::default()
        }
    }

    fn ready() -> Engine {
        let mut e = Engine::new();
        e.initialize(tiny_config(), "abcabcabc\nabcabc\ncab cab cab\n")
            .expect("init");
        e
    }

    #[test]
    fn queries_before_init_are_not_ready() {
        let mut e = Engine::new();
        assert!(matches!(e.train_step(0.1), Err(EngineError::NotReady)));
        assert!(matches!(
            e.generate_text("a", &GenerateOptions::from_config(&tiny_config())),
            Err(EngineError::NotReady)
        ));
    }

    #[test]
    fn invalid_config_is_rejected_with_reasons() {
        let mut e = Engine::new();
        let cfg = ModelConfig {
            d_model: 15,
            ..tiny_config()
        };
        match e.initialize(cfg, "hello world") {
            Err(EngineError::InvalidConfig(errs)) => assert!(!errs.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn vocab_size_is_filled_from_tokenizer() {
        let e = ready();
        // 'a' 'b' 'c' ' ' '\n' plus BOS/EOS
        assert_eq!(e.config().map(|c| c.vocab_size), Some(7));
    }

    #[test]
    fn training_reduces_loss() {
        let mut e = ready();
        let first: f32 = (0..3).map(|_| e.train_step(1e-2).expect("step")).sum::<f32>() / 3.0;
        for _ in 0..60 {
            e.train_step(1e-2).expect("step");
        }
        let last: f32 = (0..3).map(|_| e.train_step(1e-2).expect("step")).sum::<f32>() / 3.0;
        assert!(last < first, "{first} -> {last}");
    }

    #[test]
    fn greedy_generation_is_deterministic_and_respects_limits() {
        let mut a = ready();
        let mut b = ready();
        let opts = GenerateOptions {
            max_tokens: 5,
            sampling: SamplingParams {
                strategy: SamplingStrategy::Greedy,
                ..SamplingParams::default()
            },
            min_new_tokens: 5,
        };
        let ta = a.generate_text("ab", &opts).expect("generate");
        let tb = b.generate_text("ab", &opts).expect("generate");
        assert_eq!(ta, tb);
        assert!(ta.starts_with("ab"));
        // BOS may be sampled and decodes to nothing
        assert!(ta.chars().count() <= 2 + 5);
    }

    #[test]
    fn streaming_reports_each_new_token() {
        let mut e = ready();
        let opts = GenerateOptions {
            max_tokens: 4,
            min_new_tokens: 4,
            ..GenerateOptions::from_config(&tiny_config())
        };
        let mut pieces = Vec::new();
        let full = e
            .generate_streaming("", &opts, |t| pieces.push(t.to_string()))
            .expect("generate");
        assert_eq!(pieces.len(), 4);
        assert!(full.ends_with(&pieces.concat()));
    }

    #[test]
    fn unknown_prompt_symbol_is_an_error() {
        let mut e = ready();
        let opts = GenerateOptions::from_config(&tiny_config());
        assert!(matches!(
            e.generate_text("xyz", &opts),
            Err(EngineError::Tokenizer(_))
        ));
    }

    #[test]
    fn update_corpus_keeps_weights() {
        let mut e = ready();
        let before = e.tensors().expect("tensors");
        let cfg = ModelConfig {
            max_epochs: 3,
            ..tiny_config()
        };
        e.update_corpus("cab\nabc\n", &cfg).expect("update");
        assert_eq!(e.tensors().expect("tensors"), before);
        assert_eq!(e.config().map(|c| c.max_epochs), Some(3));
    }
}
