//! Decoder-only transformer: embedding, sinusoidal positions, pre-norm blocks,
//! final norm and an unbiased output head.

use crate::array::Array2;
use crate::attention::MultiHeadAttention;
use crate::config::ModelConfig;
use crate::layers::{Embedding, FeedForward, LayerNorm, Linear, Module, Param, PositionalEncoding};
use crate::prng::Prng;

#[derive(Debug, Clone)]
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attention: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub ffn: FeedForward,
}

impl TransformerBlock {
    pub fn new(d_model: usize, n_heads: usize, d_ff: usize, rng: &mut Prng) -> Self {
        Self {
            ln1: LayerNorm::new(d_model),
            attention: MultiHeadAttention::new(d_model, n_heads, rng),
            ln2: LayerNorm::new(d_model),
            ffn: FeedForward::new(d_model, d_ff, rng),
        }
    }

    /// `h = x + attn(ln1(x))`, `out = h + ffn(ln2(h))`
    pub fn forward(&mut self, x: &Array2, batch: usize, seq: usize) -> Array2 {
        let a = self.ln1.forward(x);
        let h = x.add(&self.attention.forward(&a, batch, seq));
        let f = self.ln2.forward(&h);
        h.add(&self.ffn.forward(&f))
    }

    pub fn backward(&mut self, grad_out: &Array2) -> Array2 {
        let g_ffn = self.ln2.backward(&self.ffn.backward(grad_out));
        let d_h = grad_out.add(&g_ffn);
        let g_attn = self.ln1.backward(&self.attention.backward(&d_h));
        d_h.add(&g_attn)
    }
}

impl Module for TransformerBlock {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param)) {
        self.ln1.visit_params(&mut |n, p| f(&format!("ln1.{n}"), p));
        self.attention
            .visit_params(&mut |n, p| f(&format!("attention.{n}"), p));
        self.ln2.visit_params(&mut |n, p| f(&format!("ln2.{n}"), p));
        self.ffn.visit_params(&mut |n, p| f(&format!("ffn.{n}"), p));
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param)) {
        self.ln1.visit_params_mut(&mut |n, p| f(&format!("ln1.{n}"), p));
        self.attention
            .visit_params_mut(&mut |n, p| f(&format!("attention.{n}"), p));
        self.ln2.visit_params_mut(&mut |n, p| f(&format!("ln2.{n}"), p));
        self.ffn.visit_params_mut(&mut |n, p| f(&format!("ffn.{n}"), p));
    }
}

#[derive(Debug, Clone)]
pub struct TransformerModel {
    pub vocab_size: usize,
    pub d_model: usize,
    pub seq_len: usize,
    pub embedding: Embedding,
    pub positional: PositionalEncoding,
    pub blocks: Vec<TransformerBlock>,
    pub final_ln: LayerNorm,
    pub output_head: Linear,
    last_shape: (usize, usize),
}

impl TransformerModel {
    /// Build a freshly initialised model. `cfg.vocab_size` must already be set.
    pub fn new(cfg: &ModelConfig, rng: &mut Prng) -> Self {
        let embedding = Embedding::new(cfg.vocab_size, cfg.d_model, rng);
        let positional = PositionalEncoding::new(cfg.seq_len, cfg.d_model);
        let blocks = (0..cfg.n_layers)
            .map(|_| TransformerBlock::new(cfg.d_model, cfg.n_heads, cfg.d_ff, rng))
            .collect();
        let final_ln = LayerNorm::new(cfg.d_model);
        let output_head = Linear::new(cfg.d_model, cfg.vocab_size, false, rng);
        Self {
            vocab_size: cfg.vocab_size,
            d_model: cfg.d_model,
            seq_len: cfg.seq_len,
            embedding,
            positional,
            blocks,
            final_ln,
            output_head,
            last_shape: (0, 0),
        }
    }

    /// `ids` holds `batch` rows of `seq` tokens each. Returns logits
    /// `(batch * seq, vocab)`.
    pub fn forward(&mut self, ids: &[usize], batch: usize, seq: usize) -> Array2 {
        debug_assert_eq!(ids.len(), batch * seq);
        debug_assert!(seq <= self.seq_len);
        let mut x = self.embedding.forward(ids);
        self.positional.add_to(&mut x, seq);
        for block in &mut self.blocks {
            x = block.forward(&x, batch, seq);
        }
        let x = self.final_ln.forward(&x);
        self.last_shape = (batch, seq);
        self.output_head.forward(&x)
    }

    pub fn backward(&mut self, d_logits: &Array2) {
        let mut g = self.final_ln.backward(&self.output_head.backward(d_logits));
        for block in self.blocks.iter_mut().rev() {
            g = block.backward(&g);
        }
        // Positional encoding is constant; its gradient passes straight through.
        self.embedding.backward(&g);
    }

    /// `(batch, seq)` of the last forward.
    pub fn last_shape(&self) -> (usize, usize) {
        self.last_shape
    }

    /// Top-level modules in parameter order, with their display names.
    pub fn named_modules(&self) -> Vec<(String, &dyn Module)> {
        let mut out: Vec<(String, &dyn Module)> =
            vec![("embedding".into(), &self.embedding as &dyn Module)];
        for (i, b) in self.blocks.iter().enumerate() {
            out.push((format!("block{i}.ln1"), &b.ln1 as &dyn Module));
            out.push((format!("block{i}.attention"), &b.attention as &dyn Module));
            out.push((format!("block{i}.ln2"), &b.ln2 as &dyn Module));
            out.push((format!("block{i}.ffn"), &b.ffn as &dyn Module));
        }
        out.push(("final_ln".into(), &self.final_ln as &dyn Module));
        out.push(("output_head".into(), &self.output_head as &dyn Module));
        out
    }
}

impl Module for TransformerModel {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param)) {
        for (name, m) in self.named_modules() {
            m.visit_params(&mut |n, p| f(&format!("{name}.{n}"), p));
        }
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param)) {
        self.embedding
            .visit_params_mut(&mut |n, p| f(&format!("embedding.{n}"), p));
        for (i, b) in self.blocks.iter_mut().enumerate() {
            b.visit_params_mut(&mut |n, p| f(&format!("block{i}.{n}"), p));
        }
        self.final_ln
            .visit_params_mut(&mut |n, p| f(&format!("final_ln.{n}"), p));
        self.output_head
            .visit_params_mut(&mut |n, p| f(&format!("output_head.{n}"), p));
    }
}
