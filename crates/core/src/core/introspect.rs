//! Read-only views into a loaded engine: attention maps, loss on arbitrary
//! text, embedding projections, weight matrices and per-module statistics.

use serde::{Deserialize, Serialize};

use crate::array::{dot, Array2};
use crate::engine::{Engine, GenerateOptions};
use crate::error::EngineError;
use crate::layers::{Module, Param};
use crate::loss::cross_entropy_loss;
use crate::sampling::{probabilities, sample_token, top_n};
use crate::viz::{AttentionResult, Matrix};

/// Cap on rows and columns for the weight inspector.
pub const INSPECT_MAX_DIM: usize = 64;
/// Cap on rows and columns for snapshots pushed during training.
pub const SNAPSHOT_MAX_DIM: usize = 32;
const TOP_PROBS: usize = 5;
const POWER_ITERATIONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingPoint {
    pub token: String,
    pub token_id: usize,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightMatrixInfo {
    pub module: String,
    pub param: String,
    pub shape: Vec<usize>,
    #[serde(flatten)]
    pub matrix: Matrix,
    pub mean: f32,
    pub std: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub module: String,
    pub param: String,
    #[serde(flatten)]
    pub matrix: Matrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStats {
    pub module_name: String,
    pub param_count: usize,
    pub weight_norm: f32,
    pub gradient_norm: Option<f32>,
    pub mean: f32,
    pub std: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub token: String,
    pub prob: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedToken {
    pub token: String,
    pub token_id: usize,
    pub probability: f32,
    pub top_probs: Vec<TokenProb>,
    pub is_eos: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAttention {
    pub layer: usize,
    /// Head-averaged attention of the newest position over the context.
    pub attention_to_context: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionSnapshot {
    pub step: usize,
    pub context_tokens: Vec<String>,
    pub layers: Vec<LayerAttention>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTrace {
    pub prompt: String,
    pub prompt_tokens: Vec<String>,
    pub generated_tokens: Vec<GeneratedToken>,
    pub attention_snapshots: Vec<AttentionSnapshot>,
    pub full_text: String,
}

/// `block0.attention.W_q.W` -> (`block0.attention`, `W_q.W`).
fn split_param_name(name: &str) -> (String, String) {
    let mut parts = name.splitn(3, '.');
    let first = parts.next().unwrap_or_default();
    match (parts.next(), parts.next()) {
        (Some(second), Some(rest)) if first.starts_with("block") => {
            (format!("{first}.{second}"), rest.to_string())
        }
        (Some(second), Some(rest)) => (first.to_string(), format!("{second}.{rest}")),
        (Some(second), None) => (first.to_string(), second.to_string()),
        _ => (first.to_string(), String::new()),
    }
}

fn in_snapshot(module: &str) -> bool {
    module == "embedding"
        || module == "output_head"
        || module.ends_with(".attention")
        || module.ends_with(".ffn")
}

impl Engine {
    /// One `AttentionResult` per (layer, head). Text longer than `seq_len`
    /// is truncated to its first `seq_len` symbols.
    pub fn attention(&mut self, text: &str) -> Result<Vec<AttentionResult>, EngineError> {
        let l = self.loaded_mut()?;
        let mut ids = l.tokenizer.encode(text)?;
        if ids.is_empty() {
            return Err(EngineError::EmptyText);
        }
        ids.truncate(l.config.seq_len);
        let tokens: Vec<String> = ids.iter().map(|&id| l.tokenizer.label(id)).collect();
        let seq = ids.len();
        l.model.forward(&ids, 1, seq);

        let mut out = Vec::new();
        for (layer, block) in l.model.blocks.iter().enumerate() {
            let Some(w) = block.attention.last_weights() else {
                continue;
            };
            for head in 0..w.heads {
                let values = w
                    .head(0, head)
                    .chunks(seq)
                    .map(<[f32]>::to_vec)
                    .collect();
                out.push(AttentionResult {
                    layer,
                    head,
                    tokens: tokens.clone(),
                    weights: Matrix {
                        rows: seq,
                        cols: seq,
                        values,
                        min: 0.0,
                        max: 1.0,
                    },
                });
            }
        }
        Ok(out)
    }

    /// Mean next-symbol cross-entropy over the encoded `text`, predicting
    /// `ids[1..=seq]` from `ids[..seq]` with `seq = min(len - 1, seq_len)`.
    /// Zero when there is nothing to predict.
    pub fn loss_on_text(&mut self, text: &str) -> Result<f32, EngineError> {
        let l = self.loaded_mut()?;
        let ids = l.tokenizer.encode(text)?;
        let seq = ids.len().saturating_sub(1).min(l.config.seq_len);
        if seq < 1 {
            return Ok(0.0);
        }
        let logits = l.model.forward(&ids[..seq], 1, seq);
        Ok(cross_entropy_loss(&logits, &ids[1..=seq]))
    }

    pub fn perplexity(&mut self, text: &str) -> Result<f32, EngineError> {
        Ok(self.loss_on_text(text)?.exp())
    }

    /// Token embeddings projected onto their two leading principal
    /// components.
    pub fn embeddings_2d(&self) -> Result<Vec<EmbeddingPoint>, EngineError> {
        let l = self.loaded()?;
        let w = &l.model.embedding.w.value;
        let (rows, d) = (w.rows(), w.cols());
        if rows == 0 || d == 0 {
            return Ok(Vec::new());
        }

        let means = w.column_sums();
        let mut centered = w.clone();
        for r in 0..rows {
            for (v, m) in centered.row_mut(r).iter_mut().zip(&means) {
                *v -= m / rows as f32;
            }
        }
        let mut cov = centered.t_matmul(&centered);
        cov.scale(1.0 / (rows.max(2) - 1) as f32);

        let pc1 = power_iteration(&cov, 0);
        deflate(&mut cov, &pc1);
        let pc2 = if d > 1 {
            power_iteration(&cov, 1)
        } else {
            vec![0.0; d]
        };

        Ok((0..rows)
            .map(|id| {
                let row = centered.row(id);
                EmbeddingPoint {
                    token: l.tokenizer.label(id),
                    token_id: id,
                    x: dot(row, &pc1),
                    y: dot(row, &pc2),
                }
            })
            .collect())
    }

    /// Every 2-D parameter, sampled down to [`INSPECT_MAX_DIM`].
    pub fn weight_matrices(&self) -> Result<Vec<WeightMatrixInfo>, EngineError> {
        let l = self.loaded()?;
        let mut out = Vec::new();
        let mut push = |name: &str, p: &Param| {
            if p.vector {
                return;
            }
            let (module, param) = split_param_name(name);
            out.push(WeightMatrixInfo {
                module,
                param,
                shape: p.shape(),
                matrix: Matrix::sample_from(&p.value, INSPECT_MAX_DIM),
                mean: p.value.mean(),
                std: p.value.std(),
            });
        };
        l.model.visit_params(&mut push);
        Ok(out)
    }

    /// Compact view of the embedding, attention, FFN and output weights for
    /// live training updates.
    pub fn weight_snapshot(&self) -> Result<Vec<WeightSnapshot>, EngineError> {
        let l = self.loaded()?;
        let mut out = Vec::new();
        l.model.visit_params(&mut |name, p| {
            let (module, param) = split_param_name(name);
            if p.vector || !in_snapshot(&module) {
                return;
            }
            out.push(WeightSnapshot {
                module,
                param,
                matrix: Matrix::sample_from(&p.value, SNAPSHOT_MAX_DIM),
            });
        });
        Ok(out)
    }

    pub fn parameter_stats(&self) -> Result<Vec<ParameterStats>, EngineError> {
        let l = self.loaded()?;
        let mut out = Vec::new();
        for (module_name, m) in l.model.named_modules() {
            let mut count = 0usize;
            let mut w_sq = 0.0f32;
            let mut g_sq = 0.0f32;
            let mut sum = 0.0f32;
            let mut values = Vec::new();
            m.visit_params(&mut |_, p| {
                count += p.len();
                w_sq += p.value.sum_sq();
                g_sq += p.grad.sum_sq();
                sum += p.value.data().iter().sum::<f32>();
                values.extend_from_slice(p.value.data());
            });
            if count == 0 {
                continue;
            }
            let mean = sum / count as f32;
            let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count as f32;
            out.push(ParameterStats {
                module_name,
                param_count: count,
                weight_norm: w_sq.sqrt(),
                gradient_norm: (g_sq > 0.0).then(|| g_sq.sqrt()),
                mean,
                std: var.sqrt(),
            });
        }
        Ok(out)
    }

    /// Generate step by step, recording what the model attended to and how
    /// confident it was at each step.
    pub fn generation_weights(
        &mut self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<GenerationTrace, EngineError> {
        let l = self.loaded_mut()?;
        let prompt_len = l.tokenizer.encode(prompt)?.len();
        let mut ids = l.prompt_ids(prompt)?;
        let prompt_tokens: Vec<String> = ids
            .iter()
            .take(prompt_len + 1)
            .map(|&id| l.tokenizer.label(id))
            .collect();
        let eos = l.tokenizer.eos_id();

        let mut generated_tokens = Vec::new();
        let mut attention_snapshots = Vec::new();
        for step in 0..opts.max_tokens {
            let start = ids.len().saturating_sub(l.config.seq_len);
            let ctx = ids[start..].to_vec();
            let logits = l.next_logits(&ids);

            let layers = l
                .model
                .blocks
                .iter()
                .enumerate()
                .filter_map(|(layer, b)| {
                    b.attention.last_weights().map(|w| LayerAttention {
                        layer,
                        attention_to_context: w.head_mean_row(0, ctx.len() - 1),
                    })
                })
                .collect();
            attention_snapshots.push(AttentionSnapshot {
                step,
                context_tokens: ctx.iter().map(|&id| l.tokenizer.label(id)).collect(),
                layers,
            });

            let probs = probabilities(&logits, opts.sampling.temperature);
            let next = sample_token(&logits, &opts.sampling, &mut l.rng);
            let top_probs = top_n(&probs, TOP_PROBS)
                .into_iter()
                .map(|(id, prob)| TokenProb {
                    token: l.tokenizer.label(id),
                    prob,
                })
                .collect();
            generated_tokens.push(GeneratedToken {
                token: l.tokenizer.label(next),
                token_id: next,
                probability: probs.get(next).copied().unwrap_or(0.0),
                top_probs,
                is_eos: next == eos,
            });
            if next == eos {
                break;
            }
            ids.push(next);
        }

        Ok(GenerationTrace {
            prompt: prompt.to_string(),
            prompt_tokens,
            generated_tokens,
            attention_snapshots,
            full_text: l.tokenizer.decode(&ids),
        })
    }
}

/// Dominant eigenvector of a symmetric matrix. `seed` picks the start
/// vector so the second component does not start parallel to the first.
fn power_iteration(a: &Array2, seed: usize) -> Vec<f32> {
    let n = a.rows();
    let mut v: Vec<f32> = (0..n)
        .map(|i| if (i + seed) % 2 == 0 { 1.0 } else { 0.5 })
        .collect();
    normalize(&mut v);
    for _ in 0..POWER_ITERATIONS {
        let mut next: Vec<f32> = (0..n).map(|r| dot(a.row(r), &v)).collect();
        if normalize(&mut next) == 0.0 {
            break;
        }
        v = next;
    }
    v
}

fn deflate(a: &mut Array2, v: &[f32]) {
    let av: Vec<f32> = (0..a.rows()).map(|r| dot(a.row(r), v)).collect();
    let lambda = dot(v, &av);
    for r in 0..a.rows() {
        for (c, x) in a.row_mut(r).iter_mut().enumerate() {
            *x -= lambda * v[r] * v[c];
        }
    }
}

fn normalize(v: &mut [f32]) -> f32 {
    let n = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if n > 0.0 {
        v.iter_mut().for_each(|x| *x /= n);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::sampling::{SamplingParams, SamplingStrategy};

    fn ready() -> Engine {
        let cfg = ModelConfig {
            d_model: 16,
            n_heads: 2,
            n_layers: 2,
            d_ff: 32,
            seq_len: 8,
            batch_size: 2,
            ..ModelConfig::default()
        };
        let mut e = Engine::new();
        e.initialize(cfg, "hello world\nhold the door\n").expect("init");
        e
    }

    #[test]
    fn param_names_split_into_module_and_param() {
        assert_eq!(
            split_param_name("block0.attention.W_q.W"),
            ("block0.attention".to_string(), "W_q.W".to_string())
        );
        assert_eq!(
            split_param_name("embedding.W"),
            ("embedding".to_string(), "W".to_string())
        );
        assert_eq!(
            split_param_name("block1.ffn.linear1.b"),
            ("block1.ffn".to_string(), "linear1.b".to_string())
        );
    }

    #[test]
    fn attention_has_one_square_map_per_layer_and_head() {
        let mut e = ready();
        let maps = e.attention("hello").expect("attention");
        assert_eq!(maps.len(), 2 * 2);
        for m in &maps {
            m.validate().expect("square");
            assert_eq!(m.tokens.len(), 5);
            // causal: nothing above the diagonal
            assert_eq!(m.weights.get(0, 4), 0.0);
            let row_sum: f32 = m.weights.values[4].iter().sum();
            assert!((row_sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn long_text_is_truncated_to_context() {
        let mut e = ready();
        let maps = e.attention("hello world hello").expect("attention");
        assert_eq!(maps[0].tokens.len(), 8);
    }

    #[test]
    fn empty_text_has_no_attention() {
        let mut e = ready();
        assert!(matches!(e.attention(""), Err(EngineError::EmptyText)));
    }

    #[test]
    fn perplexity_is_exp_loss() {
        let mut e = ready();
        let loss = e.loss_on_text("hold").expect("loss");
        let ppl = e.perplexity("hold").expect("ppl");
        assert!(loss > 0.0);
        assert!((ppl - loss.exp()).abs() < 1e-3 * ppl);
    }

    #[test]
    fn single_symbol_has_nothing_to_predict() {
        let mut e = ready();
        assert_eq!(e.loss_on_text("h").expect("loss"), 0.0);
        assert_eq!(e.loss_on_text("").expect("loss"), 0.0);
        assert_eq!(e.perplexity("h").expect("ppl"), 1.0);
    }

    #[test]
    fn loss_window_is_capped_at_context() {
        let mut e = ready();
        // seq_len is 8: only the first 9 symbols take part
        let short = e.loss_on_text("hello wor").expect("loss");
        let long = e.loss_on_text("hello world hello").expect("loss");
        assert!((short - long).abs() < 1e-6);
    }

    #[test]
    fn embeddings_cover_the_whole_vocabulary() {
        let e = ready();
        let points = e.embeddings_2d().expect("pca");
        let vocab = e.tokenizer().map(|t| t.vocab_size()).unwrap_or_default();
        assert_eq!(points.len(), vocab);
        assert!(points.iter().all(|p| p.x.is_finite() && p.y.is_finite()));
        assert_eq!(points.last().map(|p| p.token.as_str()), Some("<EOS>"));
    }

    #[test]
    fn principal_component_of_a_diagonal_covariance() {
        let a = Array2::from_vec(2, 2, vec![4.0, 0.0, 0.0, 1.0]);
        let v = power_iteration(&a, 0);
        assert!(v[0].abs() > 0.99);
    }

    #[test]
    fn weight_matrices_skip_vectors_and_cap_dims() {
        let e = ready();
        let mats = e.weight_matrices().expect("weights");
        assert!(mats.iter().all(|m| m.shape.len() == 2));
        assert!(mats.iter().all(|m| m.matrix.rows <= INSPECT_MAX_DIM));
        assert!(mats.iter().any(|m| m.module == "output_head"));
        assert!(!mats.iter().any(|m| m.module.ends_with(".ln1")));
    }

    #[test]
    fn snapshot_only_covers_matrix_modules() {
        let e = ready();
        let snap = e.weight_snapshot().expect("snapshot");
        assert!(snap.iter().all(|s| in_snapshot(&s.module)));
        assert!(snap.iter().any(|s| s.module == "block1.attention"));
        let json = serde_json::to_value(&snap[0]).expect("json");
        assert!(json.get("values").is_some());
        assert!(json.get("module").is_some());
    }

    #[test]
    fn stats_report_missing_gradients_as_none() {
        let e = ready();
        let stats = e.parameter_stats().expect("stats");
        assert_eq!(stats[0].module_name, "embedding");
        assert!(stats.iter().all(|s| s.gradient_norm.is_none()));
        let total: usize = stats.iter().map(|s| s.param_count).sum();
        assert_eq!(total, e.param_count());
    }

    #[test]
    fn generation_trace_records_each_step() {
        let mut e = ready();
        let opts = GenerateOptions {
            max_tokens: 4,
            sampling: SamplingParams {
                strategy: SamplingStrategy::Greedy,
                ..SamplingParams::default()
            },
            min_new_tokens: 0,
        };
        let trace = e.generation_weights("he", &opts).expect("trace");
        assert_eq!(trace.prompt_tokens, vec!["<BOS>", "h", "e"]);
        assert_eq!(trace.generated_tokens.len(), trace.attention_snapshots.len());
        for s in &trace.attention_snapshots {
            assert_eq!(s.layers.len(), 2);
            for la in &s.layers {
                assert_eq!(la.attention_to_context.len(), s.context_tokens.len());
            }
        }
        for t in &trace.generated_tokens {
            assert!(t.top_probs.len() <= 5);
        }
        assert!(trace.full_text.starts_with("he"));
    }
}
