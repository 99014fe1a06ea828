//! Multi-head causal self-attention.

use crate::array::{dot, softmax_in_place, Array2};
use crate::layers::{Linear, Module, Param};
use crate::prng::Prng;

/// Attention weights of the last forward, laid out `[batch][head][query][key]`.
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub batch: usize,
    pub heads: usize,
    pub seq: usize,
    pub data: Vec<f32>,
}

impl AttentionWeights {
    #[inline]
    fn offset(&self, b: usize, h: usize) -> usize {
        (b * self.heads + h) * self.seq * self.seq
    }

    /// `seq × seq` block for one (batch, head).
    pub fn head(&self, b: usize, h: usize) -> &[f32] {
        let o = self.offset(b, h);
        &self.data[o..o + self.seq * self.seq]
    }

    pub fn get(&self, b: usize, h: usize, i: usize, j: usize) -> f32 {
        self.head(b, h)[i * self.seq + j]
    }

    /// Row `i` averaged over heads, for batch `b`.
    pub fn head_mean_row(&self, b: usize, i: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.seq];
        if self.heads == 0 {
            return out;
        }
        for h in 0..self.heads {
            let row = &self.head(b, h)[i * self.seq..(i + 1) * self.seq];
            for (o, w) in out.iter_mut().zip(row) {
                *o += *w;
            }
        }
        let k = 1.0 / self.heads as f32;
        out.iter_mut().for_each(|v| *v *= k);
        out
    }
}

#[derive(Debug, Clone)]
struct Cache {
    q: Array2,
    k: Array2,
    v: Array2,
    weights: AttentionWeights,
}

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub d_model: usize,
    pub n_heads: usize,
    pub d_k: usize,
    pub w_q: Linear,
    pub w_k: Linear,
    pub w_v: Linear,
    pub w_o: Linear,
    cache: Option<Cache>,
}

impl MultiHeadAttention {
    /// `d_model` must be divisible by `n_heads`; config validation checks this
    /// before a model is ever built.
    pub fn new(d_model: usize, n_heads: usize, rng: &mut Prng) -> Self {
        let n_heads = n_heads.max(1);
        Self {
            d_model,
            n_heads,
            d_k: d_model / n_heads,
            w_q: Linear::new(d_model, d_model, false, rng),
            w_k: Linear::new(d_model, d_model, false, rng),
            w_v: Linear::new(d_model, d_model, false, rng),
            w_o: Linear::new(d_model, d_model, false, rng),
            cache: None,
        }
    }

    pub fn last_weights(&self) -> Option<&AttentionWeights> {
        self.cache.as_ref().map(|c| &c.weights)
    }

    /// `x` is `(batch * seq, d_model)`.
    pub fn forward(&mut self, x: &Array2, batch: usize, seq: usize) -> Array2 {
        let q = self.w_q.forward(x);
        let k = self.w_k.forward(x);
        let v = self.w_v.forward(x);
        let (h, dk) = (self.n_heads, self.d_k);
        let scale = 1.0 / (dk as f32).sqrt();

        let mut weights = AttentionWeights {
            batch,
            heads: h,
            seq,
            data: vec![0.0; batch * h * seq * seq],
        };
        let mut concat = Array2::zeros(batch * seq, self.d_model);

        for b in 0..batch {
            for head in 0..h {
                let col = head * dk;
                let base = weights.offset(b, head);
                for i in 0..seq {
                    let qi = &q.row(b * seq + i)[col..col + dk];
                    // Causal: keys 0..=i only; the masked tail stays 0.
                    let row = &mut weights.data[base + i * seq..base + i * seq + i + 1];
                    for (j, w) in row.iter_mut().enumerate() {
                        *w = dot(qi, &k.row(b * seq + j)[col..col + dk]) * scale;
                    }
                    softmax_in_place(row);

                    let out = &mut concat.row_mut(b * seq + i)[col..col + dk];
                    for j in 0..=i {
                        let w = weights.data[base + i * seq + j];
                        let vj = &v.row(b * seq + j)[col..col + dk];
                        for (o, vv) in out.iter_mut().zip(vj) {
                            *o += w * vv;
                        }
                    }
                }
            }
        }

        let out = self.w_o.forward(&concat);
        self.cache = Some(Cache { q, k, v, weights });
        out
    }

    pub fn backward(&mut self, grad_out: &Array2) -> Array2 {
        let d_concat = self.w_o.backward(grad_out);
        let Some(cache) = &self.cache else {
            return Array2::zeros(grad_out.rows(), self.d_model);
        };
        let (batch, seq) = (cache.weights.batch, cache.weights.seq);
        let (h, dk) = (self.n_heads, self.d_k);
        let scale = 1.0 / (dk as f32).sqrt();

        let mut dq = Array2::zeros(batch * seq, self.d_model);
        let mut dkm = Array2::zeros(batch * seq, self.d_model);
        let mut dv = Array2::zeros(batch * seq, self.d_model);
        let mut d_w = vec![0.0f32; seq];

        for b in 0..batch {
            for head in 0..h {
                let col = head * dk;
                let w = cache.weights.head(b, head);
                for i in 0..seq {
                    let d_oi = &d_concat.row(b * seq + i)[col..col + dk];
                    let wi = &w[i * seq..i * seq + i + 1];

                    // dA_ij = dO_i . v_j ; dV_j += A_ij dO_i
                    for j in 0..=i {
                        d_w[j] = dot(d_oi, &cache.v.row(b * seq + j)[col..col + dk]);
                        let dvj = &mut dv.row_mut(b * seq + j)[col..col + dk];
                        for (x, g) in dvj.iter_mut().zip(d_oi) {
                            *x += wi[j] * g;
                        }
                    }

                    // softmax backward, then the 1/sqrt(dk) scaling
                    let sum: f32 = (0..=i).map(|j| wi[j] * d_w[j]).sum();
                    for j in 0..=i {
                        let ds = wi[j] * (d_w[j] - sum) * scale;
                        if ds == 0.0 {
                            continue;
                        }
                        let kj = &cache.k.row(b * seq + j)[col..col + dk];
                        let dqi = &mut dq.row_mut(b * seq + i)[col..col + dk];
                        for (x, kv) in dqi.iter_mut().zip(kj) {
                            *x += ds * kv;
                        }
                        let qi = &cache.q.row(b * seq + i)[col..col + dk];
                        let dkj = &mut dkm.row_mut(b * seq + j)[col..col + dk];
                        for (x, qv) in dkj.iter_mut().zip(qi) {
                            *x += ds * qv;
                        }
                    }
                }
            }
        }

        let mut dx = self.w_q.backward(&dq);
        dx.add_assign(&self.w_k.backward(&dkm));
        dx.add_assign(&self.w_v.backward(&dv));
        dx
    }
}

impl Module for MultiHeadAttention {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param)) {
        self.w_q.visit_params(&mut |n, p| f(&format!("W_q.{n}"), p));
        self.w_k.visit_params(&mut |n, p| f(&format!("W_k.{n}"), p));
        self.w_v.visit_params(&mut |n, p| f(&format!("W_v.{n}"), p));
        self.w_o.visit_params(&mut |n, p| f(&format!("W_o.{n}"), p));
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param)) {
        self.w_q.visit_params_mut(&mut |n, p| f(&format!("W_q.{n}"), p));
        self.w_k.visit_params_mut(&mut |n, p| f(&format!("W_k.{n}"), p));
        self.w_v.visit_params_mut(&mut |n, p| f(&format!("W_v.{n}"), p));
        self.w_o.visit_params_mut(&mut |n, p| f(&format!("W_o.{n}"), p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MultiHeadAttention, Array2) {
        let mut rng = Prng::new(21);
        let attn = MultiHeadAttention::new(8, 2, &mut rng);
        let x = Array2::randn(2 * 4, 8, 1.0, &mut rng);
        (attn, x)
    }

    #[test]
    fn rows_sum_to_one_and_future_is_masked() {
        let (mut attn, x) = setup();
        attn.forward(&x, 2, 4);
        let w = attn.last_weights().expect("weights cached");
        for b in 0..2 {
            for h in 0..2 {
                for i in 0..4 {
                    let s: f32 = (0..4).map(|j| w.get(b, h, i, j)).sum();
                    assert!((s - 1.0).abs() < 1e-5);
                    for j in i + 1..4 {
                        assert_eq!(w.get(b, h, i, j), 0.0);
                    }
                }
            }
        }
        assert_eq!(w.get(0, 0, 0, 0), 1.0);
    }

    #[test]
    fn input_gradient_matches_finite_difference() {
        let (mut attn, x) = setup();
        let mut rng = Prng::new(4);
        let g = Array2::randn(8, 8, 1.0, &mut rng);
        let objective = |attn: &mut MultiHeadAttention, x: &Array2| -> f32 {
            let y = attn.forward(x, 2, 4);
            y.data().iter().zip(g.data()).map(|(a, b)| a * b).sum()
        };

        objective(&mut attn, &x);
        let dx = attn.backward(&g);

        let eps = 1e-2;
        for &(r, c) in &[(0usize, 0usize), (3, 5), (6, 2)] {
            let mut xp = x.clone();
            xp.set(r, c, x.get(r, c) + eps);
            let mut xm = x.clone();
            xm.set(r, c, x.get(r, c) - eps);
            let numeric = (objective(&mut attn, &xp) - objective(&mut attn, &xm)) / (2.0 * eps);
            let analytic = dx.get(r, c);
            assert!(
                (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
                "({r},{c}): {numeric} vs {analytic}"
            );
        }
    }

    #[test]
    fn head_mean_row_averages_heads() {
        let (mut attn, x) = setup();
        attn.forward(&x, 2, 4);
        let w = attn.last_weights().expect("weights cached");
        let row = w.head_mean_row(1, 3);
        let expected = (w.get(1, 0, 3, 1) + w.get(1, 1, 3, 1)) / 2.0;
        assert!((row[1] - expected).abs() < 1e-6);
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
