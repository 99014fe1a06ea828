//! Trainable building blocks with hand-written backward passes.
//!
//! Each layer caches what its backward needs during `forward`. Gradients are
//! overwritten by `backward`, never accumulated across calls.

use crate::array::Array2;
use crate::prng::Prng;

/// A trainable tensor and its gradient of the same shape.
///
/// Vectors (biases, norm scales) are stored as `1 × n` with `vector` set so
/// callers can report their logical shape.
#[derive(Debug, Clone)]
pub struct Param {
    pub value: Array2,
    pub grad: Array2,
    pub vector: bool,
}

impl Param {
    pub fn new(value: Array2) -> Self {
        let grad = Array2::zeros(value.rows(), value.cols());
        Self {
            value,
            grad,
            vector: false,
        }
    }

    pub fn vector(len: usize, fill: f32) -> Self {
        Self {
            value: Array2::filled(1, len, fill),
            grad: Array2::zeros(1, len),
            vector: true,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        if self.vector {
            vec![self.value.cols()]
        } else {
            vec![self.value.rows(), self.value.cols()]
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Anything that owns parameters.
///
/// Visit order is fixed; the optimizer relies on it to line up its moment
/// buffers, and the weight file relies on the names.
pub trait Module {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param));
    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param));

    fn param_count(&self) -> usize {
        let mut n = 0;
        self.visit_params(&mut |_, p| n += p.len());
        n
    }

    fn zero_grad(&mut self) {
        self.visit_params_mut(&mut |_, p| p.grad.fill(0.0));
    }
}

// ---------------------------------------------------------------------------
// Linear

/// `y = x W + b`, Xavier-initialised weights and zero bias.
#[derive(Debug, Clone)]
pub struct Linear {
    pub w: Param,
    pub b: Option<Param>,
    input: Option<Array2>,
}

impl Linear {
    pub fn new(d_in: usize, d_out: usize, bias: bool, rng: &mut Prng) -> Self {
        let scale = (2.0 / (d_in + d_out) as f32).sqrt();
        Self {
            w: Param::new(Array2::randn(d_in, d_out, scale, rng)),
            b: bias.then(|| Param::vector(d_out, 0.0)),
            input: None,
        }
    }

    pub fn forward(&mut self, x: &Array2) -> Array2 {
        let mut out = x.matmul(&self.w.value);
        if let Some(b) = &self.b {
            out.add_row_broadcast(b.value.data());
        }
        self.input = Some(x.clone());
        out
    }

    /// Forward without touching the cache (inference-only callers).
    pub fn apply(&self, x: &Array2) -> Array2 {
        let mut out = x.matmul(&self.w.value);
        if let Some(b) = &self.b {
            out.add_row_broadcast(b.value.data());
        }
        out
    }

    pub fn backward(&mut self, grad_out: &Array2) -> Array2 {
        if let Some(x) = &self.input {
            self.w.grad = x.t_matmul(grad_out);
        }
        if let Some(b) = &mut self.b {
            b.grad = Array2::from_vec(1, grad_out.cols(), grad_out.column_sums());
        }
        grad_out.matmul_t(&self.w.value)
    }
}

impl Module for Linear {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param)) {
        f("W", &self.w);
        if let Some(b) = &self.b {
            f("b", b);
        }
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param)) {
        f("W", &mut self.w);
        if let Some(b) = &mut self.b {
            f("b", b);
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding

#[derive(Debug, Clone)]
pub struct Embedding {
    pub w: Param,
    ids: Vec<usize>,
}

impl Embedding {
    pub fn new(vocab_size: usize, d_model: usize, rng: &mut Prng) -> Self {
        Self {
            w: Param::new(Array2::randn(vocab_size, d_model, 0.02, rng)),
            ids: Vec::new(),
        }
    }

    pub fn forward(&mut self, ids: &[usize]) -> Array2 {
        self.ids = ids.to_vec();
        self.lookup(ids)
    }

    pub fn lookup(&self, ids: &[usize]) -> Array2 {
        let d = self.w.value.cols();
        let mut out = Array2::zeros(ids.len(), d);
        for (r, &id) in ids.iter().enumerate() {
            out.row_mut(r).copy_from_slice(self.w.value.row(id));
        }
        out
    }

    /// Scatter-add: a token that appears twice gets both contributions.
    pub fn backward(&mut self, grad_out: &Array2) {
        let mut grad = Array2::zeros(self.w.value.rows(), self.w.value.cols());
        for (r, &id) in self.ids.iter().enumerate() {
            for (g, d) in grad.row_mut(id).iter_mut().zip(grad_out.row(r)) {
                *g += *d;
            }
        }
        self.w.grad = grad;
    }
}

impl Module for Embedding {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param)) {
        f("W", &self.w);
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param)) {
        f("W", &mut self.w);
    }
}

// ---------------------------------------------------------------------------
// Positional encoding

/// Fixed sinusoidal table; adds `pe[t]` to every row at position `t`.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    pe: Array2,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, d_model: usize) -> Self {
        let mut pe = Array2::zeros(max_len, d_model);
        let k = -(10_000f32.ln()) / d_model as f32;
        for pos in 0..max_len {
            for i in (0..d_model).step_by(2) {
                let angle = pos as f32 * (i as f32 * k).exp();
                pe.set(pos, i, angle.sin());
                if i + 1 < d_model {
                    pe.set(pos, i + 1, angle.cos());
                }
            }
        }
        Self { pe }
    }

    pub fn table(&self) -> &Array2 {
        &self.pe
    }

    /// `x` is `(batch * seq, d_model)`.
    pub fn add_to(&self, x: &mut Array2, seq: usize) {
        for r in 0..x.rows() {
            let t = r % seq.max(1);
            for (v, p) in x.row_mut(r).iter_mut().zip(self.pe.row(t)) {
                *v += *p;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LayerNorm

pub const LAYER_NORM_EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Param,
    pub beta: Param,
    x_hat: Option<Array2>,
    std_inv: Vec<f32>,
}

impl LayerNorm {
    pub fn new(d_model: usize) -> Self {
        Self {
            gamma: Param::vector(d_model, 1.0),
            beta: Param::vector(d_model, 0.0),
            x_hat: None,
            std_inv: Vec::new(),
        }
    }

    pub fn forward(&mut self, x: &Array2) -> Array2 {
        let (out, x_hat, std_inv) = self.normalize(x);
        self.x_hat = Some(x_hat);
        self.std_inv = std_inv;
        out
    }

    pub fn apply(&self, x: &Array2) -> Array2 {
        self.normalize(x).0
    }

    fn normalize(&self, x: &Array2) -> (Array2, Array2, Vec<f32>) {
        let d = x.cols();
        let mut x_hat = Array2::zeros(x.rows(), d);
        let mut out = Array2::zeros(x.rows(), d);
        let mut std_inv = Vec::with_capacity(x.rows());
        let gamma = self.gamma.value.data();
        let beta = self.beta.value.data();
        for r in 0..x.rows() {
            let row = x.row(r);
            let mu = row.iter().sum::<f32>() / d as f32;
            let var = row.iter().map(|v| (v - mu) * (v - mu)).sum::<f32>() / d as f32;
            let inv = 1.0 / (var + LAYER_NORM_EPS).sqrt();
            std_inv.push(inv);
            for c in 0..d {
                let h = (row[c] - mu) * inv;
                x_hat.set(r, c, h);
                out.set(r, c, gamma[c] * h + beta[c]);
            }
        }
        (out, x_hat, std_inv)
    }

    /// dx = (1/D) * std_inv * (D*dx_hat - sum(dx_hat) - x_hat*sum(dx_hat*x_hat))
    pub fn backward(&mut self, grad_out: &Array2) -> Array2 {
        let d = grad_out.cols();
        let mut dx = Array2::zeros(grad_out.rows(), d);
        let Some(x_hat) = &self.x_hat else {
            return dx;
        };
        let gamma = self.gamma.value.data();
        let mut dgamma = vec![0.0; d];
        let mut dbeta = vec![0.0; d];
        let mut dx_hat = vec![0.0; d];

        for r in 0..grad_out.rows() {
            let g = grad_out.row(r);
            let h = x_hat.row(r);
            let mut sum_dxh = 0.0;
            let mut sum_dxh_h = 0.0;
            for c in 0..d {
                dgamma[c] += g[c] * h[c];
                dbeta[c] += g[c];
                dx_hat[c] = g[c] * gamma[c];
                sum_dxh += dx_hat[c];
                sum_dxh_h += dx_hat[c] * h[c];
            }
            let k = self.std_inv[r] / d as f32;
            let out = dx.row_mut(r);
            for c in 0..d {
                out[c] = k * (d as f32 * dx_hat[c] - sum_dxh - h[c] * sum_dxh_h);
            }
        }

        self.gamma.grad = Array2::from_vec(1, d, dgamma);
        self.beta.grad = Array2::from_vec(1, d, dbeta);
        dx
    }
}

impl Module for LayerNorm {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param)) {
        f("gamma", &self.gamma);
        f("beta", &self.beta);
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param)) {
        f("gamma", &mut self.gamma);
        f("beta", &mut self.beta);
    }
}

// ---------------------------------------------------------------------------
// FeedForward

/// `linear2(relu(linear1(x)))`
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub linear1: Linear,
    pub linear2: Linear,
    relu_mask: Vec<bool>,
}

impl FeedForward {
    pub fn new(d_model: usize, d_ff: usize, rng: &mut Prng) -> Self {
        Self {
            linear1: Linear::new(d_model, d_ff, true, rng),
            linear2: Linear::new(d_ff, d_model, true, rng),
            relu_mask: Vec::new(),
        }
    }

    pub fn forward(&mut self, x: &Array2) -> Array2 {
        let mut h = self.linear1.forward(x);
        self.relu_mask = h.data().iter().map(|v| *v > 0.0).collect();
        relu(&mut h);
        self.linear2.forward(&h)
    }

    pub fn apply(&self, x: &Array2) -> Array2 {
        let mut h = self.linear1.apply(x);
        relu(&mut h);
        self.linear2.apply(&h)
    }

    pub fn backward(&mut self, grad_out: &Array2) -> Array2 {
        let mut g = self.linear2.backward(grad_out);
        for (v, keep) in g.data_mut().iter_mut().zip(&self.relu_mask) {
            if !keep {
                *v = 0.0;
            }
        }
        self.linear1.backward(&g)
    }
}

fn relu(x: &mut Array2) {
    for v in x.data_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

impl Module for FeedForward {
    fn visit_params(&self, f: &mut dyn FnMut(&str, &Param)) {
        self.linear1.visit_params(&mut |n, p| f(&format!("linear1.{n}"), p));
        self.linear2.visit_params(&mut |n, p| f(&format!("linear2.{n}"), p));
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, &mut Param)) {
        self.linear1.visit_params_mut(&mut |n, p| f(&format!("linear1.{n}"), p));
        self.linear2.visit_params_mut(&mut |n, p| f(&format!("linear2.{n}"), p));
    }
}
