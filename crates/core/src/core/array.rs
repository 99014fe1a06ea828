//! Dense row-major f32 matrices.
//!
//! Activations are kept flat as `(batch * seq, features)`; the attention layer
//! indexes into them per (batch, head) itself.

use crate::prng::Prng;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Array2 {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Array2 {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Build from row-major data. Panics if `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols, "Array2::from_vec: bad length");
        Self { rows, cols, data }
    }

    /// Gaussian init scaled by `scale`.
    pub fn randn(rows: usize, cols: usize, scale: f32, rng: &mut Prng) -> Self {
        let data = (0..rows * cols).map(|_| rng.next_normal() * scale).collect();
        Self { rows, cols, data }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        let c = self.cols;
        &mut self.data[r * c..(r + 1) * c]
    }

    pub fn fill(&mut self, v: f32) {
        self.data.iter_mut().for_each(|x| *x = v);
    }

    pub fn scale(&mut self, s: f32) {
        self.data.iter_mut().for_each(|x| *x *= s);
    }

    pub fn add_assign(&mut self, other: &Array2) {
        debug_assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
    }

    pub fn add(&self, other: &Array2) -> Array2 {
        let mut out = self.clone();
        out.add_assign(other);
        out
    }

    /// Add `bias` to every row.
    pub fn add_row_broadcast(&mut self, bias: &[f32]) {
        debug_assert_eq!(bias.len(), self.cols);
        for r in 0..self.rows {
            for (x, b) in self.row_mut(r).iter_mut().zip(bias.iter()) {
                *x += *b;
            }
        }
    }

    /// Sum over rows (one value per column).
    pub fn column_sums(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.cols];
        for r in 0..self.rows {
            for (o, x) in out.iter_mut().zip(self.row(r)) {
                *o += *x;
            }
        }
        out
    }

    pub fn sum_sq(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum()
    }

    pub fn transpose(&self) -> Array2 {
        let mut out = Array2::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }

    /// `self @ other`
    pub fn matmul(&self, other: &Array2) -> Array2 {
        assert_eq!(self.cols, other.rows, "matmul: inner dims differ");
        let n = other.cols;
        let mut out = Array2::zeros(self.rows, n);
        let fill_row = |r: usize, out_row: &mut [f32]| {
            let a = self.row(r);
            for (k, &av) in a.iter().enumerate() {
                if av == 0.0 {
                    continue;
                }
                let b = other.row(k);
                for (o, &bv) in out_row.iter_mut().zip(b) {
                    *o += av * bv;
                }
            }
        };

        #[cfg(feature = "parallel")]
        out.data
            .par_chunks_mut(n.max(1))
            .enumerate()
            .for_each(|(r, row)| fill_row(r, row));

        #[cfg(not(feature = "parallel"))]
        for (r, row) in out.data.chunks_mut(n.max(1)).enumerate() {
            fill_row(r, row);
        }

        out
    }

    /// `self @ other^T`
    pub fn matmul_t(&self, other: &Array2) -> Array2 {
        assert_eq!(self.cols, other.cols, "matmul_t: inner dims differ");
        let mut out = Array2::zeros(self.rows, other.rows);
        for r in 0..self.rows {
            let a = self.row(r);
            for j in 0..other.rows {
                out.data[r * other.rows + j] = dot(a, other.row(j));
            }
        }
        out
    }

    /// `self^T @ other`
    pub fn t_matmul(&self, other: &Array2) -> Array2 {
        assert_eq!(self.rows, other.rows, "t_matmul: outer dims differ");
        let mut out = Array2::zeros(self.cols, other.cols);
        for r in 0..self.rows {
            let a = self.row(r);
            let b = other.row(r);
            for (i, &av) in a.iter().enumerate() {
                if av == 0.0 {
                    continue;
                }
                let o = &mut out.data[i * other.cols..(i + 1) * other.cols];
                for (x, &bv) in o.iter_mut().zip(b) {
                    *x += av * bv;
                }
            }
        }
        out
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Population standard deviation.
    pub fn std(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let m = self.mean();
        let var = self.data.iter().map(|x| (x - m) * (x - m)).sum::<f32>() / self.data.len() as f32;
        var.sqrt()
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Numerically stable softmax (subtracts the max before exponentiating).
pub fn softmax(xs: &[f32]) -> Vec<f32> {
    let mut out = xs.to_vec();
    softmax_in_place(&mut out);
    out
}

pub fn softmax_in_place(xs: &mut [f32]) {
    if xs.is_empty() {
        return;
    }
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for x in xs.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    if sum > 0.0 {
        for x in xs.iter_mut() {
            *x /= sum;
        }
    }
}
