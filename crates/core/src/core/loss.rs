//! Cross-entropy fused with log-softmax.

use crate::array::Array2;

/// Mean negative log-likelihood of `targets` under `logits` (one row per
/// position), plus the gradient w.r.t. the logits: `(softmax - onehot) / N`.
pub fn cross_entropy(logits: &Array2, targets: &[usize]) -> (f32, Array2) {
    let n = logits.rows();
    debug_assert_eq!(n, targets.len());
    let mut grad = Array2::zeros(n, logits.cols());
    if n == 0 {
        return (0.0, grad);
    }

    let mut total = 0.0f64;
    let inv_n = 1.0 / n as f32;
    for (r, &t) in targets.iter().enumerate() {
        let row = logits.row(r);
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum_exp: f32 = row.iter().map(|v| (v - max).exp()).sum();
        let log_z = max + sum_exp.ln();
        total += f64::from(log_z - row[t]);

        let g = grad.row_mut(r);
        for (c, v) in row.iter().enumerate() {
            g[c] = (v - log_z).exp() * inv_n;
        }
        g[t] -= inv_n;
    }
    ((total / n as f64) as f32, grad)
}

/// Loss only, for evaluation.
pub fn cross_entropy_loss(logits: &Array2, targets: &[usize]) -> f32 {
    cross_entropy(logits, targets).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Array2::zeros(3, 4);
        let (loss, _) = cross_entropy(&logits, &[0, 1, 3]);
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn gradient_rows_sum_to_zero() {
        let logits = Array2::from_vec(2, 3, vec![1.0, 2.0, 0.5, -1.0, 0.0, 3.0]);
        let (_, g) = cross_entropy(&logits, &[1, 2]);
        for r in 0..2 {
            assert!(g.row(r).iter().sum::<f32>().abs() < 1e-6);
        }
        assert!(g.get(0, 1) < 0.0);
    }

    #[test]
    fn confident_correct_prediction_has_small_loss() {
        let logits = Array2::from_vec(1, 3, vec![20.0, 0.0, 0.0]);
        assert!(cross_entropy_loss(&logits, &[0]) < 1e-6);
    }
}
