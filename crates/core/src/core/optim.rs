//! Optimizers and gradient clipping.
//!
//! Optimizers walk the parameters of a [`Module`] in visit order; moment
//! buffers are keyed by that position.

use crate::array::Array2;
use crate::layers::{Module, Param};

pub trait Optimizer {
    fn set_lr(&mut self, lr: f32);
    fn lr(&self) -> f32;
    fn step(&mut self, model: &mut dyn Module);
}

#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self, model: &mut dyn Module) {
        let lr = self.lr;
        model.visit_params_mut(&mut |_, p| {
            for (w, g) in p.value.data_mut().iter_mut().zip(p.grad.data()) {
                *w -= lr * g;
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdamParams {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

/// Adam with bias correction and decoupled weight decay.
#[derive(Debug, Clone)]
pub struct Adam {
    pub params: AdamParams,
    t: u32,
    m: Vec<Array2>,
    v: Vec<Array2>,
}

impl Adam {
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn steps_taken(&self) -> u32 {
        self.t
    }

    fn ensure_state(&mut self, model: &dyn Module) {
        let mut shapes = Vec::new();
        model.visit_params(&mut |_, p| shapes.push((p.value.rows(), p.value.cols())));
        let matches = shapes.len() == self.m.len()
            && shapes
                .iter()
                .zip(&self.m)
                .all(|(&(r, c), m)| m.rows() == r && m.cols() == c);
        if !matches {
            self.m = shapes.iter().map(|&(r, c)| Array2::zeros(r, c)).collect();
            self.v = self.m.clone();
            self.t = 0;
        }
    }
}

impl Optimizer for Adam {
    fn set_lr(&mut self, lr: f32) {
        self.params.lr = lr;
    }

    fn lr(&self) -> f32 {
        self.params.lr
    }

    fn step(&mut self, model: &mut dyn Module) {
        self.ensure_state(model);
        self.t += 1;
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);

        let m_all = &mut self.m;
        let v_all = &mut self.v;
        let mut idx = 0;
        model.visit_params_mut(&mut |_, p: &mut Param| {
            let m = m_all[idx].data_mut();
            let v = v_all[idx].data_mut();
            idx += 1;
            let grads = p.grad.data();
            for (i, w) in p.value.data_mut().iter_mut().enumerate() {
                let g = grads[i];
                m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                let m_hat = m[i] / bc1;
                let v_hat = v[i] / bc2;
                if weight_decay > 0.0 {
                    *w -= lr * weight_decay * *w;
                }
                *w -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        });
    }
}

/// Global L2 norm over every gradient.
pub fn grad_norm(model: &dyn Module) -> f32 {
    let mut sq = 0.0f32;
    model.visit_params(&mut |_, p| sq += p.grad.sum_sq());
    sq.sqrt()
}

/// Rescale all gradients so their global norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(model: &mut dyn Module, max_norm: f32) -> f32 {
    let norm = grad_norm(model);
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-8);
        model.visit_params_mut(&mut |_, p| p.grad.scale(scale));
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use crate::prng::Prng;

    fn params(wd: f32) -> AdamParams {
        AdamParams {
            lr: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: wd,
        }
    }

    fn single_weight(value: f32, grad: f32) -> Linear {
        let mut lin = Linear::new(1, 1, false, &mut Prng::new(1));
        lin.w.value.set(0, 0, value);
        lin.w.grad.set(0, 0, grad);
        lin
    }

    #[test]
    fn first_adam_step_moves_by_lr() {
        // With bias correction the first update is lr * g / |g|.
        let mut lin = single_weight(1.0, 0.5);
        let mut adam = Adam::new(params(0.0));
        adam.step(&mut lin);
        assert!((lin.w.value.get(0, 0) - 0.9).abs() < 1e-5);
    }

    #[test]
    fn weight_decay_is_applied_once_per_step() {
        let mut lin = single_weight(2.0, 0.0);
        let mut adam = Adam::new(params(0.5));
        adam.step(&mut lin);
        // zero gradient: only decay moves the weight, 2 - 0.1*0.5*2
        assert!((lin.w.value.get(0, 0) - 1.9).abs() < 1e-6);
    }

    #[test]
    fn clipping_caps_global_norm() {
        let mut lin = single_weight(0.0, 10.0);
        let before = clip_grad_norm(&mut lin, 1.0);
        assert!((before - 10.0).abs() < 1e-5);
        assert!((grad_norm(&lin) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn sgd_follows_negative_gradient() {
        let mut lin = single_weight(1.0, 2.0);
        Sgd::new(0.25).step(&mut lin);
        assert_eq!(lin.w.value.get(0, 0), 0.5);
    }
}
