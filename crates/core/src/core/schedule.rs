//! Learning-rate schedules.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    /// Cosine annealing from the base rate down to 0.
    Cosine,
    /// SGDR: cosine cycles that double in length after each restart.
    CosineRestarts,
}

const RESTARTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Scheduler {
    kind: LrSchedule,
    base_lr: f32,
    total_steps: usize,
    t_0: usize,
    step: usize,
}

impl Scheduler {
    pub fn new(kind: LrSchedule, base_lr: f32, total_steps: usize) -> Self {
        // 1 + 2 + 4 cycles fill the run when T_mult = 2.
        let divisor = (1usize << RESTARTS) - 1;
        Self {
            kind,
            base_lr,
            total_steps,
            t_0: (total_steps / divisor).max(1),
            step: 0,
        }
    }

    pub fn lr_at(&self, step: usize) -> f32 {
        if self.total_steps <= 1 {
            return self.base_lr;
        }
        match self.kind {
            LrSchedule::Constant => self.base_lr,
            LrSchedule::Cosine => {
                let progress = (step as f32 / self.total_steps as f32).min(1.0);
                self.base_lr * 0.5 * (1.0 + (PI * progress).cos())
            }
            LrSchedule::CosineRestarts => {
                let mut s = step;
                let mut cycle = self.t_0;
                while s >= cycle {
                    s -= cycle;
                    cycle *= 2;
                }
                let progress = s as f32 / cycle as f32;
                self.base_lr * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }

    /// Rate for the current step, then advance.
    pub fn next_lr(&mut self) -> f32 {
        let lr = self.lr_at(self.step);
        self.step += 1;
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_never_moves() {
        let mut s = Scheduler::new(LrSchedule::Constant, 0.01, 100);
        for _ in 0..100 {
            assert_eq!(s.next_lr(), 0.01);
        }
    }

    #[test]
    fn cosine_starts_at_base_and_ends_near_zero() {
        let s = Scheduler::new(LrSchedule::Cosine, 1.0, 100);
        assert_eq!(s.lr_at(0), 1.0);
        assert!((s.lr_at(50) - 0.5).abs() < 1e-5);
        assert!(s.lr_at(100) < 1e-6);
    }

    #[test]
    fn restarts_jump_back_to_base() {
        let s = Scheduler::new(LrSchedule::CosineRestarts, 1.0, 70);
        // T_0 = 10, then cycles of 20 and 40
        assert_eq!(s.lr_at(0), 1.0);
        assert!(s.lr_at(9) < 0.1);
        assert_eq!(s.lr_at(10), 1.0);
        assert_eq!(s.lr_at(30), 1.0);
    }

    #[test]
    fn single_step_runs_use_base_rate() {
        for kind in [LrSchedule::Cosine, LrSchedule::CosineRestarts] {
            assert_eq!(Scheduler::new(kind, 0.3, 1).lr_at(0), 0.3);
        }
    }

    #[test]
    fn names_round_trip_through_serde() {
        let s: LrSchedule = serde_json::from_str("\"cosine_restarts\"").expect("parse");
        assert_eq!(s, LrSchedule::CosineRestarts);
    }
}
