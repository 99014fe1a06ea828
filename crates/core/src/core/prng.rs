// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives weight init, batch sampling and token sampling so that a fixed
// seed reproduces the same model and the same generations.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32() >> 8;
        (x as f32) / ((1u32 << 24) as f32)
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        low + (self.next_u64() % span) as usize
    }

    /// Standard normal sample (Box-Muller).
    pub fn next_normal(&mut self) -> f32 {
        let u1 = self.next_f32_01().max(f32::MIN_POSITIVE);
        let u2 = self.next_f32_01();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }

    /// Draw an index with probability proportional to `weights`.
    ///
    /// Non-positive total mass falls back to the last index.
    pub fn choose_weighted(&mut self, weights: &[f32]) -> usize {
        if weights.is_empty() {
            return 0;
        }
        let total: f32 = weights.iter().filter(|w| w.is_finite()).sum();
        if total <= 0.0 {
            return weights.len() - 1;
        }
        let mut target = self.next_f32_01() * total;
        for (i, &w) in weights.iter().enumerate() {
            if !w.is_finite() {
                continue;
            }
            if target < w {
                return i;
            }
            target -= w;
        }
        weights.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn unit_interval_is_half_open() {
        let mut r = Prng::new(1);
        for _ in 0..10_000 {
            let x = r.next_f32_01();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn weighted_choice_skips_zero_mass() {
        let mut r = Prng::new(3);
        for _ in 0..200 {
            let i = r.choose_weighted(&[0.0, 1.0, 0.0]);
            assert_eq!(i, 1);
        }
    }

    #[test]
    fn normal_samples_are_centered() {
        let mut r = Prng::new(11);
        let n = 20_000;
        let mean: f32 = (0..n).map(|_| r.next_normal()).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
    }
}
