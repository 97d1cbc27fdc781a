//! Deterministic noise generation.
//!
//! Sampling reproducibility depends on every stochastic draw going through
//! one seeded generator, so the sampler creates a fresh [`Pcg32`] per call
//! instead of relying on backend RNG state. PCG32 (XSH-RR output function)
//! with Box-Muller for Gaussian variates.

use candle_core::{Device, Shape, Tensor};

const PCG_MULT: u64 = 6364136223846793005;
const DEFAULT_STREAM: u64 = 1442695040888963407;

/// PCG32 random number generator.
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Generator on the default stream.
    pub fn seed_from(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate.wrapping_mul(PCG_MULT).wrapping_add(self.inc);
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        (xorshifted >> rot) | (xorshifted << ((0u32).wrapping_sub(rot) & 31))
    }

    /// Uniform float in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        // 2^{-24}
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// One pair of standard normal variates via Box-Muller.
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let z0 = mag * (2.0 * std::f32::consts::PI * u2).cos();
        let z1 = mag * (2.0 * std::f32::consts::PI * u2).sin();
        (z0, z1)
    }

    /// Standard normal tensor of the given shape, f32.
    pub fn randn(
        &mut self,
        shape: impl Into<Shape>,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count);
        while data.len() < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            if data.len() < elem_count {
                data.push(z1);
            }
        }
        Tensor::from_vec(data, shape, device)
    }

    /// Standard normal tensor matching `t`'s shape, device and dtype.
    pub fn randn_like(&mut self, t: &Tensor) -> candle_core::Result<Tensor> {
        self.randn(t.shape().clone(), t.device())?.to_dtype(t.dtype())
    }

    /// Elementwise 0/1 keep-mask: each element is 0 with probability
    /// `drop_prob`, 1 otherwise. Survivors are not rescaled.
    pub fn keep_mask(
        &mut self,
        shape: impl Into<Shape>,
        drop_prob: f64,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let p = drop_prob as f32;
        let mut data = Vec::with_capacity(elem_count);
        for _ in 0..elem_count {
            data.push(if self.next_f32() < p { 0f32 } else { 1f32 });
        }
        Tensor::from_vec(data, shape, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Pcg32::seed_from(7);
        let mut b = Pcg32::seed_from(7);
        for _ in 0..64 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn gaussian_moments_are_plausible() {
        let mut rng = Pcg32::seed_from(42);
        let n = 20_000;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        for _ in 0..n / 2 {
            let (z0, z1) = rng.next_gaussian();
            sum += (z0 + z1) as f64;
            sum_sq += (z0 * z0 + z1 * z1) as f64;
        }
        let mean = sum / n as f64;
        let var = sum_sq / n as f64 - mean * mean;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }

    #[test]
    fn keep_mask_drop_rate() {
        let mut rng = Pcg32::seed_from(3);
        let mask = rng
            .keep_mask((100, 100), 0.25, &Device::Cpu)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let kept: f32 = mask.iter().sum();
        let rate = kept / mask.len() as f32;
        assert!((rate - 0.75).abs() < 0.02, "keep rate {rate}");
        assert!(mask.iter().all(|&v| v == 0.0 || v == 1.0));
    }
}
