//! DDIM schedule construction.
//!
//! A sampling call selects a strictly increasing subsequence of the base
//! training timesteps and precomputes per-step coefficients: alphas, the
//! shifted previous-step alphas, `sqrt(1 - alpha)` and the eta-scaled
//! sigmas. The schedule is a call-scoped immutable value; nothing here is
//! cached on the sampler, so concurrent calls never observe each other's
//! schedule.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SamplerError};
use crate::model::BaseSchedule;

/// How the DDIM subsequence is drawn from the base schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    /// Evenly spaced over `[0, N-1]`; always includes the last base step.
    Uniform,
    /// Even stride anchored at the last base step, `round(j*N/T) - 1`.
    UniformTrailing,
    /// Squared linspace up to `0.8 * N`; denser near the clean end.
    Quadratic,
}

impl std::str::FromStr for TimestepSpacing {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "uniform_trailing" => Ok(Self::UniformTrailing),
            "quadratic" | "quad" => Ok(Self::Quadratic),
            other => Err(SamplerError::invalid(format!(
                "unknown timestep spacing {other:?}"
            ))),
        }
    }
}

/// Precomputed coefficients for one reverse trajectory.
///
/// `timesteps` is ascending; the sampling loop walks indices from
/// `len() - 1` down to 0. `alphas_prev[0]` self-references `alphas[0]`,
/// which makes `sigmas[0]` exactly zero.
#[derive(Debug, Clone)]
pub struct DdimSchedule {
    timesteps: Vec<usize>,
    alphas: Vec<f64>,
    alphas_prev: Vec<f64>,
    sqrt_one_minus_alphas: Vec<f64>,
    sigmas: Vec<f64>,
    scales: Option<Vec<f64>>,
    scales_prev: Option<Vec<f64>>,
    eta: f64,
}

impl DdimSchedule {
    /// Derive the schedule for `num_steps` DDIM steps.
    ///
    /// `eta` interpolates between the deterministic DDIM trajectory (0)
    /// and full ancestral-sampling variance (1). Same inputs always yield
    /// the same schedule.
    pub fn build(
        base: &BaseSchedule,
        num_steps: usize,
        spacing: TimestepSpacing,
        eta: f64,
    ) -> Result<Self> {
        let n = base.num_timesteps();
        if num_steps == 0 || num_steps > n {
            return Err(SamplerError::invalid(format!(
                "num_steps must be in [1, {n}], got {num_steps}"
            )));
        }
        if !(0.0..=1.0).contains(&eta) {
            return Err(SamplerError::invalid(format!(
                "eta must be in [0, 1], got {eta}"
            )));
        }

        let timesteps = select_timesteps(spacing, num_steps, n)?;
        let cumprod = base.alphas_cumprod();

        let alphas: Vec<f64> = timesteps.iter().map(|&t| cumprod[t]).collect();
        let mut alphas_prev = Vec::with_capacity(num_steps);
        alphas_prev.push(alphas[0]);
        alphas_prev.extend_from_slice(&alphas[..num_steps - 1]);

        let sqrt_one_minus_alphas: Vec<f64> = alphas.iter().map(|&a| (1.0 - a).sqrt()).collect();
        let sigmas: Vec<f64> = alphas
            .iter()
            .zip(alphas_prev.iter())
            .map(|(&a, &ap)| eta * ((1.0 - ap) / (1.0 - a) * (1.0 - a / ap)).sqrt())
            .collect();

        let (scales, scales_prev) = match base.scale_arr() {
            Some(arr) => {
                let s: Vec<f64> = timesteps.iter().map(|&t| arr[t]).collect();
                let mut sp = Vec::with_capacity(num_steps);
                sp.push(s[0]);
                sp.extend_from_slice(&s[..num_steps - 1]);
                (Some(s), Some(sp))
            }
            None => (None, None),
        };

        Ok(Self {
            timesteps,
            alphas,
            alphas_prev,
            sqrt_one_minus_alphas,
            sigmas,
            scales,
            scales_prev,
            eta,
        })
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    /// Selected base-schedule timesteps, ascending.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_prev(&self) -> &[f64] {
        &self.alphas_prev
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn alpha(&self, index: usize) -> f64 {
        self.alphas[index]
    }

    pub fn alpha_prev(&self, index: usize) -> f64 {
        self.alphas_prev[index]
    }

    pub fn sigma(&self, index: usize) -> f64 {
        self.sigmas[index]
    }

    pub fn sqrt_one_minus_alpha(&self, index: usize) -> f64 {
        self.sqrt_one_minus_alphas[index]
    }

    pub fn sqrt_alpha(&self, index: usize) -> f64 {
        self.alphas[index].sqrt()
    }

    /// Dynamic-rescale ratio `scale_prev / scale`, when the base schedule
    /// carries scale factors.
    pub fn scale_ratio(&self, index: usize) -> Option<f64> {
        match (&self.scales, &self.scales_prev) {
            (Some(s), Some(sp)) => Some(sp[index] / s[index]),
            _ => None,
        }
    }
}

fn select_timesteps(
    spacing: TimestepSpacing,
    num_steps: usize,
    num_base: usize,
) -> Result<Vec<usize>> {
    let steps = match spacing {
        TimestepSpacing::Uniform => {
            if num_steps == 1 {
                vec![num_base - 1]
            } else {
                let scale = (num_base - 1) as f64 / (num_steps - 1) as f64;
                (0..num_steps)
                    .map(|i| (i as f64 * scale).round() as usize)
                    .collect()
            }
        }
        TimestepSpacing::UniformTrailing => {
            let stride = num_base as f64 / num_steps as f64;
            (1..=num_steps)
                .map(|j| (j as f64 * stride).round() as usize - 1)
                .collect()
        }
        TimestepSpacing::Quadratic => {
            let max = (num_base as f64 * 0.8).sqrt();
            let mut steps: Vec<usize> = (0..num_steps)
                .map(|i| {
                    let v = if num_steps == 1 {
                        0.0
                    } else {
                        i as f64 * max / (num_steps - 1) as f64
                    };
                    (v * v) as usize
                })
                .collect();
            // Squaring truncates early values onto each other; bump
            // duplicates to keep the selection strictly increasing.
            for i in 1..steps.len() {
                if steps[i] <= steps[i - 1] {
                    steps[i] = steps[i - 1] + 1;
                }
            }
            steps
        }
    };

    if let Some(&last) = steps.last() {
        if last >= num_base {
            return Err(SamplerError::invalid(format!(
                "selected timestep {last} exceeds base schedule length {num_base}"
            )));
        }
    }
    debug_assert!(steps.windows(2).all(|w| w[0] < w[1]));
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameterization;

    fn base(n: usize) -> BaseSchedule {
        BaseSchedule::linear(n, 1e-4, 2e-2, Parameterization::Eps).unwrap()
    }

    #[test]
    fn uniform_covers_both_ends() {
        let ts = select_timesteps(TimestepSpacing::Uniform, 50, 1000).unwrap();
        assert_eq!(ts.len(), 50);
        assert_eq!(ts[0], 0);
        assert_eq!(*ts.last().unwrap(), 999);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn trailing_anchors_last_step() {
        let ts = select_timesteps(TimestepSpacing::UniformTrailing, 50, 1000).unwrap();
        assert_eq!(ts.len(), 50);
        assert_eq!(ts[0], 19);
        assert_eq!(*ts.last().unwrap(), 999);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn quadratic_is_strictly_increasing() {
        let ts = select_timesteps(TimestepSpacing::Quadratic, 100, 1000).unwrap();
        assert_eq!(ts.len(), 100);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        assert!(*ts.last().unwrap() < 1000);
    }

    #[test]
    fn boundary_self_reference_zeroes_first_sigma() {
        let schedule = DdimSchedule::build(&base(1000), 20, TimestepSpacing::Uniform, 1.0).unwrap();
        assert_eq!(schedule.alpha_prev(0), schedule.alpha(0));
        assert_eq!(schedule.sigma(0), 0.0);
    }

    #[test]
    fn eta_zero_means_all_sigmas_zero() {
        let schedule = DdimSchedule::build(&base(1000), 25, TimestepSpacing::Uniform, 0.0).unwrap();
        assert!(schedule.sigmas().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let b = base(100);
        assert!(DdimSchedule::build(&b, 0, TimestepSpacing::Uniform, 0.0).is_err());
        assert!(DdimSchedule::build(&b, 101, TimestepSpacing::Uniform, 0.0).is_err());
        assert!(DdimSchedule::build(&b, 10, TimestepSpacing::Uniform, 1.5).is_err());
        assert!(DdimSchedule::build(&b, 10, TimestepSpacing::Uniform, -0.1).is_err());
    }
}
