//! Collaborator interfaces and base diffusion coefficients.
//!
//! The denoising network is a black box behind the [`Denoiser`] trait; the
//! sampler only relies on it being deterministic for fixed inputs. The
//! [`BaseSchedule`] carries the full-length training schedule (cumulative
//! alpha products and friends) that every DDIM subsequence is derived from,
//! together with the forward-noising map and the v-parameterization
//! identities.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::conditioning::Conditioning;
use crate::error::{Result, SamplerError};

/// Quantity the denoiser was trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameterization {
    /// Network predicts the noise directly.
    Eps,
    /// Network predicts a velocity blend of signal and noise.
    V,
}

impl std::str::FromStr for Parameterization {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eps" => Ok(Self::Eps),
            "v" => Ok(Self::V),
            other => Err(SamplerError::invalid(format!(
                "unknown parameterization {other:?} (expected \"eps\" or \"v\")"
            ))),
        }
    }
}

/// The denoising network collaborator.
///
/// `predict` must return a tensor of the same shape as `latent` and be
/// deterministic given identical inputs (assumed, not enforced).
pub trait Denoiser {
    fn predict(
        &self,
        latent: &Tensor,
        timesteps: &[usize],
        conditioning: &Conditioning,
    ) -> Result<Tensor>;

    /// Quantize a predicted clean latent through the first-stage codebook.
    /// The default has no quantizer and rejects the request.
    fn quantize_denoised(&self, pred_clean: &Tensor) -> Result<Tensor> {
        let _ = pred_clean;
        Err(SamplerError::unsupported(
            "denoiser exposes no latent quantizer",
        ))
    }
}

/// External score-correction hook, applied to the noise estimate before the
/// transition math. Only legal under eps parameterization.
pub trait ScoreCorrector {
    fn modify_score(
        &self,
        eps: &Tensor,
        latent: &Tensor,
        timesteps: &[usize],
        conditioning: &Conditioning,
    ) -> Result<Tensor>;
}

/// Full-length training schedule coefficients.
///
/// Immutable once built; shared by every sampling call on a sampler
/// instance. All derived DDIM schedules index into these arrays.
#[derive(Debug, Clone)]
pub struct BaseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    parameterization: Parameterization,
    scale_arr: Option<Vec<f64>>,
}

impl BaseSchedule {
    /// Build from a per-step beta array.
    pub fn from_betas(betas: Vec<f64>, parameterization: Parameterization) -> Result<Self> {
        if betas.is_empty() {
            return Err(SamplerError::invalid("beta schedule is empty"));
        }
        if betas.iter().any(|&b| !(0.0..1.0).contains(&b)) {
            return Err(SamplerError::invalid("betas must lie in [0, 1)"));
        }
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0;
        for &beta in betas.iter() {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }
        let mut alphas_cumprod_prev = Vec::with_capacity(betas.len());
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..alphas_cumprod.len() - 1]);
        Ok(Self {
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            parameterization,
            scale_arr: None,
        })
    }

    /// Build from the cumulative alpha-product array exposed by the
    /// denoiser collaborator. The array must cover every base timestep.
    pub fn from_alphas_cumprod(
        num_timesteps: usize,
        alphas_cumprod: Vec<f64>,
        parameterization: Parameterization,
    ) -> Result<Self> {
        if num_timesteps == 0 {
            return Err(SamplerError::invalid("base schedule is empty"));
        }
        if alphas_cumprod.len() != num_timesteps {
            return Err(SamplerError::invalid(format!(
                "alphas must be defined for each timestep: got {} for {num_timesteps}",
                alphas_cumprod.len()
            )));
        }
        if alphas_cumprod.iter().any(|&a| !(0.0..=1.0).contains(&a)) {
            return Err(SamplerError::invalid(
                "cumulative alpha products must lie in (0, 1]",
            ));
        }
        let mut prev = 1.0;
        let betas = alphas_cumprod
            .iter()
            .map(|&a| {
                let beta = 1.0 - a / prev;
                prev = a;
                beta
            })
            .collect::<Vec<_>>();
        if betas.iter().any(|&b| b <= 0.0 || b >= 1.0) {
            return Err(SamplerError::invalid(
                "cumulative alpha products must be strictly decreasing",
            ));
        }
        let mut alphas_cumprod_prev = Vec::with_capacity(num_timesteps);
        alphas_cumprod_prev.push(1.0);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..num_timesteps - 1]);
        Ok(Self {
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            parameterization,
            scale_arr: None,
        })
    }

    /// Linear beta schedule.
    pub fn linear(
        num_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        parameterization: Parameterization,
    ) -> Result<Self> {
        if num_timesteps < 2 {
            return Err(SamplerError::invalid("need at least 2 base timesteps"));
        }
        let betas = (0..num_timesteps)
            .map(|i| {
                let t = i as f64 / (num_timesteps - 1) as f64;
                beta_start + t * (beta_end - beta_start)
            })
            .collect();
        Self::from_betas(betas, parameterization)
    }

    /// Scaled-linear beta schedule (linear in sqrt-beta space), the common
    /// latent-diffusion default.
    pub fn scaled_linear(
        num_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        parameterization: Parameterization,
    ) -> Result<Self> {
        if num_timesteps < 2 {
            return Err(SamplerError::invalid("need at least 2 base timesteps"));
        }
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        let betas = (0..num_timesteps)
            .map(|i| {
                let t = i as f64 / (num_timesteps - 1) as f64;
                let b = start + t * (end - start);
                b * b
            })
            .collect();
        Self::from_betas(betas, parameterization)
    }

    /// Attach dynamic-rescale scale factors (one per base timestep).
    pub fn with_dynamic_rescale(mut self, scale_arr: Vec<f64>) -> Result<Self> {
        if scale_arr.len() != self.num_timesteps() {
            return Err(SamplerError::invalid(format!(
                "scale array has length {}, base schedule has {} timesteps",
                scale_arr.len(),
                self.num_timesteps()
            )));
        }
        self.scale_arr = Some(scale_arr);
        Ok(self)
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    pub fn parameterization(&self) -> Parameterization {
        self.parameterization
    }

    pub fn scale_arr(&self) -> Option<&[f64]> {
        self.scale_arr.as_deref()
    }

    /// Forward-noising map: `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise` with
    /// per-batch timestep gather. Deterministic given `noise`.
    pub fn q_sample(&self, x0: &Tensor, timesteps: &[usize], noise: &Tensor) -> Result<Tensor> {
        let sqrt_a = self.gather(timesteps, x0, |a| a.sqrt())?;
        let sqrt_one_minus_a = self.gather(timesteps, x0, |a| (1.0 - a).sqrt())?;
        let signal = x0.broadcast_mul(&sqrt_a)?;
        let noised = noise.broadcast_mul(&sqrt_one_minus_a)?;
        Ok((signal + noised)?)
    }

    /// `eps = sqrt(a_t) * v + sqrt(1 - a_t) * x_t`.
    pub fn predict_eps_from_z_and_v(
        &self,
        latent: &Tensor,
        timesteps: &[usize],
        v: &Tensor,
    ) -> Result<Tensor> {
        let sqrt_a = self.gather(timesteps, latent, |a| a.sqrt())?;
        let sqrt_one_minus_a = self.gather(timesteps, latent, |a| (1.0 - a).sqrt())?;
        Ok((v.broadcast_mul(&sqrt_a)? + latent.broadcast_mul(&sqrt_one_minus_a)?)?)
    }

    /// `x0 = sqrt(a_t) * x_t - sqrt(1 - a_t) * v`.
    pub fn predict_start_from_z_and_v(
        &self,
        latent: &Tensor,
        timesteps: &[usize],
        v: &Tensor,
    ) -> Result<Tensor> {
        let sqrt_a = self.gather(timesteps, latent, |a| a.sqrt())?;
        let sqrt_one_minus_a = self.gather(timesteps, latent, |a| (1.0 - a).sqrt())?;
        Ok((latent.broadcast_mul(&sqrt_a)? - v.broadcast_mul(&sqrt_one_minus_a)?)?)
    }

    /// Gather a derived cumulative-alpha coefficient per batch element and
    /// shape it `[B, 1, ..., 1]` at the reference tensor's rank.
    fn gather<F: Fn(f64) -> f64>(
        &self,
        timesteps: &[usize],
        like: &Tensor,
        f: F,
    ) -> Result<Tensor> {
        let n = self.num_timesteps();
        let mut vals = Vec::with_capacity(timesteps.len());
        for &t in timesteps {
            if t >= n {
                return Err(SamplerError::invalid(format!(
                    "timestep {t} out of range for base schedule of length {n}"
                )));
            }
            vals.push(f(self.alphas_cumprod[t]) as f32);
        }
        let mut shape = vec![timesteps.len()];
        shape.extend(std::iter::repeat(1).take(like.rank().saturating_sub(1)));
        let coeff = Tensor::from_vec(vals, shape, like.device())?;
        Ok(coeff.to_dtype(like.dtype())?)
    }
}
