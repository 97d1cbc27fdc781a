//! Classifier-free guidance composition.
//!
//! Combines conditional and unconditional denoiser outputs into one guided
//! estimate, with an optional camera-conditioning guidance term (its own
//! scale and weight schedule) and optional guidance rescaling that pulls
//! the guided estimate's per-sample standard deviation back toward the
//! conditional one.

use candle_core::Tensor;

use crate::conditioning::Conditioning;
use crate::error::{Result, SamplerError};
use crate::model::Denoiser;

/// Weight schedule for the camera-conditioning guidance term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfgWeightSchedule {
    /// Constant weight 1.
    Constant,
    /// `cos((1 - t / (N-1)) * pi / 2)`: near zero at the noisy end,
    /// approaching one as the latent cleans up.
    Cosine,
}

impl std::str::FromStr for CfgWeightSchedule {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "constant" => Ok(Self::Constant),
            "cosine" => Ok(Self::Cosine),
            other => Err(SamplerError::unsupported(format!(
                "unknown guidance weight schedule {other:?}"
            ))),
        }
    }
}

/// Secondary guidance over the camera conditioning signal.
#[derive(Debug, Clone)]
pub struct CameraGuidance {
    pub scale: f64,
    pub schedule: CfgWeightSchedule,
}

impl Default for CameraGuidance {
    fn default() -> Self {
        Self {
            scale: 1.0,
            schedule: CfgWeightSchedule::Constant,
        }
    }
}

/// Guidance configuration for one sampling call.
#[derive(Debug, Clone)]
pub struct GuidanceConfig {
    /// Classifier-free guidance scale; 1 disables guidance entirely.
    pub scale: f64,
    /// Guidance-rescale blend factor in `[0, 1]`; 0 is a no-op.
    pub rescale: f64,
    pub camera: Option<CameraGuidance>,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            rescale: 0.0,
            camera: None,
        }
    }
}

impl GuidanceConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.rescale) {
            return Err(SamplerError::invalid(format!(
                "guidance rescale must be in [0, 1], got {}",
                self.rescale
            )));
        }
        Ok(())
    }
}

/// Produce the guided noise/velocity estimate for one step.
///
/// Without an unconditional bundle (or with `scale == 1`) this is a single
/// conditional denoiser call returned unchanged. Otherwise the classic CFG
/// combination runs, the camera term adds a third, camera-ablated call,
/// and `rescale > 0` renormalizes the result.
pub fn compose(
    model: &dyn Denoiser,
    latent: &Tensor,
    timesteps: &[usize],
    cond: &Conditioning,
    uncond: Option<&Conditioning>,
    config: &GuidanceConfig,
    num_base_timesteps: usize,
) -> Result<Tensor> {
    config.validate()?;

    let uncond = match uncond {
        Some(uc) if config.scale != 1.0 => uc,
        _ => return model.predict(latent, timesteps, cond),
    };

    let e_t_cond = model.predict(latent, timesteps, cond)?;

    // The unconditional branch keeps the camera pose but carries the
    // unconditional flag, mirroring what the denoiser saw in training.
    let uncond_flagged;
    let uncond = if let Some(camera) = &cond.camera {
        let mut uc = uncond.clone();
        uc.camera = Some(camera.as_unconditional());
        uncond_flagged = uc;
        &uncond_flagged
    } else {
        uncond
    };
    let e_t_uncond = model.predict(latent, timesteps, uncond)?;

    let delta = (&e_t_cond - &e_t_uncond)?;
    let mut guided = (&e_t_uncond + (delta * config.scale)?)?;

    if let Some(camera_cfg) = &config.camera {
        if cond.camera.is_some() && camera_cfg.scale != 1.0 {
            let e_t_ablated = model.predict(latent, timesteps, &cond.without_camera())?;
            let camera_delta = (&e_t_cond - &e_t_ablated)?;
            let term = match camera_cfg.schedule {
                CfgWeightSchedule::Constant => (camera_delta * (camera_cfg.scale - 1.0))?,
                CfgWeightSchedule::Cosine => {
                    let w = cosine_weight(timesteps, num_base_timesteps, &camera_delta)?;
                    (camera_delta.broadcast_mul(&w)? * (camera_cfg.scale - 1.0))?
                }
            };
            guided = (&guided + term)?;
        }
    }

    if config.rescale > 0.0 {
        guided = rescale_noise_cfg(&guided, &e_t_cond, config.rescale)?;
    }
    Ok(guided)
}

/// Per-batch cosine decay weight shaped `[B, 1, ..., 1]` at the latent's
/// own rank, so the same code broadcasts over image and video latents.
fn cosine_weight(timesteps: &[usize], num_base_timesteps: usize, like: &Tensor) -> Result<Tensor> {
    let denom = num_base_timesteps.saturating_sub(1).max(1) as f64;
    let vals: Vec<f32> = timesteps
        .iter()
        .map(|&t| (((1.0 - t as f64 / denom) * std::f64::consts::FRAC_PI_2).cos()) as f32)
        .collect();
    let mut shape = vec![timesteps.len()];
    shape.extend(std::iter::repeat(1).take(like.rank().saturating_sub(1)));
    let w = Tensor::from_vec(vals, shape, like.device())?;
    Ok(w.to_dtype(like.dtype())?)
}

fn std_over_batch_keepdim(x: &Tensor) -> Result<Tensor> {
    let rank = x.rank();
    if rank < 2 {
        return Err(SamplerError::invalid(format!(
            "guidance rescale expects rank >= 2, got {rank}"
        )));
    }
    let b = x.dim(0)?;
    let flat = x.flatten_from(1)?;
    let std = flat.var_keepdim(1)?.sqrt()?;
    let mut shape = Vec::with_capacity(rank);
    shape.push(b);
    shape.extend(std::iter::repeat(1).take(rank - 1));
    Ok(std.reshape(shape)?)
}

/// Renormalize the guided estimate's per-sample standard deviation toward
/// the conditional estimate's, blended by `factor`. Exact identity at 0.
pub fn rescale_noise_cfg(guided: &Tensor, conditional: &Tensor, factor: f64) -> Result<Tensor> {
    if factor == 0.0 {
        return Ok(guided.clone());
    }
    let std_cond = std_over_batch_keepdim(conditional)?;
    let std_guided = std_over_batch_keepdim(guided)?;
    let ratio = std_cond.broadcast_div(&std_guided)?;
    let renormalized = guided.broadcast_mul(&ratio)?;
    let a = renormalized.affine(factor, 0.0)?;
    let b = guided.affine(1.0 - factor, 0.0)?;
    Ok(a.broadcast_add(&b)?)
}
