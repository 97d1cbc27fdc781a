//! Constraint injection around the denoising step.
//!
//! Constraints let the trajectory honor partial ground truth while the
//! rest is generated: masked blending against a reference latent,
//! overlap-frame pasting for chained generation windows, per-batch pinning
//! of a single conditioning frame, and scene-constrained noise shaping
//! that only acts above a noise-level threshold.
//!
//! Every application returns a fresh tensor assembled with `narrow`/`cat`;
//! the caller-visible latent is never written through.

use candle_core::Tensor;
use tracing::debug;

use crate::conditioning::Conditioning;
use crate::error::{Result, SamplerError};
use crate::model::BaseSchedule;
use crate::rng::Pcg32;

/// Pre-step blend of a reference latent under a binary or soft mask.
#[derive(Debug, Clone)]
pub struct MaskedBlend {
    /// 1 keeps the reference, 0 keeps the working latent.
    pub mask: Tensor,
    /// Clean reference latent.
    pub reference: Tensor,
    /// Blend the clean reference directly instead of its forward-noised
    /// image at the current timestep.
    pub clean_reference: bool,
}

/// Force the first `num_frames` temporal frames to follow the ground-truth
/// origin latent: forward-noised during sampling, exact once the loop ends.
#[derive(Debug, Clone, Copy)]
pub struct OverlapPaste {
    pub num_frames: usize,
}

/// Bias the latent toward a forward-noised scene reference while the
/// timestep is at or above `min_timestep`.
#[derive(Debug, Clone)]
pub struct NoiseShaping {
    pub mask: Tensor,
    pub min_timestep: usize,
    /// Scene reference; falls back to the conditioning's origin latent.
    pub scene: Option<Tensor>,
    pub ratio: f64,
}

/// All structural constraints for one sampling call, validated up front.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub masked_blend: Option<MaskedBlend>,
    pub overlap: Option<OverlapPaste>,
    /// Pin the per-batch conditioning frame named by
    /// `Conditioning::cond_frame_index` to the origin latent.
    pub pin_cond_frame: bool,
    pub noise_shaping: Option<NoiseShaping>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.masked_blend.is_none()
            && self.overlap.is_none()
            && !self.pin_cond_frame
            && self.noise_shaping.is_none()
    }

    /// Check that every enabled constraint has what it needs before the
    /// loop starts.
    pub fn validate(&self, cond: &Conditioning) -> Result<()> {
        if let Some(overlap) = &self.overlap {
            if overlap.num_frames == 0 {
                return Err(SamplerError::invalid(
                    "overlap pasting requires num_frames >= 1",
                ));
            }
            let origin = cond.origin_latent.as_ref().ok_or_else(|| {
                SamplerError::invalid("overlap pasting requires an origin latent")
            })?;
            let frames = origin.dim(2)?;
            if overlap.num_frames > frames {
                return Err(SamplerError::invalid(format!(
                    "overlap of {} frames exceeds the {} origin frames",
                    overlap.num_frames, frames
                )));
            }
        }
        if self.pin_cond_frame {
            if cond.origin_latent.is_none() {
                return Err(SamplerError::invalid(
                    "frame pinning requires an origin latent",
                ));
            }
            if cond.cond_frame_index.is_none() {
                return Err(SamplerError::invalid(
                    "frame pinning requires per-batch frame indices",
                ));
            }
        }
        if let Some(shaping) = &self.noise_shaping {
            if !(0.0..=1.0).contains(&shaping.ratio) {
                return Err(SamplerError::invalid(format!(
                    "noise shaping ratio must be in [0, 1], got {}",
                    shaping.ratio
                )));
            }
            if shaping.scene.is_none() && cond.origin_latent.is_none() {
                return Err(SamplerError::invalid(
                    "noise shaping requires a scene reference or origin latent",
                ));
            }
        }
        Ok(())
    }

    /// Blends applied to the working latent before the denoiser sees it.
    pub fn apply_pre_step(
        &self,
        latent: &Tensor,
        timestep: usize,
        timesteps: &[usize],
        base: &BaseSchedule,
        cond: &Conditioning,
        rng: &mut Pcg32,
    ) -> Result<Tensor> {
        let mut out = latent.clone();

        if let Some(mb) = &self.masked_blend {
            let reference = if mb.clean_reference {
                mb.reference.clone()
            } else {
                let noise = rng.randn_like(&mb.reference)?;
                base.q_sample(&mb.reference, timesteps, &noise)?
            };
            out = masked_mix(&reference, &out, &mb.mask)?;
        }

        if let Some(overlap) = &self.overlap {
            let origin = required_origin(cond)?;
            let head = origin.narrow(2, 0, overlap.num_frames)?;
            let noise = rng.randn_like(&head)?;
            let noised_head = base.q_sample(&head, timesteps, &noise)?;
            out = splice_head(&out, &noised_head, overlap.num_frames)?;
        }

        if let Some(shaping) = &self.noise_shaping {
            if timestep >= shaping.min_timestep {
                debug!(timestep, "applying scene-constrained noise shaping");
                let scene = match &shaping.scene {
                    Some(scene) => scene,
                    None => required_origin(cond)?,
                };
                let noise = rng.randn_like(scene)?;
                let noised_scene = base.q_sample(scene, timesteps, &noise)?;
                let mask = shaping.mask.affine(shaping.ratio, 0.0)?;
                out = masked_mix(&noised_scene, &out, &mask)?;
            }
        }

        Ok(out)
    }

    /// Pastes applied to the predicted clean latent inside each step.
    pub fn apply_pred_clean(
        &self,
        pred_clean: &Tensor,
        cond: &Conditioning,
    ) -> Result<Tensor> {
        let mut out = pred_clean.clone();
        if self.pin_cond_frame {
            let origin = required_origin(cond)?;
            let indices = required_indices(cond)?;
            out = pin_frames(&out, origin, indices)?;
        }
        if let Some(overlap) = &self.overlap {
            let origin = required_origin(cond)?;
            let head = origin.narrow(2, 0, overlap.num_frames)?;
            out = splice_head(&out, &head, overlap.num_frames)?;
        }
        Ok(out)
    }

    /// Exact pastes applied once the reverse loop completes.
    pub fn finalize(&self, latent: &Tensor, cond: &Conditioning) -> Result<Tensor> {
        let mut out = latent.clone();
        if let Some(overlap) = &self.overlap {
            let origin = required_origin(cond)?;
            let head = origin.narrow(2, 0, overlap.num_frames)?;
            out = splice_head(&out, &head, overlap.num_frames)?;
        }
        if self.pin_cond_frame {
            let origin = required_origin(cond)?;
            let indices = required_indices(cond)?;
            out = pin_frames(&out, origin, indices)?;
        }
        Ok(out)
    }
}

fn required_origin(cond: &Conditioning) -> Result<&Tensor> {
    cond.origin_latent
        .as_ref()
        .ok_or_else(|| SamplerError::invalid("constraint requires an origin latent"))
}

fn required_indices(cond: &Conditioning) -> Result<&[usize]> {
    cond.cond_frame_index
        .as_deref()
        .ok_or_else(|| SamplerError::invalid("constraint requires per-batch frame indices"))
}

/// `mask * a + (1 - mask) * b`, broadcasting the mask over both operands.
fn masked_mix(a: &Tensor, b: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let inv = mask.affine(-1.0, 1.0)?;
    let kept = a.broadcast_mul(mask)?;
    let generated = b.broadcast_mul(&inv)?;
    Ok(kept.broadcast_add(&generated)?)
}

/// Replace the first `k` temporal frames of `latent` with `head`.
fn splice_head(latent: &Tensor, head: &Tensor, k: usize) -> Result<Tensor> {
    let frames = latent.dim(2)?;
    if k > frames {
        return Err(SamplerError::invalid(format!(
            "cannot splice {k} frames into a {frames}-frame latent"
        )));
    }
    if k == frames {
        return Ok(head.clone());
    }
    let tail = latent.narrow(2, k, frames - k)?;
    Ok(Tensor::cat(&[head, &tail], 2)?)
}

/// Replace one temporal frame per batch element, the index varying per
/// element.
fn pin_frames(latent: &Tensor, reference: &Tensor, indices: &[usize]) -> Result<Tensor> {
    let dims = latent.dims();
    if dims.len() != 5 {
        return Err(SamplerError::invalid(format!(
            "frame pinning expects a video latent [B, C, T, H, W], got rank {}",
            dims.len()
        )));
    }
    let (batch, frames) = (dims[0], dims[2]);
    if indices.len() != batch {
        return Err(SamplerError::invalid(format!(
            "{} frame indices for batch of {}",
            indices.len(),
            batch
        )));
    }
    let mut rows = Vec::with_capacity(batch);
    for (bi, &fi) in indices.iter().enumerate() {
        if fi >= frames {
            return Err(SamplerError::invalid(format!(
                "pinned frame {fi} out of range for {frames} frames"
            )));
        }
        let row = latent.narrow(0, bi, 1)?;
        let pinned = reference.narrow(0, bi, 1)?.narrow(2, fi, 1)?;
        let mut parts = Vec::with_capacity(3);
        if fi > 0 {
            parts.push(row.narrow(2, 0, fi)?);
        }
        parts.push(pinned);
        if fi + 1 < frames {
            parts.push(row.narrow(2, fi + 1, frames - fi - 1)?);
        }
        rows.push(Tensor::cat(&parts, 2)?);
    }
    Ok(Tensor::cat(&rows, 0)?)
}
