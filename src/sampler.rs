//! DDIM reverse-process sampler.
//!
//! The driver walks the schedule from the noisiest selected timestep down
//! to the cleanest, at each position applying pre-step constraint blends,
//! guidance composition against the denoiser, and the DDIM transition.
//! Sampling is strictly sequential; parallelism, if any, lives inside the
//! denoiser collaborator.
//!
//! The schedule is built per call and threaded through the loop as a
//! value, so a `DdimSampler` can serve concurrent calls from independent
//! threads as long as the denoiser itself is shareable.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::conditioning::Conditioning;
use crate::constraints::Constraints;
use crate::error::{Result, SamplerError};
use crate::guidance::{self, GuidanceConfig};
use crate::model::{BaseSchedule, Denoiser, Parameterization, ScoreCorrector};
use crate::rng::Pcg32;
use crate::schedule::{DdimSchedule, TimestepSpacing};

/// Per-step progress callback; an `Err` aborts the loop.
pub type StepCallback<'a> = dyn FnMut(usize) -> Result<()> + 'a;
/// Callback receiving the predicted clean latent of each step.
pub type LatentCallback<'a> = dyn FnMut(&Tensor, usize) -> Result<()> + 'a;

/// Options consumed by the transition function itself.
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Multiplier on the stochastic term.
    pub temperature: f64,
    /// Probability of zeroing each noise element, in `[0, 1)`. Survivors
    /// are not rescaled.
    pub noise_dropout: f64,
    /// Quantize the predicted clean latent through the denoiser's
    /// first-stage quantizer.
    pub quantize_denoised: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            noise_dropout: 0.0,
            quantize_denoised: false,
        }
    }
}

/// Options for one `sample` call.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub num_steps: usize,
    pub spacing: TimestepSpacing,
    /// Stochastic-noise magnitude in `[0, 1]`; 0 is the deterministic
    /// DDIM trajectory.
    pub eta: f64,
    pub temperature: f64,
    pub noise_dropout: f64,
    pub quantize_denoised: bool,
    pub guidance: GuidanceConfig,
    pub constraints: Constraints,
    /// Record an intermediate-trace entry every this many schedule
    /// positions (plus the terminal step).
    pub trace_every: usize,
    /// Seed for the call-local noise generator.
    pub seed: u64,
    /// Directory for best-effort per-step latent dumps.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            num_steps: 50,
            spacing: TimestepSpacing::Uniform,
            eta: 0.0,
            temperature: 1.0,
            noise_dropout: 0.0,
            quantize_denoised: false,
            guidance: GuidanceConfig::default(),
            constraints: Constraints::default(),
            trace_every: 100,
            seed: 0,
            checkpoint_dir: None,
        }
    }
}

impl SampleOptions {
    pub fn step_options(&self) -> StepOptions {
        StepOptions {
            temperature: self.temperature,
            noise_dropout: self.noise_dropout,
            quantize_denoised: self.quantize_denoised,
        }
    }

    /// Fail fast before the first denoiser invocation.
    pub fn validate(&self, cond: &Conditioning) -> Result<()> {
        if !(0.0..1.0).contains(&self.noise_dropout) {
            return Err(SamplerError::invalid(format!(
                "noise dropout must be in [0, 1), got {}",
                self.noise_dropout
            )));
        }
        if self.trace_every == 0 {
            return Err(SamplerError::invalid("trace stride must be at least 1"));
        }
        self.guidance.validate()?;
        self.constraints.validate(cond)?;
        Ok(())
    }
}

/// Intermediate snapshots recorded along the trajectory.
#[derive(Debug, Default)]
pub struct Intermediates {
    pub latents: Vec<Tensor>,
    pub pred_clean: Vec<Tensor>,
}

/// The sampler: a denoiser collaborator plus the base training schedule.
pub struct DdimSampler<'a> {
    model: &'a dyn Denoiser,
    base: BaseSchedule,
}

impl<'a> DdimSampler<'a> {
    pub fn new(model: &'a dyn Denoiser, base: BaseSchedule) -> Self {
        Self { model, base }
    }

    pub fn base(&self) -> &BaseSchedule {
        &self.base
    }

    /// Build a call-scoped DDIM schedule against this sampler's base
    /// coefficients.
    pub fn schedule(
        &self,
        num_steps: usize,
        spacing: TimestepSpacing,
        eta: f64,
    ) -> Result<DdimSchedule> {
        DdimSchedule::build(&self.base, num_steps, spacing, eta)
    }

    /// Run the full reverse trajectory.
    ///
    /// `shape` is the per-sample latent shape, `[C, H, W]` for images or
    /// `[C, T, H, W]` for video. The initial latent comes from
    /// `init_noise` when supplied, otherwise from a fresh standard-normal
    /// draw seeded by `opts.seed`. A conditioning batch size differing
    /// from `batch_size` is only warned about, since broadcasting may
    /// still succeed downstream.
    #[allow(clippy::too_many_arguments)]
    pub fn sample(
        &self,
        opts: &SampleOptions,
        batch_size: usize,
        shape: &[usize],
        cond: Option<&Conditioning>,
        uncond: Option<&Conditioning>,
        init_noise: Option<&Tensor>,
        device: &Device,
        corrector: Option<&dyn ScoreCorrector>,
        mut on_step: Option<&mut StepCallback<'_>>,
        mut on_pred_clean: Option<&mut LatentCallback<'_>>,
    ) -> Result<(Tensor, Intermediates)> {
        let default_cond = Conditioning::default();
        let cond = cond.unwrap_or(&default_cond);
        opts.validate(cond)?;

        if let Some(cond_batch) = cond.batch_size() {
            if cond_batch != batch_size {
                warn!(
                    conditioning_batch = cond_batch,
                    batch_size, "conditioning batch size does not match sampling batch size"
                );
            }
        }

        let schedule = DdimSchedule::build(&self.base, opts.num_steps, opts.spacing, opts.eta)?;

        let size: Vec<usize> = match shape.len() {
            3 | 4 => {
                let mut s = Vec::with_capacity(shape.len() + 1);
                s.push(batch_size);
                s.extend_from_slice(shape);
                s
            }
            rank => {
                return Err(SamplerError::invalid(format!(
                    "latent shape must be [C, H, W] or [C, T, H, W], got {rank} dims"
                )))
            }
        };

        let mut rng = Pcg32::seed_from(opts.seed);
        let mut latent = match init_noise {
            Some(x) => x.clone(),
            None => rng.randn(size, device)?,
        };

        let total = schedule.len();
        let mut trace = Intermediates {
            latents: vec![latent.clone()],
            pred_clean: vec![latent.clone()],
        };
        let step_opts = opts.step_options();
        info!(
            steps = total,
            eta = opts.eta,
            cfg = opts.guidance.scale,
            "starting DDIM sampling"
        );

        for i in 0..total {
            let index = total - 1 - i;
            let timestep = schedule.timesteps()[index];
            let ts = vec![timestep; batch_size];

            latent = opts
                .constraints
                .apply_pre_step(&latent, timestep, &ts, &self.base, cond, &mut rng)?;

            let guided = guidance::compose(
                self.model,
                &latent,
                &ts,
                cond,
                uncond,
                &opts.guidance,
                self.base.num_timesteps(),
            )?;

            let (next, pred_clean) = self.ddim_step(
                &schedule,
                &latent,
                &guided,
                &ts,
                index,
                &step_opts,
                &opts.constraints,
                cond,
                corrector,
                &mut rng,
            )?;
            latent = next;
            debug!(step = i, timestep, latent_shape = ?latent.dims(), "denoising step");

            if let Some(cb) = on_step.as_mut() {
                cb(i)?;
            }
            if let Some(cb) = on_pred_clean.as_mut() {
                cb(&pred_clean, i)?;
            }

            if index % opts.trace_every == 0 || index == total - 1 {
                trace.latents.push(latent.clone());
                trace.pred_clean.push(pred_clean);
            }

            if let Some(dir) = &opts.checkpoint_dir {
                let path = dir.join(format!("{total}.bin"));
                if let Err(err) = crate::checkpoint::write_latent(&path, &latent) {
                    warn!(path = ?path, %err, "latent checkpoint write failed");
                }
            }
        }

        latent = opts.constraints.finalize(&latent, cond)?;
        Ok((latent, trace))
    }

    /// One DDIM transition: guided estimate in, previous-timestep latent
    /// and predicted clean latent out.
    #[allow(clippy::too_many_arguments)]
    pub fn ddim_step(
        &self,
        schedule: &DdimSchedule,
        latent: &Tensor,
        model_output: &Tensor,
        timesteps: &[usize],
        index: usize,
        opts: &StepOptions,
        constraints: &Constraints,
        cond: &Conditioning,
        corrector: Option<&dyn ScoreCorrector>,
        rng: &mut Pcg32,
    ) -> Result<(Tensor, Tensor)> {
        if index >= schedule.len() {
            return Err(SamplerError::invalid(format!(
                "step index {index} out of range for schedule of length {}",
                schedule.len()
            )));
        }
        if !(0.0..1.0).contains(&opts.noise_dropout) {
            return Err(SamplerError::invalid(format!(
                "noise dropout must be in [0, 1), got {}",
                opts.noise_dropout
            )));
        }

        let a_t = schedule.alpha(index);
        let a_prev = schedule.alpha_prev(index);
        let sigma_t = schedule.sigma(index);
        let sqrt_one_minus_a_t = schedule.sqrt_one_minus_alpha(index);

        let (eps, mut pred_clean) = match self.base.parameterization() {
            Parameterization::Eps => {
                let mut eps = model_output.clone();
                if let Some(corrector) = corrector {
                    eps = corrector.modify_score(&eps, latent, timesteps, cond)?;
                }
                let pred = ((latent - (&eps * sqrt_one_minus_a_t)?)? / a_t.sqrt())?;
                (eps, pred)
            }
            Parameterization::V => {
                if corrector.is_some() {
                    return Err(SamplerError::unsupported(
                        "score correction requires an eps-parameterized model",
                    ));
                }
                let eps = self
                    .base
                    .predict_eps_from_z_and_v(latent, timesteps, model_output)?;
                let pred = self
                    .base
                    .predict_start_from_z_and_v(latent, timesteps, model_output)?;
                (eps, pred)
            }
        };

        // Compensates for latent-scale drift when the model was trained
        // with dynamic rescaling; runs before any constraint pinning.
        if let Some(ratio) = schedule.scale_ratio(index) {
            pred_clean = (&pred_clean * ratio)?;
        }

        pred_clean = constraints.apply_pred_clean(&pred_clean, cond)?;

        if opts.quantize_denoised {
            pred_clean = self.model.quantize_denoised(&pred_clean)?;
        }

        // 1 - a_prev - sigma^2 can underflow below zero near the schedule
        // boundary; the clamp keeps the sqrt real.
        let dir_coeff = (1.0 - a_prev - sigma_t * sigma_t).max(0.0).sqrt();
        let dir = (&eps * dir_coeff)?;

        let mut prev = ((&pred_clean * a_prev.sqrt())? + dir)?;
        if sigma_t != 0.0 && opts.temperature != 0.0 {
            let mut noise = (rng.randn_like(latent)? * (sigma_t * opts.temperature))?;
            if opts.noise_dropout > 0.0 {
                let mask =
                    rng.keep_mask(latent.shape().clone(), opts.noise_dropout, latent.device())?;
                noise = (noise * mask)?;
            }
            prev = (&prev + noise)?;
        }

        Ok((prev, pred_clean))
    }

    /// Per-frame transition: one schedule index per temporal frame, used
    /// when chained generation windows sit at different noise levels.
    /// Eps-parameterized only (the per-frame estimate is a noise
    /// prediction).
    pub fn step_frames(
        &self,
        schedule: &DdimSchedule,
        sample: &Tensor,
        noise_pred: &Tensor,
        indices: &[usize],
        rng: &mut Pcg32,
    ) -> Result<(Tensor, Tensor)> {
        let dims = sample.dims();
        if dims.len() != 5 {
            return Err(SamplerError::invalid(format!(
                "per-frame stepping expects a video latent [B, C, T, H, W], got rank {}",
                dims.len()
            )));
        }
        let frames = dims[2];
        if indices.len() != frames {
            return Err(SamplerError::invalid(format!(
                "{} schedule indices for {} frames",
                indices.len(),
                frames
            )));
        }

        let mut prevs = Vec::with_capacity(frames);
        let mut preds = Vec::with_capacity(frames);
        for (f, &index) in indices.iter().enumerate() {
            if index >= schedule.len() {
                return Err(SamplerError::invalid(format!(
                    "step index {index} out of range for schedule of length {}",
                    schedule.len()
                )));
            }
            let x = sample.narrow(2, f, 1)?;
            let eps = noise_pred.narrow(2, f, 1)?;

            let a_t = schedule.alpha(index);
            let a_prev = schedule.alpha_prev(index);
            let sigma_t = schedule.sigma(index);
            let sqrt_one_minus_a_t = schedule.sqrt_one_minus_alpha(index);

            let pred = ((&x - (&eps * sqrt_one_minus_a_t)?)? / a_t.sqrt())?;
            let dir_coeff = (1.0 - a_prev - sigma_t * sigma_t).max(0.0).sqrt();
            let mut prev = ((&pred * a_prev.sqrt())? + (&eps * dir_coeff)?)?;
            if sigma_t != 0.0 {
                prev = (&prev + (rng.randn_like(&x)? * sigma_t)?)?;
            }
            prevs.push(prev);
            preds.push(pred);
        }

        Ok((Tensor::cat(&prevs, 2)?, Tensor::cat(&preds, 2)?))
    }

    /// Run only the suffix of the reverse loop, from schedule position
    /// `t_start` down to 0. No constraint injection; pairs with
    /// [`Self::stochastic_encode`] for encode-then-resample.
    #[allow(clippy::too_many_arguments)]
    pub fn decode(
        &self,
        schedule: &DdimSchedule,
        latent: &Tensor,
        t_start: usize,
        cond: Option<&Conditioning>,
        uncond: Option<&Conditioning>,
        guidance: &GuidanceConfig,
        rng: &mut Pcg32,
        mut on_step: Option<&mut StepCallback<'_>>,
    ) -> Result<Tensor> {
        if t_start > schedule.len() {
            return Err(SamplerError::invalid(format!(
                "decode start {t_start} exceeds schedule length {}",
                schedule.len()
            )));
        }
        let default_cond = Conditioning::default();
        let cond = cond.unwrap_or(&default_cond);
        let batch_size = latent.dim(0)?;
        let step_opts = StepOptions::default();
        let constraints = Constraints::default();
        info!(steps = t_start, "running DDIM decode");

        let mut out = latent.clone();
        for i in 0..t_start {
            let index = t_start - 1 - i;
            let timestep = schedule.timesteps()[index];
            let ts = vec![timestep; batch_size];
            let guided = guidance::compose(
                self.model,
                &out,
                &ts,
                cond,
                uncond,
                guidance,
                self.base.num_timesteps(),
            )?;
            let (next, _) = self.ddim_step(
                schedule,
                &out,
                &guided,
                &ts,
                index,
                &step_opts,
                &constraints,
                cond,
                None,
                rng,
            )?;
            out = next;
            if let Some(cb) = on_step.as_mut() {
                cb(i)?;
            }
        }
        Ok(out)
    }

    /// Forward-noise a clean latent to schedule position `t`. Pure: one
    /// affine combination, no loop. Fast, but does not allow exact
    /// reconstruction.
    pub fn stochastic_encode(
        &self,
        schedule: &DdimSchedule,
        clean: &Tensor,
        t: usize,
        noise: Option<&Tensor>,
        rng: &mut Pcg32,
    ) -> Result<Tensor> {
        if t >= schedule.len() {
            return Err(SamplerError::invalid(format!(
                "encode target {t} out of range for schedule of length {}",
                schedule.len()
            )));
        }
        let noise = match noise {
            Some(n) => n.clone(),
            None => rng.randn_like(clean)?,
        };
        Ok(((clean * schedule.sqrt_alpha(t))? + (noise * schedule.sqrt_one_minus_alpha(t))?)?)
    }
}
