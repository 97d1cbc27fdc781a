//! DDIM sampling for conditional video latent diffusion models.
//!
//! This crate implements the reverse-process state machine of a
//! variance-preserving latent diffusion model: schedule construction over
//! a subset of the training timesteps, classifier-free guidance
//! composition (with an optional camera-conditioning guidance term), the
//! per-step DDIM transition for eps- and v-parameterized networks, and
//! constraint injection that pins partial ground truth (masked blending,
//! overlap/single-frame pasting, scene-constrained noise shaping) while
//! the rest is generated.
//!
//! The denoising network, first-stage codecs and any serialization live
//! behind the traits in [`model`]; the sampler itself is synchronous,
//! sequential and free of instance-level mutable state.

pub mod checkpoint;
pub mod conditioning;
pub mod constraints;
pub mod error;
pub mod guidance;
pub mod model;
pub mod rng;
pub mod sampler;
pub mod schedule;

pub use conditioning::{CameraCondition, Conditioning};
pub use constraints::{Constraints, MaskedBlend, NoiseShaping, OverlapPaste};
pub use error::{Result, SamplerError};
pub use guidance::{CameraGuidance, CfgWeightSchedule, GuidanceConfig};
pub use model::{BaseSchedule, Denoiser, Parameterization, ScoreCorrector};
pub use rng::Pcg32;
pub use sampler::{DdimSampler, Intermediates, SampleOptions, StepOptions};
pub use schedule::{DdimSchedule, TimestepSpacing};
