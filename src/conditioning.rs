//! Conditioning bundle passed through to the denoiser.
//!
//! The sampler never inspects conditioning content beyond what guidance
//! composition needs (the camera entry and the ground-truth origin latent
//! used by constraint injection); everything else is forwarded to the
//! denoiser untouched.

use candle_core::Tensor;

/// Camera-pose conditioning with the flag guidance composition flips on the
/// unconditional branch.
#[derive(Debug, Clone)]
pub struct CameraCondition {
    /// Pose embedding (e.g. Plucker coordinates), batch-major.
    pub pose: Tensor,
    /// Marks the unconditional copy during classifier-free guidance.
    pub is_uncond: bool,
}

impl CameraCondition {
    pub fn new(pose: Tensor) -> Self {
        Self {
            pose,
            is_uncond: false,
        }
    }

    /// Shallow copy flagged as the unconditional guidance branch.
    pub fn as_unconditional(&self) -> Self {
        Self {
            pose: self.pose.clone(),
            is_uncond: true,
        }
    }
}

/// Conditioning inputs for one sampling call.
///
/// All fields are optional; the denoiser decides which ones it consumes.
/// The bundle is read-only to the sampler, which only ever takes shallow
/// clones (to flip the camera `is_uncond` flag or drop the camera entry for
/// ablated guidance).
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    /// Text embedding, `[B, L, D]`.
    pub text: Option<Tensor>,
    /// Frame-stride / fps conditioning, `[B]`.
    pub frame_stride: Option<Tensor>,
    /// Reference context frames in latent space.
    pub reference_frames: Option<Tensor>,
    /// Ground-truth clean latent, `[B, C, T, H, W]`, consumed by the
    /// pasting and noise-shaping constraints.
    pub origin_latent: Option<Tensor>,
    /// Per-batch temporal index of the pinned conditioning frame.
    pub cond_frame_index: Option<Vec<usize>>,
    /// Camera-pose conditioning.
    pub camera: Option<CameraCondition>,
}

impl Conditioning {
    /// Batch size implied by the first populated entry, if any.
    pub fn batch_size(&self) -> Option<usize> {
        let tensors = [
            &self.text,
            &self.frame_stride,
            &self.reference_frames,
            &self.origin_latent,
        ];
        if let Some(t) = tensors.into_iter().flatten().next() {
            return t.dims().first().copied();
        }
        if let Some(camera) = &self.camera {
            return camera.pose.dims().first().copied();
        }
        self.cond_frame_index.as_ref().map(|v| v.len())
    }

    /// Shallow copy with the camera entry removed, for the ablated
    /// denoiser pass of camera-conditioning guidance.
    pub fn without_camera(&self) -> Self {
        let mut out = self.clone();
        out.camera = None;
        out
    }
}

impl From<Tensor> for Conditioning {
    /// A bare tensor is treated as a text embedding. Conversion happens at
    /// the call boundary; nothing downstream branches on the input form.
    fn from(text: Tensor) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }
}
