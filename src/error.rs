//! Error types for the sampler crate.

/// Errors surfaced by schedule construction, guidance composition and the
/// sampling loop.
///
/// Collaborator failures (the denoiser raising mid-trajectory) are wrapped
/// as [`SamplerError::Tensor`] and propagate unmodified; there is no retry,
/// since every reverse step depends on the previous one.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// Malformed schedule or sampling parameters, detected before any
    /// denoiser invocation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An optional feature was requested that the current setup cannot
    /// provide. Raised at the point of use.
    #[error("unsupported option: {0}")]
    UnsupportedOption(String),

    /// A step callback asked for the loop to stop.
    #[error("sampling aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SamplerError>;

impl SamplerError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOption(msg.into())
    }
}
