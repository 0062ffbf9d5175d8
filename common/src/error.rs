//! Error taxonomy for the classification pipeline.
//!
//! Each pipeline stage fails with exactly one variant; the HTTP layer maps
//! the variant to a status code via [`PipelineError::kind`].

use thiserror::Error;

/// A request-level failure of one pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The uploaded bytes are empty or not a readable audio container.
    #[error("cannot decode audio: {0}")]
    Decode(String),

    /// The decoded signal is too short for the fixed FFT window.
    #[error("cannot extract features: {0}")]
    Feature(String),

    /// The spectrogram matrix is degenerate (no bands or no frames).
    #[error("cannot render spectrogram: {0}")]
    Render(String),

    /// The rendered image does not fit the model input, or inference failed.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Label and score vectors disagree in length. Indicates a wiring bug.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl PipelineError {
    /// Stable machine-readable name, used as the `error` field in responses.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Decode(_) => "decode_error",
            PipelineError::Feature(_) => "feature_error",
            PipelineError::Render(_) => "render_error",
            PipelineError::Inference(_) => "inference_error",
            PipelineError::Invariant(_) => "invariant_error",
        }
    }

    /// Errors caused by the uploaded clip rather than by the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode(_) | PipelineError::Feature(_) | PipelineError::Render(_)
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(PipelineError::Decode("x".into()).kind(), "decode_error");
        assert_eq!(PipelineError::Invariant("x".into()).kind(), "invariant_error");
    }

    #[test]
    fn test_client_errors() {
        assert!(PipelineError::Feature("short".into()).is_client_error());
        assert!(!PipelineError::Inference("shape".into()).is_client_error());
        assert!(!PipelineError::Invariant("len".into()).is_client_error());
    }

    #[test]
    fn test_display_includes_detail() {
        let e = PipelineError::Feature("2047 samples".into());
        assert_eq!(e.to_string(), "cannot extract features: 2047 samples");
    }
}
