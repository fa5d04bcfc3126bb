use std::fmt::Display;

/// The pipeline stage a generation failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    EncodePrompt,
    InitLatents,
    EncodeImage,
    Denoise,
    Decode,
    SafetyCheck,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncodePrompt => write!(f, "encode_prompt"),
            Self::InitLatents => write!(f, "init_latents"),
            Self::EncodeImage => write!(f, "encode_image"),
            Self::Denoise => write!(f, "denoise"),
            Self::Decode => write!(f, "decode"),
            Self::SafetyCheck => write!(f, "safety_check"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request is malformed; nothing was run.
    #[error("{0}")]
    Validation(String),
    /// A collaborator required by the request is not loaded.
    #[error("model not ready: {0}")]
    ModelNotReady(String),
    /// A model call or tensor operation failed mid-session.
    #[error("{stage} failed: {source}")]
    Inference {
        stage: Stage,
        #[source]
        source: sdstream_common::core::Error,
    },
    /// Another generation holds the model set.
    #[error("a generation is already in progress")]
    Busy,
    /// The session stopped without yielding a result.
    #[error("generation ended without a result")]
    Incomplete,
}

impl Error {
    /// The failed stage, for inference errors.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Inference { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attach the running [`Stage`] to a tensor-level failure.
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageContext<T> for sdstream_common::core::Result<T> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|source| Error::Inference { stage, source })
    }
}
