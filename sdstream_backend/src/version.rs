use std::fmt::Display;

use candle_transformers::models::stable_diffusion::StableDiffusionConfig;

/// Stable Diffusion checkpoint family. Decides the network configurations,
/// the default weights repository and the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StableDiffusionVersion {
    #[value(name = "v1-5")]
    V1_5,
    #[value(name = "v2-1")]
    V2_1,
}

impl Display for StableDiffusionVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1_5 => write!(f, "v1-5"),
            Self::V2_1 => write!(f, "v2-1"),
        }
    }
}

impl StableDiffusionVersion {
    /// Hugging Face repository with the `unet/`, `vae/` and `text_encoder/` weights.
    pub fn repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "stable-diffusion-v1-5/stable-diffusion-v1-5",
            Self::V2_1 => "stabilityai/stable-diffusion-2-1",
        }
    }

    /// Repository holding a `tokenizer.json` compatible with the text encoder.
    pub fn tokenizer_repo(&self) -> &'static str {
        match self {
            Self::V1_5 => "openai/clip-vit-base-patch32",
            Self::V2_1 => "laion/CLIP-ViT-H-14-laion2B-s32B-b79K",
        }
    }

    pub fn embedding_dim(&self) -> usize {
        match self {
            Self::V1_5 => 768,
            Self::V2_1 => 1024,
        }
    }

    pub(crate) fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn versions_parse_from_their_cli_names() {
        for version in StableDiffusionVersion::value_variants() {
            let parsed = StableDiffusionVersion::from_str(&version.to_string(), false);
            assert_eq!(parsed, Ok(*version));
        }
    }

    #[test]
    fn sd2_uses_the_wide_text_encoder() {
        assert_eq!(StableDiffusionVersion::V1_5.embedding_dim(), 768);
        assert_eq!(StableDiffusionVersion::V2_1.embedding_dim(), 1024);
    }
}
