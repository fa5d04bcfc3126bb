//! Contracts for the networks a generation runs.
//!
//! The sampler never executes a network itself: it hands tensors to the
//! collaborators of a [`ModelSet`]. Implementations must be `Send + Sync` so a
//! model set can be shared by a server, but they are free to keep
//! non-reentrant execution buffers: a [`crate::Pipeline`] never calls into one
//! model set from two generations at once.

use sdstream_common::core::{Device, Result, Tensor};

/// Splits prompt text into token IDs, without BOS/EOS markers.
pub trait PromptTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

pub trait TextEncoder: Send + Sync {
    /// Width of one token embedding, e.g. 768 for SD 1.x and 1024 for SD 2.x.
    fn embedding_dim(&self) -> usize;

    /// `(batch, 77)` u32 token IDs to `(batch, 77, embedding_dim)` embeddings.
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;
}

pub trait Denoiser: Send + Sync {
    /// Predict the noise in `latents` at `timestep`. The output must match the latent batch and shape.
    fn forward(
        &self,
        latents: &Tensor,
        timestep: usize,
        text_embeddings: &Tensor,
    ) -> Result<Tensor>;
}

/// Per-element posterior of the VAE encoder.
#[derive(Debug, Clone)]
pub struct LatentDistribution {
    pub mean: Tensor,
    pub std: Tensor,
}

pub trait ImageEncoder: Send + Sync {
    /// This function *does not* scale the latents; see [`crate::VAE_SCALE_FACTOR`].
    ///
    /// Input is `(1, 3, H, W)` with values in `[-1, 1]`.
    fn encode(&self, pixels: &Tensor) -> Result<LatentDistribution>;
}

pub trait ImageDecoder: Send + Sync {
    /// This function expects *unscaled* latents and returns `(1, 3, H, W)` values in `[-1, 1]`.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

pub trait SafetyChecker: Send + Sync {
    /// NSFW score in `[0, 1]` for a row-major `H x W x 3` RGB buffer.
    fn nsfw_score(&self, rgb: &[u8], width: usize, height: usize) -> Result<f32>;
}

/// Every collaborator a generation may call, loaded once at process start.
pub struct ModelSet {
    pub tokenizer: Box<dyn PromptTokenizer>,
    pub text_encoder: Box<dyn TextEncoder>,
    pub denoiser: Box<dyn Denoiser>,
    pub image_encoder: Option<Box<dyn ImageEncoder>>,
    pub decoder: Box<dyn ImageDecoder>,
    pub safety_checker: Option<Box<dyn SafetyChecker>>,
    /// Device the latents live on.
    pub device: Device,
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet")
            .field("embedding_dim", &self.text_encoder.embedding_dim())
            .field("image_encoder", &self.image_encoder.is_some())
            .field("safety_checker", &self.safety_checker.is_some())
            .field("device", &self.device)
            .finish()
    }
}
