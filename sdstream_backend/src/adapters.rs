//! [`sdstream_core`] collaborator implementations over candle-transformers networks.
//!
//! The sampler works in `f32`. Each adapter casts its inputs to the dtype the
//! weights were loaded in and casts outputs back.

use std::sync::Arc;

use candle_transformers::models::stable_diffusion::{
    clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use sdstream_common::core::{DType, Error, Module, Result, Tensor};
use sdstream_core::{
    Denoiser, ImageDecoder, ImageEncoder, LatentDistribution, PromptTokenizer, TextEncoder,
};
use tokenizers::Tokenizer;

pub struct ClipTokenizer(Tokenizer);

impl ClipTokenizer {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self(tokenizer)
    }
}

impl PromptTokenizer for ClipTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        // BOS/EOS framing is done by the sampler.
        let encoding = self
            .0
            .encode(text, false)
            .map_err(|e| Error::Msg(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }
}

pub struct ClipTextEncoder {
    model: ClipTextTransformer,
    embedding_dim: usize,
}

impl ClipTextEncoder {
    pub fn new(model: ClipTextTransformer, embedding_dim: usize) -> Self {
        Self {
            model,
            embedding_dim,
        }
    }
}

impl TextEncoder for ClipTextEncoder {
    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.model.forward(input_ids)?.to_dtype(DType::F32)
    }
}

pub struct UNetDenoiser {
    model: UNet2DConditionModel,
    dtype: DType,
}

impl UNetDenoiser {
    pub fn new(model: UNet2DConditionModel, dtype: DType) -> Self {
        Self { model, dtype }
    }
}

impl Denoiser for UNetDenoiser {
    fn forward(
        &self,
        latents: &Tensor,
        timestep: usize,
        text_embeddings: &Tensor,
    ) -> Result<Tensor> {
        self.model
            .forward(
                &latents.to_dtype(self.dtype)?,
                timestep as f64,
                &text_embeddings.to_dtype(self.dtype)?,
            )?
            .to_dtype(DType::F32)
    }
}

/// Encoder half of the autoencoder.
///
/// candle's posterior keeps its mean and standard deviation private, so the
/// distribution reported here is a point mass on one posterior sample.
pub struct VaeImageEncoder {
    model: Arc<AutoEncoderKL>,
    dtype: DType,
}

impl VaeImageEncoder {
    pub fn new(model: Arc<AutoEncoderKL>, dtype: DType) -> Self {
        Self { model, dtype }
    }
}

impl ImageEncoder for VaeImageEncoder {
    fn encode(&self, pixels: &Tensor) -> Result<LatentDistribution> {
        let sample = self
            .model
            .encode(&pixels.to_dtype(self.dtype)?)?
            .sample()?
            .to_dtype(DType::F32)?;
        let std = sample.zeros_like()?;
        Ok(LatentDistribution { mean: sample, std })
    }
}

pub struct VaeImageDecoder {
    model: Arc<AutoEncoderKL>,
    dtype: DType,
}

impl VaeImageDecoder {
    pub fn new(model: Arc<AutoEncoderKL>, dtype: DType) -> Self {
        Self { model, dtype }
    }
}

impl ImageDecoder for VaeImageDecoder {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        self.model
            .decode(&latents.to_dtype(self.dtype)?)?
            .to_dtype(DType::F32)
    }
}
