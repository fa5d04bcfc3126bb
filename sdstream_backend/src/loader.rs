use std::{path::PathBuf, sync::Arc, time::Instant};

use candle_transformers::models::stable_diffusion::build_clip_transformer;
use sdstream_common::{
    core::{DType, Device},
    FileLoader, ModelSource, TokenSource,
};
use sdstream_core::{Error, ModelSet};
use tokenizers::Tokenizer;
use tracing::info;

use crate::{
    adapters::{ClipTextEncoder, ClipTokenizer, UNetDenoiser, VaeImageDecoder, VaeImageEncoder},
    StableDiffusionVersion,
};

const CLIP_WEIGHTS: &str = "text_encoder/model.safetensors";
const UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";
const VAE_WEIGHTS: &str = "vae/diffusion_pytorch_model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";
const LATENT_CHANNELS: usize = 4;

/// Where and how to load a Stable Diffusion model set.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub version: StableDiffusionVersion,
    /// Weights source. Defaults to [`StableDiffusionVersion::repo`] on the hub.
    pub source: Option<ModelSource>,
    /// A `tokenizer.json` to use instead of downloading [`StableDiffusionVersion::tokenizer_repo`].
    pub tokenizer: Option<PathBuf>,
    pub token: TokenSource,
    pub revision: Option<String>,
    pub device: Device,
    pub dtype: DType,
    /// Attention slice size, trading speed for memory.
    pub sliced_attention_size: Option<usize>,
    pub use_flash_attn: bool,
    pub silent: bool,
}

impl LoadOptions {
    pub fn new(version: StableDiffusionVersion, device: Device) -> Self {
        Self {
            version,
            source: None,
            tokenizer: None,
            token: TokenSource::CacheToken,
            revision: None,
            device,
            dtype: DType::F32,
            sliced_attention_size: None,
            use_flash_attn: false,
            silent: false,
        }
    }
}

/// Pick the accelerator when one was compiled in, otherwise the CPU.
pub fn default_device(cpu: bool) -> anyhow::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0)?;
    #[cfg(not(feature = "metal"))]
    let device = Device::cuda_if_available(0)?;
    Ok(device)
}

fn component<T>(name: &str, load: impl FnOnce() -> anyhow::Result<T>) -> Result<T, Error> {
    let start = Instant::now();
    info!("loading {name}");
    let loaded = load().map_err(|e| Error::ModelNotReady(format!("{name}: {e:#}")))?;
    info!("loaded {name} in {:.2?}", start.elapsed());
    Ok(loaded)
}

/// Load tokenizer, text encoder, UNet and autoencoder.
///
/// The returned set has an image encoder but no safety checker. Any failure is
/// reported as [`Error::ModelNotReady`] naming the component.
///
/// Image-to-image with this set is not reproducible from the request seed: the
/// image encoder reports a posterior sample drawn by candle, see [`VaeImageEncoder`].
pub fn load_model_set(opts: &LoadOptions) -> Result<ModelSet, Error> {
    let source = opts
        .source
        .clone()
        .unwrap_or_else(|| ModelSource::from_model_id(opts.version.repo()));
    info!(
        "loading Stable Diffusion {} from {source} on {:?} ({:?})",
        opts.version, opts.device, opts.dtype
    );

    let loader = component("model files", || {
        FileLoader::from_model_source(&source, opts.silent, &opts.token, opts.revision.clone())
    })?;
    let config = opts.version.config(opts.sliced_attention_size);
    let device = &opts.device;

    let tokenizer = component("tokenizer", || {
        let path = match &opts.tokenizer {
            Some(path) => path.clone(),
            None => FileLoader::from_model_source(
                &ModelSource::from_model_id(opts.version.tokenizer_repo()),
                opts.silent,
                &opts.token,
                None,
            )?
            .read_file(TOKENIZER_FILE)?,
        };
        Tokenizer::from_file(&path).map_err(anyhow::Error::msg)
    })?;

    let text_encoder = component("text encoder", || {
        let weights = loader.read_file(CLIP_WEIGHTS)?;
        // The text encoder always runs in f32.
        let model = build_clip_transformer(&config.clip, weights, device, DType::F32)?;
        Ok(ClipTextEncoder::new(model, opts.version.embedding_dim()))
    })?;

    let denoiser = component("unet", || {
        let weights = loader.read_file(UNET_WEIGHTS)?;
        let model = config.build_unet(
            weights,
            device,
            LATENT_CHANNELS,
            opts.use_flash_attn,
            opts.dtype,
        )?;
        Ok(UNetDenoiser::new(model, opts.dtype))
    })?;

    let vae = component("vae", || {
        let weights = loader.read_file(VAE_WEIGHTS)?;
        Ok(Arc::new(config.build_vae(weights, device, opts.dtype)?))
    })?;

    Ok(ModelSet {
        tokenizer: Box::new(ClipTokenizer::new(tokenizer)),
        text_encoder: Box::new(text_encoder),
        denoiser: Box::new(denoiser),
        image_encoder: Some(Box::new(VaeImageEncoder::new(vae.clone(), opts.dtype))),
        decoder: Box::new(VaeImageDecoder::new(vae, opts.dtype)),
        safety_checker: None,
        device: device.clone(),
    })
}
