use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use sdstream_common::core::{Device, Result, Tensor};

use super::scheduler::DPMSolverMultistepScheduler;
use crate::models::{Denoiser, ImageEncoder};

/// Scale between VAE posterior samples and the latent space the denoiser works in.
pub const VAE_SCALE_FACTOR: f64 = 0.18215;
pub const LATENT_CHANNELS: usize = 4;
/// Pixels per latent element along each spatial axis.
pub const VAE_DOWNSAMPLE: usize = 8;

/// Seeded standard-normal draws. Noise is sampled on the host so a seed
/// reproduces the same latents on every device.
pub struct NoiseGenerator {
    rng: StdRng,
}

impl NoiseGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A `(1, 4, size / 8, size / 8)` latent of independent N(0, 1) samples.
    pub fn latent(&mut self, size: usize, device: &Device) -> Result<Tensor> {
        let side = size / VAE_DOWNSAMPLE;
        let area = side.checked_mul(side);
        let Some(numel) = area.and_then(|a| a.checked_mul(LATENT_CHANNELS)) else {
            sdstream_common::core::bail!("latent side {side} is too large")
        };
        let data: Vec<f32> = (0..numel)
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        Tensor::from_vec(data, (1, LATENT_CHANNELS, side, side), device)
    }
}

/// Index of the first timestep an image-to-image run denoises from.
///
/// Clamped so at least one denoising step always runs.
pub fn start_step(steps: usize, denoise_strength: f32) -> usize {
    let skipped = (steps as f32 * (1. - denoise_strength.clamp(0., 1.))) as usize;
    skipped.min(steps.saturating_sub(1))
}

/// Row-major `H x W x 3` RGB bytes to a `(1, 3, H, W)` tensor in `[-1, 1]`.
pub fn rgb_to_tensor(rgb: &[u8], size: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = rgb.iter().map(|&v| v as f32 / 255.).collect();
    Tensor::from_vec(data, (1, size, size, 3), device)?
        .permute((0, 3, 1, 2))?
        .contiguous()?
        .affine(2., -1.)
}

/// Encode `pixels`, noise the scaled latent up to `timesteps()[start_step]`,
/// and point the scheduler at `start_step`.
pub fn image_to_image_latents(
    encoder: &dyn ImageEncoder,
    scheduler: &mut DPMSolverMultistepScheduler,
    noise: &mut NoiseGenerator,
    pixels: &Tensor,
    size: usize,
    start_step: usize,
) -> Result<Tensor> {
    let device = pixels.device();
    let posterior = encoder.encode(pixels)?;
    let sample_noise = noise.latent(size, device)?;
    let image_latents = (posterior.mean + (posterior.std * sample_noise)?)?;
    let image_latents = (image_latents * VAE_SCALE_FACTOR)?;

    scheduler.set_begin_index(start_step);
    let timestep = scheduler.timesteps()[start_step];
    let blend_noise = noise.latent(size, device)?;
    scheduler.add_noise(&image_latents, &blend_noise, timestep)
}

/// Combine a denoiser output into a single noise prediction.
///
/// With guidance the output batch is `[uncond, cond]` and the result is
/// `uncond + scale * (cond - uncond)`; without it the output is used as is.
pub fn guided_noise_prediction(output: &Tensor, guidance_scale: Option<f32>) -> Result<Tensor> {
    match guidance_scale {
        None => Ok(output.clone()),
        Some(scale) => {
            let uncond = output.narrow(0, 0, 1)?;
            let cond = output.narrow(0, 1, 1)?;
            &uncond + ((&cond - &uncond)? * scale as f64)?
        }
    }
}

/// One iteration of the denoising loop: run the denoiser on the (possibly
/// duplicated) latent, apply guidance, and step the scheduler.
pub fn denoise_step(
    denoiser: &dyn Denoiser,
    scheduler: &mut DPMSolverMultistepScheduler,
    latents: &Tensor,
    timestep: usize,
    text_embeddings: &Tensor,
    guidance_scale: Option<f32>,
) -> Result<Tensor> {
    let latent_model_input = if guidance_scale.is_some() {
        Tensor::cat(&[latents, latents], 0)?
    } else {
        latents.clone()
    };

    let output = denoiser.forward(&latent_model_input, timestep, text_embeddings)?;
    if output.dims() != latent_model_input.dims() {
        sdstream_common::core::bail!(
            "denoiser returned shape {:?}, expected {:?}",
            output.dims(),
            latent_model_input.dims()
        )
    }
    let noise_pred = guided_noise_prediction(&output, guidance_scale)?;
    scheduler.step(&noise_pred, timestep, latents)
}
