use sdstream_common::core::{DType, Device, Result, Tensor};

use super::sampling::VAE_SCALE_FACTOR;
use crate::models::ImageDecoder;

/// Scores strictly above this replace the image.
pub const DEFAULT_NSFW_THRESHOLD: f32 = 0.5;

/// Unscale the final latents and run the decoder.
pub fn decode_latents(decoder: &dyn ImageDecoder, latents: &Tensor) -> Result<Tensor> {
    decoder.decode(&(latents / VAE_SCALE_FACTOR)?)
}

/// A decoded RGB image on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

/// Convert a `(1, 3, H, W)` tensor in `[-1, 1]` to row-major `H x W x 3` bytes.
pub fn to_rgb_image(decoded: &Tensor) -> Result<RgbImage> {
    let img = decoded.to_device(&Device::Cpu)?.squeeze(0)?;
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        sdstream_common::core::bail!("decoder returned {channels} channels, expected 3")
    }
    let pixels = img
        .to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .permute((1, 2, 0))?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    Ok(RgbImage {
        pixels,
        width,
        height,
    })
}

/// Blank the whole buffer to white when `score` exceeds `threshold`.
///
/// Returns whether the image was suppressed.
pub fn apply_safety_gate(pixels: &mut [u8], score: f32, threshold: f32) -> bool {
    if score > threshold {
        pixels.fill(255);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Halve;

    impl ImageDecoder for Halve {
        fn decode(&self, latents: &Tensor) -> Result<Tensor> {
            latents * 0.5
        }
    }

    #[test]
    fn latents_are_unscaled_before_decoding() -> Result<()> {
        let latents = Tensor::new(&[VAE_SCALE_FACTOR as f32], &Device::Cpu)?;
        let out = decode_latents(&Halve, &latents)?.to_vec1::<f32>()?;
        assert!((out[0] - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn pixel_conversion_clamps_and_interleaves() -> Result<()> {
        // 1x2 image, channels-first: R = [-1, 1], G = [2, -2], B = [0, 0.5].
        let decoded = Tensor::new(&[[[-1f32, 1.]], [[2., -2.]], [[0., 0.5]]], &Device::Cpu)?;
        let img = to_rgb_image(&decoded.unsqueeze(0)?)?;
        assert_eq!((img.width, img.height), (2, 1));
        assert_eq!(img.pixels, vec![0, 255, 127, 255, 0, 191]);
        Ok(())
    }

    #[test]
    fn non_rgb_output_is_rejected() -> Result<()> {
        let decoded = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(to_rgb_image(&decoded).is_err());
        Ok(())
    }

    #[test]
    fn safety_gate_whites_out_only_above_threshold() {
        let mut pixels = vec![10u8, 20, 30];
        assert!(!apply_safety_gate(&mut pixels, 0.5, DEFAULT_NSFW_THRESHOLD));
        assert_eq!(pixels, vec![10, 20, 30]);
        assert!(apply_safety_gate(&mut pixels, 0.51, DEFAULT_NSFW_THRESHOLD));
        assert!(pixels.iter().all(|&p| p == 255));
    }
}
