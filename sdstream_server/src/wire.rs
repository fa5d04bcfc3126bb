//! JSON shapes of `POST /generate`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::FilterType;
use sdstream_core::{GenerationEvent, GenerationRequest, GenerationResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

fn default_steps() -> usize {
    20
}

fn default_cfg() -> f32 {
    7.5
}

fn default_size() -> usize {
    512
}

fn default_denoise_strength() -> f32 {
    0.6
}

/// Request body of `POST /generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_cfg")]
    pub cfg: f32,
    #[serde(default)]
    pub use_cfg: bool,
    #[serde(default = "default_size")]
    pub size: usize,
    /// Base64-encoded PNG/JPEG/... source image for image-to-image.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_denoise_strength")]
    pub denoise_strength: f32,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerateBody {
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(body).map_err(|e| format!("invalid request body: {e}"))
    }

    /// The core request, without its source image. A missing seed is drawn at random.
    pub fn to_generation_request(&self, enable_safety_check: bool) -> GenerationRequest {
        let seed = self.seed.unwrap_or_else(|| rand::random::<u32>().into());
        GenerationRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            guidance_scale: self.cfg,
            use_guidance: self.use_cfg,
            seed,
            size: self.size,
            source_image: None,
            denoise_strength: self.denoise_strength,
            enable_safety_check,
        }
    }
}

/// Decode a base64 image and resample it to `size x size` RGB bytes.
///
/// Returns `None`, after logging why, when the data cannot be decoded; the
/// request then runs as text-to-image.
pub fn decode_source_image(encoded: &str, size: usize) -> Option<Vec<u8>> {
    let bytes = match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("ignoring source image, invalid base64: {e}");
            return None;
        }
    };
    let img = match image::load_from_memory(&bytes) {
        Ok(img) => img,
        Err(e) => {
            warn!("ignoring source image, cannot decode: {e}");
            return None;
        }
    };
    let side = u32::try_from(size).ok()?;
    Some(
        img.resize_exact(side, side, FilterType::Triangle)
            .to_rgb8()
            .into_raw(),
    )
}

/// One `data:` frame of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Progress {
        step: usize,
        total_steps: usize,
    },
    Complete {
        /// Base64 of the raw row-major RGB bytes.
        image: String,
        seed: u64,
        width: usize,
        height: usize,
        channels: usize,
        generation_time_ms: u64,
        first_step_time_ms: u64,
    },
    Error {
        message: String,
    },
}

impl From<GenerationEvent> for StreamFrame {
    fn from(event: GenerationEvent) -> Self {
        match event {
            GenerationEvent::Progress { step, total } => Self::Progress {
                step,
                total_steps: total,
            },
            GenerationEvent::Complete(GenerationResult {
                pixels,
                width,
                height,
                channels,
                seed,
                total_time_ms,
                first_step_time_ms,
                ..
            }) => Self::Complete {
                image: STANDARD.encode(pixels),
                seed,
                width,
                height,
                channels,
                generation_time_ms: total_time_ms,
                first_step_time_ms,
            },
            GenerationEvent::Error(err) => Self::Error {
                message: err.to_string(),
            },
        }
    }
}

/// Body of a non-streaming error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}
