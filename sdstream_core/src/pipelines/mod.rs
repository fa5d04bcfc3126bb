mod postprocess;
mod prompt;
mod sampling;
mod scheduler;
mod session;

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{info, warn};

use crate::{models::ModelSet, Error, Result};

pub use postprocess::{apply_safety_gate, RgbImage, DEFAULT_NSFW_THRESHOLD};
pub use prompt::{frame_token_ids, BOS_TOKEN_ID, EOS_TOKEN_ID, MAX_TOKEN_LENGTH};
pub use sampling::{start_step, VAE_SCALE_FACTOR};
pub use scheduler::{
    DPMSolverMultistepScheduler, DPMSolverMultistepSchedulerConfig, NoiseSchedule,
};
pub use session::GenerationSession;

/// Largest accepted output side, in pixels.
pub const MAX_IMAGE_SIZE: usize = 2048;

/// Generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Conditioning for the unconditional half of the guidance batch.
    pub negative_prompt: String,
    /// The number of denoising steps. Image-to-image runs only the last
    /// `steps * denoise_strength` of them.
    pub steps: usize,
    /// Higher guidance scale encourages to generate images that are closely linked to the text `prompt`,
    /// usually at the expense of lower image quality.
    pub guidance_scale: f32,
    /// Run classifier-free guidance. Without it the denoiser sees a batch of one and
    /// `guidance_scale` is ignored.
    pub use_guidance: bool,
    pub seed: u64,
    /// Width and height of the square output, a multiple of 8 up to [`MAX_IMAGE_SIZE`].
    pub size: usize,
    /// Row-major `size x size x 3` RGB pixels to start from. A buffer of any other
    /// length is ignored and the request runs as text-to-image.
    pub source_image: Option<Vec<u8>>,
    pub denoise_strength: f32,
    pub enable_safety_check: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 20,
            guidance_scale: 7.5,
            use_guidance: false,
            seed: 0,
            size: 512,
            source_image: None,
            denoise_strength: 0.6,
            enable_safety_check: false,
        }
    }
}

impl GenerationRequest {
    /// Check the request against `max_steps`, the length of the training schedule.
    pub fn validate(&self, max_steps: usize) -> Result<()> {
        if self.prompt.is_empty() {
            return Err(Error::Validation("`prompt` must not be empty".to_string()));
        }
        if self.steps == 0 || self.steps > max_steps {
            return Err(Error::Validation(format!(
                "`steps` must be in 1..={max_steps}, got {}",
                self.steps
            )));
        }
        if self.size == 0 || self.size % 8 != 0 || self.size > MAX_IMAGE_SIZE {
            return Err(Error::Validation(format!(
                "`size` must be a positive multiple of 8 no larger than {MAX_IMAGE_SIZE}, got {}",
                self.size
            )));
        }
        if !self.guidance_scale.is_finite() {
            return Err(Error::Validation(
                "`cfg` must be a finite number".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.denoise_strength) {
            return Err(Error::Validation(format!(
                "`denoise_strength` must be in [0, 1], got {}",
                self.denoise_strength
            )));
        }
        Ok(())
    }
}

/// A finished image.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Row-major `height x width x channels` bytes.
    pub pixels: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub seed: u64,
    /// The safety checker flagged the image and `pixels` is solid white.
    pub suppressed: bool,
    pub total_time_ms: u64,
    /// Duration of the first denoising step alone.
    pub first_step_time_ms: u64,
}

/// One item of a [`GenerationSession`].
///
/// A session yields zero or more `Progress` events with strictly increasing
/// `step`, then exactly one `Complete` or `Error`.
#[derive(Debug)]
pub enum GenerationEvent {
    Progress { step: usize, total: usize },
    Complete(GenerationResult),
    Error(Error),
}

/// Owns the loaded models and hands out at most one generation at a time.
pub struct Pipeline {
    models: Mutex<ModelSet>,
    scheduler_config: DPMSolverMultistepSchedulerConfig,
    nsfw_threshold: f32,
    has_safety_checker: bool,
    has_image_encoder: bool,
}

impl Pipeline {
    pub fn new(models: ModelSet) -> Self {
        info!("pipeline ready: {models:?}");
        Self {
            has_safety_checker: models.safety_checker.is_some(),
            has_image_encoder: models.image_encoder.is_some(),
            models: Mutex::new(models),
            scheduler_config: DPMSolverMultistepSchedulerConfig::default(),
            nsfw_threshold: DEFAULT_NSFW_THRESHOLD,
        }
    }

    pub fn with_nsfw_threshold(mut self, threshold: f32) -> Self {
        self.nsfw_threshold = threshold;
        self
    }

    pub fn with_scheduler_config(mut self, config: DPMSolverMultistepSchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn scheduler_config(&self) -> &DPMSolverMultistepSchedulerConfig {
        &self.scheduler_config
    }

    /// Whether requests may enable the safety check. Does not wait for a running generation.
    pub fn has_safety_checker(&self) -> bool {
        self.has_safety_checker
    }

    pub fn supports_image_to_image(&self) -> bool {
        self.has_image_encoder
    }

    fn lock(&self) -> MutexGuard<'_, ModelSet> {
        // A panicking session leaves the models untouched; the guard is still usable.
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a generation, waiting for any running one to finish first.
    ///
    /// Validation happens before waiting. The returned session holds the models
    /// until it is dropped.
    pub fn session(&self, request: GenerationRequest) -> Result<GenerationSession<'_>> {
        request.validate(self.scheduler_config.train_timesteps)?;
        let models = self.lock();
        self.start(models, request)
    }

    /// Like [`Pipeline::session`], but fails with [`Error::Busy`] instead of waiting.
    pub fn try_session(&self, request: GenerationRequest) -> Result<GenerationSession<'_>> {
        request.validate(self.scheduler_config.train_timesteps)?;
        let models = match self.models.try_lock() {
            Ok(models) => models,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(Error::Busy),
        };
        self.start(models, request)
    }

    fn start<'a>(
        &self,
        models: MutexGuard<'a, ModelSet>,
        mut request: GenerationRequest,
    ) -> Result<GenerationSession<'a>> {
        if request.enable_safety_check && models.safety_checker.is_none() {
            return Err(Error::ModelNotReady(
                "safety check requested but no safety checker is loaded".to_string(),
            ));
        }

        if let Some(pixels) = &request.source_image {
            let expected = request
                .size
                .checked_mul(request.size)
                .and_then(|n| n.checked_mul(3));
            if expected != Some(pixels.len()) {
                warn!(
                    "source image has {} samples, expected {expected:?}; running text-to-image",
                    pixels.len()
                );
                request.source_image = None;
            } else if models.image_encoder.is_none() {
                warn!("no image encoder loaded; running text-to-image");
                request.source_image = None;
            }
        }

        let threshold = self.nsfw_threshold;
        GenerationSession::new(models, request, &self.scheduler_config, threshold)
    }

    /// Run a generation to completion, discarding progress.
    pub fn forward(&self, request: GenerationRequest) -> Result<GenerationResult> {
        for event in self.session(request)? {
            match event {
                GenerationEvent::Progress { .. } => (),
                GenerationEvent::Complete(result) => return Ok(result),
                GenerationEvent::Error(err) => return Err(err),
            }
        }
        Err(Error::Incomplete)
    }
}
