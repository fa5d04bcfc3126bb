use std::{
    sync::MutexGuard,
    time::{Duration, Instant},
};

use sdstream_common::core::Tensor;
use tracing::{debug, error, info};

use super::{
    postprocess::{apply_safety_gate, decode_latents, to_rgb_image},
    prompt::prompt_input_ids,
    sampling::{self, denoise_step, image_to_image_latents, rgb_to_tensor, NoiseGenerator},
    scheduler::{DPMSolverMultistepScheduler, DPMSolverMultistepSchedulerConfig},
    GenerationEvent, GenerationRequest, GenerationResult,
};
use crate::{
    error::{Result, Stage, StageContext},
    models::ModelSet,
};

enum State {
    EncodePrompt,
    InitLatents {
        text_embeddings: Tensor,
    },
    Denoise {
        text_embeddings: Tensor,
        latents: Tensor,
        step: usize,
    },
    Decode {
        latents: Tensor,
    },
    Complete(GenerationResult),
    Finished,
}

/// A single generation, run lazily one stage per [`Iterator::next`].
///
/// The session holds the model set exclusively. Dropping it before the final
/// event stops generation: no further model calls are made and the model set is
/// released for the next request.
pub struct GenerationSession<'a> {
    models: MutexGuard<'a, ModelSet>,
    request: GenerationRequest,
    scheduler: DPMSolverMultistepScheduler,
    noise: NoiseGenerator,
    nsfw_threshold: f32,
    state: State,
    start_step: usize,
    completed: usize,
    total: usize,
    started: Instant,
    first_step_time: Duration,
}

impl<'a> GenerationSession<'a> {
    pub(super) fn new(
        models: MutexGuard<'a, ModelSet>,
        request: GenerationRequest,
        scheduler_config: &DPMSolverMultistepSchedulerConfig,
        nsfw_threshold: f32,
    ) -> Result<Self> {
        let mut scheduler = DPMSolverMultistepScheduler::new(scheduler_config.clone());
        scheduler
            .set_timesteps(request.steps)
            .map_err(|e| crate::Error::Validation(e.to_string()))?;

        let start_step = match request.source_image {
            Some(_) => sampling::start_step(request.steps, request.denoise_strength),
            None => 0,
        };
        let total = request.steps + 2 - start_step;

        info!(
            "starting generation: steps={} size={} guidance={} seed={} image_to_image={} start_step={start_step}",
            request.steps,
            request.size,
            if request.use_guidance {
                request.guidance_scale.to_string()
            } else {
                "off".to_string()
            },
            request.seed,
            start_step > 0,
        );

        Ok(Self {
            models,
            noise: NoiseGenerator::new(request.seed),
            request,
            scheduler,
            nsfw_threshold,
            state: State::EncodePrompt,
            start_step,
            completed: 0,
            total,
            started: Instant::now(),
            first_step_time: Duration::ZERO,
        })
    }

    /// Number of progress steps the session reports, including prompt encoding and decoding.
    pub fn total_steps(&self) -> usize {
        self.total
    }

    /// First timestep index that is denoised; non-zero only for image-to-image.
    pub fn start_step(&self) -> usize {
        self.start_step
    }

    fn guidance_scale(&self) -> Option<f32> {
        self.request
            .use_guidance
            .then_some(self.request.guidance_scale)
    }

    fn progress(&mut self) -> GenerationEvent {
        self.completed += 1;
        GenerationEvent::Progress {
            step: self.completed,
            total: self.total,
        }
    }

    /// Run the current stage. `Ok(None)` means the stage produced no event.
    fn advance(&mut self, state: State) -> Result<Option<GenerationEvent>> {
        match state {
            State::EncodePrompt => {
                let text_embeddings = self.encode_prompt().stage(Stage::EncodePrompt)?;
                self.state = State::InitLatents { text_embeddings };
                Ok(Some(self.progress()))
            }
            State::InitLatents { text_embeddings } => {
                let latents = self.init_latents()?;
                self.state = State::Denoise {
                    text_embeddings,
                    latents,
                    step: self.start_step,
                };
                Ok(None)
            }
            State::Denoise {
                text_embeddings,
                latents,
                step,
            } => {
                let timestep = self.scheduler.timesteps()[step];
                let guidance_scale = self.guidance_scale();
                let step_start = Instant::now();
                let latents = denoise_step(
                    self.models.denoiser.as_ref(),
                    &mut self.scheduler,
                    &latents,
                    timestep,
                    &text_embeddings,
                    guidance_scale,
                )
                .stage(Stage::Denoise)?;
                let elapsed = step_start.elapsed();
                if step == self.start_step {
                    self.first_step_time = elapsed;
                }
                debug!("step {step} (timestep {timestep}) took {elapsed:.2?}");

                self.state = if step + 1 < self.request.steps {
                    State::Denoise {
                        text_embeddings,
                        latents,
                        step: step + 1,
                    }
                } else {
                    State::Decode { latents }
                };
                Ok(Some(self.progress()))
            }
            State::Decode { latents } => {
                let decode_start = Instant::now();
                let decoded =
                    decode_latents(self.models.decoder.as_ref(), &latents).stage(Stage::Decode)?;
                let image = to_rgb_image(&decoded).stage(Stage::Decode)?;
                debug!("decoding took {:.2?}", decode_start.elapsed());

                let result = self.finish(image)?;
                self.state = State::Complete(result);
                Ok(Some(self.progress()))
            }
            State::Complete(result) => {
                info!(
                    "generation finished in {}ms (first step {}ms)",
                    result.total_time_ms, result.first_step_time_ms
                );
                Ok(Some(GenerationEvent::Complete(result)))
            }
            State::Finished => Ok(None),
        }
    }

    fn encode_prompt(&self) -> sdstream_common::core::Result<Tensor> {
        let text_encoder = self.models.text_encoder.as_ref();
        let input_ids = prompt_input_ids(
            self.models.tokenizer.as_ref(),
            &self.request.prompt,
            &self.request.negative_prompt,
            text_encoder.embedding_dim(),
            self.request.use_guidance,
            &self.models.device,
        )?;
        text_encoder.forward(&input_ids)
    }

    fn init_latents(&mut self) -> Result<Tensor> {
        let device = self.models.device.clone();
        let size = self.request.size;
        let latents = self.noise.latent(size, &device).stage(Stage::InitLatents)?;

        let (Some(pixels), Some(encoder)) = (
            self.request.source_image.as_deref(),
            self.models.image_encoder.as_deref(),
        ) else {
            return Ok(latents);
        };
        if self.start_step == 0 {
            // Full strength: the source image would be drowned out entirely.
            return Ok(latents);
        }

        let pixels = rgb_to_tensor(pixels, size, &device).stage(Stage::EncodeImage)?;
        image_to_image_latents(
            encoder,
            &mut self.scheduler,
            &mut self.noise,
            &pixels,
            size,
            self.start_step,
        )
        .stage(Stage::EncodeImage)
    }

    fn finish(&self, image: super::RgbImage) -> Result<GenerationResult> {
        let super::RgbImage {
            mut pixels,
            width,
            height,
        } = image;

        let mut suppressed = false;
        if self.request.enable_safety_check {
            if let Some(checker) = self.models.safety_checker.as_deref() {
                let score = checker
                    .nsfw_score(&pixels, width, height)
                    .stage(Stage::SafetyCheck)?;
                suppressed = apply_safety_gate(&mut pixels, score, self.nsfw_threshold);
                if suppressed {
                    info!(
                        "safety checker score {score:.3} above {}; image suppressed",
                        self.nsfw_threshold
                    );
                }
            }
        }

        Ok(GenerationResult {
            pixels,
            width,
            height,
            channels: 3,
            seed: self.request.seed,
            suppressed,
            total_time_ms: self.started.elapsed().as_millis() as u64,
            first_step_time_ms: self.first_step_time.as_millis() as u64,
        })
    }
}

impl Iterator for GenerationSession<'_> {
    type Item = GenerationEvent;

    fn next(&mut self) -> Option<GenerationEvent> {
        loop {
            let state = std::mem::replace(&mut self.state, State::Finished);
            if matches!(state, State::Finished) {
                return None;
            }
            match self.advance(state) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => continue,
                Err(err) => {
                    error!("generation failed: {err}");
                    self.state = State::Finished;
                    return Some(GenerationEvent::Error(err));
                }
            }
        }
    }
}
