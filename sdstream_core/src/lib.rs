//! Core crate of sdstream: a Stable Diffusion sampler that streams its progress.
//!
//! The networks themselves live behind the traits in [`ModelSet`]; this crate owns
//! the noise schedule, the DPM-Solver++ scheduler, prompt framing, the denoising
//! loop and post-processing. A [`Pipeline`] runs one generation at a time and
//! hands it out as a [`GenerationSession`], an iterator of [`GenerationEvent`]s.
//!
//! ```rust,no_run
//! use sdstream_core::{GenerationEvent, GenerationRequest, ModelSet, Pipeline};
//!
//! # fn load_models() -> ModelSet { unimplemented!() }
//! let pipeline = Pipeline::new(load_models());
//!
//! let session = pipeline.session(GenerationRequest {
//!     prompt: "a red apple on a wooden table".to_string(),
//!     steps: 20,
//!     seed: 42,
//!     ..Default::default()
//! })?;
//!
//! for event in session {
//!     match event {
//!         GenerationEvent::Progress { step, total } => println!("{step}/{total}"),
//!         GenerationEvent::Complete(result) => {
//!             println!("{}x{} in {}ms", result.width, result.height, result.total_time_ms)
//!         }
//!         GenerationEvent::Error(err) => eprintln!("{err}"),
//!     }
//! }
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod error;
mod models;
mod pipelines;

pub use error::{Error, Result, Stage};
pub use models::{
    Denoiser, ImageDecoder, ImageEncoder, LatentDistribution, ModelSet, PromptTokenizer,
    SafetyChecker, TextEncoder,
};
pub use pipelines::{
    apply_safety_gate, frame_token_ids, start_step, DPMSolverMultistepScheduler,
    DPMSolverMultistepSchedulerConfig, GenerationEvent, GenerationRequest, GenerationResult,
    GenerationSession, NoiseSchedule, Pipeline, RgbImage, BOS_TOKEN_ID, DEFAULT_NSFW_THRESHOLD,
    EOS_TOKEN_ID, MAX_IMAGE_SIZE, MAX_TOKEN_LENGTH, VAE_SCALE_FACTOR,
};
pub use sdstream_common::{ModelSource, TokenSource};
