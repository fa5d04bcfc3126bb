use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use sdstream_common::core::{
    DType, Device, Error as TensorError, Result as TensorResult, Tensor, D,
};
use sdstream_core::{
    Denoiser, Error, GenerationEvent, GenerationRequest, GenerationResult, ImageDecoder,
    ImageEncoder, LatentDistribution, ModelSet, Pipeline, PromptTokenizer, SafetyChecker, Stage,
    TextEncoder, MAX_IMAGE_SIZE,
};

const EMBEDDING_DIM: usize = 8;

struct ByteTokenizer;

impl PromptTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> TensorResult<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }
}

struct IdEncoder;

impl TextEncoder for IdEncoder {
    fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn forward(&self, input_ids: &Tensor) -> TensorResult<Tensor> {
        let (b, n) = input_ids.dims2()?;
        (input_ids.to_dtype(DType::F32)? * 1e-5)?
            .unsqueeze(2)?
            .broadcast_as((b, n, EMBEDDING_DIM))?
            .contiguous()
    }
}

#[derive(Default, Clone)]
struct Calls {
    denoiser: Arc<AtomicUsize>,
    last_batch: Arc<AtomicUsize>,
    encoder: Arc<AtomicUsize>,
}

/// Shrinks the latent a little and shifts it by the mean of its conditioning.
struct LinearDenoiser {
    calls: Calls,
    fail: bool,
}

impl Denoiser for LinearDenoiser {
    fn forward(
        &self,
        latents: &Tensor,
        timestep: usize,
        text_embeddings: &Tensor,
    ) -> TensorResult<Tensor> {
        self.calls.denoiser.fetch_add(1, Ordering::SeqCst);
        let b = latents.dim(0)?;
        self.calls.last_batch.store(b, Ordering::SeqCst);
        if self.fail {
            return Err(TensorError::Msg("denoiser exploded".to_string()));
        }
        let shift = text_embeddings
            .flatten_from(1)?
            .mean(D::Minus1)?
            .reshape((b, 1, 1, 1))?;
        (latents * (0.1 + timestep as f64 * 1e-4))?.broadcast_add(&shift)
    }
}

/// Posterior mean is the pooled image; the fourth channel repeats red.
struct PoolingEncoder {
    calls: Calls,
}

impl ImageEncoder for PoolingEncoder {
    fn encode(&self, pixels: &Tensor) -> TensorResult<LatentDistribution> {
        self.calls.encoder.fetch_add(1, Ordering::SeqCst);
        let pooled = pixels.avg_pool2d(8)?;
        let mean = Tensor::cat(&[&pooled, &pooled.narrow(1, 0, 1)?], 1)?;
        let std = (mean.ones_like()? * 0.1)?;
        Ok(LatentDistribution { mean, std })
    }
}

struct UpsamplingDecoder;

impl ImageDecoder for UpsamplingDecoder {
    fn decode(&self, latents: &Tensor) -> TensorResult<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        latents
            .narrow(1, 0, 3)?
            .upsample_nearest2d(h * 8, w * 8)?
            .tanh()
    }
}

struct FixedScore(f32);

impl SafetyChecker for FixedScore {
    fn nsfw_score(&self, rgb: &[u8], width: usize, height: usize) -> TensorResult<f32> {
        assert_eq!(rgb.len(), width * height * 3);
        Ok(self.0)
    }
}

struct Options {
    fail_denoiser: bool,
    image_encoder: bool,
    nsfw_score: Option<f32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            fail_denoiser: false,
            image_encoder: true,
            nsfw_score: None,
        }
    }
}

fn pipeline(opts: Options) -> (Pipeline, Calls) {
    let calls = Calls::default();
    let models = ModelSet {
        tokenizer: Box::new(ByteTokenizer),
        text_encoder: Box::new(IdEncoder),
        denoiser: Box::new(LinearDenoiser {
            calls: calls.clone(),
            fail: opts.fail_denoiser,
        }),
        image_encoder: opts.image_encoder.then(|| {
            Box::new(PoolingEncoder {
                calls: calls.clone(),
            }) as Box<dyn ImageEncoder>
        }),
        decoder: Box::new(UpsamplingDecoder),
        safety_checker: opts
            .nsfw_score
            .map(|score| Box::new(FixedScore(score)) as Box<dyn SafetyChecker>),
        device: Device::Cpu,
    };
    (Pipeline::new(models), calls)
}

fn request(steps: usize, size: usize, seed: u64) -> GenerationRequest {
    GenerationRequest {
        prompt: "a red apple".to_string(),
        negative_prompt: "blurry".to_string(),
        use_guidance: true,
        steps,
        size,
        seed,
        ..Default::default()
    }
}

fn gradient_image(size: usize) -> Vec<u8> {
    (0..size * size * 3).map(|i| (i % 251) as u8).collect()
}

fn complete(events: Vec<GenerationEvent>) -> GenerationResult {
    match events.into_iter().last() {
        Some(GenerationEvent::Complete(result)) => result,
        other => panic!("expected a complete event last, got {other:?}"),
    }
}

#[test]
fn single_step_text_to_image_reports_three_progress_steps() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options::default());
    let events: Vec<_> = pipeline
        .session(GenerationRequest {
            use_guidance: false,
            ..request(1, 512, 42)
        })?
        .collect();

    assert_eq!(events.len(), 4);
    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            GenerationEvent::Progress { step, total } => Some((*step, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 3), (2, 3), (3, 3)]);

    let result = complete(events);
    let dims = (result.width, result.height, result.channels);
    assert_eq!(dims, (512, 512, 3));
    assert_eq!(result.pixels.len(), 512 * 512 * 3);
    assert_eq!(result.seed, 42);
    assert!(!result.suppressed);
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 1);
    assert_eq!(calls.last_batch.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn guidance_runs_the_denoiser_on_a_batch_of_two() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options::default());
    let events: Vec<_> = pipeline
        .session(GenerationRequest {
            use_guidance: true,
            ..request(3, 64, 7)
        })?
        .collect();
    assert_eq!(events.len(), 3 + 2 + 1);
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 3);
    assert_eq!(calls.last_batch.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn same_seed_reproduces_the_same_image() -> anyhow::Result<()> {
    let (pipeline, _) = pipeline(Options::default());
    let a = pipeline.forward(request(4, 64, 1234))?;
    let b = pipeline.forward(request(4, 64, 1234))?;
    let c = pipeline.forward(request(4, 64, 4321))?;
    assert_eq!(a.pixels, b.pixels);
    assert_ne!(a.pixels, c.pixels);
    Ok(())
}

#[test]
fn full_strength_image_to_image_matches_text_to_image() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options::default());
    let txt2img = pipeline.forward(request(5, 64, 99))?;
    let img2img = pipeline.forward(GenerationRequest {
        source_image: Some(gradient_image(64)),
        denoise_strength: 1.0,
        ..request(5, 64, 99)
    })?;
    assert_eq!(txt2img.pixels, img2img.pixels);
    assert_eq!(calls.encoder.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn partial_strength_skips_the_leading_steps() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options::default());
    let session = pipeline.session(GenerationRequest {
        source_image: Some(gradient_image(64)),
        denoise_strength: 0.5,
        ..request(4, 64, 5)
    })?;
    assert_eq!(session.start_step(), 2);
    assert_eq!(session.total_steps(), 4);

    let events: Vec<_> = session.collect();
    let last_progress = events.iter().rev().find_map(|e| match e {
        GenerationEvent::Progress { step, total } => Some((*step, *total)),
        _ => None,
    });
    assert_eq!(last_progress, Some((4, 4)));
    complete(events);
    assert_eq!(calls.encoder.load(Ordering::SeqCst), 1);
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 2);

    let txt2img = pipeline.forward(request(4, 64, 5))?;
    let img2img = pipeline.forward(GenerationRequest {
        source_image: Some(gradient_image(64)),
        denoise_strength: 0.5,
        ..request(4, 64, 5)
    })?;
    assert_ne!(txt2img.pixels, img2img.pixels);
    Ok(())
}

#[test]
fn mismatched_source_image_falls_back_to_text_to_image() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options::default());
    let session = pipeline.session(GenerationRequest {
        source_image: Some(gradient_image(32)),
        denoise_strength: 0.5,
        ..request(4, 64, 11)
    })?;
    assert_eq!(session.start_step(), 0);
    let fallback = complete(session.collect());

    let txt2img = pipeline.forward(request(4, 64, 11))?;
    assert_eq!(fallback.pixels, txt2img.pixels);
    assert_eq!(calls.encoder.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn missing_image_encoder_falls_back_to_text_to_image() -> anyhow::Result<()> {
    let (pipeline, _) = pipeline(Options {
        image_encoder: false,
        ..Default::default()
    });
    assert!(!pipeline.supports_image_to_image());
    let session = pipeline.session(GenerationRequest {
        source_image: Some(gradient_image(64)),
        denoise_strength: 0.5,
        ..request(4, 64, 11)
    })?;
    assert_eq!(session.total_steps(), 6);
    complete(session.collect());
    Ok(())
}

#[test]
fn flagged_images_are_replaced_with_white() -> anyhow::Result<()> {
    let (pipeline, _) = pipeline(Options {
        nsfw_score: Some(0.9),
        ..Default::default()
    });
    let result = pipeline.forward(GenerationRequest {
        enable_safety_check: true,
        ..request(2, 64, 3)
    })?;
    assert!(result.suppressed);
    assert_eq!(result.pixels.len(), 64 * 64 * 3);
    assert!(result.pixels.iter().all(|&p| p == 255));

    // Without the check the same model set returns the real image.
    let unchecked = pipeline.forward(request(2, 64, 3))?;
    assert!(!unchecked.suppressed);
    assert!(unchecked.pixels.iter().any(|&p| p != 255));
    Ok(())
}

#[test]
fn low_scores_pass_the_safety_gate() -> anyhow::Result<()> {
    let (pipeline, _) = pipeline(Options {
        nsfw_score: Some(0.1),
        ..Default::default()
    });
    let checked = pipeline.forward(GenerationRequest {
        enable_safety_check: true,
        ..request(2, 64, 3)
    })?;
    let unchecked = pipeline.forward(request(2, 64, 3))?;
    assert!(!checked.suppressed);
    assert_eq!(checked.pixels, unchecked.pixels);
    Ok(())
}

#[test]
fn safety_check_without_a_checker_is_refused() {
    let (pipeline, _) = pipeline(Options::default());
    assert!(!pipeline.has_safety_checker());
    let err = pipeline
        .session(GenerationRequest {
            enable_safety_check: true,
            ..request(2, 64, 3)
        })
        .err();
    assert!(matches!(err, Some(Error::ModelNotReady(_))));
}

#[test]
fn denoiser_failure_ends_the_session_with_its_stage() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options {
        fail_denoiser: true,
        ..Default::default()
    });
    let mut session = pipeline.session(request(5, 64, 1))?;
    assert!(matches!(
        session.next(),
        Some(GenerationEvent::Progress { step: 1, total: 7 })
    ));
    match session.next() {
        Some(GenerationEvent::Error(err)) => assert_eq!(err.stage(), Some(Stage::Denoise)),
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(session.next().is_none());
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 1);

    drop(session);
    assert!(matches!(
        pipeline.forward(request(5, 64, 1)),
        Err(Error::Inference {
            stage: Stage::Denoise,
            ..
        })
    ));
    Ok(())
}

#[test]
fn only_one_session_runs_at_a_time() -> anyhow::Result<()> {
    let (pipeline, _) = pipeline(Options::default());
    let session = pipeline.try_session(request(2, 64, 1))?;
    assert!(matches!(
        pipeline.try_session(request(2, 64, 1)),
        Err(Error::Busy)
    ));
    drop(session);
    assert!(pipeline.try_session(request(2, 64, 1)).is_ok());
    Ok(())
}

#[test]
fn dropping_a_session_stops_denoising() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options::default());
    let mut session = pipeline.session(request(10, 64, 1))?;
    // Prompt encoding, then two denoising steps.
    for _ in 0..3 {
        let event = session.next();
        assert!(matches!(event, Some(GenerationEvent::Progress { .. })));
    }
    drop(session);
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 2);

    // The model set is free again.
    assert!(pipeline.try_session(request(1, 64, 1)).is_ok());
    Ok(())
}

#[test]
fn queued_sessions_run_one_after_another() -> anyhow::Result<()> {
    let (pipeline, calls) = pipeline(Options::default());
    let pipeline = &pipeline;
    std::thread::scope(|s| {
        let mut handles = Vec::new();
        for seed in 0..3 {
            handles.push(s.spawn(move || pipeline.forward(request(3, 64, seed))));
        }
        for handle in handles {
            let result = handle.join().expect("generation panicked");
            assert_eq!(result?.pixels.len(), 64 * 64 * 3);
        }
        anyhow::Ok(())
    })?;
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 9);
    Ok(())
}

#[test]
fn invalid_requests_fail_before_running() {
    let (pipeline, calls) = pipeline(Options::default());
    let err = pipeline
        .session(GenerationRequest {
            size: 100,
            ..request(2, 64, 1)
        })
        .err();
    assert!(matches!(err, Some(Error::Validation(_))));
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 0);
}

#[test]
fn oversized_requests_are_refused_without_allocating() {
    let (pipeline, calls) = pipeline(Options::default());
    for size in [MAX_IMAGE_SIZE + 8, 1 << 40] {
        let err = pipeline
            .forward(GenerationRequest {
                size,
                source_image: Some(vec![0; 3]),
                ..request(1, 64, 1)
            })
            .err();
        assert!(matches!(err, Some(Error::Validation(_))), "{size}: {err:?}");
    }
    assert_eq!(calls.denoiser.load(Ordering::SeqCst), 0);
    assert_eq!(calls.encoder.load(Ordering::SeqCst), 0);
}
