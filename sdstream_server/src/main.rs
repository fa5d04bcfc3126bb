use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use sdstream_backend::{default_device, load_model_set, LoadOptions, StableDiffusionVersion};
use sdstream_common::{core::DType, ModelSource, TokenSource};
use sdstream_core::{Pipeline, DEFAULT_NSFW_THRESHOLD};
use sdstream_server::{router, AppState, BusyPolicy};
use tokio::net::TcpListener;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Subcommand)]
pub enum SourceCommand {
    /// Load the model from some Hugging Face model ID
    ModelId {
        /// Model ID
        #[arg(short, long)]
        model_id: String,
    },

    /// Load the model from a local directory laid out like a diffusers repository
    Local {
        /// Model directory
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Where to load weights from. Defaults to the hub repository of `--which`.
    #[clap(subcommand)]
    source: Option<SourceCommand>,

    /// Stable Diffusion version of the weights.
    #[arg(long, value_enum, default_value_t = StableDiffusionVersion::V1_5)]
    which: StableDiffusionVersion,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Hugging Face token source: `literal:<value>`, `env[:<var>]`, `path:<file>`, `cache` or `none`.
    #[arg(long, default_value = "cache")]
    token: TokenSource,

    /// Model revision (branch, tag or commit) for hub sources.
    #[arg(long)]
    revision: Option<String>,

    /// `tokenizer.json` to use instead of downloading one.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Load the UNet and autoencoder in half precision.
    #[arg(long)]
    use_f16: bool,

    /// Attention slice size. Lowers memory use at some speed cost.
    #[arg(long)]
    sliced_attention_size: Option<usize>,

    /// Whether a request arriving during a generation waits or is rejected with 503.
    #[arg(long, value_enum, default_value_t = BusyPolicy::Queue)]
    busy: BusyPolicy,

    /// Safety checker scores above this replace the image with white.
    #[arg(long, default_value_t = DEFAULT_NSFW_THRESHOLD)]
    nsfw_threshold: f32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let source = args.source.map(|source| match source {
        SourceCommand::ModelId { model_id } => ModelSource::from_model_id(model_id),
        SourceCommand::Local { dir } => ModelSource::local_dir(dir),
    });
    let opts = LoadOptions {
        source,
        tokenizer: args.tokenizer,
        token: args.token,
        revision: args.revision,
        dtype: if args.use_f16 { DType::F16 } else { DType::F32 },
        sliced_attention_size: args.sliced_attention_size,
        ..LoadOptions::new(args.which, default_device(args.cpu)?)
    };

    let models = tokio::task::spawn_blocking(move || load_model_set(&opts)).await??;
    let pipeline = Arc::new(Pipeline::new(models).with_nsfw_threshold(args.nsfw_threshold));
    info!(
        "safety checker: {}, image-to-image: {}, busy policy: {:?}",
        pipeline.has_safety_checker(),
        pipeline.supports_image_to_image(),
        args.busy
    );

    let app = router(AppState::new(pipeline, args.busy));
    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
