//! Stable Diffusion v1.5 / v2.1 collaborators for [`sdstream_core`], built on
//! candle-transformers and a Hugging Face `tokenizers` CLIP tokenizer.

mod adapters;
mod loader;
mod version;

pub use adapters::{
    ClipTextEncoder, ClipTokenizer, UNetDenoiser, VaeImageDecoder, VaeImageEncoder,
};
pub use loader::{default_device, load_model_set, LoadOptions};
pub use version::StableDiffusionVersion;
