use sdstream_common::core::{Device, Result, Tensor};

use crate::models::PromptTokenizer;

/// Sequence length of the CLIP text encoder.
pub const MAX_TOKEN_LENGTH: usize = 77;
pub const BOS_TOKEN_ID: u32 = 49406;
pub const EOS_TOKEN_ID: u32 = 49407;

/// SD 2.x text encoders (1024-wide embeddings) pad with 0 after the first EOS.
const ZERO_PADDED_EMBEDDING_DIM: usize = 1024;

/// Frame raw token IDs as `BOS ids.. EOS pad..`, exactly [`MAX_TOKEN_LENGTH`] long.
pub fn frame_token_ids(ids: &[u32], embedding_dim: usize) -> Vec<u32> {
    let mut framed = Vec::with_capacity(MAX_TOKEN_LENGTH);
    framed.push(BOS_TOKEN_ID);
    framed.extend(ids.iter().take(MAX_TOKEN_LENGTH - 2));
    framed.push(EOS_TOKEN_ID);

    let filler = if embedding_dim == ZERO_PADDED_EMBEDDING_DIM {
        0
    } else {
        EOS_TOKEN_ID
    };
    framed.resize(MAX_TOKEN_LENGTH, filler);
    framed
}

/// Build the `(batch, 77)` token batch for a prompt.
///
/// With guidance the batch is `[negative, prompt]`: the denoising loop relies
/// on index 0 being unconditional and index 1 conditional.
pub fn prompt_input_ids(
    tokenizer: &dyn PromptTokenizer,
    prompt: &str,
    negative_prompt: &str,
    embedding_dim: usize,
    use_guidance: bool,
    device: &Device,
) -> Result<Tensor> {
    let prompt_ids = frame_token_ids(&tokenizer.encode(prompt)?, embedding_dim);

    let mut ids = Vec::with_capacity(2 * MAX_TOKEN_LENGTH);
    if use_guidance {
        let negative_ids = tokenizer.encode(negative_prompt)?;
        ids.extend(frame_token_ids(&negative_ids, embedding_dim));
    }
    ids.extend(prompt_ids);

    let batch = ids.len() / MAX_TOKEN_LENGTH;
    Tensor::from_vec(ids, (batch, MAX_TOKEN_LENGTH), device)
}
