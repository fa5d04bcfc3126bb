mod model_source;
mod tokens;

/// The tensor crate every other `sdstream` crate computes with.
pub mod core {
    pub use candle_core::*;
}

pub use model_source::*;
pub use tokens::get_token;
pub use tokens::TokenSource;
