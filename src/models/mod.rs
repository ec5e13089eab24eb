//! Model seams consumed by the textual inversion trainer
//!
//! The trainer never touches concrete model types directly. Tokenizer,
//! text encoder, image encoder and denoising network are reached through
//! the traits below so that the embedding-update discipline can be tested
//! with small in-memory models.

pub mod clip_text;
pub mod sd_unet;
pub mod stable_diffusion;

use candle_core::{DType, Tensor, Var};
use rand::rngs::StdRng;

use crate::embeddings::Result as InversionResult;

pub use clip_text::{ClipActivation, ClipTextConfig, ClipTextEncoder};
pub use sd_unet::{ConditionedUNet, ConditionedUNetConfig};
pub use stable_diffusion::{SdUnet, SdVae, SdVersion};

/// Tokenizer with a growable vocabulary
pub trait ConceptTokenizer: Send + Sync {
    /// Number of ids, including tokens added at runtime
    fn vocab_size(&self) -> usize;

    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Token ids of `text` without BOS/EOS and without padding
    fn encode(&self, text: &str) -> InversionResult<Vec<u32>>;

    /// BOS + ids + EOS, truncated and padded to exactly `max_length` ids
    fn encode_padded(&self, text: &str, max_length: usize) -> InversionResult<Vec<u32>>;

    /// Appends tokens to the vocabulary, returns how many were new
    fn add_tokens(&mut self, tokens: &[String]) -> usize;
}

/// Text encoder whose token lookup table is the only trainable parameter
pub trait TextEncoder {
    /// Live `[vocab_size, embed_dim]` token embedding table
    fn token_embedding(&self) -> &Var;

    fn embed_dim(&self) -> usize;

    /// Longest id sequence the position embeddings cover
    fn max_sequence_length(&self) -> usize;

    /// Grows or shrinks the token table to `new_num_tokens` rows.
    /// Existing rows are kept, new rows are drawn from `rng`.
    fn resize_token_embeddings(
        &mut self,
        new_num_tokens: usize,
        rng: &mut StdRng,
    ) -> candle_core::Result<()>;

    /// `[batch, seq]` u32 ids to `[batch, seq, embed_dim]` hidden states
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;
}

/// Image to latent encoder (VAE encoder half)
pub trait LatentEncoder {
    /// `[batch, 3, H, W]` images in [-1, 1] to unscaled latents
    fn encode(&self, images: &Tensor) -> candle_core::Result<Tensor>;

    fn dtype(&self) -> DType;
}

/// Noise / velocity predictor conditioned on text hidden states
pub trait DenoisingNetwork {
    /// One timestep per batch element
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &[u32],
        encoder_hidden_states: &Tensor,
    ) -> candle_core::Result<Tensor>;

    fn dtype(&self) -> DType;
}
