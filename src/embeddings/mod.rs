//! Concept-token embedding core: registration, restore and weight files

pub mod embedding_guard;
pub mod error;
pub mod token_registrar;
pub mod weight_codec;

pub use embedding_guard::EmbeddingGuard;
pub use error::{InversionError, Result};
pub use token_registrar::{
    concept_token_strings, extract_rows, initialize_concept_embeddings, register_concept_tokens, ConceptTokens,
    EmbeddingInit,
};
pub use weight_codec::{load_weights, save_weights, WeightFormat, EMBEDDING_KEY, LEGACY_PARAM_KEY};
