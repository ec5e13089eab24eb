//! Error kinds for the concept-embedding core

use std::path::PathBuf;

/// Error type for token registration, embedding restore and weight files
#[derive(thiserror::Error, Debug)]
pub enum InversionError {
    #[error("token string already exists in tokenizer, please use another one: {0:?}")]
    TokenConflict(Vec<String>),
    #[error("num_vectors_per_token must be at least 1, got {0}")]
    InvalidVectorCount(usize),
    #[error("init word {0:?} encodes to no tokens")]
    EmptyInitWord(String),
    #[error("tokenizer added {added} tokens, expected {expected}")]
    TokenCount { expected: usize, added: usize },
    #[error("token ids {ids:?} are not a contiguous block at the end of a vocabulary of {vocab_size}")]
    NonContiguousTokenIds { ids: Vec<u32>, vocab_size: usize },
    #[error("shape mismatch for {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("embedding snapshot has shape {snapshot:?} but live table has shape {live:?}")]
    SnapshotShapeMismatch { snapshot: Vec<usize>, live: Vec<usize> },
    #[error("invalid weight file {path}: {reason}")]
    InvalidWeightFile { path: PathBuf, reason: String },
    #[error("weight file not found: {0}")]
    WeightFileNotFound(PathBuf),
    #[error("unsupported dtype for weight files: {0:?}")]
    UnsupportedDtype(candle_core::DType),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InversionError>;
