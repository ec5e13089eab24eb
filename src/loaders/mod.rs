pub mod clip_tokenizer;
pub mod sd_model_loader;

pub use clip_tokenizer::ClipTokenizer;
pub use sd_model_loader::{SdModelLoader, SdModelPaths};
