//! Stable Diffusion 1.x / 2.x loading from a diffusers-layout directory
//!
//! ```text
//! <root>/tokenizer/tokenizer.json
//! <root>/text_encoder/model.safetensors
//! <root>/unet/diffusion_pytorch_model.safetensors
//! <root>/vae/diffusion_pytorch_model.safetensors
//! ```
//!
//! Each component path can be overridden on its own in the model config.

use anyhow::{bail, Result};
use candle_core::{DType, Device};
use log::info;
use std::path::{Path, PathBuf};

use super::clip_tokenizer::ClipTokenizer;
use crate::models::stable_diffusion::SdVersion;
use crate::models::{ClipTextConfig, ClipTextEncoder, SdUnet, SdVae};
use crate::trainers::ModelConfig;

/// SD 2.x tokenizers pad with `!` rather than EOS
const V2_PAD_TOKEN: &str = "!";

/// Resolved file locations of the four components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdModelPaths {
    pub tokenizer: PathBuf,
    pub text_encoder: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl SdModelPaths {
    pub fn resolve(config: &ModelConfig) -> Result<Self> {
        let root = Path::new(&config.name_or_path);
        let pick = |explicit: &Option<String>, default: &[&str]| -> PathBuf {
            match explicit {
                Some(path) => PathBuf::from(path),
                None => default.iter().fold(root.to_path_buf(), |p, part| p.join(part)),
            }
        };

        let paths = Self {
            tokenizer: pick(&config.tokenizer_path, &["tokenizer", "tokenizer.json"]),
            text_encoder: pick(&config.text_encoder_path, &["text_encoder", "model.safetensors"]),
            unet: pick(&config.unet_path, &["unet", "diffusion_pytorch_model.safetensors"]),
            vae: pick(&config.vae_path, &["vae", "diffusion_pytorch_model.safetensors"]),
        };

        let missing: Vec<String> = [
            &paths.tokenizer,
            &paths.text_encoder,
            &paths.unet,
            &paths.vae,
        ]
        .iter()
        .filter(|p| !p.is_file())
        .map(|p| p.display().to_string())
        .collect();
        if !missing.is_empty() {
            bail!("model files not found: {}", missing.join(", "));
        }
        Ok(paths)
    }
}

pub struct SdModelLoader {
    paths: SdModelPaths,
    version: SdVersion,
    clip_skip: Option<usize>,
    device: Device,
}

impl SdModelLoader {
    pub fn new(config: &ModelConfig, device: Device) -> Result<Self> {
        let paths = SdModelPaths::resolve(config)?;
        let version = SdVersion::from_flag(config.v2);
        info!("Model {} ({:?})", config.name_or_path, version);
        Ok(Self {
            paths,
            version,
            clip_skip: config.clip_skip,
            device,
        })
    }

    pub fn paths(&self) -> &SdModelPaths {
        &self.paths
    }

    pub fn tokenizer(&self) -> Result<ClipTokenizer> {
        let pad = match self.version {
            SdVersion::V1_5 => None,
            SdVersion::V2_1 => Some(V2_PAD_TOKEN),
        };
        ClipTokenizer::from_file(&self.paths.tokenizer, pad)
    }

    pub fn text_encoder(&self) -> Result<ClipTextEncoder> {
        let config = match self.version {
            SdVersion::V1_5 => ClipTextConfig::v1_5(),
            SdVersion::V2_1 => ClipTextConfig::v2_1(),
        };
        let encoder = ClipTextEncoder::load(&self.paths.text_encoder, config, &self.device)?;
        Ok(match self.clip_skip {
            Some(skip) => encoder.with_clip_skip(skip),
            None => encoder,
        })
    }

    pub fn unet(&self, dtype: DType) -> Result<SdUnet> {
        SdUnet::load(&self.paths.unet, self.version, &self.device, dtype)
    }

    pub fn vae(&self, dtype: DType) -> Result<SdVae> {
        SdVae::load(&self.paths.vae, self.version, &self.device, dtype)
    }
}
