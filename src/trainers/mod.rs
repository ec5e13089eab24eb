pub mod accelerator;
pub mod caption_templates;
pub mod checkpoint_policy;
pub mod dataset;
pub mod ddpm_scheduler;
pub mod lr_scheduler;
pub mod optimizer;
pub mod textual_inversion;

// Re-export key types
pub use accelerator::{Accelerator, GradientAccumulator, LocalAccelerator, TrainingProgress};
pub use caption_templates::{CaptionTemplater, TemplateKind};
pub use checkpoint_policy::{EmbeddingCheckpointer, EpochAction, EpochSavePolicy, TrainingState};
pub use dataset::{BatchProvider, FolderDataset, FolderDatasetConfig, TrainingBatch};
pub use ddpm_scheduler::DDPMScheduler;
pub use lr_scheduler::{create_scheduler, LRScheduler};
pub use optimizer::{AdamWConfig, AdamWState, EmbeddingAdamW};
pub use textual_inversion::{
    run_textual_inversion, ModelComponents, TextualInversionTrainer, TrainingOutcome, TrainingPhase,
    TrainingPlan,
};

use anyhow::{bail, Context, Result};
use candle_core::DType;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};


/// Process types this binary knows how to run
const PROCESS_TYPES: &[&str] = &["textual_inversion", "ti"];

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    pub config: ConfigData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigData {
    pub name: Option<String>,
    pub process: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(rename = "type")]
    pub process_type: Option<String>,
    pub device: Option<String>,
    pub model: ModelConfig,
    pub concept: ConceptConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub train: TrainConfig,
    pub save: SaveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Diffusers-layout model directory
    pub name_or_path: String,
    pub tokenizer_path: Option<String>,
    pub text_encoder_path: Option<String>,
    pub unet_path: Option<String>,
    pub vae_path: Option<String>,
    #[serde(default)]
    pub v2: bool,
    #[serde(default)]
    pub v_parameterization: bool,
    pub clip_skip: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptConfig {
    pub token_string: String,
    pub init_word: Option<String>,
    #[serde(default = "default_num_vectors")]
    pub num_vectors_per_token: usize,
    /// Embedding file used to initialize the new rows
    pub weights: Option<String>,
    #[serde(default)]
    pub use_object_template: bool,
    #[serde(default)]
    pub use_style_template: bool,
}

fn default_num_vectors() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub train_data_dir: String,
    pub reg_data_dir: Option<String>,
    pub caption_extension: String,
    pub resolution: usize,
    pub batch_size: usize,
    pub cache_latents: bool,
    pub vae_batch_size: usize,
    pub random_crop: bool,
    pub prior_loss_weight: f32,
    pub max_data_loader_n_workers: usize,
    /// 75, 150 or 225 caption tokens
    pub max_token_length: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            train_data_dir: String::new(),
            reg_data_dir: None,
            caption_extension: ".caption".to_string(),
            resolution: 512,
            batch_size: 1,
            cache_latents: false,
            vae_batch_size: 1,
            random_crop: false,
            prior_loss_weight: 1.0,
            max_data_loader_n_workers: 8,
            max_token_length: None,
        }
    }
}

impl DatasetConfig {
    pub fn max_token_length(&self) -> usize {
        self.max_token_length.unwrap_or(75)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub lr_scheduler: String,
    pub lr_warmup_steps: usize,
    pub lr_scheduler_num_cycles: usize,
    pub lr_scheduler_power: f64,
    pub gradient_accumulation_steps: usize,
    pub max_train_steps: usize,
    pub max_train_epochs: Option<usize>,
    pub noise_offset: Option<f64>,
    /// 0 disables min-SNR weighting
    pub min_snr_gamma: Option<f64>,
    /// 0 disables clipping
    pub max_grad_norm: f64,
    /// `no`, `fp16` or `bf16`
    pub mixed_precision: String,
    pub seed: Option<u64>,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub adam_weight_decay: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-3,
            lr_scheduler: "constant".to_string(),
            lr_warmup_steps: 0,
            lr_scheduler_num_cycles: 1,
            lr_scheduler_power: 1.0,
            gradient_accumulation_steps: 1,
            max_train_steps: 1600,
            max_train_epochs: None,
            noise_offset: None,
            min_snr_gamma: None,
            max_grad_norm: 1.0,
            mixed_precision: "no".to_string(),
            seed: None,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            adam_weight_decay: 0.01,
        }
    }
}

impl TrainConfig {
    /// Dtype of the frozen UNet and VAE
    pub fn weight_dtype(&self) -> DType {
        match self.mixed_precision.as_str() {
            "fp16" => DType::F16,
            "bf16" => DType::BF16,
            _ => DType::F32,
        }
    }

    pub fn adamw(&self) -> optimizer::AdamWConfig {
        optimizer::AdamWConfig {
            beta1: self.adam_beta1,
            beta2: self.adam_beta2,
            eps: self.adam_epsilon,
            weight_decay: self.adam_weight_decay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub output_dir: String,
    /// Defaults to the token string
    pub output_name: Option<String>,
    /// `pt` (default) or `ckpt` for a JSON record, `safetensors` for safetensors
    pub save_model_as: String,
    /// `float`, `fp16` or `bf16`
    pub save_precision: Option<String>,
    pub save_every_n_epochs: Option<usize>,
    pub save_n_epoch_ratio: Option<usize>,
    pub save_last_n_epochs: Option<usize>,
    pub save_state: bool,
    pub save_last_n_epochs_state: Option<usize>,
    /// State directory to resume from
    pub resume: Option<String>,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            output_dir: "output".to_string(),
            output_name: None,
            save_model_as: "pt".to_string(),
            save_precision: None,
            save_every_n_epochs: None,
            save_n_epoch_ratio: None,
            save_last_n_epochs: None,
            save_state: false,
            save_last_n_epochs_state: None,
            resume: None,
        }
    }
}

impl SaveConfig {
    pub fn save_dtype(&self) -> Option<DType> {
        match self.save_precision.as_deref() {
            Some("float") => Some(DType::F32),
            Some("fp16") => Some(DType::F16),
            Some("bf16") => Some(DType::BF16),
            _ => None,
        }
    }

    /// File extension of embedding checkpoints, exactly as configured
    pub fn extension(&self) -> &str {
        &self.save_model_as
    }

    pub fn model_name(&self, token_string: &str) -> String {
        self.output_name
            .clone()
            .unwrap_or_else(|| token_string.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub logging_dir: Option<String>,
    pub log_prefix: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    pub author: String,
    pub version: String,
    pub description: String,
}

impl ProcessConfig {
    /// Reject settings the trainer cannot run with
    pub fn validate(&self) -> Result<()> {
        let token = &self.concept.token_string;
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            bail!("token_string must be a single non-empty word, got {:?}", token);
        }
        if self.concept.num_vectors_per_token == 0 {
            bail!("num_vectors_per_token must be at least 1");
        }
        if self.concept.use_object_template && self.concept.use_style_template {
            bail!("use_object_template and use_style_template are mutually exclusive");
        }

        let dataset = &self.dataset;
        if dataset.train_data_dir.is_empty() {
            bail!("dataset.train_data_dir is required");
        }
        if dataset.batch_size == 0 || dataset.vae_batch_size == 0 {
            bail!("batch_size and vae_batch_size must be at least 1");
        }
        if dataset.resolution == 0 || dataset.resolution % 64 != 0 {
            bail!("resolution must be a positive multiple of 64, got {}", dataset.resolution);
        }
        if !matches!(dataset.max_token_length(), 75 | 150 | 225) {
            bail!("max_token_length must be 75, 150 or 225");
        }
        if dataset.cache_latents && dataset.random_crop {
            bail!("cache_latents cannot be used with random_crop");
        }

        let train = &self.train;
        if train.gradient_accumulation_steps == 0 {
            bail!("gradient_accumulation_steps must be at least 1");
        }
        if train.max_train_steps == 0 && train.max_train_epochs.unwrap_or(0) == 0 {
            bail!("max_train_steps or max_train_epochs must be positive");
        }
        if train.learning_rate <= 0.0 {
            bail!("learning_rate must be positive");
        }
        if train.max_grad_norm < 0.0 {
            bail!("max_grad_norm must not be negative");
        }
        if let Some(gamma) = train.min_snr_gamma {
            if gamma.is_nan() || gamma < 0.0 {
                bail!("min_snr_gamma must not be negative, got {}", gamma);
            }
        }
        if !matches!(train.mixed_precision.as_str(), "no" | "fp16" | "bf16") {
            bail!("mixed_precision must be no, fp16 or bf16, got {:?}", train.mixed_precision);
        }
        if !lr_scheduler::SCHEDULER_NAMES.contains(&train.lr_scheduler.as_str()) {
            bail!(
                "lr_scheduler must be one of {:?}, got {:?}",
                lr_scheduler::SCHEDULER_NAMES,
                train.lr_scheduler
            );
        }

        let save = &self.save;
        if !matches!(save.save_model_as.as_str(), "safetensors" | "pt" | "ckpt") {
            bail!("save_model_as must be safetensors, pt or ckpt, got {:?}", save.save_model_as);
        }
        if let Some(precision) = &save.save_precision {
            if !matches!(precision.as_str(), "float" | "fp16" | "bf16") {
                bail!("save_precision must be float, fp16 or bf16, got {:?}", precision);
            }
        }
        if save.save_n_epoch_ratio == Some(0) {
            bail!("save_n_epoch_ratio must be at least 1");
        }

        if self.model.v_parameterization && !self.model.v2 {
            warn!("v_parameterization is set without v2, this is unusual for SD 1.x models");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

/// Run every textual inversion process of a job file
pub fn train_from_config(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    info!("Job: {}", config.job);

    let mut ran = 0;
    for process in &config.config.process {
        let kind = process.process_type.as_deref().unwrap_or("textual_inversion");
        if !PROCESS_TYPES.contains(&kind) {
            warn!("Skipping process of type {:?}", kind);
            continue;
        }
        process.validate()?;
        let outcome = run_textual_inversion(process)?;
        info!(
            "Finished {} after {} steps: {}",
            process.concept.token_string,
            outcome.global_step,
            outcome
                .last_checkpoint
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "no checkpoint written".to_string())
        );
        ran += 1;
    }

    if ran == 0 {
        bail!("No textual inversion process in {}", config_path.display());
    }
    Ok(())
}

/// Stable per-step seed from the run seed and loop coordinates
pub fn derive_seed(seed: u64, parts: &[u64]) -> u64 {
    // splitmix64 over each part
    parts.iter().fold(seed, |acc, &part| {
        let mut z = acc ^ part.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
job: extension
config:
  name: zwx_ti
  process:
    - type: textual_inversion
      model:
        name_or_path: /models/sd15
      concept:
        token_string: zwx
        init_word: cat
      dataset:
        train_data_dir: /data/zwx
      save:
        output_dir: /out
"#;

    fn minimal() -> ProcessConfig {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.config.process.into_iter().next().unwrap()
    }

    #[test]
    fn test_defaults() {
        let process = minimal();

        assert_eq!(process.concept.num_vectors_per_token, 1);
        assert_eq!(process.dataset.resolution, 512);
        assert_eq!(process.dataset.max_token_length(), 75);
        assert_eq!(process.train.lr_scheduler, "constant");
        assert_eq!(process.train.max_train_steps, 1600);
        assert_eq!(process.train.weight_dtype(), DType::F32);
        assert_eq!(process.save.extension(), "pt");
        assert_eq!(process.save.model_name("zwx"), "zwx");
        assert_eq!(process.save.save_dtype(), None);
        process.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let yaml = MINIMAL.replace(
            "      save:\n        output_dir: /out\n",
            "      train:\n        mixed_precision: bf16\n        lr_scheduler: cosine\n      save:\n        output_dir: /out\n        save_model_as: ckpt\n        save_precision: fp16\n        output_name: mine\n",
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let process = &config.config.process[0];

        assert_eq!(process.train.weight_dtype(), DType::BF16);
        assert_eq!(process.save.extension(), "ckpt");
        assert_eq!(process.save.save_dtype(), Some(DType::F16));
        assert_eq!(process.save.model_name("zwx"), "mine");
        process.validate().unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let mut p = minimal();
        p.concept.token_string = "two words".to_string();
        assert!(p.validate().is_err());

        let mut p = minimal();
        p.concept.use_object_template = true;
        p.concept.use_style_template = true;
        assert!(p.validate().is_err());

        let mut p = minimal();
        p.dataset.resolution = 500;
        assert!(p.validate().is_err());

        let mut p = minimal();
        p.dataset.max_token_length = Some(100);
        assert!(p.validate().is_err());

        let mut p = minimal();
        p.train.lr_scheduler = "step".to_string();
        assert!(p.validate().is_err());

        let mut p = minimal();
        p.save.save_model_as = "onnx".to_string();
        assert!(p.validate().is_err());

        let mut p = minimal();
        p.dataset.cache_latents = true;
        p.dataset.random_crop = true;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_min_snr_gamma_bounds() {
        let mut p = minimal();
        p.train.min_snr_gamma = Some(-1.0);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("min_snr_gamma"));

        p.train.min_snr_gamma = Some(f64::NAN);
        assert!(p.validate().is_err());

        // 0 is accepted and means disabled
        p.train.min_snr_gamma = Some(0.0);
        p.validate().unwrap();
        p.train.min_snr_gamma = Some(5.0);
        p.validate().unwrap();
    }

    #[test]
    fn test_derive_seed() {
        assert_eq!(derive_seed(1, &[2, 3]), derive_seed(1, &[2, 3]));
        assert_ne!(derive_seed(1, &[2, 3]), derive_seed(1, &[3, 2]));
        assert_ne!(derive_seed(1, &[0]), derive_seed(2, &[0]));
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config(Path::new("/nonexistent/job.yaml")).is_err());
    }
}
