//! DreamBooth-style folder dataset
//!
//! `train_data_dir` holds one subdirectory per concept named `<repeats>_<class>`.
//! Each image may have a sidecar caption file, otherwise the class part of
//! the directory name is the caption. Regularization images live in the same
//! layout under `reg_data_dir` and are cycled to match the training count.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::accelerator::TrainingProgress;
use super::caption_templates::CaptionTemplater;
use super::derive_seed;
use crate::models::{ConceptTokenizer, LatentEncoder};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

/// One step's worth of examples
pub struct TrainingBatch {
    /// `[B, 3, H, W]` in [-1, 1], absent when latents are cached
    pub images: Option<Tensor>,
    /// `[B, 4, H/8, W/8]` unscaled VAE latents
    pub latents: Option<Tensor>,
    /// `[B, L]` u32 caption ids
    pub input_ids: Tensor,
    /// `[B]` f32 per-example loss weights
    pub loss_weights: Tensor,
}

/// What the training loop needs from a data pipeline
pub trait BatchProvider {
    fn num_batches(&self) -> usize;

    fn batch_size(&self) -> usize;

    fn num_train_images(&self) -> usize;

    fn num_reg_images(&self) -> usize;

    fn is_latent_cacheable(&self) -> bool;

    fn cache_latents(&mut self, vae: &dyn LatentEncoder, vae_batch_size: usize) -> Result<()>;

    /// Batch `index` of the epoch currently published in the shared progress
    fn batch(&self, index: usize) -> Result<TrainingBatch>;
}

#[derive(Debug, Clone)]
pub struct FolderDatasetConfig {
    pub train_data_dir: PathBuf,
    pub reg_data_dir: Option<PathBuf>,
    pub caption_extension: String,
    pub resolution: usize,
    pub batch_size: usize,
    pub random_crop: bool,
    pub prior_loss_weight: f32,
    pub max_data_loader_n_workers: usize,
    /// Caption tokens without BOS/EOS
    pub max_token_length: usize,
    pub seed: u64,
}

#[derive(Debug, Clone)]
struct ImageRecord {
    path: PathBuf,
    caption: String,
}

#[derive(Debug, Clone, Copy)]
struct Example {
    image: usize,
    loss_weight: f32,
}

pub struct FolderDataset {
    config: FolderDatasetConfig,
    images: Vec<ImageRecord>,
    examples: Vec<Example>,
    num_train_images: usize,
    num_reg_images: usize,
    tokenizer: Arc<dyn ConceptTokenizer>,
    templater: CaptionTemplater,
    progress: TrainingProgress,
    latent_cache: Option<Vec<Tensor>>,
    pool: rayon::ThreadPool,
    device: Device,
}

impl FolderDataset {
    pub fn new(
        config: FolderDatasetConfig,
        tokenizer: Arc<dyn ConceptTokenizer>,
        templater: CaptionTemplater,
        progress: TrainingProgress,
        device: Device,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if config.resolution == 0 || config.resolution % 8 != 0 {
            bail!("resolution must be a positive multiple of 8, got {}", config.resolution);
        }

        let mut images = Vec::new();
        let mut examples = Vec::new();

        let train = scan_concept_dirs(&config.train_data_dir, &config.caption_extension)?;
        for (record, repeats) in train {
            let image = images.len();
            images.push(record);
            examples.extend(std::iter::repeat(Example { image, loss_weight: 1.0 }).take(repeats));
        }
        let num_train_images = examples.len();
        if num_train_images == 0 {
            bail!("No training images found in {}", config.train_data_dir.display());
        }

        let mut num_reg_images = 0;
        if let Some(reg_dir) = &config.reg_data_dir {
            let mut reg = Vec::new();
            for (record, repeats) in scan_concept_dirs(reg_dir, &config.caption_extension)? {
                let image = images.len();
                images.push(record);
                reg.extend(std::iter::repeat(image).take(repeats));
            }
            if reg.is_empty() {
                warn!("No regularization images found in {}", reg_dir.display());
            } else {
                if reg.len() < num_train_images {
                    warn!(
                        "{} regularization images for {} training images, regularization images are repeated",
                        reg.len(),
                        num_train_images
                    );
                }
                // cycle or truncate to the training count
                let reg_examples: Vec<Example> = reg
                    .iter()
                    .cycle()
                    .take(num_train_images)
                    .map(|&image| Example {
                        image,
                        loss_weight: config.prior_loss_weight,
                    })
                    .collect();
                num_reg_images = reg_examples.len();
                examples.extend(reg_examples);
            }
        }

        let workers = config
            .max_data_loader_n_workers
            .min(num_cpus::get().saturating_sub(1))
            .max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("data-loader-{}", i))
            .build()
            .context("Failed to build data loader thread pool")?;

        info!(
            "Dataset loaded: {} train images, {} reg images, {} batches of {} ({} workers)",
            num_train_images,
            num_reg_images,
            (examples.len() + config.batch_size - 1) / config.batch_size,
            config.batch_size,
            workers
        );

        Ok(Self {
            config,
            images,
            examples,
            num_train_images,
            num_reg_images,
            tokenizer,
            templater,
            progress,
            latent_cache: None,
            pool,
            device,
        })
    }

    /// Example order for an epoch, reshuffled every epoch from the seed
    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, &[epoch as u64]));
        order.shuffle(&mut rng);
        order
    }

    fn load_image(&self, path: &Path, rng_seed: u64) -> Result<Tensor> {
        let img = image::open(path)
            .with_context(|| format!("Failed to open image: {}", path.display()))?
            .to_rgb8();
        let size = self.config.resolution as u32;
        let (width, height) = img.dimensions();

        // Scale the short side to the target, then crop the long side
        let scale = size as f32 / width.min(height) as f32;
        let new_width = ((width as f32 * scale).round() as u32).max(size);
        let new_height = ((height as f32 * scale).round() as u32).max(size);
        let resized = image::imageops::resize(&img, new_width, new_height, FilterType::Lanczos3);

        let (crop_x, crop_y) = if self.config.random_crop {
            let mut rng = StdRng::seed_from_u64(rng_seed);
            (
                rng.gen_range(0..=new_width - size),
                rng.gen_range(0..=new_height - size),
            )
        } else {
            ((new_width - size) / 2, (new_height - size) / 2)
        };
        let cropped = image::imageops::crop_imm(&resized, crop_x, crop_y, size, size).to_image();

        let data = cropped.into_raw();
        let s = size as usize;
        let tensor = Tensor::from_vec(data, (s, s, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        Ok(((tensor / 127.5)? - 1.0)?)
    }

    fn load_images(&self, images: &[usize], seeds: &[u64]) -> Result<Tensor> {
        let tensors = self.pool.install(|| {
            images
                .par_iter()
                .zip(seeds.par_iter())
                .map(|(&image, &seed)| self.load_image(&self.images[image].path, seed))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(Tensor::stack(&tensors, 0)?.to_device(&self.device)?)
    }
}

impl BatchProvider for FolderDataset {
    fn num_batches(&self) -> usize {
        (self.examples.len() + self.config.batch_size - 1) / self.config.batch_size
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn num_train_images(&self) -> usize {
        self.num_train_images
    }

    fn num_reg_images(&self) -> usize {
        self.num_reg_images
    }

    fn is_latent_cacheable(&self) -> bool {
        !self.config.random_crop
    }

    fn cache_latents(&mut self, vae: &dyn LatentEncoder, vae_batch_size: usize) -> Result<()> {
        if !self.is_latent_cacheable() {
            bail!("latents cannot be cached when random_crop is enabled");
        }
        let indices: Vec<usize> = (0..self.images.len()).collect();
        let seeds = vec![0u64; indices.len()];
        let mut cache = Vec::with_capacity(indices.len());

        info!("Caching latents for {} images", indices.len());
        for (chunk, chunk_seeds) in indices
            .chunks(vae_batch_size.max(1))
            .zip(seeds.chunks(vae_batch_size.max(1)))
        {
            let images = self.load_images(chunk, chunk_seeds)?;
            let latents = vae.encode(&images)?.detach();
            for i in 0..chunk.len() {
                cache.push(latents.get(i)?);
            }
        }
        self.latent_cache = Some(cache);
        Ok(())
    }

    fn batch(&self, index: usize) -> Result<TrainingBatch> {
        let num_batches = self.num_batches();
        if index >= num_batches {
            bail!("batch {} out of range, epoch has {} batches", index, num_batches);
        }
        let epoch = self.progress.epoch();
        let step = self.progress.step();
        let order = self.epoch_order(epoch);
        let start = index * self.config.batch_size;
        let end = (start + self.config.batch_size).min(order.len());
        let examples: Vec<Example> = order[start..end].iter().map(|&i| self.examples[i]).collect();

        let max_length = self.config.max_token_length + 2;
        let mut ids = Vec::with_capacity(examples.len() * max_length);
        for (slot, example) in examples.iter().enumerate() {
            let mut rng = StdRng::seed_from_u64(derive_seed(
                self.config.seed,
                &[step as u64, index as u64, slot as u64],
            ));
            let caption = self.templater.apply(&self.images[example.image].caption, &mut rng);
            ids.extend(self.tokenizer.encode_padded(&caption, max_length)?);
        }
        let input_ids = Tensor::from_vec(ids, (examples.len(), max_length), &self.device)?;

        let weights: Vec<f32> = examples.iter().map(|e| e.loss_weight).collect();
        let loss_weights = Tensor::from_vec(weights, examples.len(), &self.device)?;

        let image_indices: Vec<usize> = examples.iter().map(|e| e.image).collect();
        let (images, latents) = match &self.latent_cache {
            Some(cache) => {
                let latents: Vec<&Tensor> = image_indices.iter().map(|&i| &cache[i]).collect();
                (None, Some(Tensor::stack(&latents, 0)?))
            }
            None => {
                let seeds: Vec<u64> = (0..image_indices.len())
                    .map(|slot| {
                        derive_seed(self.config.seed, &[epoch as u64, index as u64, slot as u64, 1])
                    })
                    .collect();
                (Some(self.load_images(&image_indices, &seeds)?), None)
            }
        };

        Ok(TrainingBatch {
            images,
            latents,
            input_ids,
            loss_weights,
        })
    }
}

/// `N_name` subdirectories of `root` with their images and repeat counts
fn scan_concept_dirs(root: &Path, caption_extension: &str) -> Result<Vec<(ImageRecord, usize)>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to read dataset directory: {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut records = Vec::new();
    for dir in dirs {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some((repeats, class_tokens)) = parse_concept_dir(&name) else {
            warn!(
                "ignore directory without repeats, expected <repeats>_<class>: {}",
                dir.display()
            );
            continue;
        };

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read concept directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        paths.sort();
        info!("{} images with {} repeats in {}", paths.len(), repeats, dir.display());

        for path in paths {
            let caption = read_caption(&path, caption_extension)?.unwrap_or_else(|| class_tokens.clone());
            records.push((ImageRecord { path, caption }, repeats));
        }
    }
    Ok(records)
}

fn parse_concept_dir(name: &str) -> Option<(usize, String)> {
    let (repeats, class_tokens) = name.split_once('_')?;
    let repeats = repeats.parse::<usize>().ok()?;
    (repeats > 0).then(|| (repeats, class_tokens.to_string()))
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false)
}

fn read_caption(image_path: &Path, caption_extension: &str) -> Result<Option<String>> {
    let stem = image_path
        .file_stem()
        .ok_or_else(|| anyhow!("image without file name: {}", image_path.display()))?;
    let mut name = stem.to_os_string();
    name.push(caption_extension);
    let caption_path = image_path.with_file_name(name);
    if !caption_path.is_file() {
        return Ok(None);
    }
    let caption = fs::read_to_string(&caption_path)
        .with_context(|| format!("Failed to read caption: {}", caption_path.display()))?;
    let caption = caption.lines().next().unwrap_or("").trim().to_string();
    Ok(Some(caption))
}

/// Batches held in memory, used for pre-encoded latents
pub struct InMemoryBatches {
    batches: Vec<TrainingBatch>,
    batch_size: usize,
}

impl InMemoryBatches {
    pub fn new(batches: Vec<TrainingBatch>) -> Result<Self> {
        let batch_size = match batches.first() {
            Some(b) => b.input_ids.dim(0)?,
            None => bail!("no batches"),
        };
        Ok(Self { batches, batch_size })
    }
}

impl BatchProvider for InMemoryBatches {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn num_train_images(&self) -> usize {
        self.batches.len() * self.batch_size
    }

    fn num_reg_images(&self) -> usize {
        0
    }

    fn is_latent_cacheable(&self) -> bool {
        true
    }

    fn cache_latents(&mut self, vae: &dyn LatentEncoder, _vae_batch_size: usize) -> Result<()> {
        for batch in &mut self.batches {
            if let Some(images) = batch.images.take() {
                batch.latents = Some(vae.encode(&images)?.detach());
            }
        }
        Ok(())
    }

    fn batch(&self, index: usize) -> Result<TrainingBatch> {
        let batch = self
            .batches
            .get(index)
            .ok_or_else(|| anyhow!("batch {} out of range", index))?;
        Ok(TrainingBatch {
            images: batch.images.clone(),
            latents: batch.latents.clone(),
            input_ids: batch.input_ids.clone(),
            loss_weights: batch.loss_weights.clone(),
        })
    }
}
