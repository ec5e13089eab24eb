//! Textual inversion training loop
//!
//! Learns the rows of the token embedding table that belong to the concept
//! tokens. The UNet, VAE and every other text encoder weight stay frozen,
//! and the embedding guard puts back all other rows after each optimizer
//! step.
//!
//! The loop runs `Init -> (TrainEpoch -> EpochCheckpoint)* -> Finalize`.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::accelerator::{Accelerator, GradientAccumulator, LocalAccelerator, TrainingProgress};
use super::caption_templates::{CaptionTemplater, TemplateKind};
use super::checkpoint_policy::{
    load_state, EmbeddingCheckpointer, EpochAction, EpochSavePolicy, TrainingState,
};
use super::dataset::{BatchProvider, FolderDataset, FolderDatasetConfig, TrainingBatch};
use super::ddpm_scheduler::{per_example_mse, DDPMScheduler, VAE_SCALE_FACTOR};
use super::lr_scheduler::{create_scheduler, LRScheduler};
use super::optimizer::EmbeddingAdamW;
use super::{derive_seed, ProcessConfig, SaveConfig, TrainConfig};
use crate::embeddings::token_registrar::write_rows;
use crate::embeddings::{
    extract_rows, initialize_concept_embeddings, load_weights, register_concept_tokens,
    ConceptTokens, EmbeddingGuard, EmbeddingInit,
};
use crate::loaders::SdModelLoader;
use crate::models::{DenoisingNetwork, LatentEncoder, TextEncoder};

/// The networks one training run works with
pub struct ModelComponents {
    pub text_encoder: Box<dyn TextEncoder>,
    /// Not needed when every batch carries cached latents
    pub vae: Option<Box<dyn LatentEncoder>>,
    pub unet: Box<dyn DenoisingNetwork>,
}

/// Step and epoch counts derived from the dataset size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingPlan {
    pub num_batches: usize,
    pub num_update_steps_per_epoch: usize,
    pub max_train_steps: usize,
    pub num_train_epochs: usize,
    pub save_every_n_epochs: Option<usize>,
}

impl TrainingPlan {
    pub fn new(
        train: &TrainConfig,
        save: &SaveConfig,
        num_batches: usize,
        num_processes: usize,
    ) -> Result<Self> {
        if num_batches == 0 {
            bail!("dataset yields no batches");
        }
        let accum = train.gradient_accumulation_steps.max(1);
        let processes = num_processes.max(1);

        let max_train_steps = match train.max_train_epochs.filter(|&e| e > 0) {
            Some(epochs) => {
                let steps = epochs * num_batches.div_ceil(processes).div_ceil(accum);
                info!("override steps. steps for {} epochs is: {}", epochs, steps);
                steps
            }
            None => train.max_train_steps,
        };
        if max_train_steps == 0 {
            bail!("max_train_steps must be positive");
        }

        let num_update_steps_per_epoch = num_batches.div_ceil(accum);
        let num_train_epochs = max_train_steps.div_ceil(num_update_steps_per_epoch);

        let save_every_n_epochs = match save.save_n_epoch_ratio {
            Some(ratio) if ratio > 0 => {
                let every = (num_train_epochs / ratio).max(1);
                info!("save_every_n_epochs is set to {} from save_n_epoch_ratio", every);
                Some(every)
            }
            _ => save.save_every_n_epochs,
        };

        Ok(Self {
            num_batches,
            num_update_steps_per_epoch,
            max_train_steps,
            num_train_epochs,
            save_every_n_epochs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Init,
    /// 0-based epoch index
    TrainEpoch(usize),
    EpochCheckpoint { epoch: usize, stopped: bool },
    Finalize,
    Terminal,
}

/// What a finished run produced
#[derive(Debug, Clone, Default)]
pub struct TrainingOutcome {
    pub global_step: usize,
    pub epochs_completed: usize,
    pub last_checkpoint: Option<PathBuf>,
    /// Epoch files still on disk after retention
    pub epoch_checkpoints: Vec<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

pub struct TextualInversionTrainer<A: Accelerator> {
    train: TrainConfig,
    save_state: bool,
    v_parameterization: bool,
    seed: u64,
    plan: TrainingPlan,
    models: ModelComponents,
    tokens: ConceptTokens,
    token_string: String,
    guard: EmbeddingGuard,
    accelerator: A,
    progress: TrainingProgress,
    checkpointer: EmbeddingCheckpointer,
    policy: EpochSavePolicy,
    noise_scheduler: DDPMScheduler,
    optimizer: EmbeddingAdamW,
    lr_scheduler: Box<dyn LRScheduler>,
    accumulator: GradientAccumulator,
    global_step: usize,
    start_epoch: usize,
}

impl<A: Accelerator> TextualInversionTrainer<A> {
    /// The concept tokens must already be registered and initialized.
    /// The embedding snapshot is taken here.
    pub fn new(
        process: &ProcessConfig,
        seed: u64,
        plan: TrainingPlan,
        models: ModelComponents,
        tokens: ConceptTokens,
        accelerator: A,
        progress: TrainingProgress,
    ) -> Result<Self> {
        let train = process.train.clone();
        let save = &process.save;

        let guard = EmbeddingGuard::capture(models.text_encoder.token_embedding(), tokens.rows())?;
        let checkpointer = EmbeddingCheckpointer::new(
            &save.output_dir,
            save.model_name(&process.concept.token_string),
            save.extension(),
            save.save_dtype(),
        )?;
        let policy = EpochSavePolicy::new(
            plan.save_every_n_epochs,
            save.save_last_n_epochs,
            save.save_state,
            save.save_last_n_epochs_state,
            plan.num_train_epochs,
        );
        let lr_scheduler = create_scheduler(
            &train.lr_scheduler,
            train.learning_rate,
            train.lr_warmup_steps,
            plan.max_train_steps,
            Some(train.lr_scheduler_num_cycles),
            Some(train.lr_scheduler_power),
        )?;
        let accumulator = GradientAccumulator::new(train.gradient_accumulation_steps)?;
        let optimizer = EmbeddingAdamW::new(train.adamw());

        Ok(Self {
            save_state: save.save_state,
            v_parameterization: process.model.v_parameterization,
            seed,
            plan,
            models,
            tokens,
            token_string: process.concept.token_string.clone(),
            guard,
            accelerator,
            progress,
            checkpointer,
            policy,
            noise_scheduler: DDPMScheduler::stable_diffusion()?,
            optimizer,
            lr_scheduler,
            accumulator,
            global_step: 0,
            start_epoch: 0,
            train,
        })
    }

    pub fn plan(&self) -> &TrainingPlan {
        &self.plan
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn tokens(&self) -> &ConceptTokens {
        &self.tokens
    }

    pub fn guard(&self) -> &EmbeddingGuard {
        &self.guard
    }

    pub fn text_encoder(&self) -> &dyn TextEncoder {
        self.models.text_encoder.as_ref()
    }

    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    /// Continue from a state directory written by an earlier run
    pub fn resume_from(&mut self, dir: &Path) -> Result<()> {
        let table = self.models.text_encoder.token_embedding();
        let loaded = load_state(dir, table.device())?;
        let state = &loaded.state;
        if state.token_string != self.token_string
            || state.num_vectors_per_token != self.tokens.len()
        {
            bail!(
                "state {} was trained for {:?} x{}, this run trains {:?} x{}",
                dir.display(),
                state.token_string,
                state.num_vectors_per_token,
                self.token_string,
                self.tokens.len()
            );
        }
        if state.seed != self.seed {
            warn!("resuming with seed {} instead of {}", self.seed, state.seed);
        }

        let rows = loaded.embeddings.to_dtype(table.dtype())?;
        write_rows(table, self.tokens.rows(), &rows)?;
        if let Some(optimizer) = loaded.optimizer {
            self.optimizer.load_state(optimizer)?;
        }
        self.global_step = state.global_step;
        self.start_epoch = state.epoch;
        self.progress.set_step(self.global_step);

        info!(
            "resumed from {} at epoch {}, step {}",
            dir.display(),
            self.start_epoch,
            self.global_step
        );
        Ok(())
    }

    pub fn train(&mut self, data: &dyn BatchProvider) -> Result<TrainingOutcome> {
        let mut outcome = TrainingOutcome::default();
        let mut bar = StepProgress::hidden();
        let mut phase = TrainingPhase::Init;

        loop {
            debug!("phase: {:?}", phase);
            phase = match phase {
                TrainingPhase::Init => {
                    if data.num_batches() != self.plan.num_batches {
                        bail!(
                            "dataset yields {} batches but the plan was made for {}",
                            data.num_batches(),
                            self.plan.num_batches
                        );
                    }
                    self.log_start(data);
                    if self.accelerator.is_main_process() {
                        bar = StepProgress::new(self.plan.max_train_steps, self.global_step);
                    }
                    if self.start_epoch < self.plan.num_train_epochs
                        && self.global_step < self.plan.max_train_steps
                    {
                        TrainingPhase::TrainEpoch(self.start_epoch)
                    } else {
                        TrainingPhase::Finalize
                    }
                }
                TrainingPhase::TrainEpoch(epoch) => {
                    let stopped = self.train_epoch(epoch, data, &bar)?;
                    TrainingPhase::EpochCheckpoint { epoch, stopped }
                }
                TrainingPhase::EpochCheckpoint { epoch, stopped } => {
                    self.epoch_checkpoint(epoch, &mut outcome)?;
                    if stopped || epoch + 1 >= self.plan.num_train_epochs {
                        TrainingPhase::Finalize
                    } else {
                        TrainingPhase::TrainEpoch(epoch + 1)
                    }
                }
                TrainingPhase::Finalize => {
                    self.finalize(&mut outcome)?;
                    bar.finish();
                    TrainingPhase::Terminal
                }
                TrainingPhase::Terminal => break,
            };
        }

        outcome.global_step = self.global_step;
        Ok(outcome)
    }

    fn log_start(&self, data: &dyn BatchProvider) {
        info!("running training");
        info!("  num train images * repeats: {}", data.num_train_images());
        info!("  num reg images: {}", data.num_reg_images());
        info!("  num batches per epoch: {}", data.num_batches());
        info!("  num epochs: {}", self.plan.num_train_epochs);
        info!("  batch size per device: {}", data.batch_size());
        info!("  gradient accumulation steps: {}", self.accumulator.steps());
        info!("  total optimization steps: {}", self.plan.max_train_steps);
        info!("  trainable token ids: {:?}", self.tokens.ids());
    }

    /// Runs one epoch, returns true when the step budget ran out
    fn train_epoch(
        &mut self,
        epoch: usize,
        data: &dyn BatchProvider,
        bar: &StepProgress,
    ) -> Result<bool> {
        info!("epoch {}/{}", epoch + 1, self.plan.num_train_epochs);
        self.progress.set_epoch(epoch);

        let num_batches = data.num_batches();
        let process_index = self.accelerator.process_index() as u64;
        let mut loss_total = 0.0;
        let mut loss_count = 0usize;
        let mut stopped = false;

        for index in 0..num_batches {
            let batch = data
                .batch(index)
                .with_context(|| format!("Failed to load batch {} of epoch {}", index, epoch + 1))?;
            let mut rng = StdRng::seed_from_u64(derive_seed(
                self.seed,
                &[epoch as u64, index as u64, process_index],
            ));

            let loss = self.compute_loss(&batch, &mut rng)?;
            let loss_value = loss.to_scalar::<f32>()? as f64;

            let grads = (loss / self.accumulator.steps() as f64)?.backward()?;
            let table = self.models.text_encoder.token_embedding();
            let grad = match grads.get(table.as_tensor()) {
                Some(grad) => grad.to_dtype(DType::F32)?,
                None => Tensor::zeros(table.dims(), DType::F32, table.device())?,
            };
            self.accumulator.accumulate(&grad)?;

            if self.accumulator.is_sync_step(index, num_batches) {
                self.sync_step(loss_value)?;
                bar.inc();
            }

            loss_total += loss_value;
            loss_count += 1;
            bar.set_loss(loss_total / loss_count as f64);

            if self.global_step >= self.plan.max_train_steps {
                stopped = true;
                break;
            }
        }

        if loss_count > 0 {
            let avg = loss_total / loss_count as f64;
            self.accelerator.log(epoch + 1, &[("loss/epoch", avg)])?;
        }
        Ok(stopped)
    }

    /// Weighted diffusion loss of one batch, a scalar F32 tensor
    fn compute_loss(&self, batch: &TrainingBatch, rng: &mut StdRng) -> Result<Tensor> {
        let latents = match (&batch.latents, &batch.images) {
            (Some(latents), _) => latents.clone(),
            (None, Some(images)) => match &self.models.vae {
                Some(vae) => vae.encode(images)?.detach(),
                None => bail!("batch carries images but no VAE is loaded"),
            },
            (None, None) => bail!("batch carries neither images nor latents"),
        };
        let latents = (latents.to_dtype(DType::F32)? * VAE_SCALE_FACTOR)?;
        let (batch_size, channels) = (latents.dim(0)?, latents.dim(1)?);

        let mut noise = gaussian(latents.dims(), rng, latents.device())?;
        if let Some(offset) = self.train.noise_offset.filter(|&o| o != 0.0) {
            let channel_noise = gaussian(&[batch_size, channels, 1, 1], rng, latents.device())?;
            noise = noise.broadcast_add(&(channel_noise * offset)?)?;
        }

        let timesteps = self.noise_scheduler.sample_timesteps(batch_size, rng);
        let noisy_latents = self.noise_scheduler.add_noise(&latents, &noise, &timesteps)?;

        let hidden = self.encode_text(&batch.input_ids)?;
        let unet_dtype = self.models.unet.dtype();
        let prediction = self
            .models
            .unet
            .forward(
                &noisy_latents.to_dtype(unet_dtype)?,
                &timesteps,
                &hidden.to_dtype(unet_dtype)?,
            )?
            .to_dtype(DType::F32)?;

        let target = if self.v_parameterization {
            self.noise_scheduler.get_velocity(&latents, &noise, &timesteps)?
        } else {
            noise
        };

        let mut loss = per_example_mse(&prediction, &target)?;
        if let Some(gamma) = self.train.min_snr_gamma.filter(|&g| g > 0.0) {
            let weights = self.noise_scheduler.min_snr_weights(&timesteps, gamma, &loss)?;
            loss = (loss * weights)?;
        }
        let loss_weights = batch.loss_weights.to_dtype(DType::F32)?;
        let loss = (loss * loss_weights)?;
        Ok(loss.mean_all()?)
    }

    /// Text hidden states for `[B, L]` ids. Sequences longer than the
    /// encoder's window are encoded in chunks of `BOS + window-2 + EOS`
    /// and stitched back to `[B, L, D]`.
    fn encode_text(&self, input_ids: &Tensor) -> Result<Tensor> {
        let encoder = &self.models.text_encoder;
        let window = encoder.max_sequence_length();
        let (_, len) = input_ids.dims2()?;
        if len <= window {
            return Ok(encoder.forward(input_ids)?);
        }

        let inner = window - 2;
        let body = len - 2;
        if body % inner != 0 {
            bail!(
                "caption length {} does not split into chunks of {} tokens",
                body,
                inner
            );
        }
        let num_chunks = body / inner;
        let bos = input_ids.narrow(1, 0, 1)?;
        let eos = input_ids.narrow(1, len - 1, 1)?;

        let mut parts = Vec::with_capacity(num_chunks + 2);
        for chunk in 0..num_chunks {
            let ids = Tensor::cat(&[&bos, &input_ids.narrow(1, 1 + chunk * inner, inner)?, &eos], 1)?;
            let hidden = encoder.forward(&ids)?;
            if chunk == 0 {
                parts.push(hidden.narrow(1, 0, 1)?);
            }
            parts.push(hidden.narrow(1, 1, inner)?);
            if chunk + 1 == num_chunks {
                parts.push(hidden.narrow(1, window - 1, 1)?);
            }
        }
        Ok(Tensor::cat(&parts, 1)?)
    }

    fn sync_step(&mut self, loss: f64) -> Result<()> {
        let Some(grad) = self.accumulator.get_and_reset() else {
            return Ok(());
        };
        let grad = self.accelerator.reduce_gradient(&grad)?;
        let (grad, grad_norm) = clip_grad_norm(grad, self.train.max_grad_norm)?;

        let lr = self.lr_scheduler.get_lr(self.global_step);
        let table = self.models.text_encoder.token_embedding();
        self.optimizer.step(table, &grad, lr)?;
        self.guard.restore(table)?;

        self.global_step += 1;
        self.progress.set_step(self.global_step);
        debug!(
            "step {}: loss {:.6}, lr {:e}, grad norm {:.4}",
            self.global_step, loss, lr, grad_norm
        );
        self.accelerator
            .log(self.global_step, &[("loss", loss), ("lr", lr)])?;
        Ok(())
    }

    fn epoch_checkpoint(&mut self, epoch: usize, outcome: &mut TrainingOutcome) -> Result<()> {
        self.accelerator.wait_for_everyone()?;
        let epoch_no = epoch + 1;
        outcome.epochs_completed = epoch_no;

        let EpochAction::Save {
            evict,
            evict_state,
            save_state,
        } = self.policy.decide(epoch_no)
        else {
            return Ok(());
        };
        if !self.accelerator.is_main_process() {
            return Ok(());
        }

        let rows = extract_rows(self.models.text_encoder.token_embedding(), &self.tokens)?;
        let path = self.checkpointer.persist(Some(epoch_no), &rows)?;
        info!("saving checkpoint: {}", path.display());
        outcome.epoch_checkpoints.push(path);

        if let Some(old) = evict {
            self.checkpointer.evict(old)?;
            let old_path = self.checkpointer.embedding_path(Some(old));
            outcome.epoch_checkpoints.retain(|p| *p != old_path);
        }
        if save_state {
            let state = self.training_state(epoch_no);
            self.checkpointer.save_state(
                Some(epoch_no),
                &state,
                &rows,
                self.optimizer.get_state().as_ref(),
            )?;
        }
        if let Some(old) = evict_state {
            self.checkpointer.evict_state(old)?;
        }
        Ok(())
    }

    fn finalize(&mut self, outcome: &mut TrainingOutcome) -> Result<()> {
        self.accelerator.wait_for_everyone()?;

        if self.accelerator.is_main_process() {
            let drift = self.guard.frozen_drift(self.models.text_encoder.token_embedding())?;
            if drift != 0.0 {
                bail!("frozen embedding rows drifted by {}", drift);
            }

            let rows = extract_rows(self.models.text_encoder.token_embedding(), &self.tokens)?;
            let path = self.checkpointer.persist(None, &rows)?;
            info!("model saved: {}", path.display());
            outcome.last_checkpoint = Some(path);

            if self.save_state {
                let state = self.training_state(outcome.epochs_completed.max(self.start_epoch));
                let dir = self.checkpointer.save_state(
                    None,
                    &state,
                    &rows,
                    self.optimizer.get_state().as_ref(),
                )?;
                outcome.state_dir = Some(dir);
            }
        }

        self.accelerator.end_training()?;
        Ok(())
    }

    fn training_state(&self, epoch: usize) -> TrainingState {
        TrainingState {
            epoch,
            global_step: self.global_step,
            optimizer_step: self.optimizer.get_step(),
            seed: self.seed,
            token_string: self.token_string.clone(),
            num_vectors_per_token: self.tokens.len(),
        }
    }
}

/// Scale `grad` so its L2 norm is at most `max_norm`. Returns the norm
/// measured before clipping. A `max_norm` of 0 disables clipping.
fn clip_grad_norm(grad: Tensor, max_norm: f64) -> Result<(Tensor, f64)> {
    let norm = grad
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()? as f64;
    if max_norm > 0.0 {
        let coef = max_norm / (norm + 1e-6);
        if coef < 1.0 {
            return Ok(((grad * coef)?, norm));
        }
    }
    Ok((grad, norm))
}

/// Standard normal F32 tensor drawn from `rng`
fn gaussian(shape: &[usize], rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

#[cfg(feature = "progress-bar")]
struct StepProgress {
    bar: Option<indicatif::ProgressBar>,
}

#[cfg(feature = "progress-bar")]
impl StepProgress {
    fn new(total: usize, position: usize) -> Self {
        use indicatif::{ProgressBar, ProgressStyle};

        let bar = ProgressBar::new(total as u64);
        match ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            Ok(style) => bar.set_style(style.progress_chars("=>-")),
            Err(e) => debug!("progress bar template rejected: {}", e),
        }
        bar.set_position(position as u64);
        bar.set_message("steps");
        Self { bar: Some(bar) }
    }

    fn hidden() -> Self {
        Self { bar: None }
    }

    fn inc(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn set_loss(&self, avg_loss: f64) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("loss {:.4}", avg_loss));
        }
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

#[cfg(not(feature = "progress-bar"))]
struct StepProgress;

#[cfg(not(feature = "progress-bar"))]
impl StepProgress {
    fn new(_total: usize, _position: usize) -> Self {
        StepProgress
    }

    fn hidden() -> Self {
        StepProgress
    }

    fn inc(&self) {}

    fn set_loss(&self, _avg_loss: f64) {}

    fn finish(&self) {}
}

/// `cpu`, `cuda` or `cuda:<ordinal>`. CUDA falls back to the CPU when it
/// is not available.
pub fn select_device(name: Option<&str>) -> Result<Device> {
    let device = match name.unwrap_or("cuda:0") {
        "cpu" => Device::Cpu,
        "cuda" => Device::cuda_if_available(0)?,
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(ordinal)) => Device::cuda_if_available(ordinal)?,
            _ => bail!("unknown device {:?}, expected cpu or cuda:<n>", other),
        },
    };
    Ok(device)
}

/// Loads the models, registers the concept, builds the dataset and runs
/// the whole training job described by `process`
pub fn run_textual_inversion(process: &ProcessConfig) -> Result<TrainingOutcome> {
    let device = select_device(process.device.as_deref())?;
    info!("Using device: {:?}", device);

    let seed = process.train.seed.unwrap_or_else(rand::random);
    info!("seed: {}", seed);
    let mut rng = StdRng::seed_from_u64(seed);

    let concept = &process.concept;
    let num_vectors = concept.num_vectors_per_token;
    let loader = SdModelLoader::new(&process.model, device.clone())?;

    let mut tokenizer = loader.tokenizer()?;
    let mut text_encoder = loader.text_encoder()?;

    let mut init = EmbeddingInit::from_init_word(&tokenizer, concept.init_word.as_deref(), num_vectors)?;
    if let Some(weights) = &concept.weights {
        init = init.with_weights(load_weights(Path::new(weights))?);
    }

    let tokens = register_concept_tokens(
        &mut tokenizer,
        &mut text_encoder,
        &concept.token_string,
        num_vectors,
        &mut rng,
    )?;
    initialize_concept_embeddings(&text_encoder, &tokens, &init)?;

    let templater = CaptionTemplater::new(
        &tokens,
        TemplateKind::from_flags(concept.use_object_template, concept.use_style_template),
    );
    if let Some((from, to)) = templater.prompt_replacement() {
        info!("prompts should use {:?} in place of {:?}", to, from);
    }

    let progress = TrainingProgress::new();
    let dataset_config = &process.dataset;
    let mut dataset = FolderDataset::new(
        FolderDatasetConfig {
            train_data_dir: PathBuf::from(&dataset_config.train_data_dir),
            reg_data_dir: dataset_config.reg_data_dir.as_ref().map(PathBuf::from),
            caption_extension: dataset_config.caption_extension.clone(),
            resolution: dataset_config.resolution,
            batch_size: dataset_config.batch_size,
            random_crop: dataset_config.random_crop,
            prior_loss_weight: dataset_config.prior_loss_weight,
            max_data_loader_n_workers: dataset_config.max_data_loader_n_workers,
            max_token_length: dataset_config.max_token_length(),
            seed,
        },
        Arc::new(tokenizer),
        templater,
        progress.clone(),
        device.clone(),
    )?;

    let weight_dtype = process.train.weight_dtype();
    let vae = loader.vae(weight_dtype)?;
    let vae: Option<Box<dyn LatentEncoder>> = if dataset_config.cache_latents {
        dataset.cache_latents(&vae, dataset_config.vae_batch_size)?;
        None
    } else {
        Some(Box::new(vae))
    };
    let unet = loader.unet(weight_dtype)?;

    let accelerator = match &process.logging.logging_dir {
        Some(dir) => LocalAccelerator::with_logging_dir(Path::new(dir), process.logging.log_prefix.as_deref())?,
        None => LocalAccelerator::new(),
    };
    let plan = TrainingPlan::new(
        &process.train,
        &process.save,
        dataset.num_batches(),
        accelerator.num_processes(),
    )?;

    let models = ModelComponents {
        text_encoder: Box::new(text_encoder),
        vae,
        unet: Box::new(unet),
    };
    let mut trainer =
        TextualInversionTrainer::new(process, seed, plan, models, tokens, accelerator, progress)?;
    if let Some(resume) = &process.save.resume {
        trainer.resume_from(Path::new(resume))?;
    }

    trainer.train(&dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::load_weights;
    use crate::models::ConceptTokenizer;
    use crate::test_support::{latent_batches, tiny_clip, tiny_tokenizer, TinyDenoiser, TINY_VOCAB};
    use crate::trainers::Config;
    use tempfile::tempdir;

    fn process_config(output_dir: &Path, max_train_steps: usize) -> ProcessConfig {
        let yaml = format!(
            r#"
job: extension
config:
  name: test
  process:
    - type: textual_inversion
      device: cpu
      model:
        name_or_path: unused
      concept:
        token_string: zwx
        init_word: cat
      dataset:
        train_data_dir: unused
      train:
        learning_rate: 0.01
        max_train_steps: {}
        seed: 7
      save:
        output_dir: {}
"#,
            max_train_steps,
            output_dir.display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        config.config.process.into_iter().next().unwrap()
    }

    struct Run {
        trainer: TextualInversionTrainer<LocalAccelerator>,
        data: crate::trainers::dataset::InMemoryBatches,
        snapshot: Tensor,
        initial_rows: Tensor,
    }

    fn setup(process: &ProcessConfig, num_batches: usize) -> Run {
        let mut rng = StdRng::seed_from_u64(process.train.seed.unwrap());
        let mut tokenizer = tiny_tokenizer();
        let mut encoder = tiny_clip(TINY_VOCAB, &mut rng);

        let init = EmbeddingInit::from_init_word(&tokenizer, Some("cat"), 1).unwrap();
        let tokens = register_concept_tokens(&mut tokenizer, &mut encoder, "zwx", 1, &mut rng).unwrap();
        initialize_concept_embeddings(&encoder, &tokens, &init).unwrap();
        let snapshot = encoder.token_embedding().as_detached_tensor().copy().unwrap();
        let initial_rows = extract_rows(encoder.token_embedding(), &tokens).unwrap();

        let ids = tokenizer.encode_padded("a photo of zwx", 8).unwrap();
        let data = latent_batches(&ids, num_batches, &mut rng);
        let plan = TrainingPlan::new(&process.train, &process.save, num_batches, 1).unwrap();
        let models = ModelComponents {
            text_encoder: Box::new(encoder),
            vae: None,
            unet: Box::new(TinyDenoiser::new(8, 4, &mut rng)),
        };
        let trainer = TextualInversionTrainer::new(
            process,
            7,
            plan,
            models,
            tokens,
            LocalAccelerator::new(),
            TrainingProgress::new(),
        )
        .unwrap();

        Run {
            trainer,
            data,
            snapshot,
            initial_rows,
        }
    }

    #[test]
    fn test_only_concept_row_changes() {
        let dir = tempdir().unwrap();
        let process = process_config(dir.path(), 2);
        let mut run = setup(&process, 1);

        let outcome = run.trainer.train(&run.data).unwrap();
        assert_eq!(outcome.global_step, 2);

        let base_id = run.trainer.tokens().base_id() as usize;
        let live = run.trainer.text_encoder().token_embedding().as_detached_tensor();
        let live = live.to_vec2::<f32>().unwrap();
        let snapshot = run.snapshot.to_vec2::<f32>().unwrap();
        for (row, (a, b)) in live.iter().zip(snapshot.iter()).enumerate() {
            if row == base_id {
                assert_ne!(a, b, "concept row did not train");
            } else {
                assert_eq!(a, b, "row {} changed", row);
            }
        }

        let saved = load_weights(outcome.last_checkpoint.as_ref().unwrap()).unwrap();
        assert_eq!(saved.dims(), &[1, 8]);
        assert_ne!(
            saved.to_vec2::<f32>().unwrap(),
            run.initial_rows.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_same_seed_gives_identical_checkpoints() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();

        let mut paths = Vec::new();
        for dir in [&first, &second] {
            let process = process_config(dir.path(), 2);
            let mut run = setup(&process, 1);
            let outcome = run.trainer.train(&run.data).unwrap();
            paths.push(outcome.last_checkpoint.unwrap());
        }

        let a = std::fs::read(&paths[0]).unwrap();
        let b = std::fs::read(&paths[1]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_early_stop_after_max_steps() {
        let dir = tempdir().unwrap();
        let mut process = process_config(dir.path(), 3);
        process.save.save_every_n_epochs = Some(2);
        let mut run = setup(&process, 10);

        assert_eq!(run.trainer.plan().num_train_epochs, 1);
        let outcome = run.trainer.train(&run.data).unwrap();

        assert_eq!(outcome.global_step, 3);
        assert_eq!(outcome.epochs_completed, 1);
        assert!(outcome.epoch_checkpoints.is_empty());
        assert_eq!(outcome.last_checkpoint, Some(dir.path().join("zwx.pt")));

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_epoch_checkpoints_and_state() {
        let dir = tempdir().unwrap();
        let mut process = process_config(dir.path(), 6);
        process.save.save_every_n_epochs = Some(1);
        process.save.save_last_n_epochs = Some(1);
        process.save.save_state = true;
        process.save.save_model_as = "ckpt".to_string();
        let mut run = setup(&process, 2);

        let outcome = run.trainer.train(&run.data).unwrap();

        assert_eq!(outcome.epochs_completed, 3);
        assert_eq!(outcome.epoch_checkpoints, vec![dir.path().join("zwx-000002.ckpt")]);
        assert!(!dir.path().join("zwx-000001.ckpt").exists());
        assert_eq!(outcome.last_checkpoint, Some(dir.path().join("zwx.ckpt")));
        assert_eq!(load_weights(&dir.path().join("zwx.ckpt")).unwrap().dims(), &[1, 8]);
        assert!(dir.path().join("zwx-000002-state").is_dir());

        let state = load_state(&outcome.state_dir.unwrap(), &Device::Cpu).unwrap();
        assert_eq!(state.state.global_step, 6);
        assert_eq!(state.state.epoch, 3);
        assert!(state.optimizer.is_some());
    }

    #[test]
    fn test_gradient_accumulation_syncs_every_other_batch() {
        let dir = tempdir().unwrap();
        let mut process = process_config(dir.path(), 2);
        process.train.gradient_accumulation_steps = 2;
        let mut run = setup(&process, 4);
        assert_eq!(run.trainer.plan().num_update_steps_per_epoch, 2);
        assert_eq!(run.trainer.plan().num_train_epochs, 1);

        let outcome = run.trainer.train(&run.data).unwrap();
        assert_eq!(outcome.global_step, 2);
        assert_eq!(outcome.epochs_completed, 1);

        let table = run.trainer.text_encoder().token_embedding();
        assert_eq!(run.trainer.guard().frozen_drift(table).unwrap(), 0.0);
        let rows = extract_rows(table, run.trainer.tokens()).unwrap();
        assert_ne!(
            rows.to_vec2::<f32>().unwrap(),
            run.initial_rows.to_vec2::<f32>().unwrap()
        );
    }

    /// Loss of the first batch under a fixed noise/timestep seed
    fn first_batch_loss(adjust: impl Fn(&mut ProcessConfig)) -> f32 {
        let dir = tempdir().unwrap();
        let mut process = process_config(dir.path(), 1);
        adjust(&mut process);
        let run = setup(&process, 1);
        let batch = run.data.batch(0).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        run.trainer
            .compute_loss(&batch, &mut rng)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_v_parameterization_changes_target() {
        let epsilon = first_batch_loss(|_| {});
        let velocity = first_batch_loss(|p| p.model.v_parameterization = true);
        assert!(epsilon.is_finite() && velocity.is_finite());
        assert_ne!(epsilon, velocity);
    }

    #[test]
    fn test_noise_offset_changes_noise() {
        let plain = first_batch_loss(|_| {});
        assert_eq!(first_batch_loss(|p| p.train.noise_offset = Some(0.0)), plain);
        assert_ne!(first_batch_loss(|p| p.train.noise_offset = Some(0.1)), plain);
    }

    #[test]
    fn test_min_snr_gamma_weighting() {
        let plain = first_batch_loss(|_| {});
        assert!(plain > 0.0);

        // 0 disables the weighting
        assert_eq!(first_batch_loss(|p| p.train.min_snr_gamma = Some(0.0)), plain);

        // min(snr, gamma) / snr < 1 for every timestep once gamma is tiny
        let weighted = first_batch_loss(|p| p.train.min_snr_gamma = Some(1e-6));
        assert!(weighted > 0.0);
        assert!(weighted < plain);
    }

    #[test]
    fn test_resume_continues_from_state() {
        let dir = tempdir().unwrap();
        let mut process = process_config(dir.path(), 2);
        process.save.save_state = true;
        let mut run = setup(&process, 1);
        let first = run.trainer.train(&run.data).unwrap();
        let state_dir = first.state_dir.unwrap();

        let resumed_dir = tempdir().unwrap();
        let mut process = process_config(resumed_dir.path(), 4);
        process.save.resume = Some(state_dir.display().to_string());
        let mut run = setup(&process, 1);
        run.trainer.resume_from(&state_dir).unwrap();
        assert_eq!(run.trainer.global_step(), 2);

        let outcome = run.trainer.train(&run.data).unwrap();
        assert_eq!(outcome.global_step, 4);
    }

    #[test]
    fn test_resume_rejects_other_concept() {
        let dir = tempdir().unwrap();
        let mut process = process_config(dir.path(), 1);
        process.save.save_state = true;
        let mut run = setup(&process, 1);
        let state_dir = run.trainer.train(&run.data).unwrap().state_dir.unwrap();

        let mut process = process_config(dir.path(), 1);
        process.concept.token_string = "other".to_string();
        let mut run = setup(&process, 1);
        assert!(run.trainer.resume_from(&state_dir).is_err());
    }

    #[test]
    fn test_long_captions_are_chunked() {
        let dir = tempdir().unwrap();
        let process = process_config(dir.path(), 1);
        let run = setup(&process, 1);

        // window of 8 positions: BOS + 2 x 6 tokens + EOS
        let tokenizer = tiny_tokenizer();
        let ids = tokenizer.encode_padded("a photo of the cat in the style of a painting", 14).unwrap();
        let ids = Tensor::from_vec(ids, (1, 14), &Device::Cpu).unwrap();
        let hidden = run.trainer.encode_text(&ids).unwrap();
        assert_eq!(hidden.dims(), &[1, 14, 8]);

        let bad = Tensor::zeros((1, 11), DType::U32, &Device::Cpu).unwrap();
        assert!(run.trainer.encode_text(&bad).is_err());
    }

    #[test]
    fn test_plan_math() {
        let mut train = TrainConfig::default();
        let mut save = SaveConfig::default();
        train.max_train_steps = 25;
        train.gradient_accumulation_steps = 2;

        let plan = TrainingPlan::new(&train, &save, 10, 1).unwrap();
        assert_eq!(plan.num_update_steps_per_epoch, 5);
        assert_eq!(plan.num_train_epochs, 5);

        train.max_train_epochs = Some(3);
        save.save_n_epoch_ratio = Some(2);
        let plan = TrainingPlan::new(&train, &save, 10, 1).unwrap();
        assert_eq!(plan.max_train_steps, 15);
        assert_eq!(plan.num_train_epochs, 3);
        assert_eq!(plan.save_every_n_epochs, Some(1));

        assert!(TrainingPlan::new(&train, &save, 0, 1).is_err());
    }

    #[test]
    fn test_clip_grad_norm() {
        let grad = Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();

        let (clipped, norm) = clip_grad_norm(grad.clone(), 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let values = clipped.to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.6).abs() < 1e-5 && (values[1] - 0.8).abs() < 1e-5);

        let (unclipped, _) = clip_grad_norm(grad, 0.0).unwrap();
        assert_eq!(unclipped.to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_select_device() {
        assert!(matches!(select_device(Some("cpu")).unwrap(), Device::Cpu));
        assert!(select_device(Some("tpu")).is_err());
    }
}
