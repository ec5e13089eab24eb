//! DDPM forward process for training
//! Noising, velocity targets and SNR based loss weights

use anyhow::{bail, Result};
use candle_core::{Tensor, D};
use rand::rngs::StdRng;
use rand::Rng;

/// Latent scale of the SD 1.x / 2.x VAE
pub const VAE_SCALE_FACTOR: f64 = 0.18215;

pub struct DDPMScheduler {
    num_timesteps: usize,
    alphas_cumprod: Vec<f64>,
}

impl DDPMScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        beta_schedule: &str,
    ) -> Result<Self> {
        if num_timesteps < 2 {
            bail!("DDPM needs at least 2 timesteps, got {}", num_timesteps);
        }
        let betas = match beta_schedule {
            "linear" => Self::linear_beta_schedule(num_timesteps, beta_start, beta_end),
            "scaled_linear" => Self::scaled_linear_beta_schedule(num_timesteps, beta_start, beta_end),
            "squaredcos_cap_v2" => Self::cosine_beta_schedule(num_timesteps),
            other => bail!("Unknown beta schedule {:?}", other),
        };

        let alphas_cumprod = betas
            .iter()
            .scan(1.0f64, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();

        Ok(Self {
            num_timesteps,
            alphas_cumprod,
        })
    }

    /// Stable Diffusion training schedule: 1000 steps, scaled linear
    /// betas from 0.00085 to 0.012
    pub fn stable_diffusion() -> Result<Self> {
        Self::new(1000, 0.00085, 0.012, "scaled_linear")
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// One uniform timestep in `[0, T)` per example
    pub fn sample_timesteps(&self, batch_size: usize, rng: &mut StdRng) -> Vec<u32> {
        (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_timesteps) as u32)
            .collect()
    }

    /// noisy = sqrt(a_t) * x0 + sqrt(1 - a_t) * noise
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[u32]) -> Result<Tensor> {
        let (sqrt_alpha, sqrt_one_minus_alpha) = self.coefficients(original, timesteps)?;
        Ok((original.broadcast_mul(&sqrt_alpha)? + noise.broadcast_mul(&sqrt_one_minus_alpha)?)?)
    }

    /// v = sqrt(a_t) * noise - sqrt(1 - a_t) * x0
    pub fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &[u32]) -> Result<Tensor> {
        let (sqrt_alpha, sqrt_one_minus_alpha) = self.coefficients(sample, timesteps)?;
        Ok((noise.broadcast_mul(&sqrt_alpha)? - sample.broadcast_mul(&sqrt_one_minus_alpha)?)?)
    }

    /// a_t / (1 - a_t)
    pub fn snr(&self, timesteps: &[u32]) -> Result<Vec<f64>> {
        timesteps
            .iter()
            .map(|&t| {
                let a = self.alpha_cumprod(t)?;
                Ok(a / (1.0 - a))
            })
            .collect()
    }

    /// Min-SNR-gamma weights `min(snr, gamma) / snr`, shape `[B]`
    pub fn min_snr_weights(&self, timesteps: &[u32], gamma: f64, like: &Tensor) -> Result<Tensor> {
        let weights: Vec<f32> = self
            .snr(timesteps)?
            .into_iter()
            .map(|snr| (snr.min(gamma) / snr) as f32)
            .collect();
        Ok(Tensor::from_vec(weights, timesteps.len(), like.device())?.to_dtype(like.dtype())?)
    }

    fn alpha_cumprod(&self, t: u32) -> Result<f64> {
        match self.alphas_cumprod.get(t as usize) {
            Some(&a) => Ok(a),
            None => bail!("timestep {} out of range 0..{}", t, self.num_timesteps),
        }
    }

    /// Per-example `[B, 1, 1, 1]` (sqrt(a_t), sqrt(1 - a_t)) in the sample dtype
    fn coefficients(&self, like: &Tensor, timesteps: &[u32]) -> Result<(Tensor, Tensor)> {
        let batch_size = like.dim(0)?;
        if timesteps.len() != batch_size {
            bail!("got {} timesteps for a batch of {}", timesteps.len(), batch_size);
        }

        let mut sqrt_alpha = Vec::with_capacity(batch_size);
        let mut sqrt_one_minus_alpha = Vec::with_capacity(batch_size);
        for &t in timesteps {
            let a = self.alpha_cumprod(t)?;
            sqrt_alpha.push(a.sqrt() as f32);
            sqrt_one_minus_alpha.push((1.0 - a).sqrt() as f32);
        }

        let mut shape = vec![batch_size];
        shape.resize(like.rank(), 1);
        let build = |values: Vec<f32>| -> Result<Tensor> {
            Ok(Tensor::from_vec(values, shape.as_slice(), like.device())?.to_dtype(like.dtype())?)
        };
        Ok((build(sqrt_alpha)?, build(sqrt_one_minus_alpha)?))
    }

    // Beta schedule functions
    fn linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
        (0..num_timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * i as f64 / (num_timesteps as f64 - 1.0))
            .collect()
    }

    fn scaled_linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        (0..num_timesteps)
            .map(|i| {
                let t = start + (end - start) * i as f64 / (num_timesteps as f64 - 1.0);
                t * t
            })
            .collect()
    }

    fn cosine_beta_schedule(num_timesteps: usize) -> Vec<f64> {
        let s = 0.008;
        let alpha_bar = |t: f64| ((t + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2).cos().powi(2);
        (0..num_timesteps)
            .map(|i| {
                let t1 = i as f64 / num_timesteps as f64;
                let t2 = (i + 1) as f64 / num_timesteps as f64;
                (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
            })
            .collect()
    }
}

/// Mean squared error per example, reduced over every non-batch dim
pub fn per_example_mse(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = (prediction - target)?.sqr()?;
    Ok(diff.flatten_from(1)?.mean(D::Minus1)?)
}
