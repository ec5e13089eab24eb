//! Frozen Stable Diffusion UNet and VAE behind the trainer's model seams

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{vae::AutoEncoderKL, StableDiffusionConfig};
use log::info;
use std::path::Path;

use super::sd_unet::{ConditionedUNet, ConditionedUNetConfig};
use super::{DenoisingNetwork, LatentEncoder};

/// SD generations the trainer knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    V2_1,
}

impl SdVersion {
    pub fn from_flag(v2: bool) -> Self {
        if v2 {
            SdVersion::V2_1
        } else {
            SdVersion::V1_5
        }
    }

    fn config(self) -> StableDiffusionConfig {
        match self {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            SdVersion::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        }
    }

    pub fn unet_config(self) -> ConditionedUNetConfig {
        match self {
            SdVersion::V1_5 => ConditionedUNetConfig::v1_5(),
            SdVersion::V2_1 => ConditionedUNetConfig::v2_1(),
        }
    }
}

pub struct SdUnet {
    model: ConditionedUNet,
    dtype: DType,
}

impl SdUnet {
    pub fn new(vs: VarBuilder, config: ConditionedUNetConfig) -> candle_core::Result<Self> {
        let dtype = vs.dtype();
        let model = ConditionedUNet::new(vs, config)?;
        Ok(Self { model, dtype })
    }

    pub fn load(path: &Path, version: SdVersion, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading UNet ({:?}, {:?}) from: {}", version, dtype, path.display());
        let vs = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
            .with_context(|| format!("Failed to map UNet weights {}", path.display()))?;
        Self::new(vs, version.unet_config())
            .with_context(|| format!("Failed to build UNet from {}", path.display()))
    }
}

impl DenoisingNetwork for SdUnet {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &[u32],
        encoder_hidden_states: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let batch_size = noisy_latents.dim(0)?;
        if timesteps.len() != batch_size {
            candle_core::bail!(
                "got {} timesteps for a batch of {}",
                timesteps.len(),
                batch_size
            );
        }
        let timesteps: Vec<f32> = timesteps.iter().map(|&t| t as f32).collect();
        let timesteps = Tensor::from_vec(timesteps, batch_size, noisy_latents.device())?;
        self.model
            .forward(noisy_latents, &timesteps, encoder_hidden_states)
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

pub struct SdVae {
    model: AutoEncoderKL,
    dtype: DType,
}

impl SdVae {
    pub fn load(path: &Path, version: SdVersion, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading VAE ({:?}) from: {}", dtype, path.display());
        let model = version
            .config()
            .build_vae(path, device, dtype)
            .with_context(|| format!("Failed to build VAE from {}", path.display()))?;
        Ok(Self { model, dtype })
    }
}

impl LatentEncoder for SdVae {
    fn encode(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        let images = images.to_dtype(self.dtype)?;
        self.model.encode(&images)?.sample()
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frozen_weights, tiny_unet_config};
    use candle_core::Var;

    fn weighted_output(
        unet: &dyn DenoisingNetwork,
        latents: &Tensor,
        hidden: &Tensor,
        weights: &Tensor,
    ) -> candle_core::Result<Tensor> {
        (unet.forward(latents, &[250, 750], hidden)? * weights)?.sum_all()
    }

    #[test]
    fn test_hidden_state_gradient_matches_finite_differences() {
        let device = Device::Cpu;
        for linear in [false, true] {
            let unet = frozen_weights(DType::F64, |vs| SdUnet::new(vs, tiny_unet_config(linear)));
            let unet: &dyn DenoisingNetwork = &unet;
            let latents = Tensor::randn(0f64, 1f64, (2, 4, 4, 4), &device).unwrap();
            let weights = Tensor::randn(0f64, 1f64, (2, 4, 4, 4), &device).unwrap();
            let hidden = Var::randn(0f64, 1f64, (2, 3, 8), &device).unwrap();

            let grads = weighted_output(unet, &latents, hidden.as_tensor(), &weights)
                .unwrap()
                .backward()
                .unwrap();
            let analytic = grads
                .get(hidden.as_tensor())
                .expect("no gradient reached the hidden states")
                .flatten_all()
                .unwrap()
                .to_vec1::<f64>()
                .unwrap();
            assert!(analytic.iter().any(|g| g.abs() > 1e-6));

            let base = hidden.as_tensor().flatten_all().unwrap().to_vec1::<f64>().unwrap();
            let objective = |values: Vec<f64>| {
                let hidden = Tensor::from_vec(values, (2, 3, 8), &device).unwrap();
                weighted_output(unet, &latents, &hidden, &weights)
                    .unwrap()
                    .to_scalar::<f64>()
                    .unwrap()
            };
            let eps = 1e-5;
            for i in (0..base.len()).step_by(5) {
                let mut plus = base.clone();
                plus[i] += eps;
                let mut minus = base.clone();
                minus[i] -= eps;
                let numeric = (objective(plus) - objective(minus)) / (2.0 * eps);
                let tolerance = 1e-5 * (1.0 + numeric.abs().max(analytic[i].abs()));
                assert!(
                    (numeric - analytic[i]).abs() < tolerance,
                    "element {}: autograd {} vs finite difference {}",
                    i,
                    analytic[i],
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_timestep_count_must_match_batch() {
        let unet = frozen_weights(DType::F32, |vs| SdUnet::new(vs, tiny_unet_config(false)));
        let latents = Tensor::zeros((2, 4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let hidden = Tensor::zeros((2, 3, 8), DType::F32, &Device::Cpu).unwrap();
        let err = unet.forward(&latents, &[10], &hidden).unwrap_err();
        assert!(err.to_string().contains("1 timesteps for a batch of 2"));
    }

    #[test]
    fn test_unet_config_per_version() {
        assert!(!SdVersion::V1_5.unet_config().use_linear_projection);
        assert_eq!(SdVersion::V2_1.unet_config().cross_attention_dim, 1024);
    }
}
