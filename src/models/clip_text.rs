//! CLIP text transformer with a trainable token embedding table
//! Direct weight loading and custom forward pass, every weight except the
//! token table is a plain tensor so no gradient is tracked for it

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var, D};
use log::{debug, info};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::path::Path;

use super::TextEncoder;

const TOKEN_EMBEDDING_KEY: &str = "text_model.embeddings.token_embedding.weight";
const POSITION_EMBEDDING_KEY: &str = "text_model.embeddings.position_embedding.weight";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipActivation {
    QuickGelu,
    Gelu,
}

#[derive(Debug, Clone)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub activation: ClipActivation,
    pub layer_norm_eps: f64,
}

impl ClipTextConfig {
    /// CLIP ViT-L/14 text tower used by SD 1.x
    pub fn v1_5() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            max_position_embeddings: 77,
            activation: ClipActivation::QuickGelu,
            layer_norm_eps: 1e-5,
        }
    }

    /// OpenCLIP ViT-H/14 text tower used by SD 2.x (penultimate layer dropped)
    pub fn v2_1() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 1024,
            intermediate_size: 4096,
            num_hidden_layers: 23,
            num_attention_heads: 16,
            max_position_embeddings: 77,
            activation: ClipActivation::Gelu,
            layer_norm_eps: 1e-5,
        }
    }
}

pub struct ClipTextEncoder {
    config: ClipTextConfig,
    token_embedding: Var,
    weights: HashMap<String, Tensor>,
    clip_skip: usize,
    device: Device,
}

impl ClipTextEncoder {
    /// Load a HF `CLIPTextModel` safetensors file. The text encoder always
    /// runs in F32, whatever the mixed precision mode.
    pub fn load(path: &Path, config: ClipTextConfig, device: &Device) -> Result<Self> {
        info!("Loading CLIP text encoder from: {}", path.display());
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to read text encoder weights: {}", path.display()))?;

        let mut weights = HashMap::with_capacity(tensors.len());
        for (key, tensor) in tensors {
            // Some exports drop the `text_model.` prefix
            let key = if key.starts_with("text_model.") {
                key
            } else {
                format!("text_model.{}", key)
            };
            weights.insert(key, tensor.to_dtype(DType::F32)?);
        }

        let encoder = Self::from_weights(config, weights, device)?;
        info!(
            "CLIP text encoder loaded: {} layers, embed dim {}, vocab {}",
            encoder.config.num_hidden_layers, encoder.config.embed_dim, encoder.config.vocab_size
        );
        Ok(encoder)
    }

    /// Build from an in-memory weight map. The token table is moved out of
    /// the map into its own `Var`.
    pub fn from_weights(
        mut config: ClipTextConfig,
        mut weights: HashMap<String, Tensor>,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let table = weights.remove(TOKEN_EMBEDDING_KEY).ok_or_else(|| {
            candle_core::Error::Msg(format!("missing text encoder weight {}", TOKEN_EMBEDDING_KEY))
        })?;
        let (vocab_size, embed_dim) = table.dims2()?;
        if embed_dim != config.embed_dim {
            candle_core::bail!(
                "token embedding width {} does not match config embed dim {}",
                embed_dim,
                config.embed_dim
            );
        }
        config.vocab_size = vocab_size;

        Ok(Self {
            config,
            token_embedding: Var::from_tensor(&table)?,
            weights,
            clip_skip: 1,
            device: device.clone(),
        })
    }

    /// Use the output of the n-th layer from the end (1 = last layer)
    pub fn with_clip_skip(mut self, clip_skip: usize) -> Self {
        self.clip_skip = clip_skip.clamp(1, self.config.num_hidden_layers);
        self
    }

    pub fn config(&self) -> &ClipTextConfig {
        &self.config
    }

    fn weight(&self, name: &str) -> candle_core::Result<&Tensor> {
        self.weights
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("missing text encoder weight {}", name)))
    }

    /// Linear: out = input @ weight.T + bias
    fn linear(&self, x: &Tensor, prefix: &str) -> candle_core::Result<Tensor> {
        let weight = self.weight(&format!("{}.weight", prefix))?;
        let bias = self.weight(&format!("{}.bias", prefix))?;
        let w = weight.t()?;

        let (b, s, d) = x.dims3()?;
        let out = x.reshape((b * s, d))?.matmul(&w)?;
        let out_d = w.dim(1)?;
        out.reshape((b, s, out_d))?.broadcast_add(bias)
    }

    fn layer_norm(&self, x: &Tensor, prefix: &str) -> candle_core::Result<Tensor> {
        let weight = self.weight(&format!("{}.weight", prefix))?;
        let bias = self.weight(&format!("{}.bias", prefix))?;

        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (variance + self.config.layer_norm_eps)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(weight)?
            .broadcast_add(bias)
    }

    fn activation(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self.config.activation {
            // x * sigmoid(1.702 * x)
            ClipActivation::QuickGelu => {
                let gate = ((x * -1.702)?.exp()? + 1.0)?.recip()?;
                x.mul(&gate)
            }
            ClipActivation::Gelu => x.gelu_erf(),
        }
    }

    fn attention(&self, x: &Tensor, mask: &Tensor, prefix: &str) -> candle_core::Result<Tensor> {
        let (b, s, d) = x.dims3()?;
        let heads = self.config.num_attention_heads;
        let head_dim = d / heads;
        let scale = (head_dim as f64).powf(-0.5);

        let q = (self.linear(x, &format!("{}.q_proj", prefix))? * scale)?;
        let k = self.linear(x, &format!("{}.k_proj", prefix))?;
        let v = self.linear(x, &format!("{}.v_proj", prefix))?;

        let split = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, s, heads, head_dim))?.transpose(1, 2)?.contiguous()
        };
        let q = split(q)?;
        let k = split(k)?;
        let v = split(v)?;

        let scores = q.matmul(&k.t()?.contiguous()?)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, d))?;

        self.linear(&out, &format!("{}.out_proj", prefix))
    }

    fn causal_mask(&self, seq_len: usize) -> candle_core::Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Tensor::from_vec(mask, (seq_len, seq_len), &self.device)
    }
}

impl TextEncoder for ClipTextEncoder {
    fn token_embedding(&self) -> &Var {
        &self.token_embedding
    }

    fn embed_dim(&self) -> usize {
        self.config.embed_dim
    }

    fn max_sequence_length(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn resize_token_embeddings(
        &mut self,
        new_num_tokens: usize,
        rng: &mut StdRng,
    ) -> candle_core::Result<()> {
        let current = self.token_embedding.as_detached_tensor();
        let (old_num_tokens, dim) = current.dims2()?;
        if new_num_tokens == old_num_tokens {
            return Ok(());
        }

        let resized = if new_num_tokens > old_num_tokens {
            let extra = new_num_tokens - old_num_tokens;
            let normal = Normal::new(0.0f32, 0.02)
                .map_err(|e| candle_core::Error::Msg(format!("invalid init distribution: {}", e)))?;
            let values: Vec<f32> = (0..extra * dim).map(|_| normal.sample(rng)).collect();
            let rows = Tensor::from_vec(values, (extra, dim), current.device())?
                .to_dtype(current.dtype())?;
            Tensor::cat(&[&current, &rows], 0)?
        } else {
            current.narrow(0, 0, new_num_tokens)?
        };

        debug!(
            "Resized token embeddings: {} -> {} rows",
            old_num_tokens, new_num_tokens
        );
        self.token_embedding = Var::from_tensor(&resized)?;
        self.config.vocab_size = new_num_tokens;
        Ok(())
    }

    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (b, s) = input_ids.dims2()?;
        if s > self.config.max_position_embeddings {
            candle_core::bail!(
                "sequence length {} exceeds {} position embeddings",
                s,
                self.config.max_position_embeddings
            );
        }

        let d = self.config.embed_dim;
        let tokens = self
            .token_embedding
            .as_tensor()
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b, s, d))?;
        let positions = self.weight(POSITION_EMBEDDING_KEY)?.narrow(0, 0, s)?;
        let mut hidden = tokens.broadcast_add(&positions)?;

        let mask = self.causal_mask(s)?;
        let num_layers = self.config.num_hidden_layers + 1 - self.clip_skip;
        for i in 0..num_layers {
            let prefix = format!("text_model.encoder.layers.{}", i);

            let residual = hidden.clone();
            let x = self.layer_norm(&hidden, &format!("{}.layer_norm1", prefix))?;
            let x = self.attention(&x, &mask, &format!("{}.self_attn", prefix))?;
            hidden = (residual + x)?;

            let residual = hidden.clone();
            let x = self.layer_norm(&hidden, &format!("{}.layer_norm2", prefix))?;
            let x = self.linear(&x, &format!("{}.mlp.fc1", prefix))?;
            let x = self.activation(&x)?;
            let x = self.linear(&x, &format!("{}.mlp.fc2", prefix))?;
            hidden = (residual + x)?;
        }

        self.layer_norm(&hidden, "text_model.final_layer_norm")
    }
}
