//! Small in-memory models and tokenizer for unit tests

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use tokenizers::Tokenizer;

use crate::loaders::ClipTokenizer;
use crate::models::sd_unet::{ConditionedUNetConfig, UNetBlockConfig};
use crate::models::{ClipActivation, ClipTextConfig, ClipTextEncoder, DenoisingNetwork};
use crate::trainers::dataset::{InMemoryBatches, TrainingBatch};

pub const TINY_VOCAB: usize = 12;

const TINY_WORDS: [&str; TINY_VOCAB] = [
    "<|startoftext|>",
    "<|endoftext|>",
    "a",
    "photo",
    "of",
    "cat",
    "dog",
    "toy",
    "in",
    "the",
    "style",
    "painting",
];

/// Whitespace word-level tokenizer over `TINY_WORDS`
pub fn tiny_tokenizer() -> ClipTokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = TINY_WORDS
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), serde_json::json!(id)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<|endoftext|>"
        }
    });
    let tokenizer = Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap();
    ClipTokenizer::from_tokenizer(tokenizer, None).unwrap()
}

fn random(shape: &[usize], std: f32, rng: &mut StdRng) -> Tensor {
    let normal = Normal::new(0.0f32, std).unwrap();
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| normal.sample(rng)).collect();
    Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
}

/// One layer, width 8, two heads, eight positions
pub fn tiny_clip(vocab_size: usize, rng: &mut StdRng) -> ClipTextEncoder {
    let config = ClipTextConfig {
        vocab_size,
        embed_dim: 8,
        intermediate_size: 16,
        num_hidden_layers: 1,
        num_attention_heads: 2,
        max_position_embeddings: 8,
        activation: ClipActivation::QuickGelu,
        layer_norm_eps: 1e-5,
    };
    let d = config.embed_dim;
    let ones = || Tensor::ones(d, DType::F32, &Device::Cpu).unwrap();
    let zeros = |n: usize| Tensor::zeros(n, DType::F32, &Device::Cpu).unwrap();

    let mut weights = HashMap::new();
    weights.insert(
        "text_model.embeddings.token_embedding.weight".to_string(),
        random(&[vocab_size, d], 0.5, rng),
    );
    weights.insert(
        "text_model.embeddings.position_embedding.weight".to_string(),
        random(&[config.max_position_embeddings, d], 0.1, rng),
    );

    let layer = "text_model.encoder.layers.0";
    for norm in ["layer_norm1", "layer_norm2"] {
        weights.insert(format!("{}.{}.weight", layer, norm), ones());
        weights.insert(format!("{}.{}.bias", layer, norm), zeros(d));
    }
    for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
        weights.insert(format!("{}.self_attn.{}.weight", layer, proj), random(&[d, d], 0.3, rng));
        weights.insert(format!("{}.self_attn.{}.bias", layer, proj), zeros(d));
    }
    let inner = config.intermediate_size;
    weights.insert(format!("{}.mlp.fc1.weight", layer), random(&[inner, d], 0.3, rng));
    weights.insert(format!("{}.mlp.fc1.bias", layer), zeros(inner));
    weights.insert(format!("{}.mlp.fc2.weight", layer), random(&[d, inner], 0.3, rng));
    weights.insert(format!("{}.mlp.fc2.bias", layer), zeros(d));
    weights.insert("text_model.final_layer_norm.weight".to_string(), ones());
    weights.insert("text_model.final_layer_norm.bias".to_string(), zeros(d));

    ClipTextEncoder::from_weights(config, weights, &Device::Cpu).unwrap()
}

/// `pred = 0.5 * noisy + mean_seq(hidden) @ W`, broadcast over H and W
pub struct TinyDenoiser {
    projection: Tensor,
}

impl TinyDenoiser {
    pub fn new(embed_dim: usize, channels: usize, rng: &mut StdRng) -> Self {
        Self {
            projection: random(&[embed_dim, channels], 0.5, rng),
        }
    }
}

impl DenoisingNetwork for TinyDenoiser {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        _timesteps: &[u32],
        encoder_hidden_states: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let (b, c, _, _) = noisy_latents.dims4()?;
        let text = encoder_hidden_states
            .mean(1)?
            .matmul(&self.projection)?
            .reshape((b, c, 1, 1))?;
        (noisy_latents * 0.5)?.broadcast_add(&text)
    }

    fn dtype(&self) -> DType {
        DType::F32
    }
}

/// Batches of one example with random `[1, 4, 2, 2]` latents and `ids`
pub fn latent_batches(ids: &[u32], num_batches: usize, rng: &mut StdRng) -> InMemoryBatches {
    let batches = (0..num_batches)
        .map(|_| TrainingBatch {
            images: None,
            latents: Some(random(&[1, 4, 2, 2], 1.0, rng)),
            input_ids: Tensor::from_vec(ids.to_vec(), (1, ids.len()), &Device::Cpu).unwrap(),
            loss_weights: Tensor::ones(1, DType::F32, &Device::Cpu).unwrap(),
        })
        .collect();
    InMemoryBatches::new(batches).unwrap()
}

/// Two-level UNet, 8 channels, 4 groups, context width 8
pub fn tiny_unet_config(use_linear_projection: bool) -> ConditionedUNetConfig {
    ConditionedUNetConfig {
        in_channels: 4,
        out_channels: 4,
        blocks: vec![
            UNetBlockConfig {
                out_channels: 8,
                cross_attn: true,
                num_heads: 2,
            },
            UNetBlockConfig {
                out_channels: 8,
                cross_attn: false,
                num_heads: 2,
            },
        ],
        layers_per_block: 1,
        norm_num_groups: 4,
        norm_eps: 1e-5,
        cross_attention_dim: 8,
        use_linear_projection,
        flip_sin_to_cos: true,
        freq_shift: 0.,
    }
}

/// Builds `T` twice: once against a `VarMap` to draw random weights, then
/// against plain tensors so nothing in the result is a `Var`
pub fn frozen_weights<T>(
    dtype: DType,
    build: impl Fn(VarBuilder) -> candle_core::Result<T>,
) -> T {
    let varmap = VarMap::new();
    build(VarBuilder::from_varmap(&varmap, dtype, &Device::Cpu)).unwrap();
    let tensors = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect();
    build(VarBuilder::from_tensors(tensors, dtype, &Device::Cpu)).unwrap()
}
