//! Stable Diffusion 1.x / 2.x UNet with a differentiable text-conditioning path
//!
//! Resnet and timestep blocks come from candle-transformers. The spatial
//! transformers are assembled here from `candle_nn::ops::softmax` and a
//! composed layer norm, so gradients reach `encoder_hidden_states`.
//! Tensor names follow the diffusers `unet/` layout.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn as nn;
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    resnet::{ResnetBlock2D, ResnetBlock2DConfig},
};

#[derive(Debug, Clone, Copy)]
pub struct UNetBlockConfig {
    pub out_channels: usize,
    /// Whether each resnet in the block is followed by a spatial transformer
    pub cross_attn: bool,
    pub num_heads: usize,
}

#[derive(Debug, Clone)]
pub struct ConditionedUNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub blocks: Vec<UNetBlockConfig>,
    pub layers_per_block: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub cross_attention_dim: usize,
    pub use_linear_projection: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
}

impl ConditionedUNetConfig {
    fn sd(heads: [usize; 4], cross_attention_dim: usize, use_linear_projection: bool) -> Self {
        let block = |out_channels, cross_attn, num_heads| UNetBlockConfig {
            out_channels,
            cross_attn,
            num_heads,
        };
        Self {
            in_channels: 4,
            out_channels: 4,
            blocks: vec![
                block(320, true, heads[0]),
                block(640, true, heads[1]),
                block(1280, true, heads[2]),
                block(1280, false, heads[3]),
            ],
            layers_per_block: 2,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim,
            use_linear_projection,
            flip_sin_to_cos: true,
            freq_shift: 0.,
        }
    }

    pub fn v1_5() -> Self {
        Self::sd([8, 8, 8, 8], 768, false)
    }

    pub fn v2_1() -> Self {
        Self::sd([5, 10, 20, 20], 1024, true)
    }

    fn time_embed_dim(&self) -> usize {
        self.blocks[0].out_channels * 4
    }
}

#[derive(Debug)]
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(vs: nn::VarBuilder, dim: usize, eps: f64) -> Result<Self> {
        let weight = vs.get_with_hints(dim, "weight", nn::Init::Const(1.))?;
        let bias = vs.get_with_hints(dim, "bias", nn::Init::Const(0.))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = match dtype {
            DType::F16 | DType::BF16 => xs.to_dtype(DType::F32)?,
            _ => xs.clone(),
        };
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        centered
            .broadcast_div(&(variance + self.eps)?.sqrt()?)?
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

#[derive(Debug)]
struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    heads: usize,
    scale: f64,
}

impl CrossAttention {
    fn new(
        vs: nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
    ) -> Result<Self> {
        let inner_dim = heads * dim_head;
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: nn::linear_no_bias(query_dim, inner_dim, vs.pp("to_q"))?,
            to_k: nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_k"))?,
            to_v: nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_v"))?,
            to_out: nn::linear(inner_dim, query_dim, vs.pp("to_out").pp("0"))?,
            heads,
            scale: 1.0 / (dim_head as f64).sqrt(),
        })
    }

    /// `[b, seq, heads * d]` to `[b, heads, seq, d]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq, dim) = xs.dims3()?;
        xs.reshape((b, seq, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let (b, seq, _) = xs.dims3()?;
        let context = context.unwrap_or(xs);
        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;

        // Scores and softmax in f32 for half-precision weights
        let in_dtype = q.dtype();
        let compute_dtype = match in_dtype {
            DType::F16 | DType::BF16 => DType::F32,
            dtype => dtype,
        };
        let q = q.to_dtype(compute_dtype)?;
        let k = k.to_dtype(compute_dtype)?;
        let v = v.to_dtype(compute_dtype)?;
        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let probs = nn::ops::softmax(&scores, D::Minus1)?;
        let out = probs
            .matmul(&v)?
            .to_dtype(in_dtype)?
            .transpose(1, 2)?
            .contiguous()?;
        let inner_dim = out.dim(2)? * out.dim(3)?;
        self.to_out.forward(&out.reshape((b, seq, inner_dim))?)
    }
}

#[derive(Debug)]
struct FeedForward {
    project_in: nn::Linear,
    project_out: nn::Linear,
}

impl FeedForward {
    fn new(vs: nn::VarBuilder, dim: usize) -> Result<Self> {
        let inner_dim = dim * 4;
        let vs = vs.pp("net");
        Ok(Self {
            project_in: nn::linear(dim, inner_dim * 2, vs.pp("0").pp("proj"))?,
            project_out: nn::linear(inner_dim, dim, vs.pp("2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // GEGLU
        let states_and_gate = self.project_in.forward(xs)?.chunk(2, D::Minus1)?;
        let xs = (&states_and_gate[0] * states_and_gate[1].gelu_erf()?)?;
        self.project_out.forward(&xs)
    }
}

#[derive(Debug)]
struct BasicTransformerBlock {
    norm1: LayerNorm,
    attn1: CrossAttention,
    norm2: LayerNorm,
    attn2: CrossAttention,
    norm3: LayerNorm,
    ff: FeedForward,
}

impl BasicTransformerBlock {
    fn new(vs: nn::VarBuilder, dim: usize, heads: usize, context_dim: usize) -> Result<Self> {
        let dim_head = dim / heads;
        Ok(Self {
            norm1: LayerNorm::new(vs.pp("norm1"), dim, 1e-5)?,
            attn1: CrossAttention::new(vs.pp("attn1"), dim, None, heads, dim_head)?,
            norm2: LayerNorm::new(vs.pp("norm2"), dim, 1e-5)?,
            attn2: CrossAttention::new(vs.pp("attn2"), dim, Some(context_dim), heads, dim_head)?,
            norm3: LayerNorm::new(vs.pp("norm3"), dim, 1e-5)?,
            ff: FeedForward::new(vs.pp("ff"), dim)?,
        })
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, Some(context))? + xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + xs
    }
}

#[derive(Debug)]
enum Projection {
    Conv(nn::Conv2d),
    Linear(nn::Linear),
}

impl Projection {
    fn new(vs: nn::VarBuilder, in_dim: usize, out_dim: usize, linear: bool) -> Result<Self> {
        if linear {
            Ok(Self::Linear(nn::linear(in_dim, out_dim, vs)?))
        } else {
            Ok(Self::Conv(nn::conv2d(in_dim, out_dim, 1, Default::default(), vs)?))
        }
    }
}

/// Transformer2DModel: group norm, projection in, one transformer block,
/// projection out, residual
#[derive(Debug)]
struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Projection,
    block: BasicTransformerBlock,
    proj_out: Projection,
}

impl SpatialTransformer {
    fn new(
        vs: nn::VarBuilder,
        channels: usize,
        heads: usize,
        config: &ConditionedUNetConfig,
    ) -> Result<Self> {
        let linear = config.use_linear_projection;
        Ok(Self {
            norm: nn::group_norm(config.norm_num_groups, channels, 1e-6, vs.pp("norm"))?,
            proj_in: Projection::new(vs.pp("proj_in"), channels, channels, linear)?,
            block: BasicTransformerBlock::new(
                vs.pp("transformer_blocks").pp("0"),
                channels,
                heads,
                config.cross_attention_dim,
            )?,
            proj_out: Projection::new(vs.pp("proj_out"), channels, channels, linear)?,
        })
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (b, channels, h, w) = xs.dims4()?;
        let residual = xs;
        let xs = self.norm.forward(xs)?;
        // NCHW to [b, h * w, c]
        let to_sequence = |xs: &Tensor| -> Result<Tensor> {
            let c = xs.dim(1)?;
            xs.transpose(1, 2)?.t()?.reshape((b, h * w, c))
        };
        let xs = match &self.proj_in {
            Projection::Conv(conv) => to_sequence(&conv.forward(&xs)?)?,
            Projection::Linear(linear) => linear.forward(&to_sequence(&xs)?)?,
        };
        let xs = self.block.forward(&xs, context)?;
        let xs = match &self.proj_out {
            Projection::Conv(conv) => {
                let inner_dim = xs.dim(2)?;
                conv.forward(&xs.reshape((b, h, w, inner_dim))?.t()?.transpose(1, 2)?)?
            }
            Projection::Linear(linear) => linear
                .forward(&xs)?
                .reshape((b, h, w, channels))?
                .t()?
                .transpose(1, 2)?,
        };
        xs + residual
    }
}

#[derive(Debug)]
struct Downsample2D {
    conv: nn::Conv2d,
}

impl Downsample2D {
    fn new(vs: nn::VarBuilder, channels: usize) -> Result<Self> {
        let config = nn::Conv2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let conv = nn::conv2d(channels, channels, 3, config, vs.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

#[derive(Debug)]
struct Upsample2D {
    conv: nn::Conv2d,
}

impl Upsample2D {
    fn new(vs: nn::VarBuilder, channels: usize) -> Result<Self> {
        let config = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = nn::conv2d(channels, channels, 3, config, vs.pp("conv"))?;
        Ok(Self { conv })
    }

    fn forward(&self, xs: &Tensor, size: Option<(usize, usize)>) -> Result<Tensor> {
        let xs = match size {
            None => {
                let (_b, _c, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(2 * h, 2 * w)?
            }
            Some((h, w)) => xs.upsample_nearest2d(h, w)?,
        };
        self.conv.forward(&xs)
    }
}

#[derive(Debug)]
struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsample2D>,
}

impl DownBlock {
    fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        context: &Tensor,
        skips: &mut Vec<Tensor>,
    ) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
            skips.push(xs.clone());
        }
        if let Some(downsampler) = &self.downsampler {
            xs = downsampler.forward(&xs)?;
            skips.push(xs.clone());
        }
        Ok(xs)
    }
}

#[derive(Debug)]
struct UpBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    upsampler: Option<Upsample2D>,
}

impl UpBlock {
    fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        context: &Tensor,
        skips: &mut Vec<Tensor>,
        upsample_size: Option<(usize, usize)>,
    ) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            let skip = skips
                .pop()
                .ok_or_else(|| candle_core::Error::Msg("ran out of skip connections".into()))?;
            xs = Tensor::cat(&[&xs, &skip], 1)?.contiguous()?;
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                xs = attn.forward(&xs, context)?;
            }
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => Ok(xs),
        }
    }
}

#[derive(Debug)]
struct MidBlock {
    resnet_in: ResnetBlock2D,
    attention: SpatialTransformer,
    resnet_out: ResnetBlock2D,
}

/// UNet2DConditionModel for SD 1.x / 2.x. Frozen weights, gradients flow to
/// the conditioning input only.
#[derive(Debug)]
pub struct ConditionedUNet {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2d,
    config: ConditionedUNetConfig,
}

impl ConditionedUNet {
    pub fn new(vs: nn::VarBuilder, config: ConditionedUNetConfig) -> Result<Self> {
        let n_blocks = config.blocks.len();
        if n_blocks == 0 {
            candle_core::bail!("UNet config has no blocks");
        }
        let base_channels = config.blocks[0].out_channels;
        let last = config.blocks[n_blocks - 1];
        let time_embed_dim = config.time_embed_dim();
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let resnet_cfg = |out_channels| ResnetBlock2DConfig {
            out_channels: Some(out_channels),
            temb_channels: Some(time_embed_dim),
            groups: config.norm_num_groups,
            eps: config.norm_eps,
            ..Default::default()
        };

        let conv_in = nn::conv2d(config.in_channels, base_channels, 3, conv_cfg, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(base_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), base_channels, time_embed_dim)?;

        let vs_down = vs.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(n_blocks);
        for (i, block) in config.blocks.iter().enumerate() {
            let vs = vs_down.pp(i.to_string());
            let in_channels = if i == 0 {
                base_channels
            } else {
                config.blocks[i - 1].out_channels
            };
            let mut resnets = Vec::with_capacity(config.layers_per_block);
            let mut attentions = Vec::new();
            for j in 0..config.layers_per_block {
                let resnet_in = if j == 0 { in_channels } else { block.out_channels };
                resnets.push(ResnetBlock2D::new(
                    vs.pp("resnets").pp(j.to_string()),
                    resnet_in,
                    resnet_cfg(block.out_channels),
                )?);
                if block.cross_attn {
                    attentions.push(SpatialTransformer::new(
                        vs.pp("attentions").pp(j.to_string()),
                        block.out_channels,
                        block.num_heads,
                        &config,
                    )?);
                }
            }
            let downsampler = if i + 1 < n_blocks {
                Some(Downsample2D::new(
                    vs.pp("downsamplers").pp("0"),
                    block.out_channels,
                )?)
            } else {
                None
            };
            down_blocks.push(DownBlock {
                resnets,
                attentions,
                downsampler,
            });
        }

        let vs_mid = vs.pp("mid_block");
        let mid_block = MidBlock {
            resnet_in: ResnetBlock2D::new(
                vs_mid.pp("resnets").pp("0"),
                last.out_channels,
                resnet_cfg(last.out_channels),
            )?,
            attention: SpatialTransformer::new(
                vs_mid.pp("attentions").pp("0"),
                last.out_channels,
                last.num_heads,
                &config,
            )?,
            resnet_out: ResnetBlock2D::new(
                vs_mid.pp("resnets").pp("1"),
                last.out_channels,
                resnet_cfg(last.out_channels),
            )?,
        };

        let vs_up = vs.pp("up_blocks");
        let mut up_blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            let vs = vs_up.pp(i.to_string());
            let block = config.blocks[n_blocks - 1 - i];
            let prev_out_channels = if i == 0 {
                last.out_channels
            } else {
                config.blocks[n_blocks - i].out_channels
            };
            // Channels of the skip consumed by the block's last resnet
            let skip_channels = config.blocks[(n_blocks - 1 - i).saturating_sub(1)].out_channels;
            let num_layers = config.layers_per_block + 1;
            let mut resnets = Vec::with_capacity(num_layers);
            let mut attentions = Vec::new();
            for j in 0..num_layers {
                let res_skip = if j + 1 == num_layers {
                    skip_channels
                } else {
                    block.out_channels
                };
                let resnet_in = if j == 0 {
                    prev_out_channels
                } else {
                    block.out_channels
                };
                resnets.push(ResnetBlock2D::new(
                    vs.pp("resnets").pp(j.to_string()),
                    resnet_in + res_skip,
                    resnet_cfg(block.out_channels),
                )?);
                if block.cross_attn {
                    attentions.push(SpatialTransformer::new(
                        vs.pp("attentions").pp(j.to_string()),
                        block.out_channels,
                        block.num_heads,
                        &config,
                    )?);
                }
            }
            let upsampler = if i + 1 < n_blocks {
                Some(Upsample2D::new(vs.pp("upsamplers").pp("0"), block.out_channels)?)
            } else {
                None
            };
            up_blocks.push(UpBlock {
                resnets,
                attentions,
                upsampler,
            });
        }

        let conv_norm_out = nn::group_norm(
            config.norm_num_groups,
            base_channels,
            config.norm_eps,
            vs.pp("conv_norm_out"),
        )?;
        let conv_out = nn::conv2d(base_channels, config.out_channels, 3, conv_cfg, vs.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            config,
        })
    }

    /// `timesteps` is a `[batch]` tensor, one diffusion step per example
    pub fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let (_b, _c, height, width) = xs.dims4()?;
        let n_blocks = self.config.blocks.len();
        let up_factor = 1usize << (n_blocks - 1);
        let forward_upsample_size = height % up_factor != 0 || width % up_factor != 0;

        let emb = self.time_proj.forward(&timesteps.to_dtype(xs.dtype())?)?;
        let temb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(xs)?;
        let mut skips = vec![xs.clone()];
        let mut xs = xs;
        for block in &self.down_blocks {
            xs = block.forward(&xs, &temb, encoder_hidden_states, &mut skips)?;
        }

        let mid = &self.mid_block;
        let xs = mid.resnet_in.forward(&xs, Some(&temb))?;
        let xs = mid.attention.forward(&xs, encoder_hidden_states)?;
        let mut xs = mid.resnet_out.forward(&xs, Some(&temb))?;

        for (i, block) in self.up_blocks.iter().enumerate() {
            // Upsample to the resolution of the next block's skips
            let upsample_size = match skips.len().checked_sub(block.resnets.len() + 1) {
                Some(next) if i + 1 < n_blocks && forward_upsample_size => {
                    let (_, _, h, w) = skips[next].dims4()?;
                    Some((h, w))
                }
                _ => None,
            };
            xs = block.forward(&xs, &temb, encoder_hidden_states, &mut skips, upsample_size)?;
        }

        let xs = nn::ops::silu(&self.conv_norm_out.forward(&xs)?)?;
        self.conv_out.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frozen_weights, tiny_unet_config};
    use candle_core::Device;

    fn inputs(batch: usize, dtype: DType) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let latents = Tensor::randn(0f32, 1f32, (batch, 4, 4, 4), &device)
            .unwrap()
            .to_dtype(dtype)
            .unwrap();
        let context = Tensor::randn(0f32, 1f32, (batch, 3, 8), &device)
            .unwrap()
            .to_dtype(dtype)
            .unwrap();
        (latents, context)
    }

    #[test]
    fn test_output_matches_latent_shape() {
        for linear in [false, true] {
            let config = tiny_unet_config(linear);
            let unet = frozen_weights(DType::F32, |vs| ConditionedUNet::new(vs, config.clone()));
            let (latents, context) = inputs(2, DType::F32);
            let timesteps = Tensor::new(&[10f32, 900.], &Device::Cpu).unwrap();
            let out = unet.forward(&latents, &timesteps, &context).unwrap();
            assert_eq!(out.dims(), latents.dims());
        }
    }

    #[test]
    fn test_odd_latent_size_restores_resolution() {
        let unet = frozen_weights(DType::F32, |vs| {
            ConditionedUNet::new(vs, tiny_unet_config(false))
        });
        let device = Device::Cpu;
        let latents = Tensor::randn(0f32, 1f32, (1, 4, 5, 3), &device).unwrap();
        let context = Tensor::randn(0f32, 1f32, (1, 3, 8), &device).unwrap();
        let timesteps = Tensor::new(&[500f32], &device).unwrap();
        let out = unet.forward(&latents, &timesteps, &context).unwrap();
        assert_eq!(out.dims(), &[1, 4, 5, 3]);
    }

    #[test]
    fn test_timestep_is_per_example() {
        let unet = frozen_weights(DType::F32, |vs| {
            ConditionedUNet::new(vs, tiny_unet_config(false))
        });
        let (latents, context) = inputs(1, DType::F32);
        let latents = Tensor::cat(&[&latents, &latents], 0).unwrap();
        let context = Tensor::cat(&[&context, &context], 0).unwrap();

        let same = Tensor::new(&[100f32, 100.], &Device::Cpu).unwrap();
        let out = unet.forward(&latents, &same, &context).unwrap();
        let diff = (out.get(0).unwrap() - out.get(1).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);

        let different = Tensor::new(&[100f32, 800.], &Device::Cpu).unwrap();
        let out = unet.forward(&latents, &different, &context).unwrap();
        let diff = (out.get(0).unwrap() - out.get(1).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 1e-5);
    }

    #[test]
    fn test_sd_configs() {
        let v1 = ConditionedUNetConfig::v1_5();
        assert_eq!(v1.cross_attention_dim, 768);
        assert!(!v1.use_linear_projection);
        assert_eq!(v1.time_embed_dim(), 1280);

        let v2 = ConditionedUNetConfig::v2_1();
        assert_eq!(v2.cross_attention_dim, 1024);
        assert!(v2.use_linear_projection);
        let heads: Vec<usize> = v2.blocks.iter().map(|b| b.num_heads).collect();
        assert_eq!(heads, vec![5, 10, 20, 20]);
        // 64-wide heads everywhere
        for block in &v2.blocks {
            assert_eq!(block.out_channels / block.num_heads, 64);
        }
    }
}
