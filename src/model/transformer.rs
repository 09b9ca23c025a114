//! Post-norm transformer encoder and decoder stacks over sequence-major tensors.
//!
//! Inputs are `[seq, batch, d_model]`. Every sub-layer is
//! `x = norm(x + dropout(sublayer(x)))`, and the stacks end without a final norm.
//!
//! ## Weight keys
//!
//! ```text
//! layers.{i}.self_attn.in_proj_weight         [3E, E]
//! layers.{i}.self_attn.in_proj_bias           [3E]
//! layers.{i}.self_attn.out_proj.{weight,bias}
//! layers.{i}.multihead_attn.*                 (decoder only)
//! layers.{i}.linear1.{weight,bias}            [ff, E]
//! layers.{i}.linear2.{weight,bias}            [E, ff]
//! layers.{i}.norm1.{weight,bias}              (norm3 in the decoder)
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{Dropout, Init, Linear, VarBuilder};

use crate::config::Activation;
use crate::{Error, Result};

/// Shared hyper-parameters of one layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerSpec {
    pub d_model: usize,
    pub num_heads: usize,
    pub ff_size: usize,
    pub dropout: f32,
    pub activation: Activation,
    pub layer_norm_eps: f64,
}

// ---------------------------------------------------------------------------
// Multi-head attention
// ---------------------------------------------------------------------------

/// Multi-head attention with a packed input projection.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(embed_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(Error::Config(format!(
                "embed_dim {embed_dim} is not divisible by {num_heads} heads"
            )));
        }
        // Xavier uniform over [3E, E].
        let bound = (6.0 / (embed_dim + 3 * embed_dim) as f64).sqrt();
        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let in_proj_bias =
            vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.0))?;

        let chunk = |i: usize| -> Result<Linear> {
            let w = in_proj_weight.narrow(0, i * embed_dim, embed_dim)?;
            let b = in_proj_bias.narrow(0, i * embed_dim, embed_dim)?;
            Ok(Linear::new(w, Some(b)))
        };
        let out_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            q_proj: chunk(0)?,
            k_proj: chunk(1)?,
            v_proj: chunk(2)?,
            out_proj,
            num_heads,
            head_dim: embed_dim / num_heads,
            dropout: Dropout::new(dropout),
        })
    }

    /// `[len, batch, E]` -> `[batch, heads, len, head_dim]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (len, batch, _) = xs.dims3()?;
        Ok(xs
            .reshape((len, batch, self.num_heads, self.head_dim))?
            .permute((1, 2, 0, 3))?
            .contiguous()?)
    }

    /// Attend `query [Lq, B, E]` over `key`/`value [Lk, B, E]`.
    ///
    /// `attn_mask` is additive, either `[Lq, Lk]` or `[B * heads, Lq, Lk]` indexed
    /// `b * heads + h`. `key_padding_mask [B, Lk]` marks keys to ignore with non-zero.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (len_q, batch, embed_dim) = query.dims3()?;
        let len_k = key.dim(0)?;

        let scale = (self.head_dim as f64).powf(-0.5);
        let q = (self.split_heads(&self.q_proj.forward(query)?)? * scale)?;
        let k = self.split_heads(&self.k_proj.forward(key)?)?;
        let v = self.split_heads(&self.v_proj.forward(value)?)?;

        // [B, heads, Lq, Lk]
        let mut scores = q.matmul(&k.t()?.contiguous()?)?;

        if let Some(mask) = attn_mask {
            let mask = mask.to_dtype(scores.dtype())?;
            let mask = match mask.rank() {
                2 => mask,
                3 => mask.reshape((batch, self.num_heads, len_q, len_k))?,
                r => {
                    return Err(Error::Shape(format!(
                        "attn_mask must be rank 2 or 3, got rank {r}"
                    )));
                }
            };
            scores = scores.broadcast_add(&mask)?;
        }

        if let Some(padding) = key_padding_mask {
            let ignore = padding
                .ne(0u8)?
                .reshape((batch, 1, 1, len_k))?
                .broadcast_as(scores.dims())?;
            let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.dims(), scores.device())?
                .to_dtype(scores.dtype())?;
            scores = ignore.where_cond(&neg_inf, &scores)?;
        }

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let weights = self.dropout.forward(&weights, train)?;

        // [B, heads, Lq, d] -> [Lq, B, heads, d] -> [Lq, B, E]
        let out = weights
            .matmul(&v)?
            .permute((2, 0, 1, 3))?
            .reshape((len_q, batch, embed_dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

// ---------------------------------------------------------------------------
// Feed-forward
// ---------------------------------------------------------------------------

/// `linear2(dropout(act(linear1(x))))`, weights stored flat on the owning layer.
#[derive(Debug, Clone)]
struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    activation: Activation,
    dropout: Dropout,
}

impl FeedForward {
    fn new(spec: &LayerSpec, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            linear1: candle_nn::linear(spec.d_model, spec.ff_size, vb.pp("linear1"))?,
            linear2: candle_nn::linear(spec.ff_size, spec.d_model, vb.pp("linear2"))?,
            activation: spec.activation,
            dropout: Dropout::new(spec.dropout),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.linear1.forward(xs)?;
        let h = match self.activation {
            Activation::Gelu => h.gelu_erf()?,
            Activation::Relu => h.relu()?,
        };
        let h = self.dropout.forward(&h, train)?;
        Ok(self.linear2.forward(&h)?)
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: MultiHeadAttention,
    ff: FeedForward,
    norm1: candle_nn::LayerNorm,
    norm2: candle_nn::LayerNorm,
    dropout1: Dropout,
    dropout2: Dropout,
}

impl EncoderLayer {
    pub fn new(spec: &LayerSpec, vb: VarBuilder) -> Result<Self> {
        let d = spec.d_model;
        Ok(Self {
            self_attn: MultiHeadAttention::new(
                d,
                spec.num_heads,
                spec.dropout,
                vb.pp("self_attn"),
            )?,
            ff: FeedForward::new(spec, &vb)?,
            norm1: candle_nn::layer_norm(d, spec.layer_norm_eps, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(d, spec.layer_norm_eps, vb.pp("norm2"))?,
            dropout1: Dropout::new(spec.dropout),
            dropout2: Dropout::new(spec.dropout),
        })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        src_key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let sa = self
            .self_attn
            .forward(src, src, src, None, src_key_padding_mask, train)?;
        let x = self.norm1.forward(&(src + self.dropout1.forward(&sa, train)?)?)?;

        let ff = self.ff.forward(&x, train)?;
        Ok(self.norm2.forward(&(&x + self.dropout2.forward(&ff, train)?)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: MultiHeadAttention,
    multihead_attn: MultiHeadAttention,
    ff: FeedForward,
    norm1: candle_nn::LayerNorm,
    norm2: candle_nn::LayerNorm,
    norm3: candle_nn::LayerNorm,
    dropout1: Dropout,
    dropout2: Dropout,
    dropout3: Dropout,
}

/// Masks for one decoder pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderMasks<'a> {
    /// Additive self-attention mask, `[F, F]` or `[B * heads, F, F]`.
    pub tgt_mask: Option<&'a Tensor>,
    /// `[B, F]`, non-zero = padded query frame.
    pub tgt_key_padding_mask: Option<&'a Tensor>,
}

impl DecoderLayer {
    pub fn new(spec: &LayerSpec, vb: VarBuilder) -> Result<Self> {
        let d = spec.d_model;
        let eps = spec.layer_norm_eps;
        Ok(Self {
            self_attn: MultiHeadAttention::new(
                d,
                spec.num_heads,
                spec.dropout,
                vb.pp("self_attn"),
            )?,
            multihead_attn: MultiHeadAttention::new(
                d,
                spec.num_heads,
                spec.dropout,
                vb.pp("multihead_attn"),
            )?,
            ff: FeedForward::new(spec, &vb)?,
            norm1: candle_nn::layer_norm(d, eps, vb.pp("norm1"))?,
            norm2: candle_nn::layer_norm(d, eps, vb.pp("norm2"))?,
            norm3: candle_nn::layer_norm(d, eps, vb.pp("norm3"))?,
            dropout1: Dropout::new(spec.dropout),
            dropout2: Dropout::new(spec.dropout),
            dropout3: Dropout::new(spec.dropout),
        })
    }

    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        masks: &DecoderMasks<'_>,
        train: bool,
    ) -> Result<Tensor> {
        let sa = self.self_attn.forward(
            tgt,
            tgt,
            tgt,
            masks.tgt_mask,
            masks.tgt_key_padding_mask,
            train,
        )?;
        let x = self.norm1.forward(&(tgt + self.dropout1.forward(&sa, train)?)?)?;

        // Memory is built per frame from the latent and audio, and is never padded.
        let ca = self
            .multihead_attn
            .forward(&x, memory, memory, None, None, train)?;
        let x = self.norm2.forward(&(&x + self.dropout2.forward(&ca, train)?)?)?;

        let ff = self.ff.forward(&x, train)?;
        Ok(self.norm3.forward(&(&x + self.dropout3.forward(&ff, train)?)?)?)
    }
}

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    layers: Vec<EncoderLayer>,
}

impl TransformerEncoder {
    pub fn new(spec: &LayerSpec, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("layers");
        let layers = (0..num_layers)
            .map(|i| EncoderLayer::new(spec, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        src_key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut xs = src.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs, src_key_padding_mask, train)?;
        }
        Ok(xs)
    }
}

#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    layers: Vec<DecoderLayer>,
}

impl TransformerDecoder {
    pub fn new(spec: &LayerSpec, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("layers");
        let layers = (0..num_layers)
            .map(|i| DecoderLayer::new(spec, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        masks: &DecoderMasks<'_>,
        train: bool,
    ) -> Result<Tensor> {
        let mut xs = tgt.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs, memory, masks, train)?;
        }
        Ok(xs)
    }
}
