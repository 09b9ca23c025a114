//! Scale-only layer norm and the pre-norm / residual wrappers around it.

use candle_core::{D, Module, Tensor};
use candle_nn::{Init, VarBuilder};

use super::attention::{AttentionContext, Block};
use crate::Result;

/// Layer normalization over the trailing axis with a learned scale and no shift.
///
/// `(x - mean) / sqrt(var + eps) * gamma`, population variance.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// `[1, 1, dim]`, initialised to ones.
    gamma: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints((1, 1, dim), "gamma", Init::Const(1.0))?;
        Ok(Self { gamma, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.gamma)
    }
}

/// Normalizes its input, then hands only the normalized value to `inner`.
#[derive(Debug, Clone)]
pub struct PreNorm<B> {
    norm: LayerNorm,
    inner: B,
}

impl<B: Block> PreNorm<B> {
    /// `vb` is the wrapper's own prefix: the norm lives under `norm`.
    pub fn new(dim: usize, eps: f64, inner: B, vb: VarBuilder) -> Result<Self> {
        let norm = LayerNorm::new(dim, eps, vb.pp("norm"))?;
        Ok(Self { norm, inner })
    }
}

impl<B: Block> Block for PreNorm<B> {
    fn forward(&self, xs: &Tensor, ctx: &AttentionContext<'_>) -> Result<Tensor> {
        let normed = self.norm.forward(xs)?;
        self.inner.forward(&normed, ctx)
    }
}

/// `inner(x) + x`.
#[derive(Debug, Clone)]
pub struct Residual<B> {
    inner: B,
}

impl<B: Block> Residual<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

impl<B: Block> Block for Residual<B> {
    fn forward(&self, xs: &Tensor, ctx: &AttentionContext<'_>) -> Result<Tensor> {
        let out = self.inner.forward(xs, ctx)?;
        Ok((out + xs)?)
    }
}
