//! Axis rearrangements that let one attention implementation serve several views.
//!
//! ```text
//! SequenceMajor   l b c        ->  b l c          (decoder time queries)
//! Temporal        b c f h w    ->  b (h w) f c    (attend across time per location)
//! Spatial         b c f h w    ->  b f (h w) c    (attend across locations per frame)
//! ```
//!
//! The leading axis of every target layout is the batch axis, which is what the
//! attention's focus-present mask indexes.

use candle_core::Tensor;

use super::attention::{AttentionContext, Block};
use crate::{Error, Result};

/// Source → target layout pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisLayout {
    SequenceMajor,
    Temporal,
    Spatial,
}

impl AxisLayout {
    fn source_rank(self) -> usize {
        match self {
            Self::SequenceMajor => 3,
            Self::Temporal | Self::Spatial => 5,
        }
    }

    /// Target dims for a source of shape `dims`.
    fn target_dims(self, dims: &[usize]) -> Vec<usize> {
        match self {
            Self::SequenceMajor => vec![dims[1], dims[0], dims[2]],
            Self::Temporal => vec![dims[0], dims[3] * dims[4], dims[2], dims[1]],
            Self::Spatial => vec![dims[0], dims[2], dims[3] * dims[4], dims[1]],
        }
    }

    /// Rearrange from the source layout into the target layout.
    pub fn to_target(self, xs: &Tensor) -> Result<Tensor> {
        let dims = xs.dims();
        if dims.len() != self.source_rank() {
            return Err(Error::Shape(format!(
                "{self:?} expects a rank-{} input, got {dims:?}",
                self.source_rank()
            )));
        }
        let target = self.target_dims(dims);
        let out = match self {
            Self::SequenceMajor => xs.transpose(0, 1)?.contiguous()?,
            // b c f h w -> b h w f c -> b (h w) f c
            Self::Temporal => xs.permute((0, 3, 4, 2, 1))?.contiguous()?.reshape(target)?,
            // b c f h w -> b f h w c -> b f (h w) c
            Self::Spatial => xs.permute((0, 2, 3, 4, 1))?.contiguous()?.reshape(target)?,
        };
        Ok(out)
    }

    /// Restore the source layout using the sizes recorded from the original input.
    pub fn to_source(self, xs: &Tensor, source_dims: &[usize]) -> Result<Tensor> {
        if source_dims.len() != self.source_rank() {
            return Err(Error::Shape(format!(
                "{self:?} cannot restore a rank-{} source",
                source_dims.len()
            )));
        }
        let expected = self.target_dims(source_dims);
        if xs.dims() != expected.as_slice() {
            return Err(Error::Shape(format!(
                "{self:?}: got {:?}, expected {expected:?} to restore {source_dims:?}",
                xs.dims()
            )));
        }
        let out = match (self, source_dims) {
            (Self::SequenceMajor, _) => xs.transpose(0, 1)?.contiguous()?,
            // b (h w) f c -> b h w f c -> b c f h w
            (Self::Temporal, &[b, c, f, h, w]) => xs
                .reshape((b, h, w, f, c))?
                .permute((0, 4, 3, 1, 2))?
                .contiguous()?,
            // b f (h w) c -> b f h w c -> b c f h w
            (Self::Spatial, &[b, c, f, h, w]) => xs
                .reshape((b, f, h, w, c))?
                .permute((0, 4, 1, 2, 3))?
                .contiguous()?,
            _ => {
                return Err(Error::Shape(format!(
                    "{self:?} cannot restore {source_dims:?}"
                )));
            }
        };
        Ok(out)
    }
}

/// Runs `inner` in the target layout and hands back the source layout.
#[derive(Debug, Clone)]
pub struct Rearranged<B> {
    layout: AxisLayout,
    inner: B,
}

impl<B: Block> Rearranged<B> {
    pub fn new(layout: AxisLayout, inner: B) -> Self {
        Self { layout, inner }
    }
}

impl<B: Block> Block for Rearranged<B> {
    fn forward(&self, xs: &Tensor, ctx: &AttentionContext<'_>) -> Result<Tensor> {
        let source_dims = xs.dims().to_vec();
        let target = self.layout.to_target(xs)?;
        let out = self.inner.forward(&target, ctx)?;
        self.layout.to_source(&out, &source_dims)
    }
}
