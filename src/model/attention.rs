//! Multi-head self-attention with relative bias, rotary queries/keys and a
//! focus-on-present shortcut.
//!
//! ```text
//! x [..., n, dim] ─ to_qkv (no bias) ─┬─ q * dim_head^-0.5 ─ rope ─┐
//!                                     ├─ k ──────────────── rope ──┴─ q·kᵀ + pos_bias
//!                                     │                               ─ focus mask
//!                                     │                               ─ softmax(· - rowmax)
//!                                     └─ v ─────────────────────────── attn · v ─ to_out
//! ```
//!
//! The wrappers in [`super::norm`] and [`super::rearrange`] compose around this block
//! through the [`Block`] trait, passing an [`AttentionContext`] down unchanged.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::VarBuilder;

use super::rope::RotaryEmbedding;
use crate::{Error, Result};

/// Optional per-call inputs threaded through the attention wrappers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttentionContext<'a> {
    /// Additive logit bias `[heads, n, n]`.
    pub pos_bias: Option<&'a Tensor>,
    /// `[batch]`, non-zero = this sample only attends to its present frame.
    pub focus_present_mask: Option<&'a Tensor>,
}

impl<'a> AttentionContext<'a> {
    pub fn with_pos_bias(pos_bias: &'a Tensor) -> Self {
        Self {
            pos_bias: Some(pos_bias),
            focus_present_mask: None,
        }
    }
}

/// A shape-preserving layer that understands [`AttentionContext`].
pub trait Block {
    fn forward(&self, xs: &Tensor, ctx: &AttentionContext<'_>) -> Result<Tensor>;
}

/// Smallest finite value of a float dtype, used to knock out disallowed logits.
pub(crate) fn dtype_min(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Multi-head attention over the second-to-last axis of its input.
#[derive(Debug, Clone)]
pub struct Attention {
    to_qkv: candle_nn::Linear,
    to_out: candle_nn::Linear,
    heads: usize,
    dim_head: usize,
    scale: f64,
    rotary_emb: Option<RotaryEmbedding>,
}

impl Attention {
    pub fn new(
        dim: usize,
        heads: usize,
        dim_head: usize,
        rotary_emb: Option<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden_dim = heads * dim_head;
        let to_qkv = candle_nn::linear_no_bias(dim, hidden_dim * 3, vb.pp("to_qkv"))?;
        let to_out = candle_nn::linear_no_bias(hidden_dim, dim, vb.pp("to_out"))?;
        Ok(Self {
            to_qkv,
            to_out,
            heads,
            dim_head,
            scale: (dim_head as f64).powf(-0.5),
            rotary_emb,
        })
    }

    /// Per-group focus flags: `[batch]` expanded over the remaining leading axes.
    fn group_focus_mask(mask: &Tensor, batch: usize, groups: usize) -> Result<Tensor> {
        let mask = mask.flatten_all()?.ne(0u8)?;
        if mask.dim(0)? != batch || groups % batch != 0 {
            return Err(Error::Shape(format!(
                "focus_present_mask has {} entries for a batch of {batch}",
                mask.dim(0)?
            )));
        }
        Ok(mask
            .reshape((batch, 1))?
            .broadcast_as((batch, groups / batch))?
            .contiguous()?
            .reshape((groups, 1, 1, 1))?)
    }
}

impl Block for Attention {
    /// `xs: [..., n, dim]` with at least one leading (batch) axis.
    fn forward(&self, xs: &Tensor, ctx: &AttentionContext<'_>) -> Result<Tensor> {
        let dims = xs.dims().to_vec();
        if dims.len() < 3 {
            return Err(Error::Shape(format!(
                "attention expects [batch, ..., seq, dim], got {dims:?}"
            )));
        }
        let rank = dims.len();
        let (n, dim) = (dims[rank - 2], dims[rank - 1]);
        let batch = dims[0];
        let groups: usize = dims[..rank - 2].iter().product();
        let hidden = self.heads * self.dim_head;

        // [groups, n, 3 * hidden]
        let qkv = self.to_qkv.forward(&xs.reshape((groups, n, dim))?)?;

        let focus = match ctx.focus_present_mask {
            Some(mask) => {
                let flags: Vec<u8> = mask.flatten_all()?.ne(0u8)?.to_vec1()?;
                Some((mask, flags))
            }
            None => None,
        };

        if let Some((_, flags)) = &focus
            && flags.iter().all(|&f| f != 0)
        {
            // Every sample attends only to itself: attention is the identity on values.
            let values = qkv.narrow(D::Minus1, 2 * hidden, hidden)?;
            let out = self.to_out.forward(&values)?;
            return Ok(out.reshape(dims)?);
        }

        // [groups, n, hidden] -> [groups, heads, n, dim_head]
        let split = |idx: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, idx * hidden, hidden)?
                .reshape((groups, n, self.heads, self.dim_head))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = (split(0)? * self.scale)?;
        let k = split(1)?;
        let v = split(2)?;

        let (q, k) = match &self.rotary_emb {
            Some(rope) => (
                rope.rotate_queries_or_keys(&q)?,
                rope.rotate_queries_or_keys(&k)?,
            ),
            None => (q, k),
        };

        // [groups, heads, n, n]
        let mut sim = q.matmul(&k.t()?.contiguous()?)?;

        if let Some(bias) = ctx.pos_bias {
            sim = sim.broadcast_add(bias)?;
        }

        if let Some((mask, flags)) = &focus
            && flags.iter().any(|&f| f != 0)
        {
            let device = sim.device();
            let shape = (groups, 1, n, n);
            let attend_self = Tensor::eye(n, DType::U8, device)?.broadcast_as(shape)?;
            let attend_all = Tensor::ones((n, n), DType::U8, device)?.broadcast_as(shape)?;
            let allowed = Self::group_focus_mask(mask, batch, groups)?
                .broadcast_as(shape)?
                .where_cond(&attend_self, &attend_all)?;
            let floor = Tensor::full(dtype_min(sim.dtype()), sim.dims(), device)?
                .to_dtype(sim.dtype())?;
            sim = allowed.broadcast_as(sim.dims())?.where_cond(&sim, &floor)?;
        }

        // Numerical stability: shift each row by its (non-differentiated) max.
        let row_max = sim.max_keepdim(D::Minus1)?.detach();
        let sim = sim.broadcast_sub(&row_max)?;
        let attn = candle_nn::ops::softmax_last_dim(&sim)?;

        // [groups, heads, n, dim_head] -> [groups, n, hidden]
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((groups, n, hidden))?;
        let out = self.to_out.forward(&out)?;
        Ok(out.reshape(dims)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn output_shape_matches_input() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = Attention::new(64, 4, 32, Some(RotaryEmbedding::new(4, 10_000.0)), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 10, 64), &device).unwrap();
        let y = attn.forward(&x, &AttentionContext::default()).unwrap();
        assert_eq!(y.dims(), &[2, 10, 64]);
    }

    #[test]
    fn extra_leading_axes_are_grouped() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = Attention::new(16, 2, 8, None, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 5, 16), &device).unwrap();
        let y = attn.forward(&x, &AttentionContext::default()).unwrap();
        assert_eq!(y.dims(), &[2, 3, 5, 16]);

        // Each group attends independently: group (1, 2) equals a standalone call.
        let single = x.get(1).unwrap().get(2).unwrap().unsqueeze(0).unwrap();
        let y_single = attn.forward(&single, &AttentionContext::default()).unwrap();
        let y_group = y.get(1).unwrap().get(2).unwrap().unsqueeze(0).unwrap();
        assert!(max_abs_diff(&y_single, &y_group) < 1e-5);
    }

    #[test]
    fn all_true_focus_mask_bypasses_attention() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = Attention::new(32, 2, 16, None, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 7, 32), &device).unwrap();
        let focus = Tensor::new(&[1u8, 1, 1], &device).unwrap();
        let ctx = AttentionContext {
            pos_bias: None,
            focus_present_mask: Some(&focus),
        };
        let y = attn.forward(&x, &ctx).unwrap();

        let qkv = attn.to_qkv.forward(&x).unwrap();
        let v = qkv.narrow(D::Minus1, 64, 32).unwrap();
        let expected = attn.to_out.forward(&v).unwrap();
        assert!(max_abs_diff(&y, &expected) < 1e-6);
    }

    #[test]
    fn partial_focus_mask_only_affects_flagged_samples() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = Attention::new(32, 2, 16, None, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 6, 32), &device).unwrap();

        let focus = Tensor::new(&[1u8, 0], &device).unwrap();
        let ctx = AttentionContext {
            pos_bias: None,
            focus_present_mask: Some(&focus),
        };
        let y = attn.forward(&x, &ctx).unwrap();
        let y_free = attn.forward(&x, &AttentionContext::default()).unwrap();

        // Flagged sample: each frame sees only itself, which is to_out(v).
        let qkv = attn.to_qkv.forward(&x).unwrap();
        let v = qkv.narrow(D::Minus1, 64, 32).unwrap();
        let identity = attn.to_out.forward(&v).unwrap();
        assert!(max_abs_diff(&y.get(0).unwrap(), &identity.get(0).unwrap()) < 1e-5);

        // Unflagged sample: unchanged from unmasked attention.
        assert!(max_abs_diff(&y.get(1).unwrap(), &y_free.get(1).unwrap()) < 1e-6);
    }

    #[test]
    fn all_false_focus_mask_is_a_no_op() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = Attention::new(16, 2, 8, None, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 16), &device).unwrap();
        let focus = Tensor::new(&[0u8, 0], &device).unwrap();
        let ctx = AttentionContext {
            pos_bias: None,
            focus_present_mask: Some(&focus),
        };
        let y = attn.forward(&x, &ctx).unwrap();
        let y_free = attn.forward(&x, &AttentionContext::default()).unwrap();
        assert!(max_abs_diff(&y, &y_free) < 1e-6);
    }

    #[test]
    fn huge_negative_bias_blocks_positions() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = Attention::new(16, 2, 8, None, vb).unwrap();
        let n = 5;
        let x = Tensor::randn(0f32, 1.0, (1, n, 16), &device).unwrap();

        // Only the diagonal survives: same result as focusing on the present.
        let eye = Tensor::eye(n, DType::F32, &device).unwrap();
        let bias = ((eye - 1.0).unwrap() * 1e8)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .broadcast_as((2, n, n))
            .unwrap()
            .contiguous()
            .unwrap();
        let y = attn
            .forward(&x, &AttentionContext::with_pos_bias(&bias))
            .unwrap();

        let focus = Tensor::new(&[1u8], &device).unwrap();
        let y_focus = attn
            .forward(
                &x,
                &AttentionContext {
                    pos_bias: None,
                    focus_present_mask: Some(&focus),
                },
            )
            .unwrap();
        assert!(max_abs_diff(&y, &y_focus) < 1e-5);
    }

    #[test]
    fn rejects_rank_two_input() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = Attention::new(16, 2, 8, None, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (4, 16), &device).unwrap();
        assert!(attn.forward(&x, &AttentionContext::default()).is_err());
    }
}
