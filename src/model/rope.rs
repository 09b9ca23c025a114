//! Rotary position embedding (RoPE) with interleaved feature pairs.
//!
//! Only the first `dim` features of each head are rotated; the rest pass through.
//! Feature pair `(2i, 2i + 1)` at position `p` is rotated by `p * theta^(-2i / dim)`.
//!
//! Used by the decoder's temporal self-attention, on queries and keys alike.

use candle_core::{D, DType, Device, Tensor};

use crate::{Error, Result};

/// Rotary embedding over the sequence axis (second to last) of its input.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f64>,
}

impl RotaryEmbedding {
    /// `dim` rotary features, base frequency `theta` (10 000 in the released model).
    pub fn new(dim: usize, theta: f64) -> Self {
        // inv_freq = 1 / (theta ^ (2i / dim)) for i in 0..dim/2
        let inv_freq = (0..dim / 2)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64))
            .collect();
        Self { inv_freq }
    }

    /// Number of features actually rotated (an even count).
    pub fn rotary_dim(&self) -> usize {
        2 * self.inv_freq.len()
    }

    /// Compute cos and sin tables for positions `0..seq_len`.
    ///
    /// Returns `(cos, sin)` each of shape `[seq_len, rotary_dim]`, with every
    /// frequency repeated for the two features of its pair.
    pub fn compute_freqs(
        &self,
        seq_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let half = self.inv_freq.len();
        let inv_freq = Tensor::from_vec(self.inv_freq.clone(), (1, half), device)?;

        let positions: Vec<f64> = (0..seq_len).map(|i| i as f64).collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), device)?;

        // [seq_len, half] -> [seq_len, half, 2] -> [seq_len, 2*half]: f0 f0 f1 f1 ...
        let freqs = positions.matmul(&inv_freq)?;
        let freqs = Tensor::stack(&[&freqs, &freqs], 2)?.reshape((seq_len, 2 * half))?;

        let cos = freqs.cos()?.to_dtype(dtype)?;
        let sin = freqs.sin()?.to_dtype(dtype)?;
        Ok((cos, sin))
    }

    /// Rotate `x` of shape `[..., seq, head_dim]` by its sequence positions.
    pub fn rotate_queries_or_keys(&self, x: &Tensor) -> Result<Tensor> {
        let rot = self.rotary_dim();
        if rot == 0 {
            return Ok(x.clone());
        }
        let head_dim = x.dim(D::Minus1)?;
        if rot > head_dim {
            return Err(Error::Shape(format!(
                "rotary dim {rot} exceeds head dim {head_dim}"
            )));
        }
        let seq_len = x.dim(D::Minus2)?;
        let (cos, sin) = self.compute_freqs(seq_len, x.dtype(), x.device())?;

        let x_rot = x.narrow(D::Minus1, 0, rot)?.contiguous()?;
        // cos/sin [S, rot] broadcast against [..., S, rot]
        let rotated = (x_rot.broadcast_mul(&cos)? + rotate_half(&x_rot)?.broadcast_mul(&sin)?)?;
        if rot == head_dim {
            return Ok(rotated.contiguous()?);
        }
        // cat along the last axis leaves a strided result; matmul needs it dense.
        let x_pass = x.narrow(D::Minus1, rot, head_dim - rot)?;
        Ok(Tensor::cat(&[&rotated, &x_pass], D::Minus1)?.contiguous()?)
    }
}

/// `(x0, x1, x2, x3, ...) -> (-x1, x0, -x3, x2, ...)`.
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let mut paired = dims.clone();
    let last = paired.pop().unwrap_or(0);
    paired.push(last / 2);
    paired.push(2);

    let x = x.reshape(paired)?;
    let x1 = x.narrow(D::Minus1, 0, 1)?;
    let x2 = x.narrow(D::Minus1, 1, 1)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    Ok(rotated.reshape(dims)?)
}
