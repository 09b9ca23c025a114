//! Forward-pass records: the input batch and the latent posterior.
//!
//! ```text
//! x        [B, F, pos_dim]     ground-truth poses, frame 0 = reference
//! y        [B, F, audio_dim]   audio features
//! mask     [B, F]  u8          1 = valid frame
//! lengths  [B]     u32         valid frame counts
//! z        [F|1, B, audio_latent_dim]   decoder only
//! ```

use candle_core::{Device, Tensor};

use crate::{Error, Result};

/// One batch flowing through the encoder and decoder.
///
/// The encoder fills in [`Batch::x_delta`], the decoder fills in [`Batch::output`].
/// All other fields pass through untouched.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Pose sequence `[B, F, pos_dim]`.
    pub x: Tensor,
    /// Audio features `[B, F, audio_dim]`.
    pub y: Tensor,
    /// Frame validity `[B, F]`, non-zero = valid.
    pub mask: Tensor,
    /// Valid frame counts `[B]`. Carried through the decoder, not read by it.
    pub lengths: Tensor,
    /// Latent sequence `[F or 1, B, audio_latent_dim]`.
    pub z: Option<Tensor>,
    /// `x - x[:, 0]`, set by the encoder.
    pub x_delta: Option<Tensor>,
    /// Decoded pose deltas `[B, F, pos_dim]`, set by the decoder.
    pub output: Option<Tensor>,
}

impl Batch {
    pub fn new(x: Tensor, y: Tensor, mask: Tensor, lengths: Tensor) -> Self {
        Self {
            x,
            y,
            mask,
            lengths,
            z: None,
            x_delta: None,
            output: None,
        }
    }

    /// Build a batch whose mask is derived from per-sample lengths.
    ///
    /// The frame axis of `x` sets the padded length.
    pub fn from_lengths(x: Tensor, y: Tensor, lengths: &[usize]) -> Result<Self> {
        let (batch, frames, _) = x.dims3()?;
        if lengths.len() != batch {
            return Err(Error::Shape(format!(
                "{} lengths for a batch of {batch}",
                lengths.len()
            )));
        }
        let mask = lengths_to_mask(lengths, frames, x.device())?;
        let counts: Vec<u32> = lengths.iter().map(|&l| l.min(frames) as u32).collect();
        let lengths = Tensor::from_vec(counts, batch, x.device())?;
        Ok(Self::new(x, y, mask, lengths))
    }

    /// Attach a latent sequence for decoding.
    pub fn with_latent(mut self, z: Tensor) -> Self {
        self.z = Some(z);
        self
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.mask.dim(0)?)
    }

    pub fn num_frames(&self) -> Result<usize> {
        Ok(self.mask.dim(1)?)
    }

    /// Validity mask as `u8`, `1` = valid.
    pub(crate) fn valid_mask(&self) -> Result<Tensor> {
        Ok(self.mask.ne(0u8)?)
    }

    /// Key padding mask as `u8`, `1` = padded (the logical negation of the mask).
    pub(crate) fn padding_mask(&self) -> Result<Tensor> {
        Ok(self.mask.eq(0u8)?)
    }
}

/// `mask[b, t] = t < lengths[b]`, returned as `[B, max_len]` `u8`.
pub fn lengths_to_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(lengths.len() * max_len);
    for &len in lengths {
        data.extend((0..max_len).map(|t| u8::from(t < len)));
    }
    Ok(Tensor::from_vec(data, (lengths.len(), max_len), device)?)
}

/// Approximate posterior over the latent trajectory.
#[derive(Debug, Clone)]
pub struct LatentParams {
    /// `[F, B, audio_latent_dim]`
    pub mu: Tensor,
    /// `[F, B, audio_latent_dim]`
    pub logvar: Tensor,
}

impl LatentParams {
    /// Reparameterised sample `mu + exp(logvar / 2) * eps`, `eps ~ N(0, 1)`.
    pub fn sample(&self) -> Result<Tensor> {
        let std = (&self.logvar * 0.5)?.exp()?;
        let eps = std.randn_like(0.0, 1.0)?;
        Ok((&self.mu + std.mul(&eps)?)?)
    }

    /// The posterior mean, for deterministic decoding.
    pub fn mean(&self) -> Tensor {
        self.mu.clone()
    }
}
