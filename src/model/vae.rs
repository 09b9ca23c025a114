//! Encoder + decoder composition.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use super::decoder::PoseDecoder;
use super::encoder::PoseEncoder;
use crate::batch::{Batch, LatentParams};
use crate::config::PoseVaeConfig;
use crate::{Error, Result};

/// The full conditional VAE. Weights live under `encoder.` and `decoder.`.
#[derive(Debug, Clone)]
pub struct PoseVae {
    pub encoder: PoseEncoder,
    pub decoder: PoseDecoder,
    audio_latent_dim: usize,
}

impl PoseVae {
    pub fn new(cfg: &PoseVaeConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = PoseEncoder::new(cfg, vb.pp("encoder"))?;
        let decoder = PoseDecoder::new(cfg, vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            decoder,
            audio_latent_dim: cfg.audio_latent_dim,
        })
    }

    /// Encode, pick `z` (a posterior sample in training, the mean otherwise), decode.
    pub fn forward(&self, mut batch: Batch, train: bool) -> Result<(Batch, LatentParams)> {
        let params = self.encoder.encode(&mut batch, train)?;
        let z = if train {
            params.sample()?
        } else {
            params.mean()
        };
        let batch = self.decoder.decode(batch.with_latent(z), train)?;
        Ok((batch, params))
    }

    /// Decode from a prior draw `z ~ N(0, 1)` of shape `[F, B, audio_latent_dim]`.
    pub fn generate(&self, batch: Batch) -> Result<Batch> {
        let (bs, frames) = (batch.batch_size()?, batch.num_frames()?);
        let z = Tensor::randn(0f32, 1.0, (frames, bs, self.audio_latent_dim), batch.x.device())?
            .to_dtype(batch.x.dtype())?;
        debug!(batch = bs, frames, "sampling from the prior");
        self.decoder.decode(batch.with_latent(z), false)
    }
}

/// Absolute poses `output + x[:, 0]` at valid frames, zero elsewhere.
///
/// `batch` must have been through the decoder.
pub fn reconstruct_poses(batch: &Batch) -> Result<Tensor> {
    let output = batch
        .output
        .as_ref()
        .ok_or(Error::MissingField("output"))?;
    let x_ref = batch.x.narrow(1, 0, 1)?;
    let poses = output.broadcast_add(&x_ref)?;
    let valid = batch
        .valid_mask()?
        .unsqueeze(2)?
        .broadcast_as(poses.dims())?;
    let zeros = poses.zeros_like()?;
    Ok(valid.where_cond(&poses, &zeros)?)
}
