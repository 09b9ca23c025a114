//! Pose encoder: ground-truth pose deltas + audio → per-frame posterior over `z`.
//!
//! ```text
//! x_ref = x[:, 0]                 ─ firstposeEmbedding ─ repeat F ─┐
//! x_delta = x - x_ref             ─ poseEmbedding ─────────────────┼─ cat → [F, B, latent_dim]
//! y                               ─ audioEmbedding ────────────────┘
//!   ─ sinusoidal positions ─ seqTransEncoder (key padding = !mask)
//!   ─ mu_layer / sigma_layer → [F, B, audio_latent_dim]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::debug;

use super::position::PositionalEncoding;
use super::transformer::{LayerSpec, TransformerEncoder};
use crate::batch::{Batch, LatentParams};
use crate::config::PoseVaeConfig;
use crate::Result;

/// Maps a batch to the mean and log-variance of its latent trajectory.
#[derive(Debug, Clone)]
pub struct PoseEncoder {
    first_pose_embedding: Linear,
    pose_embedding: Linear,
    audio_embedding: Linear,
    sequence_pos_encoder: PositionalEncoding,
    seq_trans_encoder: TransformerEncoder,
    mu_layer: Linear,
    sigma_layer: Linear,
}

impl PoseEncoder {
    pub fn new(cfg: &PoseVaeConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let latent_dim = cfg.latent_dim();

        let first_pose_embedding =
            candle_nn::linear(cfg.pos_dim, cfg.pose_latent_dim, vb.pp("firstposeEmbedding"))?;
        let pose_embedding =
            candle_nn::linear(cfg.pos_dim, cfg.pose_latent_dim, vb.pp("poseEmbedding"))?;
        let audio_embedding =
            candle_nn::linear(cfg.audio_dim, cfg.audio_latent_dim, vb.pp("audioEmbedding"))?;

        let sequence_pos_encoder = PositionalEncoding::new(
            latent_dim,
            cfg.dropout,
            cfg.max_positions,
            vb.device(),
        )?;

        let spec = LayerSpec {
            d_model: latent_dim,
            num_heads: cfg.num_heads,
            ff_size: cfg.ff_size,
            dropout: cfg.dropout,
            activation: cfg.activation,
            layer_norm_eps: cfg.layer_norm_eps,
        };
        let seq_trans_encoder =
            TransformerEncoder::new(&spec, cfg.num_layers, vb.pp("seqTransEncoder"))?;

        let mu_layer = candle_nn::linear(latent_dim, cfg.audio_latent_dim, vb.pp("mu_layer"))?;
        let sigma_layer =
            candle_nn::linear(latent_dim, cfg.audio_latent_dim, vb.pp("sigma_layer"))?;

        debug!(
            latent_dim,
            layers = cfg.num_layers,
            heads = cfg.num_heads,
            "built pose encoder"
        );

        Ok(Self {
            first_pose_embedding,
            pose_embedding,
            audio_embedding,
            sequence_pos_encoder,
            seq_trans_encoder,
            mu_layer,
            sigma_layer,
        })
    }

    /// Encode `batch`, storing `x - x[:, 0]` in [`Batch::x_delta`].
    pub fn encode(&self, batch: &mut Batch, train: bool) -> Result<LatentParams> {
        let (bs, frames, _) = batch.x.dims3()?;

        let x_ref = batch.x.narrow(1, 0, 1)?;
        let x_delta = batch.x.broadcast_sub(&x_ref)?;

        // Sequence-major: [F, B, C].
        let x_ref = x_ref.transpose(0, 1)?.contiguous()?;
        let x = x_delta.transpose(0, 1)?.contiguous()?;
        let y = batch.y.transpose(0, 1)?.contiguous()?;

        let ref_emb = self.first_pose_embedding.forward(&x_ref)?.repeat((frames, 1, 1))?;
        let pose_emb = self.pose_embedding.forward(&x)?;
        let audio_emb = self.audio_embedding.forward(&y)?;
        let xs = Tensor::cat(&[&ref_emb, &pose_emb, &audio_emb], 2)?;

        let xs = self.sequence_pos_encoder.forward(&xs, train)?;
        let padding = batch.padding_mask()?;
        let hidden = self
            .seq_trans_encoder
            .forward(&xs, Some(&padding), train)?;

        let mu = self.mu_layer.forward(&hidden)?;
        let logvar = self.sigma_layer.forward(&hidden)?;
        debug!(batch = bs, frames, mu = ?mu.dims(), "encoded");

        batch.x_delta = Some(x_delta);
        Ok(LatentParams { mu, logvar })
    }
}
