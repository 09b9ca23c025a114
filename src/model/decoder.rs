//! Pose decoder: latent `z` + reference pose + audio → pose deltas.
//!
//! ```text
//! memory  = ztimelinear(cat[firstposeEmbedding(x_ref), z, audioEmbedding(y)])   [F, B, pl]
//! queries = zeros [F, B, pl] ─ sinusoidal positions ─ init_proj
//!           ─ init_temporal_attn (residual, pre-norm, rotary + relative bias)
//! output  = finallayer(seqTransDecoder(queries, memory, tgt_mask = bias, !mask))
//!           zeroed at padded frames, [B, F, pos_dim]
//! ```
//!
//! ## Weight keys
//!
//! - `firstposeEmbedding`, `audioEmbedding`, `ztimelinear`, `init_proj`, `finallayer`
//! - `time_rel_pos_bias.relative_attention_bias.weight`: `[num_buckets, num_heads]`
//! - `init_temporal_attn.fn.norm.gamma`: `[1, 1, pose_latent_dim]`
//! - `init_temporal_attn.fn.fn.fn.{to_qkv,to_out}.weight`
//! - `seqTransDecoder.layers.{i}.*`

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::debug;

use super::attention::{Attention, AttentionContext, Block};
use super::norm::{PreNorm, Residual};
use super::position::{PositionalEncoding, RelativePositionBias};
use super::rearrange::{AxisLayout, Rearranged};
use super::rope::RotaryEmbedding;
use super::transformer::{DecoderMasks, LayerSpec, TransformerDecoder};
use crate::batch::Batch;
use crate::config::PoseVaeConfig;
use crate::{Error, Result};

type TemporalAttention = Residual<PreNorm<Rearranged<Attention>>>;

#[derive(Debug, Clone)]
pub struct PoseDecoder {
    first_pose_embedding: Linear,
    audio_embedding: Linear,
    ztimelinear: Linear,
    init_proj: Linear,
    sequence_pos_encoder: PositionalEncoding,
    time_rel_pos_bias: RelativePositionBias,
    init_temporal_attn: TemporalAttention,
    seq_trans_decoder: TransformerDecoder,
    finallayer: Linear,
    pose_latent_dim: usize,
    audio_latent_dim: usize,
    num_heads: usize,
}

impl PoseDecoder {
    pub fn new(cfg: &PoseVaeConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let pl = cfg.pose_latent_dim;

        let first_pose_embedding =
            candle_nn::linear(cfg.pos_dim, pl, vb.pp("firstposeEmbedding"))?;
        let audio_embedding =
            candle_nn::linear(cfg.audio_dim, cfg.audio_latent_dim, vb.pp("audioEmbedding"))?;
        let ztimelinear =
            candle_nn::linear(2 * cfg.audio_latent_dim + pl, pl, vb.pp("ztimelinear"))?;
        let init_proj = candle_nn::linear(pl, pl, vb.pp("init_proj"))?;

        let sequence_pos_encoder =
            PositionalEncoding::new(pl, cfg.dropout, cfg.max_positions, vb.device())?;
        let time_rel_pos_bias = RelativePositionBias::new(
            cfg.num_heads,
            cfg.num_buckets,
            cfg.max_distance,
            vb.pp("time_rel_pos_bias"),
        )?;

        // Residual(fn = PreNorm(norm, fn = Rearranged(fn = Attention)))
        let attn_vb = vb.pp("init_temporal_attn").pp("fn");
        let rotary = RotaryEmbedding::new(cfg.rotary_dim(), cfg.rotary_theta);
        let attention = Attention::new(
            pl,
            cfg.num_heads,
            cfg.attention_head_dim,
            Some(rotary),
            attn_vb.pp("fn").pp("fn"),
        )?;
        let init_temporal_attn = Residual::new(PreNorm::new(
            pl,
            cfg.layer_norm_eps,
            Rearranged::new(AxisLayout::SequenceMajor, attention),
            attn_vb,
        )?);

        let spec = LayerSpec {
            d_model: pl,
            num_heads: cfg.num_heads,
            ff_size: cfg.ff_size,
            dropout: cfg.dropout,
            activation: cfg.activation,
            layer_norm_eps: cfg.layer_norm_eps,
        };
        let seq_trans_decoder =
            TransformerDecoder::new(&spec, cfg.num_layers, vb.pp("seqTransDecoder"))?;
        let finallayer = candle_nn::linear(pl, cfg.pos_dim, vb.pp("finallayer"))?;

        debug!(
            pose_latent_dim = pl,
            layers = cfg.num_layers,
            heads = cfg.num_heads,
            buckets = cfg.num_buckets,
            "built pose decoder"
        );

        Ok(Self {
            first_pose_embedding,
            audio_embedding,
            ztimelinear,
            init_proj,
            sequence_pos_encoder,
            time_rel_pos_bias,
            init_temporal_attn,
            seq_trans_decoder,
            finallayer,
            pose_latent_dim: pl,
            audio_latent_dim: cfg.audio_latent_dim,
            num_heads: cfg.num_heads,
        })
    }

    /// `[F|1, B, audio_latent_dim]` -> `[B, F, audio_latent_dim]`
    fn latent_per_frame(&self, z: &Tensor, bs: usize, frames: usize) -> Result<Tensor> {
        let (len, zb, width) = z.dims3()?;
        if zb != bs || width != self.audio_latent_dim || (len != frames && len != 1) {
            return Err(Error::Shape(format!(
                "z is {:?}, expected [{frames} or 1, {bs}, {}]",
                z.dims(),
                self.audio_latent_dim
            )));
        }
        let z = z.transpose(0, 1)?;
        let z = if len == 1 {
            z.broadcast_as((bs, frames, width))?
        } else {
            z
        };
        Ok(z.contiguous()?)
    }

    /// Decode `batch.z` into pose deltas, stored in [`Batch::output`].
    pub fn decode(&self, mut batch: Batch, train: bool) -> Result<Batch> {
        let z = batch.z.as_ref().ok_or(Error::MissingField("z"))?;
        let (bs, frames, _) = batch.x.dims3()?;
        let device = batch.x.device().clone();

        // Memory: [B, F, 2*al + pl] -> [F, B, pl]
        let x_ref = batch.x.narrow(1, 0, 1)?.repeat((1, frames, 1))?;
        let ref_emb = self.first_pose_embedding.forward(&x_ref)?;
        let audio_emb = self.audio_embedding.forward(&batch.y)?;
        let z = self.latent_per_frame(z, bs, frames)?;
        let memory = Tensor::cat(&[&ref_emb, &z, &audio_emb], 2)?;
        let memory = self
            .ztimelinear
            .forward(&memory)?
            .transpose(0, 1)?
            .contiguous()?;

        // Time queries.
        let queries = Tensor::zeros(
            (frames, bs, self.pose_latent_dim),
            memory.dtype(),
            &device,
        )?;
        let queries = self.sequence_pos_encoder.forward(&queries, train)?;
        let bias = self
            .time_rel_pos_bias
            .forward(frames, &device)?
            .to_dtype(memory.dtype())?;
        let queries = self.init_proj.forward(&queries)?;
        let queries = self
            .init_temporal_attn
            .forward(&queries, &AttentionContext::with_pos_bias(&bias))?;

        // [heads, F, F] -> [B * heads, F, F], index b * heads + h.
        let tgt_mask = bias.repeat((bs, 1, 1))?;
        let padding = batch.padding_mask()?;
        let masks = DecoderMasks {
            tgt_mask: Some(&tgt_mask),
            tgt_key_padding_mask: Some(&padding),
        };
        let hidden = self
            .seq_trans_decoder
            .forward(&queries, &memory, &masks, train)?;

        // [F, B, pos_dim], padded frames forced to zero.
        let output = self.finallayer.forward(&hidden)?;
        let valid = batch
            .valid_mask()?
            .t()?
            .unsqueeze(2)?
            .broadcast_as(output.dims())?;
        let zeros = Tensor::zeros(output.dims(), output.dtype(), &device)?;
        let output = valid.where_cond(&output, &zeros)?.transpose(0, 1)?.contiguous()?;
        debug!(
            batch = bs,
            frames,
            heads = self.num_heads,
            output = ?output.dims(),
            "decoded"
        );

        batch.output = Some(output);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> PoseVaeConfig {
        PoseVaeConfig {
            audio_dim: 12,
            pos_dim: 6,
            pose_latent_dim: 8,
            audio_latent_dim: 16,
            ff_size: 32,
            num_layers: 2,
            num_heads: 4,
            attention_head_dim: 8,
            max_positions: 64,
            ..PoseVaeConfig::default()
        }
    }

    fn build(cfg: &PoseVaeConfig) -> (VarMap, PoseDecoder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = PoseDecoder::new(cfg, vb).unwrap();
        (varmap, decoder)
    }

    fn make_batch(cfg: &PoseVaeConfig, bs: usize, frames: usize, lengths: &[usize]) -> Batch {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (bs, frames, cfg.pos_dim), &device).unwrap();
        let y = Tensor::randn(0f32, 1.0, (bs, frames, cfg.audio_dim), &device).unwrap();
        Batch::from_lengths(x, y, lengths).unwrap()
    }

    #[test]
    fn decode_full_mask_shape() {
        let cfg = small_config();
        let (_varmap, decoder) = build(&cfg);
        let z = Tensor::randn(0f32, 1.0, (7, 2, 16), &Device::Cpu).unwrap();
        let batch = make_batch(&cfg, 2, 7, &[7, 7]).with_latent(z);
        let out = decoder.decode(batch, false).unwrap();
        let output = out.output.unwrap();
        assert_eq!(output.dims(), &[2, 7, 6]);
        assert!(out.z.is_some());
    }

    #[test]
    fn padded_frames_are_exactly_zero() {
        let cfg = small_config();
        let (_varmap, decoder) = build(&cfg);
        let z = Tensor::randn(0f32, 1.0, (6, 2, 16), &Device::Cpu).unwrap();
        let batch = make_batch(&cfg, 2, 6, &[6, 4]).with_latent(z);
        let output = decoder.decode(batch, true).unwrap().output.unwrap();

        let rows: Vec<Vec<Vec<f32>>> = output.to_vec3().unwrap();
        for frame in &rows[1][4..] {
            assert!(frame.iter().all(|&v| v == 0.0));
        }
        assert!(rows[1][0].iter().any(|&v| v != 0.0));
        assert!(rows[0][5].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn single_frame_latent_is_broadcast() {
        let cfg = small_config();
        let (_varmap, decoder) = build(&cfg);
        let device = Device::Cpu;
        let z1 = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let zf = z1.repeat((5, 1, 1)).unwrap();
        let batch = make_batch(&cfg, 2, 5, &[5, 5]);

        let a = decoder
            .decode(batch.clone().with_latent(z1), false)
            .unwrap()
            .output
            .unwrap();
        let b = decoder
            .decode(batch.with_latent(zf), false)
            .unwrap()
            .output
            .unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn relative_position_bias_shapes_output() {
        let cfg = small_config();
        let (varmap, decoder) = build(&cfg);
        let z = Tensor::randn(0f32, 1.0, (6, 2, 16), &Device::Cpu).unwrap();
        let batch = make_batch(&cfg, 2, 6, &[6, 6]).with_latent(z);

        let with_bias = decoder
            .decode(batch.clone(), false)
            .unwrap()
            .output
            .unwrap();

        {
            let data = varmap.data().lock().unwrap();
            let table = &data["time_rel_pos_bias.relative_attention_bias.weight"];
            table.set(&table.as_tensor().zeros_like().unwrap()).unwrap();
        }
        let flat = decoder.decode(batch, false).unwrap().output.unwrap();

        let diff: f32 = (with_bias - flat)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 1e-6, "bias had no effect, diff = {diff}");
    }

    #[test]
    fn missing_latent_is_reported() {
        let cfg = small_config();
        let (_varmap, decoder) = build(&cfg);
        let batch = make_batch(&cfg, 1, 4, &[4]);
        assert!(matches!(
            decoder.decode(batch, false),
            Err(Error::MissingField("z"))
        ));
    }

    #[test]
    fn mismatched_latent_is_rejected() {
        let cfg = small_config();
        let (_varmap, decoder) = build(&cfg);
        let z = Tensor::randn(0f32, 1.0, (3, 1, 16), &Device::Cpu).unwrap();
        let batch = make_batch(&cfg, 1, 4, &[4]).with_latent(z);
        assert!(matches!(decoder.decode(batch, false), Err(Error::Shape(_))));
    }

    #[test]
    fn weight_names_follow_checkpoint() {
        let cfg = small_config();
        let (varmap, _decoder) = build(&cfg);
        let data = varmap.data().lock().unwrap();
        assert_eq!(
            data["init_temporal_attn.fn.norm.gamma"].as_tensor().dims(),
            &[1, 1, 8]
        );
        assert_eq!(
            data["init_temporal_attn.fn.fn.fn.to_qkv.weight"]
                .as_tensor()
                .dims(),
            &[3 * 4 * 8, 8]
        );
        assert_eq!(
            data["time_rel_pos_bias.relative_attention_bias.weight"]
                .as_tensor()
                .dims(),
            &[32, 4]
        );
        assert_eq!(data["ztimelinear.weight"].as_tensor().dims(), &[8, 40]);
        for name in [
            "init_proj.weight",
            "finallayer.bias",
            "seqTransDecoder.layers.1.multihead_attn.out_proj.weight",
            "seqTransDecoder.layers.0.norm3.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }
}
