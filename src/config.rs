//! Configuration for the pose VAE encoder and decoder.
//!
//! Defaults match the deployed talking-head checkpoints. Every field is optional
//! in JSON; missing fields fall back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Feed-forward activation of the standard transformer layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Exact (erf) GELU.
    #[default]
    Gelu,
    Relu,
}

/// Shared configuration of [`PoseEncoder`](crate::model::encoder::PoseEncoder)
/// and [`PoseDecoder`](crate::model::decoder::PoseDecoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseVaeConfig {
    /// Expected maximum sequence length. Advisory only.
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,

    /// Raw audio feature width.
    #[serde(default = "default_audio_dim")]
    pub audio_dim: usize,

    /// Raw pose feature width (7 in the released config, 6 downstream).
    #[serde(default = "default_pos_dim")]
    pub pos_dim: usize,

    /// Width of the reference/per-frame pose embeddings.
    #[serde(default = "default_pose_latent_dim")]
    pub pose_latent_dim: usize,

    /// Width of the audio embedding and of the latent `z`.
    #[serde(default = "default_audio_latent_dim")]
    pub audio_latent_dim: usize,

    /// Feed-forward inner width of the transformer stacks.
    #[serde(default = "default_ff_size")]
    pub ff_size: usize,

    /// Number of layers in each transformer stack.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Number of attention heads.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Dropout probability (only active in training mode).
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    #[serde(default)]
    pub activation: Activation,

    /// Free-form experiment tag. Inert.
    #[serde(default)]
    pub ablation: Option<String>,

    /// Relative position buckets (decoder only).
    #[serde(default = "default_num_buckets")]
    pub num_buckets: usize,

    /// Distance at which the logarithmic buckets saturate (decoder only).
    #[serde(default = "default_max_distance")]
    pub max_distance: usize,

    /// Per-head width of the decoder's temporal attention.
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: usize,

    /// Base frequency of the rotary embedding.
    #[serde(default = "default_rotary_theta")]
    pub rotary_theta: f64,

    /// Rows in the sinusoidal positional table.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Epsilon of every layer norm.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl Default for PoseVaeConfig {
    fn default() -> Self {
        Self {
            num_frames: default_num_frames(),
            audio_dim: default_audio_dim(),
            pos_dim: default_pos_dim(),
            pose_latent_dim: default_pose_latent_dim(),
            audio_latent_dim: default_audio_latent_dim(),
            ff_size: default_ff_size(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            dropout: default_dropout(),
            activation: Activation::default(),
            ablation: None,
            num_buckets: default_num_buckets(),
            max_distance: default_max_distance(),
            attention_head_dim: default_attention_head_dim(),
            rotary_theta: default_rotary_theta(),
            max_positions: default_max_positions(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl PoseVaeConfig {
    /// Read a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Width of the encoder's transformer stack: reference + pose + audio embeddings.
    pub fn latent_dim(&self) -> usize {
        self.audio_latent_dim + 2 * self.pose_latent_dim
    }

    /// Number of rotary features per head in the decoder's temporal attention.
    pub fn rotary_dim(&self) -> usize {
        self.num_heads.min(32)
    }

    /// Check the geometric constraints the layers rely on.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(Error::Config("num_heads must be positive".into()));
        }
        for (name, width) in [
            ("audio_latent_dim + 2 * pose_latent_dim", self.latent_dim()),
            ("pose_latent_dim", self.pose_latent_dim),
        ] {
            if width % self.num_heads != 0 {
                return Err(Error::Config(format!(
                    "{name} ({width}) must be divisible by num_heads ({})",
                    self.num_heads
                )));
            }
            if width % 2 != 0 {
                return Err(Error::Config(format!(
                    "{name} ({width}) must be even for the sinusoidal encoding"
                )));
            }
        }
        if self.rotary_dim() > self.attention_head_dim {
            return Err(Error::Config(format!(
                "rotary dim {} exceeds attention_head_dim {}",
                self.rotary_dim(),
                self.attention_head_dim
            )));
        }
        if self.num_buckets < 4 {
            return Err(Error::Config(format!(
                "num_buckets ({}) must be at least 4",
                self.num_buckets
            )));
        }
        let max_exact = self.num_buckets / 4;
        if self.max_distance <= max_exact {
            return Err(Error::Config(format!(
                "max_distance ({}) must exceed num_buckets / 4 ({max_exact})",
                self.max_distance
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout ({}) must be in [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }
}

fn default_num_frames() -> usize {
    200
}
fn default_audio_dim() -> usize {
    1024
}
fn default_pos_dim() -> usize {
    7
}
fn default_pose_latent_dim() -> usize {
    64
}
fn default_audio_latent_dim() -> usize {
    256
}
fn default_ff_size() -> usize {
    1024
}
fn default_num_layers() -> usize {
    4
}
fn default_num_heads() -> usize {
    4
}
fn default_dropout() -> f32 {
    0.1
}
fn default_num_buckets() -> usize {
    32
}
fn default_max_distance() -> usize {
    32
}
fn default_attention_head_dim() -> usize {
    32
}
fn default_rotary_theta() -> f64 {
    10_000.0
}
fn default_max_positions() -> usize {
    20_000
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
