//! Audio-driven head pose generation in pure Rust.
//!
//! A candle-based conditional VAE that turns a reference pose and a sequence of
//! audio features into a sequence of head poses. Loads safetensors exported from
//! the reference checkpoints directly.
//!
//! ## Architecture
//!
//! ```text
//! x (poses), y (audio) ── PoseEncoder ──→ mu, logvar   [F, B, audio_latent_dim]
//!                                            │ sample / mean / prior
//!                                            ↓
//! x[:, 0], y, z ───────── PoseDecoder ──→ output       [B, F, pos_dim]
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: the typed batch record, latent parameters, length masks
//! - [`config`]: JSON-backed hyper-parameters
//! - [`model`]: encoder, decoder and their building blocks

pub mod batch;
pub mod config;
pub mod model;

mod error;

pub use batch::{Batch, LatentParams};
pub use config::PoseVaeConfig;
pub use error::{Error, Result};
pub use model::vae::PoseVae;
