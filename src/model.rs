//! Model components for the pose VAE.
//!
//! ## Components
//!
//! - [`encoder`]: pose + audio → per-frame posterior `(mu, logvar)`
//! - [`decoder`]: latent + reference pose + audio → pose deltas
//! - [`vae`]: encoder/decoder composition with reparameterised sampling
//! - [`transformer`]: post-norm encoder/decoder stacks with packed multi-head attention
//! - [`attention`]: temporal attention with relative bias, rotary q/k and focus masking
//! - [`position`], [`rope`]: positional encodings
//! - [`norm`], [`rearrange`]: wrappers composed around [`attention::Attention`]

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod norm;
pub mod position;
pub mod rearrange;
pub mod rope;
pub mod transformer;
pub mod vae;
