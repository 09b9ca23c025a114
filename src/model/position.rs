//! Positional information: fixed sinusoidal encoding and learned relative bias.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, VarBuilder};

use crate::{Error, Result};

/// Pairs further apart than this are hard-masked regardless of their bucket.
pub const MAX_ATTENDED_OFFSET: i64 = 32;

/// Penalty added to hard-masked pairs.
pub const DISTANT_PAIR_PENALTY: f64 = -1e8;

// ---------------------------------------------------------------------------
// Sinusoidal positional encoding
// ---------------------------------------------------------------------------

/// Fixed sinusoidal encoding added to sequence-major inputs `[len, batch, d_model]`.
///
/// Even features carry `sin(pos / 10000^(2i/d))`, odd features the matching `cos`.
/// No learnable parameters.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// `[max_len, 1, d_model]`
    pe: Tensor,
    dropout: Dropout,
}

impl PositionalEncoding {
    pub fn new(d_model: usize, dropout: f32, max_len: usize, device: &Device) -> Result<Self> {
        if d_model % 2 != 0 {
            return Err(Error::Config(format!(
                "sinusoidal encoding needs an even width, got {d_model}"
            )));
        }
        let half_d = d_model / 2;

        // div_term = exp(arange(0, d, 2) * -(ln(10000) / d))
        let div_term: Vec<f32> = (0..half_d)
            .map(|i| (-((2 * i) as f64) * (10000.0_f64).ln() / d_model as f64).exp() as f32)
            .collect();
        let div_term = Tensor::from_vec(div_term, (1, half_d), device)?;

        let position: Vec<f32> = (0..max_len).map(|p| p as f32).collect();
        let position = Tensor::from_vec(position, (max_len, 1), device)?;

        // [max_len, half_d]
        let args = position.broadcast_mul(&div_term)?;

        // Interleave: [sin0, cos0, sin1, cos1, ...]
        let sin = args.sin()?.unsqueeze(2)?;
        let cos = args.cos()?.unsqueeze(2)?;
        let pe = Tensor::cat(&[&sin, &cos], 2)?.reshape((max_len, 1, d_model))?;

        Ok(Self {
            pe,
            dropout: Dropout::new(dropout),
        })
    }

    /// Add the first `len` rows to `xs: [len, batch, d_model]`, then dropout.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let len = xs.dim(0)?;
        let pe = self.pe.narrow(0, 0, len)?.to_dtype(xs.dtype())?;
        let xs = xs.broadcast_add(&pe)?;
        Ok(self.dropout.forward(&xs, train)?)
    }
}

// ---------------------------------------------------------------------------
// Relative position bias
// ---------------------------------------------------------------------------

/// Bucketize a signed offset `key - query`.
///
/// Half of the buckets hold non-negative `query - key` distances, the other half
/// negative ones. Within a half, the first `max_exact = num_buckets / 4` buckets
/// are exact and the rest grow logarithmically up to `max_distance`.
pub fn relative_position_bucket(
    relative_position: i64,
    num_buckets: usize,
    max_distance: usize,
) -> usize {
    let mut n = -relative_position;
    let half = (num_buckets / 2) as i64;

    let mut bucket = 0;
    if n < 0 {
        bucket += half;
    }
    n = n.abs();

    let max_exact = half / 2;
    if n < max_exact {
        return (bucket + n) as usize;
    }

    // Evaluated in f32 so boundaries land where the reference tables put them.
    let log_ratio =
        (n as f32 / max_exact as f32).ln() / (max_distance as f32 / max_exact as f32).ln();
    let large = max_exact + (log_ratio * (half - max_exact) as f32) as i64;
    (bucket + large.min(half - 1)) as usize
}

/// Learned per-head bias over bucketized relative positions, with a hard cutoff
/// for pairs more than [`MAX_ATTENDED_OFFSET`] frames apart.
#[derive(Debug, Clone)]
pub struct RelativePositionBias {
    /// `[num_buckets, heads]`
    relative_attention_bias: Embedding,
    num_buckets: usize,
    max_distance: usize,
}

impl RelativePositionBias {
    pub fn new(
        heads: usize,
        num_buckets: usize,
        max_distance: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let relative_attention_bias =
            candle_nn::embedding(num_buckets, heads, vb.pp("relative_attention_bias"))?;
        Ok(Self {
            relative_attention_bias,
            num_buckets,
            max_distance,
        })
    }

    /// Bucket index matrix `[n, n]` for offsets `j - i`.
    pub fn buckets(&self, n: usize, device: &Device) -> Result<Tensor> {
        let mut data = Vec::with_capacity(n * n);
        for i in 0..n as i64 {
            for j in 0..n as i64 {
                let bucket = relative_position_bucket(j - i, self.num_buckets, self.max_distance);
                data.push(bucket as u32);
            }
        }
        Ok(Tensor::from_vec(data, (n, n), device)?)
    }

    /// Bias `[heads, n, n]` for a sequence of `n` frames.
    pub fn forward(&self, n: usize, device: &Device) -> Result<Tensor> {
        let buckets = self.buckets(n, device)?;
        // [n, n, heads] -> [heads, n, n]
        let values = self
            .relative_attention_bias
            .forward(&buckets)?
            .permute((2, 0, 1))?
            .contiguous()?;

        let mut penalty = Vec::with_capacity(n * n);
        for i in 0..n as i64 {
            for j in 0..n as i64 {
                let far = (j - i).abs() > MAX_ATTENDED_OFFSET;
                penalty.push(if far { DISTANT_PAIR_PENALTY } else { 0.0 });
            }
        }
        let penalty = Tensor::from_vec(penalty, (n, n), device)?.to_dtype(values.dtype())?;
        Ok(values.broadcast_add(&penalty)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn positional_table_starts_with_sin0_cos0() {
        let pe = PositionalEncoding::new(8, 0.1, 16, &Device::Cpu).unwrap();
        assert_eq!(pe.pe.dims(), &[16, 1, 8]);
        let row0: Vec<f32> = pe.pe.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(row0, vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn positional_table_matches_closed_form() {
        let d = 6;
        let pe = PositionalEncoding::new(d, 0.0, 10, &Device::Cpu).unwrap();
        let row: Vec<f32> = pe.pe.get(7).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for i in 0..d / 2 {
            let angle = 7.0 / 10000f64.powf((2 * i) as f64 / d as f64);
            assert!((row[2 * i] as f64 - angle.sin()).abs() < 1e-5);
            assert!((row[2 * i + 1] as f64 - angle.cos()).abs() < 1e-5);
        }
    }

    #[test]
    fn positional_forward_broadcasts_over_batch() {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(4, 0.1, 32, &device).unwrap();
        let x = Tensor::zeros((5, 3, 4), DType::F32, &device).unwrap();
        // Eval mode: dropout is a no-op, so every batch column equals the table.
        let y = pe.forward(&x, false).unwrap();
        assert_eq!(y.dims(), &[5, 3, 4]);
        let col0: Vec<f32> = y.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let col2: Vec<f32> = y.narrow(1, 2, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(col0, col2);
    }

    #[test]
    fn positional_rejects_odd_width() {
        assert!(PositionalEncoding::new(5, 0.1, 8, &Device::Cpu).is_err());
    }

    #[test]
    fn bucket_halves_are_disjoint_and_monotone() {
        let (num_buckets, max_distance) = (32, 32);
        let half = num_buckets / 2;
        let mut prev_pos = 0;
        let mut prev_neg = half;
        for k in 1..200i64 {
            let pos = relative_position_bucket(-k, num_buckets, max_distance);
            let neg = relative_position_bucket(k, num_buckets, max_distance);
            assert!(pos < half, "bucket({}) = {pos}", -k);
            assert!((half..num_buckets).contains(&neg), "bucket({k}) = {neg}");
            assert!(pos >= prev_pos);
            assert!(neg >= prev_neg);
            prev_pos = pos;
            prev_neg = neg;
        }
        assert_eq!(relative_position_bucket(0, num_buckets, max_distance), 0);
    }

    #[test]
    fn bucket_reference_values() {
        // num_buckets = 32, max_distance = 32: exact below 8, log-spaced above.
        let b = |k| relative_position_bucket(k, 32, 32);
        assert_eq!(b(-3), 3);
        assert_eq!(b(3), 19);
        assert_eq!(b(-8), 8);
        assert_eq!(b(-16), 12);
        assert_eq!(b(-31), 15);
        assert_eq!(b(-1000), 15);
        assert_eq!(b(1000), 31);
    }

    #[test]
    fn bias_shape_and_hard_cutoff() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let rpb = RelativePositionBias::new(4, 32, 32, vb).unwrap();

        let n = 40;
        let bias = rpb.forward(n, &device).unwrap();
        assert_eq!(bias.dims(), &[4, n, n]);

        let values: Vec<Vec<Vec<f32>>> = bias.to_vec3().unwrap();
        // Offsets 33 and 34 share the saturated bucket, so only the penalty differs.
        for head in &values {
            let near = head[0][32]; // offset 32, not masked
            let far = head[0][33]; // offset 33, masked
            let unmasked_far = head[1][33]; // offset 32 again
            assert!(near > -1e7);
            assert!(far <= unmasked_far - 1e8 + 1e3);
            assert!(head[39][0] < -1e7);
            assert!(head[39][7] > -1e7);
        }
    }

    #[test]
    fn bias_is_shared_along_diagonals() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let rpb = RelativePositionBias::new(2, 32, 32, vb).unwrap();
        let values: Vec<Vec<Vec<f32>>> = rpb.forward(10, &device).unwrap().to_vec3().unwrap();
        for head in &values {
            assert_eq!(head[0][3], head[5][8]);
            assert_eq!(head[4][1], head[9][6]);
        }
    }
}
