//! Vector encoding helpers.
//!
//! Dense embeddings are stored as one unsigned byte per dimension. The
//! mapping is linear over a declared `[min_val, max_val]` range split into
//! `levels` steps:
//!
//! ```text
//! scale = (max_val - min_val) / (levels - 1)
//! q     = round((clamp(v) - min_val) / scale)
//! v'    = min_val + q * scale
//! ```
//!
//! Values outside the range are clamped (never wrapped) and counted in
//! [`ClampStats`]. The ANN accelerator table stores full-precision vectors,
//! so quantized rows are expanded back with [`Quantization::dequantize`]
//! before they are encoded for it.

use serde::{Deserialize, Serialize};

/// Quantization parameters, persisted per mode in `dense_meta`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
    pub min_val: f32,
    pub max_val: f32,
    pub levels: u32,
}

impl Default for Quantization {
    fn default() -> Self {
        Self::new(-1.0, 1.0, 256)
    }
}

/// Aggregate count of out-of-range values seen while quantizing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClampStats {
    pub values: u64,
    pub vectors: u64,
}

impl ClampStats {
    pub fn is_empty(&self) -> bool {
        self.values == 0
    }
}

impl Quantization {
    pub fn new(min_val: f32, max_val: f32, levels: u32) -> Self {
        Self {
            min_val,
            max_val,
            levels: levels.clamp(2, 256),
        }
    }

    /// True when `[min_val, max_val]` is empty or not finite, so no step
    /// width exists.
    pub fn is_degenerate(&self) -> bool {
        !(self.min_val.is_finite() && self.max_val.is_finite() && self.max_val > self.min_val)
    }

    /// Width of one quantization step.
    pub fn scale(&self) -> f32 {
        (self.max_val - self.min_val) / (self.levels - 1) as f32
    }

    /// Quantize `values`, clamping anything outside `[min_val, max_val]`.
    /// NaN counts as a clamp to `min_val`.
    pub fn quantize(&self, values: &[f32], clamps: &mut ClampStats) -> Vec<u8> {
        let scale = self.scale();
        let top = (self.levels - 1) as f32;
        let mut clamped_here = 0u64;
        let out = values
            .iter()
            .map(|&v| {
                let bounded = if v.is_nan() || v < self.min_val {
                    clamped_here += 1;
                    self.min_val
                } else if v > self.max_val {
                    clamped_here += 1;
                    self.max_val
                } else {
                    v
                };
                ((bounded - self.min_val) / scale).round().clamp(0.0, top) as u8
            })
            .collect();
        if clamped_here > 0 {
            clamps.values += clamped_here;
            clamps.vectors += 1;
        }
        out
    }

    pub fn dequantize(&self, codes: &[u8]) -> Vec<f32> {
        let scale = self.scale();
        codes
            .iter()
            .map(|&q| self.min_val + q as f32 * scale)
            .collect()
    }
}

/// Clamp already-quantized integer codes into `0..=255`.
pub fn clamp_codes(values: &[i64], clamps: &mut ClampStats) -> Vec<u8> {
    let mut clamped_here = 0u64;
    let out = values
        .iter()
        .map(|&v| {
            if !(0..=255).contains(&v) {
                clamped_here += 1;
            }
            v.clamp(0, 255) as u8
        })
        .collect();
    if clamped_here > 0 {
        clamps.values += clamped_here;
        clamps.vectors += 1;
    }
    out
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverses [`vec_to_blob`]. Trailing bytes that do not fill an `f32` are
/// ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Pack a MinHash signature as little-endian `u32` words.
pub fn pack_u32(values: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn unpack_u32(blob: &[u8]) -> Vec<u32> {
    blob.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Element encoding of the ANN accelerator column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnEncoding {
    #[default]
    Float32,
    Uint8,
}

impl AnnEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnEncoding::Float32 => "float32",
            AnnEncoding::Uint8 => "uint8",
        }
    }

    pub fn expected_len(&self, dims: usize) -> usize {
        match self {
            AnnEncoding::Float32 => dims * 4,
            AnnEncoding::Uint8 => dims,
        }
    }

    /// Encode a quantized row for the ANN table.
    pub fn encode(&self, quant: &Quantization, codes: &[u8]) -> Vec<u8> {
        match self {
            AnnEncoding::Float32 => vec_to_blob(&quant.dequantize(codes)),
            AnnEncoding::Uint8 => codes.to_vec(),
        }
    }

    /// SQL column type for `vec0`-style virtual tables.
    pub fn column_type(&self) -> &'static str {
        match self {
            AnnEncoding::Float32 => "float",
            AnnEncoding::Uint8 => "int8",
        }
    }
}

/// True for plain SQL identifiers: `^[A-Za-z_][A-Za-z0-9_]*$`.
pub fn is_safe_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_ranges() {
        assert!(!Quantization::default().is_degenerate());
        assert!(Quantization::new(0.5, 0.5, 256).is_degenerate());
        assert!(Quantization::new(1.0, -1.0, 256).is_degenerate());
        assert!(Quantization::new(f32::NAN, 1.0, 256).is_degenerate());
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let quant = Quantization::default();
        let input = vec![-1.0, -0.5, -0.013, 0.0, 0.25, 0.7777, 1.0];
        let mut clamps = ClampStats::default();
        let codes = quant.quantize(&input, &mut clamps);
        let back = quant.dequantize(&codes);
        for (orig, restored) in input.iter().zip(&back) {
            assert!(
                (orig - restored).abs() <= quant.scale(),
                "{} -> {} exceeds one step {}",
                orig,
                restored,
                quant.scale()
            );
        }
        assert!(clamps.is_empty());
    }

    #[test]
    fn test_out_of_range_values_clamp_not_wrap() {
        let quant = Quantization::default();
        let mut clamps = ClampStats::default();
        let codes = quant.quantize(&[-3.0, 0.0, 2.5, 9.0], &mut clamps);
        assert_eq!(codes[0], 0);
        assert_eq!(codes[2], 255);
        assert_eq!(codes[3], 255);
        assert_eq!(clamps.values, 3);
        assert_eq!(clamps.vectors, 1);

        let codes = quant.quantize(&[0.5], &mut clamps);
        assert_eq!(codes.len(), 1);
        assert_eq!(clamps.vectors, 1, "in-range vector must not count");
    }

    #[test]
    fn test_custom_levels() {
        let quant = Quantization::new(0.0, 1.0, 5);
        let mut clamps = ClampStats::default();
        assert_eq!(quant.quantize(&[0.0, 0.26, 0.5, 1.0], &mut clamps), vec![0, 1, 2, 4]);
        assert_eq!(quant.dequantize(&[4]), vec![1.0]);
    }

    #[test]
    fn test_clamp_codes_counts() {
        let mut clamps = ClampStats::default();
        assert_eq!(clamp_codes(&[-1, 12, 300], &mut clamps), vec![0, 12, 255]);
        assert_eq!(clamps.values, 2);
    }

    #[test]
    fn test_blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.25];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
        assert_eq!(unpack_u32(&pack_u32(&[7, u32::MAX])), vec![7, u32::MAX]);
    }

    #[test]
    fn test_expected_len() {
        assert_eq!(AnnEncoding::Float32.expected_len(384), 1536);
        assert_eq!(AnnEncoding::Uint8.expected_len(384), 384);
    }

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("dense_vectors_ann"));
        assert!(is_safe_identifier("_x9"));
        assert!(!is_safe_identifier("9x"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("a-b"));
        assert!(!is_safe_identifier("t; DROP TABLE chunks"));
    }
}
