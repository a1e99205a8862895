//! Stateless PCM conversions.
//!
//! ## Scaling
//!
//! | Direction | Negative samples | Non-negative samples |
//! |-----------|------------------|----------------------|
//! | `f32 → i16` | `× 32768` | `× 32767` |
//! | `i16 → f32` | `÷ 32768` | `÷ 32768` |
//!
//! The asymmetric encode scale matches the signed 16-bit range exactly:
//! `-1.0` maps to `i16::MIN` and `1.0` maps to `i16::MAX`. Decoding always
//! divides by 32768, which is what capture hardware produces, so decoded
//! samples lie in `[-1.0, 1.0)`.
//!
//! PCM bytes are little-endian, the layout every supported capture backend
//! delivers.

pub mod transport;

pub use transport::{base64_to_bytes, bytes_to_base64, decode_base64_strict, EncodedChunk};

use crate::error::{QueuecastError, Result};

/// Convert normalized samples to signed 16-bit PCM.
///
/// Each sample is clamped to `[-1.0, 1.0]`, scaled, then truncated toward
/// zero. `NaN` maps to `0`.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| sample_to_pcm16(s)).collect()
}

#[inline]
fn sample_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        // `as` saturates and maps NaN to 0.
        (s * 32767.0) as i16
    }
}

/// Convert signed 16-bit PCM to normalized samples.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Serialize PCM16 samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Parse little-endian bytes into PCM16 samples.
///
/// # Errors
/// Returns `QueuecastError::MisalignedPcm` when `bytes` has an odd length.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(QueuecastError::MisalignedPcm { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Quantize normalized samples and wrap them in transport form.
pub fn encode_samples(samples: &[f32]) -> EncodedChunk {
    let pcm = float_to_pcm16(samples);
    EncodedChunk::from_bytes(&pcm16_to_bytes(&pcm))
}

/// Decode a transport chunk back into normalized samples.
pub fn decode_samples(chunk: &EncodedChunk) -> Result<Vec<f32>> {
    let bytes = chunk.to_bytes()?;
    let pcm = bytes_to_pcm16(&bytes)?;
    Ok(pcm16_to_float(&pcm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn full_scale_maps_to_i16_extremes() {
        let pcm = float_to_pcm16(&[-1.0, 1.0, 0.0]);
        assert_eq!(pcm, vec![i16::MIN, i16::MAX, 0]);
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let pcm = float_to_pcm16(&[-3.5, 2.0, f32::NAN]);
        assert_eq!(pcm, vec![i16::MIN, i16::MAX, 0]);
    }

    #[test]
    fn scaling_is_asymmetric() {
        // 0.5 * 32767 = 16383.5 → 16383; -0.5 * 32768 = -16384 exactly.
        let pcm = float_to_pcm16(&[0.5, -0.5]);
        assert_eq!(pcm, vec![16_383, -16_384]);
    }

    #[test]
    fn truncates_toward_zero() {
        // 0.25001 * 32767 = 8192.07; -0.25001 * 32768 = -8192.33
        let pcm = float_to_pcm16(&[0.250_01, -0.250_01]);
        assert_eq!(pcm, vec![8192, -8192]);
    }

    #[test]
    fn decode_divides_by_32768() {
        let f = pcm16_to_float(&[i16::MIN, 0, 16_384, i16::MAX]);
        assert_eq!(f[0], -1.0);
        assert_eq!(f[1], 0.0);
        assert_eq!(f[2], 0.5);
        assert_abs_diff_eq!(f[3], 32_767.0 / 32_768.0);
        assert!(f[3] < 1.0);
    }

    #[test]
    fn float_round_trip_stays_within_quantization_error() {
        let step = 1.0 / 32_768.0;
        let input: Vec<f32> = (0..=2000).map(|i| -1.0 + i as f32 * 0.001).collect();
        let back = pcm16_to_float(&float_to_pcm16(&input));
        for (x, y) in input.iter().zip(back.iter()) {
            let x = x.clamp(-1.0, 1.0);
            // Negative samples lose less than one step; the ×32767 encode
            // scale adds up to one more step on the positive side.
            let bound = if x < 0.0 { step } else { 2.0 * step };
            assert!(
                (x - y).abs() <= bound + f32::EPSILON,
                "x={x} y={y} diff={}",
                (x - y).abs()
            );
        }
    }

    #[test]
    fn pcm_bytes_are_little_endian() {
        let bytes = pcm16_to_bytes(&[0x0102, -2]);
        assert_eq!(bytes, vec![0x02, 0x01, 0xFE, 0xFF]);
        assert_eq!(bytes_to_pcm16(&bytes).unwrap(), vec![0x0102, -2]);
    }

    #[test]
    fn odd_byte_length_is_rejected() {
        let err = bytes_to_pcm16(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, QueuecastError::MisalignedPcm { len: 3 }));
    }

    #[test]
    fn empty_inputs_produce_empty_outputs() {
        assert!(float_to_pcm16(&[]).is_empty());
        assert!(pcm16_to_float(&[]).is_empty());
        assert!(pcm16_to_bytes(&[]).is_empty());
        assert!(bytes_to_pcm16(&[]).unwrap().is_empty());
        assert!(decode_samples(&encode_samples(&[])).unwrap().is_empty());
    }

    #[test]
    fn encode_samples_matches_manual_pipeline() {
        let samples = [0.1, -0.2, 0.3];
        let chunk = encode_samples(&samples);
        let bytes = base64_to_bytes(chunk.as_str()).unwrap();
        assert_eq!(bytes, pcm16_to_bytes(&float_to_pcm16(&samples)));

        let decoded = decode_samples(&chunk).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_abs_diff_eq!(decoded[1], -0.2, epsilon = 1.0 / 32_768.0);
    }
}
