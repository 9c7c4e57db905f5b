//! Binary codec for the device wire format.
//!
//! Frames are packed little-endian IEEE-754 `f32` values with no header,
//! padding or checksum:
//!
//! ```text
//! ┌──────────┬──────────┬─────┬──────────────┐
//! │ f32 (LE) │ f32 (LE) │ ... │ f32 (LE)     │
//! └──────────┴──────────┴─────┴──────────────┘
//!   field 0    field 1          field N-1
//! ```

use crate::error::{GatewayError, Result};
use bytes::{Buf, BufMut};

/// Width of one encoded value in bytes.
pub const FLOAT_WIDTH: usize = 4;

/// Decode a frame of exactly `field_count` floats.
pub fn decode(buffer: &[u8], field_count: usize) -> Result<Vec<f32>> {
    let expected = field_count * FLOAT_WIDTH;
    if buffer.len() != expected {
        return Err(GatewayError::MalformedFrame {
            expected,
            actual: buffer.len(),
        });
    }

    let mut cursor = buffer;
    let mut values = Vec::with_capacity(field_count);
    while cursor.has_remaining() {
        values.push(cursor.get_f32_le());
    }
    Ok(values)
}

/// Encode a single control value.
#[inline]
pub fn encode(value: f32) -> [u8; FLOAT_WIDTH] {
    value.to_le_bytes()
}

/// Encode a full frame in the order given.
pub fn encode_frame(values: &[f32]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(values.len() * FLOAT_WIDTH);
    for value in values {
        frame.put_f32_le(*value);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_encode_is_little_endian() {
        assert_eq!(encode(1.0), [0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(encode(2.5), [0x00, 0x00, 0x20, 0x40]);
        assert_eq!(encode(-0.0), [0x00, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_frame_roundtrip_is_bit_exact() {
        let values = [1.0, 0.42, -3.75, f32::MIN_POSITIVE, f32::MAX, 0.0, -0.0];
        let decoded = decode(&encode_frame(&values), values.len()).unwrap();

        let expected_bits: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        let decoded_bits: Vec<u32> = decoded.iter().map(|v| v.to_bits()).collect();
        assert_eq!(expected_bits, decoded_bits);
    }

    #[test]
    fn test_non_finite_values_pass_through() {
        let values = [f32::NAN, f32::INFINITY, f32::NEG_INFINITY];
        let decoded = decode(&encode_frame(&values), 3).unwrap();

        assert!(decoded[0].is_nan());
        assert_eq!(decoded[0].to_bits(), f32::NAN.to_bits());
        assert_eq!(decoded[1], f32::INFINITY);
        assert_eq!(decoded[2], f32::NEG_INFINITY);
    }

    #[test]
    fn test_rejects_wrong_length() {
        // Not a multiple of four.
        assert!(matches!(
            decode(&[0u8; 7], 3),
            Err(GatewayError::MalformedFrame { expected: 12, actual: 7 })
        ));
        // Multiple of four but wrong field count.
        assert!(matches!(
            decode(&[0u8; 16], 3),
            Err(GatewayError::MalformedFrame { expected: 12, actual: 16 })
        ));
        assert!(matches!(
            decode(&[], 1),
            Err(GatewayError::MalformedFrame { expected: 4, actual: 0 })
        ));
    }

    #[test]
    fn test_decode_from_shared_payload() {
        // Bus payloads arrive as `Bytes`, possibly a view into a larger buffer.
        let payload = Bytes::from(encode_frame(&[9.0, 1.5, -2.0]));
        let tail = payload.slice(FLOAT_WIDTH..);
        assert_eq!(decode(&tail, 2).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn test_decode_keeps_buffer_order() {
        let frame = encode_frame(&[1.0, 2.0, 3.0]);
        assert_eq!(decode(&frame, 3).unwrap(), vec![1.0, 2.0, 3.0]);
    }
}
