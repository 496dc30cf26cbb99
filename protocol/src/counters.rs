//! Instrumentation counters reported back to the operator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of one instrument/deinstrument batch.
///
/// Serializes as JSON over the HTTP bridge; `encode`/`decode` provide the
/// stable fixed-order binary form used when the record has to cross the
/// attach boundary as a raw byte payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Classes successfully retransformed in this batch.
    #[serde(default)]
    pub classes_count: u32,
    /// Methods instrumented (or removed, for a deinstrument batch).
    #[serde(default)]
    pub methods_count: u32,
    /// Classes whose retransform failed; failures never abort the batch.
    #[serde(default)]
    pub failed_classes_count: u32,
}

#[derive(Debug, Error)]
#[error("counters record truncated: got {0} bytes, need {ENCODED_LEN}", ENCODED_LEN = Counters::ENCODED_LEN)]
pub struct CountersDecodeError(pub usize);

impl Counters {
    pub const ENCODED_LEN: usize = 12;

    /// Fixed-order big-endian encoding: classes, methods, failed classes.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.classes_count.to_be_bytes());
        out[4..8].copy_from_slice(&self.methods_count.to_be_bytes());
        out[8..12].copy_from_slice(&self.failed_classes_count.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CountersDecodeError> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(CountersDecodeError(bytes.len()));
        }
        let word = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[i..i + 4]);
            u32::from_be_bytes(buf)
        };
        Ok(Counters {
            classes_count: word(0),
            methods_count: word(4),
            failed_classes_count: word(8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_fixed_order_big_endian() {
        let c = Counters {
            classes_count: 1,
            methods_count: 0x0203,
            failed_classes_count: 4,
        };
        let bytes = c.encode();
        assert_eq!(
            bytes,
            [0, 0, 0, 1, 0, 0, 2, 3, 0, 0, 0, 4],
            "field order and endianness are part of the wire contract"
        );
    }

    #[test]
    fn test_decode_roundtrip() {
        let c = Counters {
            classes_count: 42,
            methods_count: 1234,
            failed_classes_count: 7,
        };
        let decoded = Counters::decode(&c.encode()).unwrap();
        assert_eq!(decoded, c);
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let err = Counters::decode(&[0u8; 11]).unwrap_err();
        assert_eq!(err.0, 11);
    }

    #[test]
    fn test_serde_roundtrip() {
        let c = Counters {
            classes_count: 3,
            methods_count: 9,
            failed_classes_count: 1,
        };
        let json = serde_json::to_string(&c).expect("serialize");
        let decoded: Counters = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, c);
    }
}
