//! Serialize-then-compress codec for cached entries.
//! `bincode` handles the binary framing for any payload; `zstd` is
//! applied on top when the configured codec asks for it, otherwise the
//! raw `bincode` bytes are stored as-is.

use dataplane_core::config::Compression;
use dataplane_core::{Error, Result};
use serde::{Deserialize, Serialize};

pub fn encode<T: Serialize>(value: &T, codec: Compression) -> Result<Vec<u8>> {
    let raw = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
    match codec {
        Compression::None => Ok(raw),
        Compression::Zstd => zstd::encode_all(raw.as_slice(), 0).map_err(|e| Error::Serialization(e.to_string())),
    }
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], codec: Compression) -> Result<T> {
    let raw = match codec {
        Compression::None => bytes.to_vec(),
        Compression::Zstd => zstd::decode_all(bytes).map_err(|e| Error::Serialization(e.to_string()))?,
    };
    bincode::deserialize(&raw).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_round_trip_preserves_value() {
        let value = "hello cache".to_string();
        let encoded = encode(&value, Compression::Zstd).unwrap();
        let decoded: String = decode(&encoded, Compression::Zstd).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn uncompressed_round_trip_preserves_value() {
        let value = vec![1u8, 2, 3, 4];
        let encoded = encode(&value, Compression::None).unwrap();
        let decoded: Vec<u8> = decode(&encoded, Compression::None).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn corrupted_payload_fails_to_decode() {
        let garbage = vec![0xffu8; 8];
        let result: Result<String> = decode(&garbage, Compression::None);
        assert!(result.is_err());
    }
}
