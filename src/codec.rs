//! Tagged payload serialization.
//!
//! Every argument list, result, signal payload, and custom-state value is
//! persisted as an opaque byte payload whose first byte identifies the codec
//! that produced the remainder. The default codec is JSON; a bincode codec is
//! available behind an explicit opt-in.
//!
//! # Safety of the binary codec
//!
//! Bincode payloads carry no self-describing structure and must never be
//! decoded from untrusted input: a hostile payload can request enormous
//! allocations before any type mismatch is detected. Keep [`Codec::Binary`]
//! for trusted, same-deployment producers only.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Codec tag byte written ahead of the serialized bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// JSON via `serde_json` (default; self-describing, safe for inspection).
    #[default]
    Json,
    /// Bincode. Opt-in only; unsafe for untrusted input.
    Binary,
}

impl Codec {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Codec::Json => b'J',
            Codec::Binary => b'B',
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Codec> {
        match tag {
            b'J' => Some(Codec::Json),
            b'B' => Some(Codec::Binary),
            _ => None,
        }
    }
}

/// An opaque serialized value: one codec tag byte followed by the encoded
/// bytes. Backends round-trip the buffer without modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    /// Encode a value with the given codec.
    pub fn encode<T: Serialize>(codec: Codec, value: &T) -> Result<Payload, CodecError> {
        let mut bytes = Vec::with_capacity(64);
        bytes.push(codec.tag());
        match codec {
            Codec::Json => {
                serde_json::to_writer(&mut bytes, value).map_err(|e| CodecError::encode(e.to_string()))?
            }
            Codec::Binary => {
                let body = bincode::serialize(value).map_err(|e| CodecError::encode(e.to_string()))?;
                bytes.extend_from_slice(&body);
            }
        }
        Ok(Payload { bytes })
    }

    /// Encode with the default JSON codec.
    pub fn json<T: Serialize>(value: &T) -> Result<Payload, CodecError> {
        Payload::encode(Codec::Json, value)
    }

    /// Decode the payload, dispatching on the stored tag byte.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let (tag, body) = self
            .bytes
            .split_first()
            .ok_or_else(|| CodecError::decode("empty payload"))?;
        let codec =
            Codec::from_tag(*tag).ok_or_else(|| CodecError::decode(format!("unknown codec tag 0x{tag:02x}")))?;
        match codec {
            Codec::Json => serde_json::from_slice(body).map_err(|e| CodecError::decode(e.to_string())),
            Codec::Binary => bincode::deserialize(body).map_err(|e| CodecError::decode(e.to_string())),
        }
    }

    /// The codec recorded in the tag byte, if recognizable.
    pub fn codec(&self) -> Option<Codec> {
        self.bytes.first().copied().and_then(Codec::from_tag)
    }

    /// Reconstruct a payload from raw stored bytes (tag byte included).
    pub fn from_bytes(bytes: Vec<u8>) -> Payload {
        Payload { bytes }
    }

    /// The raw bytes, tag byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// A unit payload (`null` under the JSON codec).
    pub fn unit() -> Payload {
        Payload { bytes: vec![b'J', b'n', b'u', b'l', b'l'] }
    }
}

/// Serialization failure. Fatal for the task that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError {
    pub message: String,
    pub during_encode: bool,
}

impl CodecError {
    fn encode(message: impl Into<String>) -> Self {
        Self { message: message.into(), during_encode: true }
    }

    fn decode(message: impl Into<String>) -> Self {
        Self { message: message.into(), during_encode: false }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = if self.during_encode { "encode" } else { "decode" };
        write!(f, "serialization failed ({phase}): {}", self.message)
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_tag() {
        let p = Payload::json(&(1u32, "two".to_string())).unwrap();
        assert_eq!(p.as_bytes()[0], b'J');
        let (a, b): (u32, String) = p.decode().unwrap();
        assert_eq!((a, b.as_str()), (1, "two"));
    }

    #[test]
    fn binary_round_trip() {
        let p = Payload::encode(Codec::Binary, &vec![9i64, 8, 7]).unwrap();
        assert_eq!(p.as_bytes()[0], b'B');
        let v: Vec<i64> = p.decode().unwrap();
        assert_eq!(v, vec![9, 8, 7]);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let p = Payload::from_bytes(vec![b'?', 1, 2, 3]);
        assert!(p.decode::<u8>().is_err());
    }

    #[test]
    fn unit_payload_decodes_as_null() {
        let v: serde_json::Value = Payload::unit().decode().unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn stored_bytes_round_trip_unmodified() {
        let p = Payload::json(&"payload").unwrap();
        let restored = Payload::from_bytes(p.as_bytes().to_vec());
        assert_eq!(restored, p);
    }
}
