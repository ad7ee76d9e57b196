use crate::{ConsensusError, Result};
use serde::{Deserialize, Serialize};

/// Encoding of structured values to and from wire bytes.
///
/// Encode/decode is a bijection on the protocol message types: equal
/// logical messages encode to equal bytes and decode back to equal values.
pub trait WireCodec {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>>
    where
        T: Serialize;

    fn decode<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>;
}

/// Compact binary codec; the default for node-to-node traffic.
#[derive(Debug, Default, Clone)]
pub struct BinaryCodec;

impl WireCodec for BinaryCodec {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        bincode::serialize(value)
            .map_err(|e| ConsensusError::codec(format!("binary encode failed: {}", e)))
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        bincode::deserialize(bytes)
            .map_err(|e| ConsensusError::codec(format!("binary decode failed: {}", e)))
    }
}

/// Human-readable codec for diagnostics and tests.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        serde_json::to_vec(value)
            .map_err(|e| ConsensusError::codec(format!("json encode failed: {}", e)))
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_slice(bytes)
            .map_err(|e| ConsensusError::codec(format!("json decode failed: {}", e)))
    }
}

/// Codec selection without trait objects.
#[derive(Debug, Clone)]
pub enum Codec {
    Binary(BinaryCodec),
    Json(JsonCodec),
}

impl Default for Codec {
    fn default() -> Self {
        Self::Binary(BinaryCodec)
    }
}

impl WireCodec for Codec {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>>
    where
        T: Serialize,
    {
        match self {
            Self::Binary(c) => c.encode(value),
            Self::Json(c) => c.encode(value),
        }
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self {
            Self::Binary(c) => c.decode(bytes),
            Self::Json(c) => c.decode(bytes),
        }
    }
}
