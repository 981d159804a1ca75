//! Payload wire encodings.
//!
//! Every stored record carries the `PayloadCodec` it was written with, so a
//! node can change its default codec without losing access to older records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;
use crate::payload::EncodedPayload;

pub trait PayloadEncoder: Send + Sync {
    fn codec(&self) -> PayloadCodec;

    fn encode(&self, payload: &EncodedPayload) -> Result<Vec<u8>, CodecError>;

    /// Decoded payloads are validated before they are returned.
    fn decode(&self, bytes: &[u8]) -> Result<EncodedPayload, CodecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadCodec {
    #[default]
    Bincode,
    Json,
}

impl PayloadCodec {
    pub fn encoder(self) -> &'static dyn PayloadEncoder {
        match self {
            PayloadCodec::Bincode => &BincodeEncoder,
            PayloadCodec::Json => &JsonEncoder,
        }
    }

    pub fn encode(self, payload: &EncodedPayload) -> Result<Vec<u8>, CodecError> {
        self.encoder().encode(payload)
    }

    pub fn decode(self, bytes: &[u8]) -> Result<EncodedPayload, CodecError> {
        self.encoder().decode(bytes)
    }
}

impl fmt::Display for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadCodec::Bincode => f.write_str("bincode"),
            PayloadCodec::Json => f.write_str("json"),
        }
    }
}

impl FromStr for PayloadCodec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bincode" => Ok(PayloadCodec::Bincode),
            "json" => Ok(PayloadCodec::Json),
            other => Err(CodecError::Decode(format!("unknown codec '{}'", other))),
        }
    }
}

/// Compact binary encoding. Default for storage and the peer wire.
pub struct BincodeEncoder;

impl PayloadEncoder for BincodeEncoder {
    fn codec(&self) -> PayloadCodec {
        PayloadCodec::Bincode
    }

    fn encode(&self, payload: &EncodedPayload) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<EncodedPayload, CodecError> {
        let payload: EncodedPayload =
            bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }
}

pub struct JsonEncoder;

impl PayloadEncoder for JsonEncoder {
    fn codec(&self) -> PayloadCodec {
        PayloadCodec::Json
    }

    fn encode(&self, payload: &EncodedPayload) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<EncodedPayload, CodecError> {
        let payload: EncodedPayload =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }
}
