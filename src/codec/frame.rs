//! Stream frames, the plaintext inside a stream event's `content`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// What a frame asks the receiving side to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Open a session: dial the destination and start bridging
    #[serde(rename = "CONNECT")]
    Connect,
    /// Open a session, but dial the entry's public address directly
    /// instead of replying over the relays
    #[serde(rename = "CONNECTR")]
    ConnectReverse,
    /// Payload bytes for an established session
    #[serde(rename = "DATA")]
    Data,
}

/// One session frame: session id, type, payload and routing hints.
///
/// Serialized as JSON with base64 payload bytes; unknown fields are
/// ignored so old nodes tolerate newer frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// 16-byte session identifier, generated by the entry
    #[serde(rename = "key")]
    pub session: Uuid,

    /// Frame type
    #[serde(rename = "type")]
    pub frame_type: FrameType,

    /// Payload bytes; empty for control frames
    #[serde(with = "b64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,

    /// `host:port` the exit should reach; set on CONNECT, mirrored or
    /// empty on DATA
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,

    /// Public `host:port` of the entry, set on CONNECT-REVERSE only
    #[serde(
        rename = "entryPublicAddress",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub entry_public_address: String,
}

impl StreamFrame {
    /// A CONNECT frame opening `session` toward `destination`.
    pub fn connect(session: Uuid, destination: impl Into<String>) -> Self {
        Self {
            session,
            frame_type: FrameType::Connect,
            data: Vec::new(),
            destination: destination.into(),
            entry_public_address: String::new(),
        }
    }

    /// A CONNECT-REVERSE frame carrying the entry's public address.
    pub fn connect_reverse(
        session: Uuid,
        destination: impl Into<String>,
        entry_public_address: impl Into<String>,
    ) -> Self {
        Self {
            session,
            frame_type: FrameType::ConnectReverse,
            data: Vec::new(),
            destination: destination.into(),
            entry_public_address: entry_public_address.into(),
        }
    }

    /// A DATA frame carrying payload bytes for `session`.
    pub fn data(session: Uuid, data: Vec<u8>, destination: impl Into<String>) -> Self {
        Self {
            session,
            frame_type: FrameType::Data,
            data,
            destination: destination.into(),
            entry_public_address: String::new(),
        }
    }

    /// Serializes the frame to the bytes that get encrypted.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Parses a frame from decrypted payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::malformed(e.to_string()))
    }
}

mod b64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}
