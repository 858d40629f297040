//! Envelope type and JSON codec

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::PROTOCOL_VERSION;

/// Kind-specific message body
pub type Payload = serde_json::Map<String, Value>;

/// Errors produced while encoding or decoding an envelope
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bytes are not a JSON object with the envelope shape
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Object has no `v` field
    #[error("envelope has no version")]
    MissingVersion,

    /// `v` is present but not the supported version
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),

    /// Envelope could not be serialized
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Message type carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Device announces itself
    Discover,
    /// Device reports its current state
    State,
    /// Hub asks a device to change state
    Command,
    /// Hub liveness probe
    Ping,
    /// Device answer to a ping
    Pong,
    /// Any type this version does not know about
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Wire name of this type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::State => "state",
            Self::Command => "command",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    #[serde(rename = "v")]
    pub version: u64,

    /// Message type
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Device identifier (empty when the sender omitted it)
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,

    /// Endpoint class (empty when the sender omitted it)
    #[serde(default, deserialize_with = "null_as_default")]
    pub class: String,

    /// Kind-specific fields
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Payload,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Envelope {
    /// Build a current-version envelope
    #[must_use]
    pub fn new(
        kind: MessageType,
        id: impl Into<String>,
        class: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            id: id.into(),
            class: class.into(),
            payload,
        }
    }

    /// Command addressed to a device endpoint
    #[must_use]
    pub fn command(id: impl Into<String>, class: impl Into<String>, payload: Payload) -> Self {
        Self::new(MessageType::Command, id, class, payload)
    }

    /// State report from a device endpoint
    #[must_use]
    pub fn state(id: impl Into<String>, class: impl Into<String>, payload: Payload) -> Self {
        Self::new(MessageType::State, id, class, payload)
    }

    /// Hub ping carrying a unix timestamp in seconds
    #[must_use]
    pub fn ping(id: impl Into<String>, class: impl Into<String>, ts: i64) -> Self {
        let mut payload = Payload::new();
        payload.insert("ts".to_string(), Value::from(ts));
        Self::new(MessageType::Ping, id, class, payload)
    }

    /// String field from the payload
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Whether this envelope carries the supported protocol version
    #[must_use]
    pub const fn is_current_version(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Serialize an envelope to compact JSON bytes
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(CodecError::Encode)
}

/// Parse and validate one datagram
///
/// # Errors
///
/// Returns an error if the bytes are not a JSON object, carry no version,
/// carry a version other than [`PROTOCOL_VERSION`], or have ill-typed fields
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;

    match value.get("v") {
        None | Some(Value::Null) => return Err(CodecError::MissingVersion),
        Some(v) => match v.as_u64() {
            Some(PROTOCOL_VERSION) => {}
            Some(other) => return Err(CodecError::UnsupportedVersion(other)),
            // Negative, fractional or non-numeric versions are never ours
            None => return Err(CodecError::UnsupportedVersion(0)),
        },
    }

    serde_json::from_value(value).map_err(CodecError::Malformed)
}
