//! Wire formats.
//!
//! Two layers travel over the rendezvous socket:
//!
//! ```text
//! participant ──ClientFrame──► rendezvous ──ServerFrame──► participant
//!                 │                               │
//!                 ├─ control: JSON text, tag "kind"
//!                 ├─ data:    {kind:"data", link, payload: <PeerMessage | any JSON>}
//!                 └─ media:   binary, bincode-encoded MediaPacket
//! ```
//!
//! `PeerMessage` is what the two participants say to each other over a
//! data channel; the rendezvous never looks inside `payload`.

use serde::{Deserialize, Serialize};
use tandem_store::Version;
use thiserror::Error;
use uuid::Uuid;

/// Origin marker carried by every `db-sync` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
}

/// One replicated store write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub key: String,
    pub value: serde_json::Value,
    /// Empty when the sender had no version; treated as a local-origin write.
    #[serde(default)]
    pub version: String,
    pub source: Source,
}

impl SyncUpdate {
    /// The carried version, if it is a usable token.
    pub fn version(&self) -> Option<Version> {
        Version::parse(self.version.clone())
    }
}

/// Messages exchanged between the two participants over the data channel.
///
/// Dispatched on the `type` field. Anything that does not parse as one of
/// these is still delivered to listeners as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    DbSync(SyncUpdate),
}

impl PeerMessage {
    pub fn db_sync(key: impl Into<String>, value: serde_json::Value, version: &Version) -> Self {
        Self::DbSync(SyncUpdate {
            key: key.into(),
            value,
            version: version.to_string(),
            source: Source::Local,
        })
    }

    /// Recognise a received payload. `None` for foreign message kinds.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// A block of mono PCM audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub pcm: Vec<i16>,
}

impl AudioFrame {
    pub fn silence(sample_rate: u32, samples: usize) -> Self {
        Self {
            sample_rate,
            pcm: vec![0; samples],
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.pcm.len() as f64 / self.sample_rate as f64
    }
}

/// Audio on a media call, routed by `call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPacket {
    pub call: Uuid,
    pub seq: u64,
    pub frame: AudioFrame,
}

impl MediaPacket {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (packet, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(packet)
    }
}

/// Participant → rendezvous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Request an identity; `None` accepts any.
    Claim { id: Option<String> },
    /// Open a data channel to `to`.
    Connect { to: String, link: Uuid },
    Data { link: Uuid, payload: serde_json::Value },
    Close { link: Uuid },
    /// Place a media call to `to`.
    Call { to: String, call: Uuid },
    Answer { call: Uuid },
    Hangup { call: Uuid },
    /// Binary only; never JSON encoded.
    #[serde(skip)]
    Media(MediaPacket),
}

/// Rendezvous → participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Granted { id: String },
    Taken { id: String },
    /// Someone opened a data channel to us.
    Incoming { from: String, link: Uuid },
    /// Our outbound data channel reached its target.
    Opened { link: Uuid },
    /// Target of a connect or call is not registered.
    Unreachable { to: String, id: Uuid },
    Data { link: Uuid, payload: serde_json::Value },
    Closed { link: Uuid },
    IncomingCall { from: String, call: Uuid },
    Answered { call: Uuid },
    HungUp { call: Uuid },
    Error { message: String },
    #[serde(skip)]
    Media(MediaPacket),
}

/// A frame as it crosses the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Text(String),
    Binary(Vec<u8>),
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Encoded, ProtocolError> {
        match self {
            Self::Media(packet) => packet.encode().map(Encoded::Binary),
            other => serde_json::to_string(other)
                .map(Encoded::Text)
                .map_err(|e| ProtocolError::Serialization(e.to_string())),
        }
    }

    pub fn decode(encoded: Encoded) -> Result<Self, ProtocolError> {
        match encoded {
            Encoded::Binary(bytes) => MediaPacket::decode(&bytes).map(Self::Media),
            Encoded::Text(text) => serde_json::from_str(&text)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Encoded, ProtocolError> {
        match self {
            Self::Media(packet) => packet.encode().map(Encoded::Binary),
            other => serde_json::to_string(other)
                .map(Encoded::Text)
                .map_err(|e| ProtocolError::Serialization(e.to_string())),
        }
    }

    pub fn decode(encoded: Encoded) -> Result<Self, ProtocolError> {
        match encoded {
            Encoded::Binary(bytes) => MediaPacket::decode(&bytes).map(Self::Media),
            Encoded::Text(text) => serde_json::from_str(&text)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
