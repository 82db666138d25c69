//! Normalized events relayed to listeners
//!
//! Every event is created once by the relay from raw runtime output and is
//! immutable afterwards. The serialized JSON form is the cross-process payload:
//! binary values are base64, timestamps are epoch milliseconds.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Key marking a value that was moved to local storage
pub const FILE_REF_KEY: &str = "_file_ref";

/// LXMF field ids this relay knows how to shape
pub mod field_ids {
    pub const FILE_ATTACHMENTS: u8 = 5;
    pub const IMAGE: u8 = 6;
    pub const AUDIO: u8 = 7;
    pub const APP_EXTENSIONS: u8 = 16;
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub mod option {
        use super::BASE64;
        use base64::Engine;
        use serde::Serializer;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_str(&BASE64.encode(b)),
                None => serializer.serialize_none(),
            }
        }
    }
}

// ============================================================================
// FIELD VALUES
// ============================================================================

/// One element of a file-attachment list
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentEntry {
    Inline { filename: String, data: Vec<u8> },
    Stored { filename: String, size: usize, path: PathBuf },
}

impl Serialize for AttachmentEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Inline { filename, data } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("filename", filename)?;
                map.serialize_entry("data", &BASE64.encode(data))?;
                map.end()
            }
            Self::Stored {
                filename,
                size,
                path,
            } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("filename", filename)?;
                map.serialize_entry("size", size)?;
                map.serialize_entry(FILE_REF_KEY, &path.to_string_lossy())?;
                map.end()
            }
        }
    }
}

/// A message field after normalization
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Inline binary payload, optionally tagged with a format (`jpg`, `opus`, ...)
    Bytes { format: Option<String>, data: Vec<u8> },
    /// File attachment list, split per element when offloaded
    Attachments(Vec<AttachmentEntry>),
    /// Any other structured value
    Json(serde_json::Value),
    /// Whole field moved to local storage
    FileRef(PathBuf),
}

impl FieldValue {
    pub fn is_file_ref(&self) -> bool {
        matches!(self, Self::FileRef(_))
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Bytes {
                format: Some(format),
                data,
            } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(format)?;
                seq.serialize_element(&BASE64.encode(data))?;
                seq.end()
            }
            Self::Bytes { format: None, data } => serializer.serialize_str(&BASE64.encode(data)),
            Self::Attachments(entries) => entries.serialize(serializer),
            Self::Json(value) => value.serialize(serializer),
            Self::FileRef(path) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(FILE_REF_KEY, &path.to_string_lossy())?;
                map.end()
            }
        }
    }
}

/// Field id to value; serialized with the ids as string keys
pub type FieldMap = BTreeMap<u8, FieldValue>;

// ============================================================================
// EVENTS
// ============================================================================

/// Service class derived from an announce's aspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Peer,
    PropagationNode,
    NomadNode,
    Telephony,
    MapServer,
    Unknown,
}

/// How the sender delivered a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Opportunistic,
    Direct,
    Propagated,
    Paper,
}

impl DeliveryMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "opportunistic" => Some(Self::Opportunistic),
            "direct" => Some(Self::Direct),
            "propagated" => Some(Self::Propagated),
            "paper" => Some(Self::Paper),
            _ => None,
        }
    }

    /// LXMF numeric method codes
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Opportunistic),
            2 => Some(Self::Direct),
            3 => Some(Self::Propagated),
            5 => Some(Self::Paper),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnounceEvent {
    #[serde(with = "base64_bytes")]
    pub destination_hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub identity_hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub app_data: Vec<u8>,
    pub hops: u32,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stamp_cost: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stamp_cost_flexibility: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peering_cost: Option<u32>,
    pub node_type: NodeType,
    /// Protocol-extension fields for specialized aspects
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageEvent {
    #[serde(with = "base64_bytes")]
    pub message_hash: Vec<u8>,
    pub content: String,
    #[serde(with = "base64_bytes")]
    pub source_hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub destination_hash: Vec<u8>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "FieldMap::is_empty")]
    pub fields: FieldMap,
    #[serde(
        with = "base64_bytes::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub public_key: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<DeliveryMethod>,
}

impl MessageEvent {
    /// Storage key used for offloaded attachments of this message
    pub fn storage_key(&self) -> String {
        hex::encode(&self.message_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStatusEvent {
    #[serde(with = "base64_bytes")]
    pub message_hash: Vec<u8>,
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactionEvent {
    #[serde(with = "base64_bytes")]
    pub message_hash: Vec<u8>,
    /// Hex hash of the message being reacted to
    pub reaction_to: String,
    pub emoji: String,
    #[serde(with = "base64_bytes")]
    pub source_hash: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkEvent {
    #[serde(with = "base64_bytes")]
    pub link_id: Vec<u8>,
    #[serde(
        with = "base64_bytes::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub destination_hash: Option<Vec<u8>>,
    pub status: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketEvent {
    #[serde(with = "base64_bytes")]
    pub destination_hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Normalized unit of incoming data
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Announce(AnnounceEvent),
    Message(MessageEvent),
    DeliveryStatus(DeliveryStatusEvent),
    ReactionReceived(ReactionEvent),
    LinkEvent(LinkEvent),
    Packet(PacketEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announce(_) => "announce",
            Self::Message(_) => "message",
            Self::DeliveryStatus(_) => "delivery_status",
            Self::ReactionReceived(_) => "reaction",
            Self::LinkEvent(_) => "link_event",
            Self::Packet(_) => "packet",
        }
    }

    /// Message hash or destination hash, hex encoded
    pub fn correlation_id(&self) -> String {
        match self {
            Self::Announce(e) => hex::encode(&e.destination_hash),
            Self::Message(e) => hex::encode(&e.message_hash),
            Self::DeliveryStatus(e) => hex::encode(&e.message_hash),
            Self::ReactionReceived(e) => hex::encode(&e.message_hash),
            Self::LinkEvent(e) => hex::encode(&e.link_id),
            Self::Packet(e) => hex::encode(&e.destination_hash),
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Announce(e) => e.timestamp,
            Self::Message(e) => e.timestamp,
            Self::DeliveryStatus(e) => e.timestamp,
            Self::ReactionReceived(e) => e.timestamp,
            Self::LinkEvent(e) => e.timestamp,
            Self::Packet(e) => e.timestamp,
        }
    }

    /// Cross-process JSON payload
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Announce(e) => serde_json::to_string(e),
            Self::Message(e) => serde_json::to_string(e),
            Self::DeliveryStatus(e) => serde_json::to_string(e),
            Self::ReactionReceived(e) => serde_json::to_string(e),
            Self::LinkEvent(e) => serde_json::to_string(e),
            Self::Packet(e) => serde_json::to_string(e),
        }
    }
}

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
