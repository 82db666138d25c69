//! Call surface of the embedded mesh runtime
//!
//! The protocol engine is treated as a black box: only the call/return
//! contract below is relied upon. Whatever hosts the engine (an embedded
//! interpreter, a native library, a test double) implements [`MeshRuntime`]
//! and is constructed fresh for every lifetime through a [`RuntimeFactory`].
//!
//! Raw output is loosely typed: string keys mapped to msgpack values. It is
//! converted into [`crate::event::Event`] at the relay boundary and never
//! travels further than that.

use rmpv::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors surfaced by the runtime call surface
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Runtime call failed: {0}")]
    CallFailed(String),

    #[error("Runtime not initialized")]
    NotInitialized,

    #[error("Unsupported runtime call: {0}")]
    Unsupported(String),
}

// ============================================================================
// RAW EVENTS
// ============================================================================

/// Push channels the runtime can call back on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    Announce,
    Message,
    DeliveryStatus,
    LinkEvent,
    Packet,
}

impl PushKind {
    pub const ALL: [PushKind; 5] = [
        PushKind::Announce,
        PushKind::Message,
        PushKind::DeliveryStatus,
        PushKind::LinkEvent,
        PushKind::Packet,
    ];

    /// Registration name handed to the runtime
    pub fn callback_name(&self) -> &'static str {
        match self {
            Self::Announce => "announce_received",
            Self::Message => "message_received",
            Self::DeliveryStatus => "delivery_status",
            Self::LinkEvent => "link_event",
            Self::Packet => "packet_received",
        }
    }
}

impl std::fmt::Display for PushKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.callback_name())
    }
}

/// One loosely-typed record produced by the runtime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    fields: HashMap<String, Value>,
}

impl RawEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_nil())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Binary value. Hex strings are accepted because some runtime paths
    /// report hashes pre-encoded.
    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key)? {
            Value::Binary(b) => Some(b.clone()),
            Value::String(s) => s.as_str().and_then(|s| hex::decode(s).ok()),
            _ => None,
        }
    }

    /// Text value. Binary is accepted when it is valid UTF-8.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => s.as_str().map(str::to_string),
            Value::Binary(b) => std::str::from_utf8(b).ok().map(str::to_string),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Integer(i) => i.as_i64(),
            Value::F32(f) => Some(*f as i64),
            Value::F64(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::F64(f) => Some(*f),
            Value::F32(f) => Some(f64::from(*f)),
            Value::Integer(i) => i.as_f64(),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ============================================================================
// CALL SURFACE
// ============================================================================

/// Result of a successful runtime initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeInit {
    /// The runtime attached to an instance already running in another process
    pub is_shared_instance: bool,
}

/// Outbound message handed to the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub destination_hash: Vec<u8>,
    pub content: String,
    /// Field id to value, passed through untouched
    pub fields: Vec<(u8, Value)>,
}

/// Invoked by the runtime from its own thread whenever an event occurs
pub type PushCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// The embedded protocol runtime
///
/// All calls are blocking. The supervisor moves them onto worker threads and
/// bounds the lifecycle calls with timeouts.
pub trait MeshRuntime: Send + Sync {
    fn initialize(&self, config_json: &str) -> Result<RuntimeInit, RuntimeError>;

    fn shutdown(&self) -> Result<(), RuntimeError>;

    /// Announces queued before push callbacks were registered
    fn poll_queued_announces(&self) -> Result<Vec<RawEvent>, RuntimeError>;

    /// Messages queued before push callbacks were registered
    fn poll_queued_messages(&self) -> Result<Vec<RawEvent>, RuntimeError>;

    /// Liveness timestamp in unix seconds; `0.0` until the runtime starts beating
    fn heartbeat(&self) -> Result<f64, RuntimeError>;

    fn register_push_callback(
        &self,
        kind: PushKind,
        callback: PushCallback,
    ) -> Result<(), RuntimeError>;

    /// Send a message, returning its hash
    fn send(&self, _message: &OutboundMessage) -> Result<Vec<u8>, RuntimeError> {
        Err(RuntimeError::Unsupported("send".to_string()))
    }

    fn request_path(&self, _destination_hash: &[u8]) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported("request_path".to_string()))
    }

    /// Re-announce this node on every interface
    fn announce(&self) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported("announce".to_string()))
    }

    /// Domain-specific query passthrough
    fn query(
        &self,
        method: &str,
        _params: &serde_json::Value,
    ) -> Result<serde_json::Value, RuntimeError> {
        Err(RuntimeError::Unsupported(method.to_string()))
    }
}

/// Builds a fresh runtime handle for each lifetime
pub trait RuntimeFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn MeshRuntime>, RuntimeError>;
}

impl<F> RuntimeFactory for F
where
    F: Fn() -> Result<Arc<dyn MeshRuntime>, RuntimeError> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn MeshRuntime>, RuntimeError> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_accessors() {
        let raw = RawEvent::new()
            .with("hash", vec![0xab_u8, 0xcd])
            .with("hex_hash", "abcd")
            .with("name", "Alice")
            .with("hops", 3_i64)
            .with("heartbeat", 12.5_f64)
            .with("missing", Value::Nil);

        assert_eq!(raw.bytes("hash"), Some(vec![0xab, 0xcd]));
        assert_eq!(raw.bytes("hex_hash"), Some(vec![0xab, 0xcd]));
        assert_eq!(raw.text("name").as_deref(), Some("Alice"));
        assert_eq!(raw.int("hops"), Some(3));
        assert_eq!(raw.float("heartbeat"), Some(12.5));
        assert!(!raw.contains("missing"));
        assert_eq!(raw.bytes("name"), None);
    }

    #[test]
    fn test_binary_text_requires_utf8() {
        let raw = RawEvent::new()
            .with("ok", b"hello".to_vec())
            .with("bad", vec![0xff_u8, 0xfe]);
        assert_eq!(raw.text("ok").as_deref(), Some("hello"));
        assert_eq!(raw.text("bad"), None);
    }

    #[test]
    fn test_callback_names_are_distinct() {
        let mut names: Vec<_> = PushKind::ALL.iter().map(|k| k.callback_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), PushKind::ALL.len());
    }
}
