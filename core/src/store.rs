// Persistence adapter for relayed events
//
// The relay persists before it broadcasts. The store owns idempotence: every
// write is an upsert keyed by hash, so a replayed event is harmless.

use crate::event::{AnnounceEvent, DeliveryStatusEvent, MessageEvent, ReactionEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

/// Whether a message-like event was admitted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Accepted,
    /// Hash already stored; the record was refreshed but the event was seen before
    Duplicate,
    /// Filtered out (blocked sender, policy); the event must not be broadcast
    Rejected { reason: String },
}

impl PersistOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

fn upsert_outcome(existed: bool) -> PersistOutcome {
    if existed {
        PersistOutcome::Duplicate
    } else {
        PersistOutcome::Accepted
    }
}

/// Persistence contract the relay writes through
pub trait EventStore: Send + Sync {
    fn persist_announce(&self, announce: &AnnounceEvent) -> Result<(), StoreError>;

    fn persist_message(&self, message: &MessageEvent) -> Result<PersistOutcome, StoreError>;

    fn persist_reaction(&self, reaction: &ReactionEvent) -> Result<PersistOutcome, StoreError>;

    fn update_delivery_status(&self, status: &DeliveryStatusEvent) -> Result<(), StoreError>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    announces: HashMap<Vec<u8>, AnnounceEvent>,
    messages: HashMap<Vec<u8>, MessageEvent>,
    reactions: HashMap<Vec<u8>, ReactionEvent>,
    delivery: HashMap<Vec<u8>, String>,
    blocked: HashSet<Vec<u8>>,
    writes: usize,
    unavailable: bool,
}

/// In-memory store for tests and ephemeral hosts
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_sender(&self, source_hash: &[u8]) {
        self.inner.lock().blocked.insert(source_hash.to_vec());
    }

    pub fn unblock_sender(&self, source_hash: &[u8]) {
        self.inner.lock().blocked.remove(source_hash);
    }

    /// Make every write fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    pub fn announce(&self, destination_hash: &[u8]) -> Option<AnnounceEvent> {
        self.inner.lock().announces.get(destination_hash).cloned()
    }

    pub fn message(&self, message_hash: &[u8]) -> Option<MessageEvent> {
        self.inner.lock().messages.get(message_hash).cloned()
    }

    pub fn delivery_status(&self, message_hash: &[u8]) -> Option<String> {
        self.inner.lock().delivery.get(message_hash).cloned()
    }

    pub fn announce_count(&self) -> usize {
        self.inner.lock().announces.len()
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn reaction_count(&self) -> usize {
        self.inner.lock().reactions.len()
    }

    /// Total successful write calls, including upserts of known keys
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    fn check_available(inner: &MemoryInner) -> Result<(), StoreError> {
        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

impl EventStore for MemoryEventStore {
    fn persist_announce(&self, announce: &AnnounceEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner
            .announces
            .insert(announce.destination_hash.clone(), announce.clone());
        inner.writes += 1;
        Ok(())
    }

    fn persist_message(&self, message: &MessageEvent) -> Result<PersistOutcome, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        if inner.blocked.contains(&message.source_hash) {
            return Ok(PersistOutcome::Rejected {
                reason: "blocked sender".to_string(),
            });
        }
        let previous = inner
            .messages
            .insert(message.message_hash.clone(), message.clone());
        inner.writes += 1;
        Ok(upsert_outcome(previous.is_some()))
    }

    fn persist_reaction(&self, reaction: &ReactionEvent) -> Result<PersistOutcome, StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        if inner.blocked.contains(&reaction.source_hash) {
            return Ok(PersistOutcome::Rejected {
                reason: "blocked sender".to_string(),
            });
        }
        let previous = inner
            .reactions
            .insert(reaction.message_hash.clone(), reaction.clone());
        inner.writes += 1;
        Ok(upsert_outcome(previous.is_some()))
    }

    fn update_delivery_status(&self, status: &DeliveryStatusEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        Self::check_available(&inner)?;
        inner
            .delivery
            .insert(status.message_hash.clone(), status.status.clone());
        inner.writes += 1;
        Ok(())
    }
}

// ============================================================================
// SLED STORE
// ============================================================================

/// Durable store backed by sled, one tree per event family
pub struct SledEventStore {
    db: sled::Db,
    announces: sled::Tree,
    messages: sled::Tree,
    reactions: sled::Tree,
    delivery: sled::Tree,
    blocked: sled::Tree,
}

impl SledEventStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        let db = sled::open(path)?;
        Ok(Self {
            announces: db.open_tree("announces")?,
            messages: db.open_tree("messages")?,
            reactions: db.open_tree("reactions")?,
            delivery: db.open_tree("delivery")?,
            blocked: db.open_tree("blocked")?,
            db,
        })
    }

    pub fn block_sender(&self, source_hash: &[u8]) -> Result<(), StoreError> {
        self.blocked.insert(source_hash, Vec::<u8>::new())?;
        Ok(())
    }

    pub fn unblock_sender(&self, source_hash: &[u8]) -> Result<(), StoreError> {
        self.blocked.remove(source_hash)?;
        Ok(())
    }

    fn is_blocked(&self, source_hash: &[u8]) -> Result<bool, StoreError> {
        Ok(self.blocked.contains_key(source_hash)?)
    }

    /// Stored JSON of a message, as it was broadcast
    pub fn message_json(&self, message_hash: &[u8]) -> Result<Option<serde_json::Value>, StoreError> {
        match self.messages.get(message_hash)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delivery_status(&self, message_hash: &[u8]) -> Result<Option<String>, StoreError> {
        Ok(self
            .delivery
            .get(message_hash)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn announce_count(&self) -> usize {
        self.announces.len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl EventStore for SledEventStore {
    fn persist_announce(&self, announce: &AnnounceEvent) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(announce)?;
        self.announces
            .insert(announce.destination_hash.as_slice(), bytes)?;
        Ok(())
    }

    fn persist_message(&self, message: &MessageEvent) -> Result<PersistOutcome, StoreError> {
        if self.is_blocked(&message.source_hash)? {
            return Ok(PersistOutcome::Rejected {
                reason: "blocked sender".to_string(),
            });
        }
        let bytes = serde_json::to_vec(message)?;
        let previous = self.messages.insert(message.message_hash.as_slice(), bytes)?;
        Ok(upsert_outcome(previous.is_some()))
    }

    fn persist_reaction(&self, reaction: &ReactionEvent) -> Result<PersistOutcome, StoreError> {
        if self.is_blocked(&reaction.source_hash)? {
            return Ok(PersistOutcome::Rejected {
                reason: "blocked sender".to_string(),
            });
        }
        let bytes = serde_json::to_vec(reaction)?;
        let previous = self
            .reactions
            .insert(reaction.message_hash.as_slice(), bytes)?;
        Ok(upsert_outcome(previous.is_some()))
    }

    fn update_delivery_status(&self, status: &DeliveryStatusEvent) -> Result<(), StoreError> {
        self.delivery
            .insert(status.message_hash.as_slice(), status.status.as_bytes())?;
        Ok(())
    }
}
