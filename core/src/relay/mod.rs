//! Event relay: raw runtime output → normalized events → persist → broadcast
//!
//! Events reach the relay on two paths. Push callbacks are registered before
//! the runtime initializes and feed a channel drained by the service. Anything
//! the runtime queued before the callbacks were wired is picked up once by
//! [`EventRelay::startup_drain`]. There is no recurring poll.

pub mod announce;
pub mod message;

use crate::broadcast::{BroadcastError, CallbackBroadcaster};
use crate::event::{AnnounceEvent, Event};
use crate::offload::AttachmentOffloader;
use crate::runtime::{PushKind, RawEvent};
use crate::store::{EventStore, PersistOutcome, StoreError};
use crate::supervisor::RuntimeSupervisor;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rmpv::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use message::ParsedMessage;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed event: {0}")]
    Parse(String),

    #[error("Persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("Broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),
}

/// Path an event took into the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Push,
    Drain,
}

/// What the relay did with one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Broadcast,
    /// Already delivered: a push repeat of a drained announce, or a message
    /// or reaction whose hash the store had seen
    Suppressed,
    /// The store refused the event; nothing was broadcast
    Rejected { reason: String },
}

#[derive(Debug, Default)]
struct Counters {
    relayed: AtomicU64,
    suppressed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub relayed: u64,
    pub suppressed: u64,
    pub rejected: u64,
    pub dropped: u64,
}

/// Result of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub relayed: usize,
    pub suppressed: usize,
    pub rejected: usize,
    pub dropped: usize,
}

impl BatchReport {
    fn record(&mut self, result: &Result<RelayOutcome, RelayError>) {
        match result {
            Ok(RelayOutcome::Broadcast) => self.relayed += 1,
            Ok(RelayOutcome::Suppressed) => self.suppressed += 1,
            Ok(RelayOutcome::Rejected { .. }) => self.rejected += 1,
            Err(_) => self.dropped += 1,
        }
    }

    fn merge(&mut self, other: BatchReport) {
        self.relayed += other.relayed;
        self.suppressed += other.suppressed;
        self.rejected += other.rejected;
        self.dropped += other.dropped;
    }
}

pub struct EventRelay {
    store: Arc<dyn EventStore>,
    offloader: Arc<AttachmentOffloader>,
    broadcaster: Arc<CallbackBroadcaster>,
    /// destination hash → fingerprint of announces delivered by the drain
    drained_announces: Mutex<HashMap<Vec<u8>, blake3::Hash>>,
    counters: Counters,
}

impl EventRelay {
    pub fn new(
        store: Arc<dyn EventStore>,
        offloader: Arc<AttachmentOffloader>,
        broadcaster: Arc<CallbackBroadcaster>,
    ) -> Self {
        Self {
            store,
            offloader,
            broadcaster,
            drained_announces: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            relayed: self.counters.relayed.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Route one raw event by channel
    pub fn handle(
        &self,
        kind: PushKind,
        raw: &RawEvent,
        origin: Origin,
    ) -> Result<RelayOutcome, RelayError> {
        let result = match kind {
            PushKind::Announce => self.on_announce_event(raw, origin),
            PushKind::Message => self.on_message_event(raw),
            PushKind::DeliveryStatus => self.on_delivery_status_event(raw),
            PushKind::LinkEvent => self.on_link_event(raw),
            PushKind::Packet => self.on_packet_event(raw),
        };
        let counter = match &result {
            Ok(RelayOutcome::Broadcast) => &self.counters.relayed,
            Ok(RelayOutcome::Suppressed) => &self.counters.suppressed,
            Ok(RelayOutcome::Rejected { .. }) => &self.counters.rejected,
            Err(_) => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Relay a batch; per-event failures are logged and dropped
    pub fn process_batch(&self, kind: PushKind, batch: &[RawEvent], origin: Origin) -> BatchReport {
        let mut report = BatchReport::default();
        for raw in batch {
            let result = self.handle(kind, raw, origin);
            if let Err(e) = &result {
                warn!("Dropping {} event: {}", kind, e);
            }
            report.record(&result);
        }
        report
    }

    pub fn on_announce_event(
        &self,
        raw: &RawEvent,
        origin: Origin,
    ) -> Result<RelayOutcome, RelayError> {
        let announce = announce::parse_announce(raw)?;
        let fingerprint = announce_fingerprint(&announce);

        match origin {
            Origin::Drain => {
                self.drained_announces
                    .lock()
                    .insert(announce.destination_hash.clone(), fingerprint);
            }
            Origin::Push => {
                let mut drained = self.drained_announces.lock();
                if drained.get(&announce.destination_hash) == Some(&fingerprint) {
                    drained.remove(&announce.destination_hash);
                    debug!(
                        "Suppressing push duplicate of drained announce {}",
                        hex::encode(&announce.destination_hash)
                    );
                    return Ok(RelayOutcome::Suppressed);
                }
            }
        }

        // Announces are broadcast even when the store is down: peers must stay
        // discoverable.
        if let Err(e) = self.store.persist_announce(&announce) {
            warn!(
                "Failed to persist announce {}: {}",
                hex::encode(&announce.destination_hash),
                e
            );
        }
        self.broadcaster.broadcast(&Event::Announce(announce))?;
        Ok(RelayOutcome::Broadcast)
    }

    pub fn on_message_event(&self, raw: &RawEvent) -> Result<RelayOutcome, RelayError> {
        match message::parse_message(raw)? {
            ParsedMessage::Reaction(reaction) => {
                match self.store.persist_reaction(&reaction)? {
                    PersistOutcome::Accepted => {}
                    PersistOutcome::Duplicate => {
                        debug!("Reaction {} already relayed", hex::encode(&reaction.message_hash));
                        return Ok(RelayOutcome::Suppressed);
                    }
                    PersistOutcome::Rejected { reason } => {
                        debug!("Reaction {} rejected: {}", hex::encode(&reaction.message_hash), reason);
                        return Ok(RelayOutcome::Rejected { reason });
                    }
                }
                self.broadcaster.broadcast(&Event::ReactionReceived(reaction))?;
                Ok(RelayOutcome::Broadcast)
            }
            ParsedMessage::Message(mut message) => {
                let key = message.storage_key();
                let fields = std::mem::take(&mut message.fields);
                let offloaded = self.offloader.offload(&key, fields);
                message.fields = offloaded.fields;
                let had_refs = !offloaded.refs.is_empty();

                let outcome = match self.store.persist_message(&message) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Failed to persist message {}: {}", key, e);
                        if had_refs {
                            self.discard_attachments(&key);
                        }
                        return Err(e.into());
                    }
                };

                match outcome {
                    PersistOutcome::Accepted => {}
                    // The stored record still points at these attachments
                    PersistOutcome::Duplicate => {
                        debug!("Message {} already relayed", key);
                        return Ok(RelayOutcome::Suppressed);
                    }
                    PersistOutcome::Rejected { reason } => {
                        debug!("Message {} rejected: {}", key, reason);
                        if had_refs {
                            self.discard_attachments(&key);
                        }
                        return Ok(RelayOutcome::Rejected { reason });
                    }
                }

                self.broadcaster.broadcast(&Event::Message(message))?;
                Ok(RelayOutcome::Broadcast)
            }
        }
    }

    pub fn on_delivery_status_event(&self, raw: &RawEvent) -> Result<RelayOutcome, RelayError> {
        let status = message::parse_delivery_status(raw)?;
        if let Err(e) = self.store.update_delivery_status(&status) {
            warn!(
                "Failed to record delivery status for {}: {}",
                hex::encode(&status.message_hash),
                e
            );
        }
        self.broadcaster.broadcast(&Event::DeliveryStatus(status))?;
        Ok(RelayOutcome::Broadcast)
    }

    pub fn on_link_event(&self, raw: &RawEvent) -> Result<RelayOutcome, RelayError> {
        let link = message::parse_link_event(raw)?;
        self.broadcaster.broadcast(&Event::LinkEvent(link))?;
        Ok(RelayOutcome::Broadcast)
    }

    pub fn on_packet_event(&self, raw: &RawEvent) -> Result<RelayOutcome, RelayError> {
        let packet = message::parse_packet(raw)?;
        self.broadcaster.broadcast(&Event::Packet(packet))?;
        Ok(RelayOutcome::Broadcast)
    }

    fn discard_attachments(&self, key: &str) {
        if let Err(e) = self.offloader.delete_attachments(key) {
            warn!("Failed to discard attachments of {}: {}", key, e);
        }
    }

    /// One-time pickup of everything the runtime queued before push callbacks
    /// were wired. Polling runs on a blocking worker.
    pub async fn startup_drain(self: &Arc<Self>, supervisor: &Arc<RuntimeSupervisor>) -> BatchReport {
        // Fingerprints only pair a drain with pushes from the same runtime
        self.drained_announces.lock().clear();

        let polled = {
            let supervisor = supervisor.clone();
            tokio::task::spawn_blocking(move || {
                let announces = supervisor.with_runtime(|rt| rt.poll_queued_announces());
                let messages = supervisor.with_runtime(|rt| rt.poll_queued_messages());
                (announces, messages)
            })
            .await
        };
        let (announces, messages) = match polled {
            Ok(polled) => polled,
            Err(e) => {
                error!("Startup drain worker failed: {}", e);
                return BatchReport::default();
            }
        };

        let relay = self.clone();
        let report = tokio::task::spawn_blocking(move || {
            let mut report = BatchReport::default();
            if let Some(batch) = announces {
                report.merge(relay.process_batch(PushKind::Announce, &batch, Origin::Drain));
            }
            if let Some(batch) = messages {
                report.merge(relay.process_batch(PushKind::Message, &batch, Origin::Drain));
            }
            report
        })
        .await
        .unwrap_or_else(|e| {
            error!("Startup drain relay failed: {}", e);
            BatchReport::default()
        });

        info!(
            "Startup drain relayed {} event(s), dropped {}",
            report.relayed, report.dropped
        );
        report
    }
}

fn announce_fingerprint(announce: &AnnounceEvent) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&announce.identity_hash);
    hasher.update(&announce.public_key);
    hasher.update(&announce.app_data);
    hasher.update(announce.aspect.as_deref().unwrap_or_default().as_bytes());
    hasher.finalize()
}

pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => s.as_str().map(str::to_string),
        Value::Binary(b) => std::str::from_utf8(b).ok().map(str::to_string),
        _ => None,
    }
}

/// Convert a msgpack value into JSON; binary becomes base64
pub fn rmpv_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => {
            if let Some(v) = i.as_i64() {
                Json::from(v)
            } else if let Some(v) = i.as_u64() {
                Json::from(v)
            } else {
                Json::Null
            }
        }
        Value::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(s) => match s.as_str() {
            Some(text) => Json::String(text.to_string()),
            None => Json::String(BASE64.encode(s.as_bytes())),
        },
        Value::Binary(b) => Json::String(BASE64.encode(b)),
        Value::Array(items) => Json::Array(items.iter().map(rmpv_to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k), rmpv_to_json(v)))
                .collect(),
        ),
        Value::Ext(_, data) => Json::String(BASE64.encode(data)),
    }
}

fn map_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.as_str().map(str::to_string).unwrap_or_default(),
        Value::Binary(b) => hex::encode(b),
        other => other.to_string(),
    }
}
