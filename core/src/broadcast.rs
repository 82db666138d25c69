//! Cross-process fan-out of relayed events
//!
//! Listeners live in other processes and can vanish at any time. A listener
//! that reports itself dead (or fails with [`ListenerError::Dead`]) is pruned
//! after the traversal that noticed it. Every other failure is logged and
//! contained to that listener.

use crate::event::Event;
use crate::state::ServiceStatus;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The remote end is gone; the listener will be pruned
    #[error("Listener is dead")]
    Dead,

    #[error("Listener failed: {0}")]
    Remote(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Broadcast already in progress on this thread")]
    Reentrant,
}

/// Callback interface implemented by client processes
///
/// Event payloads are the JSON produced by [`Event::to_json`]. Every method
/// defaults to a no-op so listeners only implement what they consume.
pub trait RelayListener: Send + Sync {
    fn on_message(&self, _json: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_announce(&self, _json: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_status_changed(&self, _status: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_delivery_status(&self, _json: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_packet(&self, _json: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_link_event(&self, _json: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_reaction_received(&self, _json: &str) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Runtime is bound and ready for calls
    fn on_service_ready(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn is_alive(&self) -> bool {
        true
    }
}

/// Opaque handle for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerRegistration(Uuid);

impl ListenerRegistration {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Entry = (ListenerRegistration, Arc<dyn RelayListener>);

/// Registered listeners plus traversal bookkeeping
///
/// A traversal is bracketed by [`begin_broadcast`](Self::begin_broadcast) and
/// [`finish_broadcast`](Self::finish_broadcast); a second begin before the
/// matching finish is rejected.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Entry>>,
    in_broadcast: AtomicBool,
    traversals: AtomicU64,
    rejected: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn RelayListener>) -> ListenerRegistration {
        let registration = ListenerRegistration::new();
        self.listeners.lock().push((registration, listener));
        registration
    }

    pub fn unregister(&self, registration: &ListenerRegistration) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(r, _)| r != registration);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a traversal and snapshot the listeners
    pub fn begin_broadcast(&self) -> Result<Vec<Entry>, BroadcastError> {
        if self
            .in_broadcast
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BroadcastError::Reentrant);
        }
        self.traversals.fetch_add(1, Ordering::Relaxed);
        Ok(self.listeners.lock().clone())
    }

    /// Close the traversal and drop listeners found dead during it
    pub fn finish_broadcast(&self, dead: &[ListenerRegistration]) {
        if !dead.is_empty() {
            self.listeners
                .lock()
                .retain(|(r, _)| !dead.contains(r));
            info!("Pruned {} dead listener(s)", dead.len());
        }
        self.in_broadcast.store(false, Ordering::Release);
    }

    /// Completed or in-progress traversals
    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    /// Re-entrant begin attempts that were refused
    pub fn rejected_reentries(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn clear(&self) -> usize {
        let mut listeners = self.listeners.lock();
        let count = listeners.len();
        listeners.clear();
        count
    }
}

#[derive(Default)]
struct Readiness {
    bound: bool,
    pending: Vec<Arc<dyn RelayListener>>,
}

/// Summary of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    pub pruned: usize,
}

pub struct CallbackBroadcaster {
    registry: ListenerRegistry,
    // Reentrant so a listener calling back into broadcast on the same thread
    // reaches the registry guard instead of deadlocking.
    broadcast_lock: ReentrantMutex<()>,
    readiness: Mutex<Readiness>,
}

impl Default for CallbackBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackBroadcaster {
    pub fn new() -> Self {
        Self {
            registry: ListenerRegistry::new(),
            broadcast_lock: ReentrantMutex::new(()),
            readiness: Mutex::new(Readiness::default()),
        }
    }

    pub fn register(&self, listener: Arc<dyn RelayListener>) -> ListenerRegistration {
        let registration = self.registry.register(listener);
        debug!("Registered listener {}", registration);
        registration
    }

    pub fn unregister(&self, registration: &ListenerRegistration) -> bool {
        let removed = self.registry.unregister(registration);
        if removed {
            debug!("Unregistered listener {}", registration);
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Deliver `on_service_ready` once: now if bound, else at the next bind
    pub fn register_readiness(&self, listener: Arc<dyn RelayListener>) {
        let notify_now = {
            let mut readiness = self.readiness.lock();
            if readiness.bound {
                true
            } else {
                readiness.pending.push(listener.clone());
                false
            }
        };
        if notify_now {
            notify_ready(listener.as_ref());
        }
    }

    pub fn set_service_bound(&self, bound: bool) {
        let pending = {
            let mut readiness = self.readiness.lock();
            readiness.bound = bound;
            if bound {
                std::mem::take(&mut readiness.pending)
            } else {
                Vec::new()
            }
        };
        if !pending.is_empty() {
            info!("Service bound; notifying {} readiness listener(s)", pending.len());
        }
        for listener in pending {
            notify_ready(listener.as_ref());
        }
    }

    pub fn is_service_bound(&self) -> bool {
        self.readiness.lock().bound
    }

    /// Fan out one event to every listener
    pub fn broadcast(&self, event: &Event) -> Result<BroadcastReport, BroadcastError> {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(
                    "Dropping {} {}: serialization failed: {}",
                    event.kind(),
                    event.correlation_id(),
                    e
                );
                return Ok(BroadcastReport::default());
            }
        };
        let report = self.traverse(|listener| match event {
            Event::Announce(_) => listener.on_announce(&json),
            Event::Message(_) => listener.on_message(&json),
            Event::DeliveryStatus(_) => listener.on_delivery_status(&json),
            Event::ReactionReceived(_) => listener.on_reaction_received(&json),
            Event::LinkEvent(_) => listener.on_link_event(&json),
            Event::Packet(_) => listener.on_packet(&json),
        })?;
        debug!(
            "Broadcast {} {} to {} listener(s)",
            event.kind(),
            event.correlation_id(),
            report.delivered
        );
        Ok(report)
    }

    pub fn broadcast_status(&self, status: &ServiceStatus) -> Result<BroadcastReport, BroadcastError> {
        let wire = status.to_string();
        self.traverse(|listener| listener.on_status_changed(&wire))
    }

    fn traverse<F>(&self, deliver: F) -> Result<BroadcastReport, BroadcastError>
    where
        F: Fn(&dyn RelayListener) -> Result<(), ListenerError>,
    {
        let _guard = self.broadcast_lock.lock();
        let listeners = self.registry.begin_broadcast()?;
        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        for (registration, listener) in &listeners {
            if !listener.is_alive() {
                dead.push(*registration);
                continue;
            }
            match deliver(listener.as_ref()) {
                Ok(()) => report.delivered += 1,
                Err(ListenerError::Dead) => dead.push(*registration),
                Err(e) => {
                    report.failed += 1;
                    warn!("Listener {} failed: {}", registration, e);
                }
            }
        }

        report.pruned = dead.len();
        self.registry.finish_broadcast(&dead);
        Ok(report)
    }

    /// Drop every listener; used at teardown
    pub fn kill_all(&self) {
        let _guard = self.broadcast_lock.lock();
        let count = self.registry.clear();
        let pending = {
            let mut readiness = self.readiness.lock();
            readiness.bound = false;
            std::mem::take(&mut readiness.pending).len()
        };
        info!(
            "Killed {} listener(s) and {} pending readiness callback(s)",
            count, pending
        );
    }
}

fn notify_ready(listener: &dyn RelayListener) {
    if let Err(e) = listener.on_service_ready() {
        warn!("Readiness listener failed: {}", e);
    }
}
