// Shared doubles for the integration suites
#![allow(dead_code)]

use meshlink_core::broadcast::{ListenerError, RelayListener};
use meshlink_core::runtime::{
    MeshRuntime, PushCallback, PushKind, RawEvent, RuntimeError, RuntimeFactory, RuntimeInit,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Knobs and counters shared by every runtime a [`FakeFactory`] builds
#[derive(Default)]
pub struct Behaviour {
    pub init_delay: Mutex<Duration>,
    pub shutdown_delay: Mutex<Duration>,
    pub init_error: Mutex<Option<String>>,
    pub heartbeat: Mutex<f64>,
    /// Events the next runtime both queues and pushes while initializing
    pub echo_on_init: Mutex<Vec<(PushKind, RawEvent)>>,
    pub inits: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub announces: AtomicUsize,
    active_inits: AtomicUsize,
    pub max_concurrent_inits: AtomicUsize,
}

impl Behaviour {
    fn enter_init(&self) {
        let now = self.active_inits.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_inits.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_init(&self) {
        self.active_inits.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeRuntime {
    pub id: usize,
    behaviour: Arc<Behaviour>,
    callbacks: Mutex<HashMap<PushKind, PushCallback>>,
    queued_announces: Mutex<Vec<RawEvent>>,
    queued_messages: Mutex<Vec<RawEvent>>,
}

impl FakeRuntime {
    /// Deliver an event through the registered push callback
    pub fn push(&self, kind: PushKind, raw: RawEvent) -> bool {
        let callback = self.callbacks.lock().get(&kind).cloned();
        match callback {
            Some(callback) => {
                callback(raw);
                true
            }
            None => false,
        }
    }

    pub fn has_callbacks(&self) -> bool {
        self.callbacks.lock().len() == PushKind::ALL.len()
    }
}

impl MeshRuntime for FakeRuntime {
    fn initialize(&self, _config_json: &str) -> Result<RuntimeInit, RuntimeError> {
        self.behaviour.enter_init();
        std::thread::sleep(*self.behaviour.init_delay.lock());
        let echoes = std::mem::take(&mut *self.behaviour.echo_on_init.lock());
        for (kind, raw) in echoes {
            match kind {
                PushKind::Announce => self.queued_announces.lock().push(raw.clone()),
                PushKind::Message => self.queued_messages.lock().push(raw.clone()),
                _ => {}
            }
            self.push(kind, raw);
        }
        self.behaviour.leave_init();
        self.behaviour.inits.fetch_add(1, Ordering::SeqCst);
        match self.behaviour.init_error.lock().clone() {
            Some(message) => Err(RuntimeError::CallFailed(message)),
            None => Ok(RuntimeInit {
                is_shared_instance: false,
            }),
        }
    }

    fn shutdown(&self) -> Result<(), RuntimeError> {
        std::thread::sleep(*self.behaviour.shutdown_delay.lock());
        self.behaviour.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll_queued_announces(&self) -> Result<Vec<RawEvent>, RuntimeError> {
        Ok(std::mem::take(&mut *self.queued_announces.lock()))
    }

    fn poll_queued_messages(&self) -> Result<Vec<RawEvent>, RuntimeError> {
        Ok(std::mem::take(&mut *self.queued_messages.lock()))
    }

    fn heartbeat(&self) -> Result<f64, RuntimeError> {
        Ok(*self.behaviour.heartbeat.lock())
    }

    fn register_push_callback(
        &self,
        kind: PushKind,
        callback: PushCallback,
    ) -> Result<(), RuntimeError> {
        self.callbacks.lock().insert(kind, callback);
        Ok(())
    }

    fn announce(&self) -> Result<(), RuntimeError> {
        self.behaviour.announces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub behaviour: Arc<Behaviour>,
    created: Mutex<Vec<Arc<FakeRuntime>>>,
    next_announces: Mutex<Vec<RawEvent>>,
    next_messages: Mutex<Vec<RawEvent>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events the next runtime reports as queued before callbacks existed
    pub fn queue_for_next(&self, announces: Vec<RawEvent>, messages: Vec<RawEvent>) {
        *self.next_announces.lock() = announces;
        *self.next_messages.lock() = messages;
    }

    pub fn latest(&self) -> Option<Arc<FakeRuntime>> {
        self.created.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

impl RuntimeFactory for FakeFactory {
    fn create(&self) -> Result<Arc<dyn MeshRuntime>, RuntimeError> {
        let mut created = self.created.lock();
        let runtime = Arc::new(FakeRuntime {
            id: created.len() + 1,
            behaviour: self.behaviour.clone(),
            callbacks: Mutex::new(HashMap::new()),
            queued_announces: Mutex::new(std::mem::take(&mut *self.next_announces.lock())),
            queued_messages: Mutex::new(std::mem::take(&mut *self.next_messages.lock())),
        });
        created.push(runtime.clone());
        Ok(runtime)
    }
}

/// Listener that keeps every payload it receives
#[derive(Default)]
pub struct RecordingListener {
    pub messages: Mutex<Vec<String>>,
    pub announces: Mutex<Vec<String>>,
    pub statuses: Mutex<Vec<String>>,
    pub ready: AtomicUsize,
}

impl RecordingListener {
    pub fn announce_count(&self) -> usize {
        self.announces.lock().len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }
}

impl RelayListener for RecordingListener {
    fn on_message(&self, json: &str) -> Result<(), ListenerError> {
        self.messages.lock().push(json.to_string());
        Ok(())
    }

    fn on_announce(&self, json: &str) -> Result<(), ListenerError> {
        self.announces.lock().push(json.to_string());
        Ok(())
    }

    fn on_status_changed(&self, status: &str) -> Result<(), ListenerError> {
        self.statuses.lock().push(status.to_string());
        Ok(())
    }

    fn on_service_ready(&self) -> Result<(), ListenerError> {
        self.ready.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn announce_raw(dest: u8, name: &str) -> RawEvent {
    RawEvent::new()
        .with("destination_hash", vec![dest; 16])
        .with("identity_hash", vec![dest.wrapping_add(1); 16])
        .with("public_key", vec![2_u8; 64])
        .with("app_data", name.as_bytes().to_vec())
        .with("aspect", "nomadnetwork.node")
        .with("hops", 1)
}

pub fn message_raw(hash: u8, source: u8, content: &str) -> RawEvent {
    RawEvent::new()
        .with("message_hash", vec![hash; 16])
        .with("source_hash", vec![source; 16])
        .with("destination_hash", vec![9_u8; 16])
        .with("content", content)
        .with("timestamp", 1_700_000_000_000_i64)
}

/// Poll `check` until it holds or the budget runs out
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
