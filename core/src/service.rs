//! Composition root
//!
//! [`RelayService`] wires the supervisor, relay, broadcaster, offloader, lock
//! coordinator, health monitor and network coordinator onto one cancellable
//! task scope. Teardown cancels the scope and waits for every task.

use crate::broadcast::{CallbackBroadcaster, ListenerRegistration, RelayListener};
use crate::config::{ConfigError, ServiceConfig};
use crate::health::{HealthError, HealthMonitor, HeartbeatSource, RecoveryAction};
use crate::locks::{HostLocks, LockStatus, ResourceLockCoordinator};
use crate::network::{NetworkChangeCoordinator, NetworkChangedCallback, NetworkSnapshot};
use crate::offload::{AttachmentOffloader, OffloadError};
use crate::relay::{BatchReport, EventRelay, Origin};
use crate::runtime::{OutboundMessage, PushCallback, PushKind, RawEvent, RuntimeFactory};
use crate::state::{ServiceStatus, ShutdownOutcome};
use crate::store::{EventStore, SledEventStore, StoreError};
use crate::supervisor::{InitSuccess, PreInitHook, RuntimeSupervisor, SupervisorError};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Restart already in progress")]
    RestartInProgress,

    #[error("Service has been torn down")]
    TornDown,
}

/// Outcome of a successful start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReport {
    pub init: InitSuccess,
    pub drained: BatchReport,
}

struct PushEnvelope {
    generation: u64,
    kind: PushKind,
    raw: RawEvent,
}

pub struct RelayService {
    config: ServiceConfig,
    supervisor: Arc<RuntimeSupervisor>,
    relay: Arc<EventRelay>,
    broadcaster: Arc<CallbackBroadcaster>,
    offloader: Arc<AttachmentOffloader>,
    locks: Arc<ResourceLockCoordinator>,
    health: Arc<HealthMonitor>,
    network: Mutex<Option<Arc<NetworkChangeCoordinator>>>,
    token: CancellationToken,
    tracker: TaskTracker,
    push_tx: mpsc::UnboundedSender<PushEnvelope>,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<PushEnvelope>>>,
    /// Latest generation whose startup drain has finished; pushes of a
    /// generation are held until its drain is done
    drained: watch::Sender<u64>,
    pumps_started: AtomicBool,
    restarting: AtomicBool,
}

impl RelayService {
    pub fn new(
        config: ServiceConfig,
        factory: Arc<dyn RuntimeFactory>,
        store: Arc<dyn EventStore>,
        host_locks: HostLocks,
    ) -> Result<Arc<Self>, ServiceError> {
        // Initialize tracing (idempotent)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        config.validate()?;
        info!("Creating relay service at {}", config.storage_path.display());

        let supervisor = Arc::new(RuntimeSupervisor::new(config.supervisor.clone(), factory));
        let broadcaster = Arc::new(CallbackBroadcaster::new());
        let offloader = Arc::new(AttachmentOffloader::new(
            config.attachments_dir(),
            &config.offload,
        ));
        let relay = Arc::new(EventRelay::new(
            store,
            offloader.clone(),
            broadcaster.clone(),
        ));
        let locks = Arc::new(ResourceLockCoordinator::new(
            config.locks.clone(),
            host_locks,
        ));
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        Ok(Arc::new_cyclic(|weak: &Weak<RelayService>| {
            let health = Arc::new(HealthMonitor::new(
                config.health.clone(),
                heartbeat_source(&supervisor),
                recovery_action(weak.clone()),
            ));
            Self {
                config,
                supervisor,
                relay,
                broadcaster,
                offloader,
                locks,
                health,
                network: Mutex::new(None),
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                push_tx,
                push_rx: Mutex::new(Some(push_rx)),
                drained: watch::Sender::new(0),
                pumps_started: AtomicBool::new(false),
                restarting: AtomicBool::new(false),
            }
        }))
    }

    /// Service backed by the durable event store under the storage root
    pub fn with_sled_store(
        config: ServiceConfig,
        factory: Arc<dyn RuntimeFactory>,
        host_locks: HostLocks,
    ) -> Result<Arc<Self>, ServiceError> {
        let store = Arc::new(SledEventStore::open(&config.store_dir())?);
        Self::new(config, factory, store, host_locks)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Acquire locks, initialize the runtime, drain its queues, start health
    pub async fn start(self: &Arc<Self>) -> Result<StartReport, ServiceError> {
        if self.token.is_cancelled() {
            return Err(ServiceError::TornDown);
        }
        self.spawn_pumps();

        if let Err(e) = self.locks.acquire_all() {
            warn!("Starting without full lock set: {}", e);
        }

        let init = self
            .supervisor
            .initialize(&self.config.runtime_config_json(), Some(self.push_hook()))
            .await?;
        self.broadcaster.set_service_bound(true);

        let drained = self.relay.startup_drain(&self.supervisor).await;
        self.drained.send_replace(init.generation);
        self.health.start(&self.token, &self.tracker);

        info!("Relay service started (generation {})", init.generation);
        Ok(StartReport { init, drained })
    }

    /// Shutdown followed by a fresh start; concurrent requests are refused
    pub async fn restart(self: &Arc<Self>) -> Result<StartReport, ServiceError> {
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!("Restart requested while one is running; ignoring");
            return Err(ServiceError::RestartInProgress);
        }
        info!("Restarting runtime");
        self.health.stop();
        self.broadcaster.set_service_bound(false);
        self.supervisor.mark_connecting();
        let outcome = self.supervisor.shutdown().await;
        debug!("Restart shutdown outcome: {:?}", outcome);
        let result = self.start().await;
        self.restarting.store(false, Ordering::SeqCst);
        result
    }

    /// Stop the runtime and release host locks; the service can be started again
    pub async fn stop(&self) -> ShutdownOutcome {
        self.health.stop();
        self.broadcaster.set_service_bound(false);
        let outcome = self.supervisor.shutdown().await;
        if let Err(e) = self.locks.release_all() {
            warn!("Failed to release host locks: {}", e);
        }
        info!("Relay service stopped: {:?}", outcome);
        outcome
    }

    /// Stop, drop every listener and wait for all service tasks to finish
    pub async fn teardown(&self) -> ShutdownOutcome {
        let outcome = self.stop().await;
        self.broadcaster.kill_all();
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Relay service torn down");
        outcome
    }

    fn push_hook(&self) -> PreInitHook {
        let tx = self.push_tx.clone();
        Box::new(move |runtime, generation| {
            for kind in PushKind::ALL {
                let tx = tx.clone();
                let callback: PushCallback = Arc::new(move |raw: RawEvent| {
                    if tx
                        .send(PushEnvelope {
                            generation,
                            kind,
                            raw,
                        })
                        .is_err()
                    {
                        debug!("Dropping {} push after teardown", kind);
                    }
                });
                runtime.register_push_callback(kind, callback)?;
            }
            debug!("Registered push callbacks for generation {}", generation);
            Ok(())
        })
    }

    fn spawn_pumps(self: &Arc<Self>) {
        if self.pumps_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(rx) = self.push_rx.lock().take() {
            self.spawn_push_pump(rx);
        }
        self.spawn_status_forwarder();
        self.locks
            .spawn_maintenance(self.token.child_token(), &self.tracker);
        self.spawn_housekeeping();
    }

    fn spawn_push_pump(&self, mut rx: mpsc::UnboundedReceiver<PushEnvelope>) {
        let token = self.token.clone();
        let supervisor = self.supervisor.clone();
        let relay = self.relay.clone();
        let mut drained = self.drained.subscribe();
        self.tracker.spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = token.cancelled() => break,
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                if is_stale(&supervisor, &envelope) {
                    continue;
                }
                // Pushes fired during init or the drain wait for the drain, so
                // whatever both paths deliver is seen by the drain first
                let generation = envelope.generation;
                let pending = *drained.borrow() < generation;
                if pending {
                    let ready = async {
                        drained
                            .wait_for(|done| *done >= generation)
                            .await
                            .map(|_| ())
                    };
                    tokio::select! {
                        _ = token.cancelled() => break,
                        ready = ready => {
                            if ready.is_err() {
                                break;
                            }
                        }
                    }
                    if is_stale(&supervisor, &envelope) {
                        continue;
                    }
                }
                let relay = relay.clone();
                let handled = tokio::task::spawn_blocking(move || {
                    relay.handle(envelope.kind, &envelope.raw, Origin::Push)
                })
                .await;
                match handled {
                    Ok(Ok(outcome)) => debug!("Push relayed: {:?}", outcome),
                    Ok(Err(e)) => warn!("Dropping push event: {}", e),
                    Err(e) => error!("Push relay worker failed: {}", e),
                }
            }
            debug!("Push pump exited");
        });
    }

    fn spawn_status_forwarder(&self) {
        let token = self.token.clone();
        let broadcaster = self.broadcaster.clone();
        let mut statuses = self.supervisor.subscribe_status();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = statuses.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = statuses.borrow_and_update().clone();
                        if let Err(e) = broadcaster.broadcast_status(&status) {
                            warn!("Status broadcast failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    fn spawn_housekeeping(&self) {
        let token = self.token.clone();
        let offloader = self.offloader.clone();
        let period = self.config.offload.cleanup_interval();
        let max_age = self.config.offload.max_age();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let offloader = offloader.clone();
                        let cleaned = tokio::task::spawn_blocking(move || {
                            offloader.cleanup_older_than(max_age)
                        })
                        .await;
                        match cleaned {
                            Ok(Ok(removed)) => debug!("Attachment housekeeping removed {}", removed),
                            Ok(Err(e)) => warn!("Attachment housekeeping failed: {}", e),
                            Err(e) => error!("Attachment housekeeping worker failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Follow host connectivity snapshots
    ///
    /// Without a callback, a network change re-announces through the runtime.
    pub fn watch_network(
        self: &Arc<Self>,
        snapshots: watch::Receiver<Option<NetworkSnapshot>>,
        on_changed: Option<NetworkChangedCallback>,
    ) {
        let on_changed = on_changed.unwrap_or_else(|| {
            let supervisor = Arc::downgrade(&self.supervisor);
            let reannounce: NetworkChangedCallback = Arc::new(move |_snapshot: &NetworkSnapshot| {
                let supervisor = supervisor
                    .upgrade()
                    .ok_or_else(|| "service gone".to_string())?;
                supervisor
                    .call(|rt| rt.announce())
                    .map_err(|e| e.to_string())
            });
            reannounce
        });
        let coordinator = Arc::new(NetworkChangeCoordinator::new(
            self.locks.clone(),
            on_changed,
        ));
        coordinator.spawn(snapshots, self.token.child_token(), &self.tracker);
        *self.network.lock() = Some(coordinator);
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn register_listener(&self, listener: Arc<dyn RelayListener>) -> ListenerRegistration {
        self.broadcaster.register(listener)
    }

    pub fn unregister_listener(&self, registration: &ListenerRegistration) -> bool {
        self.broadcaster.unregister(registration)
    }

    pub fn register_readiness(&self, listener: Arc<dyn RelayListener>) {
        self.broadcaster.register_readiness(listener)
    }

    // ------------------------------------------------------------------------
    // Runtime passthroughs
    // ------------------------------------------------------------------------

    pub fn send(&self, message: &OutboundMessage) -> Result<Vec<u8>, SupervisorError> {
        self.supervisor.call(|rt| rt.send(message))
    }

    pub fn request_path(&self, destination_hash: &[u8]) -> Result<(), SupervisorError> {
        self.supervisor.call(|rt| rt.request_path(destination_hash))
    }

    pub fn announce(&self) -> Result<(), SupervisorError> {
        self.supervisor.call(|rt| rt.announce())
    }

    pub fn query(
        &self,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        self.supervisor.call(|rt| rt.query(method, params))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn status(&self) -> ServiceStatus {
        self.supervisor.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServiceStatus> {
        self.supervisor.subscribe_status()
    }

    pub fn set_conversation_active(&self, active: bool) {
        self.supervisor.set_conversation_active(active)
    }

    pub fn is_conversation_active(&self) -> bool {
        self.supervisor.is_conversation_active()
    }

    pub fn lock_status(&self) -> LockStatus {
        self.locks.status()
    }

    pub fn load_attachment(&self, path: &Path) -> Result<Vec<u8>, OffloadError> {
        self.offloader.load_attachment(path)
    }

    pub fn supervisor(&self) -> &Arc<RuntimeSupervisor> {
        &self.supervisor
    }

    pub fn relay(&self) -> &Arc<EventRelay> {
        &self.relay
    }

    pub fn broadcaster(&self) -> &Arc<CallbackBroadcaster> {
        &self.broadcaster
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

fn is_stale(supervisor: &RuntimeSupervisor, envelope: &PushEnvelope) -> bool {
    let current = supervisor.generation();
    if envelope.generation == current {
        return false;
    }
    debug!(
        "Dropping {} push from stale generation {} (now {})",
        envelope.kind, envelope.generation, current
    );
    true
}

fn heartbeat_source(supervisor: &Arc<RuntimeSupervisor>) -> HeartbeatSource {
    let supervisor = Arc::downgrade(supervisor);
    Arc::new(move || {
        let Some(supervisor) = supervisor.upgrade() else {
            return Ok(None);
        };
        match supervisor.call(|rt| rt.heartbeat()) {
            Ok(heartbeat) => Ok(Some(heartbeat)),
            Err(SupervisorError::NotInitialized) => Ok(None),
            Err(e) => Err(HealthError::Sample(e.to_string())),
        }
    })
}

fn recovery_action(service: Weak<RelayService>) -> RecoveryAction {
    Arc::new(move || {
        let Some(service) = service.upgrade() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            error!("Health recovery requested outside the runtime; skipping restart");
            return;
        }
        let task = service.clone();
        service.tracker.spawn(async move {
            match task.restart().await {
                Ok(report) => info!(
                    "Health recovery restarted runtime (generation {})",
                    report.init.generation
                ),
                Err(e) => error!("Health recovery restart failed: {}", e),
            }
        });
    })
}
