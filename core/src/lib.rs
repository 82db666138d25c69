// MeshLink Core: mesh runtime relay
//
// Hosts an embedded mesh protocol runtime, keeps it alive across host
// lifecycle churn, and relays what it pushes (announces, messages, delivery
// receipts, link and packet events) to subscribed listeners. Messages reach
// listeners only after the store accepted them.

pub mod broadcast;
pub mod config;
pub mod event;
pub mod health;
pub mod locks;
pub mod network;
pub mod offload;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod state;
pub mod store;
pub mod supervisor;

pub use broadcast::{
    BroadcastError, BroadcastReport, CallbackBroadcaster, ListenerError, ListenerRegistration,
    RelayListener,
};
pub use config::{
    ConfigError, HealthConfig, LockConfig, OffloadConfig, ServiceConfig, SupervisorConfig,
};
pub use event::{
    AnnounceEvent, DeliveryMethod, DeliveryStatusEvent, Event, FieldMap, FieldValue, LinkEvent,
    MessageEvent, NodeType, PacketEvent, ReactionEvent,
};
pub use health::{HealthMonitor, HealthVerdict};
pub use locks::{HostLock, HostLocks, LockError, LockKind, LockStatus, ResourceLockCoordinator};
pub use network::{NetworkChangeCoordinator, NetworkSnapshot, NetworkTransition};
pub use offload::{AttachmentOffloader, OffloadError};
pub use relay::{BatchReport, EventRelay, Origin, RelayError, RelayOutcome};
pub use runtime::{
    MeshRuntime, OutboundMessage, PushCallback, PushKind, RawEvent, RuntimeError, RuntimeFactory,
    RuntimeInit,
};
pub use service::{RelayService, ServiceError, StartReport};
pub use state::{ServiceStatus, ShutdownOutcome};
pub use store::{EventStore, MemoryEventStore, PersistOutcome, SledEventStore, StoreError};
pub use supervisor::{InitSuccess, RuntimeSupervisor, SupervisorError};
