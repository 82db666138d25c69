//! Process-wide service state owned by the runtime supervisor

use crate::runtime::MeshRuntime;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle status of the embedded runtime
///
/// Wire form is a plain string: `SHUTDOWN`, `INITIALIZING`, `READY`,
/// `CONNECTING` or `ERROR:<message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Shutdown,
    Initializing,
    Ready,
    Connecting,
    Error(String),
}

impl ServiceStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => write!(f, "SHUTDOWN"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Ready => write!(f, "READY"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Error(message) => write!(f, "ERROR:{}", message),
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHUTDOWN" => Ok(Self::Shutdown),
            "INITIALIZING" => Ok(Self::Initializing),
            "READY" => Ok(Self::Ready),
            "CONNECTING" => Ok(Self::Connecting),
            other => other
                .strip_prefix("ERROR:")
                .map(|message| Self::Error(message.to_string()))
                .ok_or_else(|| format!("unknown status: {}", other)),
        }
    }
}

impl Serialize for ServiceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServiceStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How an issued shutdown ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The runtime acknowledged the shutdown
    Completed,
    /// Nothing was running
    Idle,
    /// The native call was abandoned after the configured budget
    TimedOut,
    /// The runtime raised an error; the handle is dropped regardless
    Failed(String),
}

pub(crate) type SharedShutdown = Shared<BoxFuture<'static, ShutdownOutcome>>;

/// Shutdown that has been issued but whose native call may still be running
pub(crate) struct InFlightShutdown {
    pub ticket: u64,
    pub completion: SharedShutdown,
}

/// Mutable state guarded by the supervisor
///
/// Only the supervisor's locked entry points touch this.
pub(crate) struct ServiceState {
    pub runtime: Option<Arc<dyn MeshRuntime>>,
    pub generation: u64,
    pub status: ServiceStatus,
    pub conversation_active: bool,
    pub shutdown_in_flight: Option<InFlightShutdown>,
    pub shutdown_tickets: u64,
    status_tx: watch::Sender<ServiceStatus>,
}

impl ServiceState {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ServiceStatus::Shutdown);
        Self {
            runtime: None,
            generation: 0,
            status: ServiceStatus::Shutdown,
            conversation_active: false,
            shutdown_in_flight: None,
            shutdown_tickets: 0,
            status_tx,
        }
    }

    /// Update status and publish it to subscribers
    pub fn set_status(&mut self, status: ServiceStatus) {
        if self.status == status {
            return;
        }
        tracing::debug!("Service status {} -> {}", self.status, status);
        self.status = status.clone();
        self.status_tx.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_values() {
        assert_eq!(ServiceStatus::Shutdown.to_string(), "SHUTDOWN");
        assert_eq!(ServiceStatus::Initializing.to_string(), "INITIALIZING");
        assert_eq!(ServiceStatus::Ready.to_string(), "READY");
        assert_eq!(ServiceStatus::Connecting.to_string(), "CONNECTING");
        assert_eq!(
            ServiceStatus::Error("Permission denied".to_string()).to_string(),
            "ERROR:Permission denied"
        );
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("READY".parse::<ServiceStatus>(), Ok(ServiceStatus::Ready));
        assert_eq!(
            "ERROR:a:b".parse::<ServiceStatus>(),
            Ok(ServiceStatus::Error("a:b".to_string()))
        );
        assert!("RUNNING".parse::<ServiceStatus>().is_err());
    }

    #[test]
    fn test_status_serde_is_plain_string() {
        let json = serde_json::to_string(&ServiceStatus::Connecting).unwrap();
        assert_eq!(json, "\"CONNECTING\"");
        let back: ServiceStatus = serde_json::from_str("\"ERROR:boom\"").unwrap();
        assert_eq!(back, ServiceStatus::Error("boom".to_string()));
    }

    #[test]
    fn test_set_status_publishes() {
        let mut state = ServiceState::new();
        let rx = state.subscribe();
        state.set_status(ServiceStatus::Initializing);
        assert_eq!(*rx.borrow(), ServiceStatus::Initializing);
        assert_eq!(state.status, ServiceStatus::Initializing);
    }
}
